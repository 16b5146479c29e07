use std::{
    io::{self, Read, Write},
    thread,
    time::Duration,
};

use bincode::{
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, encode_to_vec,
};
use log::{debug, trace};
use thiserror::Error;

use crate::table::{Table, TableError};

use super::{Packet, PacketType};

/// Largest frame body accepted in either direction.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
/// Rows per DATA packet when sending a table.
pub const DEFAULT_BLOCK_SIZE: usize = 100;
/// Bytes of text per DATA packet when sending a string.
pub const STRING_CHUNK_LEN: usize = 64 * 1024;

const LEN_SIZE: usize = 4;

/// A packet arrived that makes no sense at this point of the conversation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("expected {expected}, received {received} packet")]
pub struct ProtocolViolation {
    pub expected: &'static str,
    pub received: PacketType,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode packet: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode packet: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("no connection at index {0}")]
    NoSuchConnection(usize),
    #[error("connection at index {0} is closed")]
    NotConnected(usize),
    #[error("no acknowledgement after {attempts} attempts")]
    AckTimeout { attempts: u32 },
    #[error(transparent)]
    Unexpected(#[from] ProtocolViolation),
    #[error("peer reported an error: {message}")]
    Remote { message: String },
    #[error("invalid table data: {0}")]
    Table(#[from] TableError),
}

/// How often a packet is resent while waiting for its ACK.
///
/// The default never gives up and never waits between attempts, i.e. it retries
/// until acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Packet-level duplex over a byte stream.
///
/// Each packet travels as one frame: a big-endian `u32` body length followed by the
/// bincode encoded [`Packet`].
pub struct PacketTransport<T: Read + Write> {
    stream: T,
    config: Configuration<BigEndian, Fixint>,
    frames_read: u64,
    block_size: usize,
    retry: RetryPolicy,
}

impl<T: Read + Write> PacketTransport<T> {
    pub fn new(stream: T) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self {
            stream,
            config,
            frames_read: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Number of frames consumed from the stream so far, valid or not.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Writes one packet as a single frame.
    pub fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let body = encode_to_vec(packet, self.config)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(body.len()));
        }

        let mut frame = Vec::with_capacity(LEN_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        trace!(
            "sent {} packet {}/{}",
            packet.kind(),
            packet.part(),
            packet.total_parts()
        );
        Ok(())
    }

    /// Blocks until one complete frame has been read.
    pub fn recv(&mut self) -> Result<Packet, TransportError> {
        let mut header = [0u8; LEN_SIZE];
        self.stream.read_exact(&mut header)?;

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body)?;
        self.frames_read += 1;

        let (packet, read): (Packet, usize) = decode_from_slice(&body, self.config)?;
        if read != len {
            return Err(TransportError::Malformed(format!(
                "{} trailing bytes after packet",
                len - read
            )));
        }
        packet.validate().map_err(TransportError::Malformed)?;

        trace!(
            "received {} packet {}/{}",
            packet.kind(),
            packet.part(),
            packet.total_parts()
        );
        Ok(packet)
    }

    /// Sends `packet` until the peer answers with an ACK for the same part.
    ///
    /// Any other answer triggers a resend, as allowed by the retry policy.
    pub fn deliver(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let mut attempts = 0;
        loop {
            self.send(packet)?;
            attempts += 1;

            let reply = self.recv()?;
            if reply.kind() == PacketType::Ack && reply.part() == packet.part() {
                return Ok(());
            }

            debug!(
                "no ACK for {} part {} (got {}), attempt {attempts}",
                packet.kind(),
                packet.part(),
                reply.kind()
            );
            if self.retry.exhausted(attempts) {
                return Err(TransportError::AckTimeout { attempts });
            }
            if !self.retry.backoff.is_zero() {
                thread::sleep(self.retry.backoff);
            }
        }
    }

    /// Reads one packet and fails unless it is an ACK.
    pub fn await_ack(&mut self) -> Result<(), TransportError> {
        let packet = self.recv()?;
        match packet.kind() {
            PacketType::Ack => Ok(()),
            received => Err(ProtocolViolation {
                expected: "ACK",
                received,
            }
            .into()),
        }
    }

    pub fn send_string(&mut self, text: &str) -> Result<(), TransportError> {
        self.send_parts(split_chunks(text, STRING_CHUNK_LEN))
    }

    pub fn recv_string(&mut self) -> Result<String, TransportError> {
        let mut text = String::new();
        self.recv_parts(|payload| {
            text.push_str(&payload);
            Ok(())
        })?;
        Ok(text)
    }

    /// Sends `table` as consecutive DATA packets of at most `block_size` rows.
    pub fn send_table(&mut self, table: &Table) -> Result<(), TransportError> {
        let chunks = table.encode_chunks(self.block_size);
        debug!(
            "sending table of {} rows in {} packets",
            table.len(),
            chunks.len()
        );
        self.send_parts(chunks)
    }

    /// Reassembles a table from DATA packets until the terminal one.
    pub fn recv_table(&mut self) -> Result<Table, TransportError> {
        let mut table: Option<Table> = None;
        self.recv_parts(|payload| {
            match table.as_mut() {
                Some(table) => table.extend_from_chunk(&payload)?,
                None => table = Some(Table::from_first_chunk(&payload)?),
            }
            Ok(())
        })?;

        let table = table.unwrap_or_default();
        debug!("received table of {} rows", table.len());
        Ok(table)
    }

    fn send_parts(&mut self, payloads: Vec<String>) -> Result<(), TransportError> {
        let total = u32::try_from(payloads.len())
            .map_err(|_| TransportError::Malformed("too many parts".to_string()))?;

        for (part, payload) in (0..total).zip(payloads) {
            self.deliver(&Packet::data(part, total, payload))?;
        }
        Ok(())
    }

    fn recv_parts<F>(&mut self, mut on_part: F) -> Result<(), TransportError>
    where
        F: FnMut(String) -> Result<(), TransportError>,
    {
        let mut expected = 0;
        let mut total = None;

        loop {
            let packet = self.recv()?;
            match packet.kind() {
                PacketType::Data => {}
                PacketType::Error => {
                    return Err(TransportError::Remote {
                        message: packet.into_payload().unwrap_or_default(),
                    });
                }
                received => {
                    return Err(ProtocolViolation {
                        expected: "DATA",
                        received,
                    }
                    .into());
                }
            }

            let (part, parts) = (packet.part(), packet.total_parts());
            if part < expected {
                // Our ACK got lost and the sender retried; acknowledge again.
                debug!("duplicate DATA part {part}, re-acknowledging");
                self.send(&Packet::ack_part(part, parts))?;
                continue;
            }
            if part > expected {
                return Err(TransportError::Malformed(format!(
                    "expected DATA part {expected}, received part {part}"
                )));
            }
            if *total.get_or_insert(parts) != parts {
                return Err(TransportError::Malformed(format!(
                    "part count changed mid-transfer from {} to {parts}",
                    total.unwrap_or_default()
                )));
            }

            let last = packet.is_last();
            on_part(packet.into_payload().unwrap_or_default())?;
            self.send(&Packet::ack_part(part, parts))?;

            if last {
                return Ok(());
            }
            expected += 1;
        }
    }
}

/// Splits `text` into pieces of at most `max` bytes without cutting a character.
fn split_chunks(text: &str, max: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest.len().min(max.max(1));
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head.to_string());
        rest = tail;
    }
    chunks
}
