use std::fmt;

use bincode::{Decode, Encode};

/// Tells the receiver how to interpret a packet's ordinal and payload.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq, Hash)]
pub enum PacketType {
    Query,
    Data,
    Ack,
    Nack,
    Warning,
    Error,
}

impl PacketType {
    /// ACK and NACK never carry a payload.
    pub fn is_control(self) -> bool {
        matches!(self, PacketType::Ack | PacketType::Nack)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Query => "QUERY",
            PacketType::Data => "DATA",
            PacketType::Ack => "ACK",
            PacketType::Nack => "NACK",
            PacketType::Warning => "WARNING",
            PacketType::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One unit of protocol data. Built right before a send or materialized right after
/// a receive; never mutated in between.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Packet {
    kind: PacketType,
    part: u32,
    total_parts: u32,
    payload: Option<String>,
}

impl Packet {
    /// Builds a single-part packet without data. Control packets get no payload,
    /// every other kind gets an empty one.
    pub fn new(kind: PacketType) -> Self {
        Self {
            kind,
            part: 0,
            total_parts: 1,
            payload: (!kind.is_control()).then(String::new),
        }
    }

    /// Builds a data-bearing packet. The payload is dropped for control kinds.
    pub fn with_payload(
        kind: PacketType,
        part: u32,
        total_parts: u32,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            part,
            total_parts,
            payload: (!kind.is_control()).then(|| payload.into()),
        }
    }

    pub fn query(text: impl Into<String>) -> Self {
        Self::with_payload(PacketType::Query, 0, 1, text)
    }

    pub fn data(part: u32, total_parts: u32, payload: impl Into<String>) -> Self {
        Self::with_payload(PacketType::Data, part, total_parts, payload)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_payload(PacketType::Error, 0, 1, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::with_payload(PacketType::Warning, 0, 1, message)
    }

    pub fn ack() -> Self {
        Self::new(PacketType::Ack)
    }

    pub fn nack() -> Self {
        Self::new(PacketType::Nack)
    }

    /// Acknowledges one part of a multi-part transfer.
    pub fn ack_part(part: u32, total_parts: u32) -> Self {
        Self {
            kind: PacketType::Ack,
            part,
            total_parts,
            payload: None,
        }
    }

    pub fn kind(&self) -> PacketType {
        self.kind
    }

    pub fn part(&self) -> u32 {
        self.part
    }

    pub fn total_parts(&self) -> u32 {
        self.total_parts
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn into_payload(self) -> Option<String> {
        self.payload
    }

    /// True for the terminal packet of a transfer.
    pub fn is_last(&self) -> bool {
        self.part + 1 >= self.total_parts
    }

    /// Checks the invariants a decoded packet must hold.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.total_parts == 0 {
            return Err(format!("{} packet announces zero parts", self.kind));
        }
        if self.part >= self.total_parts {
            return Err(format!(
                "{} packet part {} is out of range for {} parts",
                self.kind, self.part, self.total_parts
            ));
        }
        match (self.kind.is_control(), &self.payload) {
            (true, Some(_)) => Err(format!("{} packet must not carry a payload", self.kind)),
            (false, None) => Err(format!("{} packet is missing its payload", self.kind)),
            _ => Ok(()),
        }
    }
}
