//! Index-addressed set of live connections.
//!
//! An [`Endpoint`] owns every open connection of a process: exactly one for a
//! [`Client`](super::Client), one per accepted peer for a [`Server`](super::Server).
//! Each connection is a single record bundling the socket, its framed transport and its
//! [`ClientHandler`] state, so removing index `i` always removes all of them together.
//!
//! Indices are positions in the list. Entries are only ever removed from the tail
//! (see [`Endpoint::compact_trailing`]), so the index of a live connection never changes
//! while it is alive.
use std::{
    io,
    net::{IpAddr, Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc, Mutex, PoisonError, TryLockError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, trace};

use crate::table::Table;

use super::{
    Packet,
    transport::{DEFAULT_BLOCK_SIZE, PacketTransport, RetryPolicy, TransportError},
};

/// Bookkeeping for one connection, as seen at the time of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHandler {
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub is_connected: bool,
}

/// Result of a non-consuming readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Liveness {
    Idle,
    Readable,
    Closed,
}

pub(crate) struct Connection {
    remote: SocketAddr,
    connected: AtomicBool,
    announced: AtomicBool,
    control: TcpStream,
    transport: Mutex<PacketTransport<TcpStream>>,
}

impl Connection {
    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flips the connection to disconnected. Only the first caller gets `true`.
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    /// Latches pending input as announced. Only the first caller per episode gets `true`.
    pub(crate) fn announce_available(&self) -> bool {
        !self.announced.swap(true, Ordering::SeqCst)
    }

    /// Ends the current pending-input episode.
    pub(crate) fn rearm_available(&self) {
        self.announced.store(false, Ordering::SeqCst);
    }

    fn handler(&self) -> ClientHandler {
        ClientHandler {
            remote_ip: self.remote.ip(),
            remote_port: self.remote.port(),
            is_connected: self.is_connected(),
        }
    }

    /// Closes both directions; a reader blocked on this socket wakes up with EOF.
    fn shutdown(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            // Already closed by the peer.
            trace!("shutdown of {} failed: {e}", self.remote);
        }
    }

    /// Peeks at the socket unless someone is in the middle of an exchange on it,
    /// in which case it is busy and `None` is returned.
    pub(crate) fn try_probe(&self, timeout: Duration) -> Option<Liveness> {
        let transport = match self.transport.try_lock() {
            Ok(transport) => transport,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        Some(probe(transport.get_ref(), timeout))
    }
}

fn probe(stream: &TcpStream, timeout: Duration) -> Liveness {
    // A zero timeout is rejected by the OS.
    let timeout = timeout.max(Duration::from_millis(1));
    if stream.set_read_timeout(Some(timeout)).is_err() {
        return Liveness::Closed;
    }

    let mut buf = [0u8; 1];
    let liveness = match stream.peek(&mut buf) {
        Ok(0) => Liveness::Closed,
        Ok(_) => Liveness::Readable,
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            Liveness::Idle
        }
        Err(_) => Liveness::Closed,
    };

    if stream.set_read_timeout(None).is_err() {
        return Liveness::Closed;
    }
    liveness
}

pub struct Endpoint {
    connections: Mutex<Vec<Arc<Connection>>>,
    block_size: usize,
    retry: RetryPolicy,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, RetryPolicy::default())
    }
}

impl Endpoint {
    pub fn new(block_size: usize, retry: RetryPolicy) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            block_size,
            retry,
        }
    }

    /// Takes ownership of an open stream and returns its index.
    pub fn attach(&self, stream: TcpStream) -> Result<usize, TransportError> {
        self.attach_with(stream, |_| {})
    }

    /// Like [`attach`](Self::attach), but runs `on_attached` with the new index while the
    /// list is still locked, before any other caller can see the connection.
    pub(crate) fn attach_with<F>(
        &self,
        stream: TcpStream,
        on_attached: F,
    ) -> Result<usize, TransportError>
    where
        F: FnOnce(usize),
    {
        let remote = stream.peer_addr()?;
        let control = stream.try_clone()?;
        stream.set_nodelay(true)?;

        let connection = Arc::new(Connection {
            remote,
            connected: AtomicBool::new(true),
            announced: AtomicBool::new(false),
            control,
            transport: Mutex::new(
                PacketTransport::new(stream)
                    .with_block_size(self.block_size)
                    .with_retry(self.retry),
            ),
        });

        let mut connections = self.connections.lock().unwrap();
        connections.push(connection);
        let index = connections.len() - 1;
        on_attached(index);
        drop(connections);

        debug!("attached {remote} at index {index}");
        Ok(index)
    }

    pub(crate) fn connection(&self, index: usize) -> Result<Arc<Connection>, TransportError> {
        self.connections
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .ok_or(TransportError::NoSuchConnection(index))
    }

    /// Connections still marked connected, with their indices.
    pub(crate) fn live(&self) -> Vec<(usize, Arc<Connection>)> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_connected())
            .map(|(i, c)| (i, Arc::clone(c)))
            .collect()
    }

    /// Runs `f` with exclusive use of the transport at `index`.
    ///
    /// Holding the transport for the whole closure keeps a multi-packet conversation
    /// (e.g. QUERY, ACK, then every DATA block and its ACK) from interleaving with any
    /// other caller or with the server's readiness probe. If `f` reads at least one frame,
    /// pending input counts as new again and may be announced once more.
    pub fn exchange<R, E, F>(&self, index: usize, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut PacketTransport<TcpStream>) -> Result<R, E>,
        E: From<TransportError>,
    {
        let connection = self.connection(index)?;
        if !connection.is_connected() {
            return Err(TransportError::NotConnected(index).into());
        }

        let mut transport = connection
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = transport.frames_read();
        let result = f(&mut transport);
        let consumed = transport.frames_read() != before;
        drop(transport);

        if consumed {
            connection.rearm_available();
        }
        result
    }

    pub fn send(&self, index: usize, packet: &Packet) -> Result<(), TransportError> {
        self.exchange(index, |t| t.send(packet))
    }

    pub fn recv(&self, index: usize) -> Result<Packet, TransportError> {
        self.exchange(index, |t| t.recv())
    }

    /// Sends `packet` and blocks until it is acknowledged.
    pub fn deliver(&self, index: usize, packet: &Packet) -> Result<(), TransportError> {
        self.exchange(index, |t| t.deliver(packet))
    }

    pub fn send_string(&self, index: usize, text: &str) -> Result<(), TransportError> {
        self.exchange(index, |t| t.send_string(text))
    }

    pub fn recv_string(&self, index: usize) -> Result<String, TransportError> {
        self.exchange(index, |t| t.recv_string())
    }

    pub fn send_table(&self, index: usize, table: &Table) -> Result<(), TransportError> {
        self.exchange(index, |t| t.send_table(table))
    }

    pub fn recv_table(&self, index: usize) -> Result<Table, TransportError> {
        self.exchange(index, |t| t.recv_table())
    }

    /// Closes the connection at `index` and marks it disconnected.
    ///
    /// Returns `true` if this call was the one that marked it. The record itself
    /// stays in place until [`compact_trailing`](Self::compact_trailing) reclaims it.
    pub fn stop(&self, index: usize) -> Result<bool, TransportError> {
        let connection = self.connection(index)?;
        connection.shutdown();
        Ok(connection.mark_disconnected())
    }

    /// Shuts the socket at `index` down without marking it. The next readiness sweep
    /// finds it closed and reports the disconnect like any other.
    pub fn close(&self, index: usize) -> Result<(), TransportError> {
        self.connection(index)?.shutdown();
        Ok(())
    }

    /// Removes the run of disconnected entries at the end of the list, stopping at the
    /// first connected one. Disconnected entries before a live one are left alone so
    /// that no live index shifts. Returns how many entries were removed.
    pub fn compact_trailing(&self) -> usize {
        let mut connections = self.connections.lock().unwrap();
        let mut removed = 0;
        while connections.last().is_some_and(|c| !c.is_connected()) {
            if let Some(connection) = connections.pop() {
                connection.shutdown();
            }
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.is_connected())
            .count()
    }

    /// Handler state of every entry, in index order.
    pub fn clients(&self) -> Vec<ClientHandler> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.handler())
            .collect()
    }

    pub fn client(&self, index: usize) -> Option<ClientHandler> {
        self.connections
            .lock()
            .unwrap()
            .get(index)
            .map(|c| c.handler())
    }
}
