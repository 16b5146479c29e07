//! Single outbound connection.
//!
//! A [`Client`] binds its local address up front and connects on demand. Once
//! connected, every operation targets the only connection of its [`Endpoint`].
//!
//! # Example
//! ```no_run
//! use rowlink::protocol::Client;
//!
//! let mut client = Client::new(
//!     "127.0.0.1:39000".parse().unwrap(),
//!     "127.0.0.1:0".parse().unwrap(),
//! )?;
//! client.connect()?;
//! let table = client.query("select 1")?;
//! println!("{table}");
//! # Ok::<(), rowlink::protocol::TransportError>(())
//! ```
use std::{
    io,
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use log::{debug, info};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::table::Table;

use super::{
    Endpoint, Packet,
    transport::{DEFAULT_BLOCK_SIZE, PacketTransport, RetryPolicy, TransportError},
};

/// Transfer settings of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Rows per DATA packet for tables sent to the server.
    pub block_size: usize,
    pub retry: RetryPolicy,
    /// `None` waits as long as the OS does.
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            retry: RetryPolicy::default(),
            connect_timeout: None,
        }
    }
}

impl ClientOptions {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

const SESSION: usize = 0;

pub struct Client {
    server: SocketAddr,
    /// Address as requested, possibly with port 0.
    bind_to: SocketAddr,
    local: SocketAddr,
    socket: Option<Socket>,
    endpoint: Endpoint,
    options: ClientOptions,
}

impl Client {
    pub fn new(server: SocketAddr, local: SocketAddr) -> Result<Self, TransportError> {
        Self::with_options(server, local, ClientOptions::default())
    }

    /// Creates the socket and binds it to `local`. Port 0 picks an ephemeral port.
    pub fn with_options(
        server: SocketAddr,
        local: SocketAddr,
        options: ClientOptions,
    ) -> Result<Self, TransportError> {
        let socket = bind(local)?;
        let bound = bound_addr(&socket)?;
        debug!("client socket bound at {bound}");

        Ok(Self {
            server,
            bind_to: local,
            local: bound,
            socket: Some(socket),
            endpoint: Endpoint::new(options.block_size, options.retry),
            options,
        })
    }

    pub fn connect(&mut self) -> Result<(), TransportError> {
        if !self.endpoint.is_empty() {
            return Err(
                io::Error::new(io::ErrorKind::AlreadyExists, "client is already connected").into(),
            );
        }

        // A socket is good for one connect attempt only.
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                let socket = bind(self.bind_to)?;
                self.local = bound_addr(&socket)?;
                socket
            }
        };

        let server: SockAddr = self.server.into();
        match self.options.connect_timeout {
            Some(timeout) => socket.connect_timeout(&server, timeout)?,
            None => socket.connect(&server)?,
        }

        let stream = TcpStream::from(socket);
        self.endpoint.attach(stream)?;
        info!("connected to {} from {}", self.server, self.local);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint
            .client(SESSION)
            .is_some_and(|client| client.is_connected)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    fn exchange<R, F>(&self, f: F) -> Result<R, TransportError>
    where
        F: FnOnce(&mut PacketTransport<TcpStream>) -> Result<R, TransportError>,
    {
        self.endpoint.exchange(SESSION, f).map_err(|e| match e {
            TransportError::NoSuchConnection(index) => TransportError::NotConnected(index),
            e => e,
        })
    }

    pub fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        self.exchange(|t| t.send(packet))
    }

    pub fn recv(&self) -> Result<Packet, TransportError> {
        self.exchange(|t| t.recv())
    }

    pub fn send_string(&self, text: &str) -> Result<(), TransportError> {
        self.exchange(|t| t.send_string(text))
    }

    pub fn recv_string(&self) -> Result<String, TransportError> {
        self.exchange(|t| t.recv_string())
    }

    pub fn send_table(&self, table: &Table) -> Result<(), TransportError> {
        self.exchange(|t| t.send_table(table))
    }

    pub fn recv_table(&self) -> Result<Table, TransportError> {
        self.exchange(|t| t.recv_table())
    }

    /// Sends a QUERY packet without waiting for anything.
    pub fn send_query(&self, text: &str) -> Result<(), TransportError> {
        self.send(&Packet::query(text))
    }

    pub fn await_ack(&self) -> Result<(), TransportError> {
        self.exchange(|t| t.await_ack())
    }

    /// Reads a complete result table, acknowledging every part.
    pub fn receive_table(&self) -> Result<Table, TransportError> {
        self.recv_table()
    }

    /// Sends `packet` until the server acknowledges it.
    pub fn request(&self, packet: &Packet) -> Result<(), TransportError> {
        self.exchange(|t| t.deliver(packet))
    }

    /// Runs one full request cycle: QUERY until acknowledged, then the result table.
    ///
    /// A query the server failed to execute comes back as [`TransportError::Remote`]
    /// and leaves the session usable.
    pub fn query(&self, text: &str) -> Result<Table, TransportError> {
        let packet = Packet::query(text);
        self.exchange(|t| {
            t.deliver(&packet)?;
            t.recv_table()
        })
    }

    /// Closes the connection. The client can [`connect`](Self::connect) again afterwards.
    pub fn stop(&mut self) -> Result<(), TransportError> {
        self.endpoint.stop(SESSION).map_err(|e| match e {
            TransportError::NoSuchConnection(index) => TransportError::NotConnected(index),
            e => e,
        })?;
        self.endpoint.compact_trailing();
        info!("disconnected from {}", self.server);
        Ok(())
    }
}

fn bind(local: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&local.into())?;
    Ok(socket)
}

fn bound_addr(socket: &Socket) -> io::Result<SocketAddr> {
    socket.local_addr()?.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "socket is not an IP socket")
    })
}
