//! Multi-client server.
//!
//! A [`Server`] binds a listener on construction and starts serving on
//! [`accept`](Server::accept), which spawns three background loops:
//!
//! - **accept**: attaches every incoming connection to the [`Endpoint`] and raises
//!   [`ServerEvent::Connect`].
//! - **check**: every `check_interval`, peeks at each connected socket without consuming
//!   anything; a closed or reset socket is marked disconnected and raises exactly one
//!   [`ServerEvent::Disconnect`], pending input raises [`ServerEvent::Available`].
//! - **clean**: every `clean_interval`, drops the trailing run of disconnected entries.
//!
//! Events are delivered on a dedicated dispatcher thread (see [`event`](super::event)).
//! A failure on one client's socket only ever affects that client.
use std::{
    io,
    net::{SocketAddr, TcpListener},
    sync::{
        Arc, Mutex,
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::table::Table;

use super::{
    ClientHandler, Endpoint, Packet,
    endpoint::Liveness,
    event::{ClientEvent, Dispatcher, ServerEvent, Subscribers, emit},
    transport::{DEFAULT_BLOCK_SIZE, RetryPolicy, TransportError},
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error("listener IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("server is already listening")]
    AlreadyListening,
    #[error("server has been stopped")]
    Stopped,
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Before [`Server::accept`], and for good after [`Server::stop_server`].
    NotListening,
    Listening,
}

/// Timing and transfer settings of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// Pause between two polls of the listener.
    pub accept_interval: Duration,
    /// Pause between two liveness sweeps.
    pub check_interval: Duration,
    /// Longest a sweep waits on a single idle socket. Sockets are probed one after
    /// another, so a sweep over `n` idle clients takes about `n` times this.
    pub poll_timeout: Duration,
    /// Pause between two cleanups of dead trailing entries.
    pub clean_interval: Duration,
    /// Rows per DATA packet for tables sent to clients.
    pub block_size: usize,
    pub retry: RetryPolicy,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            accept_interval: Duration::from_millis(50),
            check_interval: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(1),
            clean_interval: Duration::from_secs(10),
            block_size: DEFAULT_BLOCK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl ServerOptions {
    pub fn with_accept_interval(mut self, interval: Duration) -> Self {
        self.accept_interval = interval;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_clean_interval(mut self, interval: Duration) -> Self {
        self.clean_interval = interval;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub struct Server {
    address: SocketAddr,
    listener: Option<TcpListener>,
    options: ServerOptions,
    endpoint: Arc<Endpoint>,
    subscribers: Arc<Mutex<Subscribers>>,
    state: ServerState,
    events: Option<mpsc::Sender<ServerEvent>>,
    shutdown: Vec<mpsc::Sender<()>>,
    loops: Vec<thread::JoinHandle<()>>,
    dispatcher: Option<Dispatcher>,
}

impl Server {
    pub fn new(address: SocketAddr) -> Result<Self, ServerError> {
        Self::with_options(address, ServerOptions::default())
    }

    /// Binds the listener. Connections queue up in the OS backlog until
    /// [`accept`](Self::accept) is called.
    pub fn with_options(address: SocketAddr, options: ServerOptions) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(address).map_err(ServerError::Bind)?;
        let address = listener.local_addr()?;
        debug!("bound listener at {address}");

        Ok(Self {
            address,
            listener: Some(listener),
            options,
            endpoint: Arc::new(Endpoint::new(options.block_size, options.retry)),
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            state: ServerState::NotListening,
            events: None,
            shutdown: Vec::new(),
            loops: Vec::new(),
            dispatcher: None,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Shared handle to the connections, e.g. for use inside event handlers.
    pub fn endpoint(&self) -> Arc<Endpoint> {
        Arc::clone(&self.endpoint)
    }

    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(&ClientEvent) + Send + 'static,
    {
        self.subscribers.lock().unwrap().connect.push(Box::new(handler));
    }

    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&ClientEvent) + Send + 'static,
    {
        self.subscribers.lock().unwrap().disconnect.push(Box::new(handler));
    }

    pub fn on_available<F>(&self, handler: F)
    where
        F: Fn(&ClientEvent) + Send + 'static,
    {
        self.subscribers.lock().unwrap().available.push(Box::new(handler));
    }

    /// Starts the accept, check and clean loops and the event dispatcher.
    pub fn accept(&mut self) -> Result<(), ServerError> {
        if self.state == ServerState::Listening {
            return Err(ServerError::AlreadyListening);
        }

        // Only a server that never listened still owns its listener.
        let listener = self.listener.take().ok_or(ServerError::Stopped)?;
        listener.set_nonblocking(true)?;

        if let Err(e) = self.start(listener) {
            self.halt();
            return Err(e);
        }

        self.state = ServerState::Listening;
        info!("listening at {}", self.address);
        Ok(())
    }

    fn start(&mut self, listener: TcpListener) -> Result<(), ServerError> {
        let (events, receiver) = mpsc::channel();
        let dispatcher = Dispatcher::spawn(receiver, Arc::clone(&self.subscribers))
            .map_err(|source| ServerError::Spawn {
                name: "events",
                source,
            })?;
        self.dispatcher = Some(dispatcher);

        let server = self.address;
        let options = self.options;

        let endpoint = Arc::clone(&self.endpoint);
        let tx = events.clone();
        self.spawn_loop("accept", options.accept_interval, move || {
            accept_pending(&listener, &endpoint, &tx, server)
        })?;

        let endpoint = Arc::clone(&self.endpoint);
        let tx = events.clone();
        self.spawn_loop("check", options.check_interval, move || {
            check_connections(&endpoint, &tx, server, options.poll_timeout)
        })?;

        let endpoint = Arc::clone(&self.endpoint);
        self.spawn_loop("clean", options.clean_interval, move || {
            let removed = endpoint.compact_trailing();
            if removed > 0 {
                debug!("reclaimed {removed} disconnected clients");
            }
        })?;

        self.events = Some(events);
        Ok(())
    }

    /// Runs `tick` now and then every `interval` until [`halt`](Self::halt) drops
    /// the loop's shutdown sender.
    fn spawn_loop<F>(
        &mut self,
        name: &'static str,
        interval: Duration,
        mut tick: F,
    ) -> Result<(), ServerError>
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("rowlink-{name}"))
            .spawn(move || {
                debug!("{name} loop started");
                loop {
                    tick();
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                debug!("{name} loop stopped");
            })
            .map_err(|source| ServerError::Spawn { name, source })?;

        self.shutdown.push(shutdown);
        self.loops.push(handle);
        Ok(())
    }

    /// Closes the connection at `index` and marks it disconnected, leaving the
    /// server and every other client untouched.
    pub fn stop_client(&self, index: usize) -> Result<(), ServerError> {
        if !self.endpoint.stop(index)? {
            return Ok(());
        }

        info!("stopped client at index {index}");
        if let (Some(events), Some(client)) = (&self.events, self.endpoint.client(index)) {
            let remote = SocketAddr::new(client.remote_ip, client.remote_port);
            emit(
                events,
                ServerEvent::Disconnect(ClientEvent::new(index, self.address, remote)),
            );
        }
        Ok(())
    }

    /// Stops listening. Background loops are joined and every event raised so far is
    /// delivered before this returns. Established client sessions stay open.
    pub fn stop_server(&mut self) -> Result<(), ServerError> {
        if self.state == ServerState::Listening {
            self.halt();
            info!("stopped listening at {}", self.address);
        }
        self.listener = None;
        self.state = ServerState::NotListening;
        Ok(())
    }

    fn halt(&mut self) {
        self.shutdown.clear();
        for handle in self.loops.drain(..) {
            if handle.join().is_err() {
                warn!("server loop panicked");
            }
        }

        drop(self.events.take());
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.join();
        }
    }

    pub fn clients(&self) -> Vec<ClientHandler> {
        self.endpoint.clients()
    }

    pub fn connected_count(&self) -> usize {
        self.endpoint.connected_count()
    }

    pub fn send(&self, index: usize, packet: &Packet) -> Result<(), TransportError> {
        self.endpoint.send(index, packet)
    }

    pub fn recv(&self, index: usize) -> Result<Packet, TransportError> {
        self.endpoint.recv(index)
    }

    pub fn send_string(&self, index: usize, text: &str) -> Result<(), TransportError> {
        self.endpoint.send_string(index, text)
    }

    pub fn recv_string(&self, index: usize) -> Result<String, TransportError> {
        self.endpoint.recv_string(index)
    }

    pub fn send_table(&self, index: usize, table: &Table) -> Result<(), TransportError> {
        self.endpoint.send_table(index, table)
    }

    pub fn recv_table(&self, index: usize) -> Result<Table, TransportError> {
        self.endpoint.recv_table(index)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.state == ServerState::Listening {
            self.halt();
        }
    }
}

fn accept_pending(
    listener: &TcpListener,
    endpoint: &Endpoint,
    events: &mpsc::Sender<ServerEvent>,
    server: SocketAddr,
) {
    loop {
        let (stream, remote) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("broken connection: {e:?}");
                return;
            }
        };

        // Some platforms hand out accepted sockets in the listener's mode.
        if let Err(e) = stream.set_nonblocking(false) {
            warn!("dropping {remote}: {e}");
            continue;
        }

        // Queued before the check loop can see the connection, so Connect always
        // precedes any other event about it.
        let attached = endpoint.attach_with(stream, |index| {
            emit(
                events,
                ServerEvent::Connect(ClientEvent::new(index, server, remote)),
            )
        });
        match attached {
            Ok(index) => info!("client {remote} connected at index {index}"),
            Err(e) => warn!("dropping {remote}: {e}"),
        }
    }
}

fn check_connections(
    endpoint: &Endpoint,
    events: &mpsc::Sender<ServerEvent>,
    server: SocketAddr,
    poll_timeout: Duration,
) {
    for (index, connection) in endpoint.live() {
        let event = ClientEvent::new(index, server, connection.remote());

        match connection.try_probe(poll_timeout) {
            None => {}
            Some(Liveness::Idle) => connection.rearm_available(),
            Some(Liveness::Readable) => {
                if connection.announce_available() {
                    emit(events, ServerEvent::Available(event));
                }
            }
            Some(Liveness::Closed) => {
                if connection.mark_disconnected() {
                    info!("client {} at index {index} disconnected", connection.remote());
                    emit(events, ServerEvent::Disconnect(event));
                }
            }
        }
    }
}
