//! Server lifecycle events.
//!
//! The accept and check loops never call subscribers themselves. They push a
//! [`ServerEvent`] onto a channel and move on; a single dispatcher thread drains the
//! channel and runs the subscribed handlers, so a slow handler delays other events but
//! never the detection loops.
use std::{
    net::{IpAddr, SocketAddr},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, mpsc},
    thread,
};

use log::{debug, trace, warn};

/// Who an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEvent {
    /// Position of the client in the server's connection list.
    pub index: usize,
    pub server: SocketAddr,
    pub client_ip: IpAddr,
    pub client_port: u16,
}

impl ClientEvent {
    pub(crate) fn new(index: usize, server: SocketAddr, client: SocketAddr) -> Self {
        Self {
            index,
            server,
            client_ip: client.ip(),
            client_port: client.port(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// A connection was accepted.
    Connect(ClientEvent),
    /// A connection was found closed or was stopped. Fired once per connection.
    Disconnect(ClientEvent),
    /// Unread data is waiting on a connection.
    Available(ClientEvent),
}

impl ServerEvent {
    pub fn client(&self) -> &ClientEvent {
        match self {
            ServerEvent::Connect(c) | ServerEvent::Disconnect(c) | ServerEvent::Available(c) => c,
        }
    }
}

pub type EventHandler = Box<dyn Fn(&ClientEvent) + Send + 'static>;

#[derive(Default)]
pub(crate) struct Subscribers {
    pub(crate) connect: Vec<EventHandler>,
    pub(crate) disconnect: Vec<EventHandler>,
    pub(crate) available: Vec<EventHandler>,
}

impl Subscribers {
    fn dispatch(&self, event: &ServerEvent) {
        let handlers = match event {
            ServerEvent::Connect(_) => &self.connect,
            ServerEvent::Disconnect(_) => &self.disconnect,
            ServerEvent::Available(_) => &self.available,
        };

        for handler in handlers {
            let client = event.client();
            if panic::catch_unwind(AssertUnwindSafe(|| handler(client))).is_err() {
                warn!("event handler panicked while handling {event:?}");
            }
        }
    }
}

/// Pushes an event towards the dispatcher. Events raised after the dispatcher
/// has shut down are dropped.
pub(crate) fn emit(events: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if events.send(event).is_err() {
        trace!("dispatcher gone, dropping {event:?}");
    }
}

pub(crate) struct Dispatcher {
    thread: thread::JoinHandle<()>,
}

impl Dispatcher {
    /// Runs until every sender of `receiver` is dropped and the queue is drained.
    pub(crate) fn spawn(
        receiver: mpsc::Receiver<ServerEvent>,
        subscribers: Arc<Mutex<Subscribers>>,
    ) -> std::io::Result<Self> {
        let thread = thread::Builder::new()
            .name("rowlink-events".to_string())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    debug!("dispatching {event:?}");
                    subscribers.lock().unwrap().dispatch(&event);
                }
                debug!("event dispatcher stopped");
            })?;

        Ok(Self { thread })
    }

    pub(crate) fn join(self) {
        if self.thread.join().is_err() {
            warn!("event dispatcher panicked");
        }
    }
}
