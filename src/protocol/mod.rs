//! Client-server communication protocol.
//!
//! This module defines how rowlink clients and servers talk: the packet format, the
//! framing used on the socket, the acknowledgement handshake, and the connection
//! bookkeeping on both sides.
//!
//! # Overview
//!
//! A client sends a QUERY packet and resends it until the server answers with an ACK.
//! The server runs the query and streams the result back as one or more DATA packets,
//! each of which the client acknowledges before the next one is sent. A query that
//! fails on the server comes back as an ERROR packet instead of the table.
//!
//! # Key Components
//!
//! - [`Packet`]: one unit of wire data, tagged with a [`PacketType`].
//! - [`PacketTransport`]: framed packet exchange over any `Read + Write` stream.
//! - [`Endpoint`]: index-addressed set of connections shared by both sides.
//! - [`Client`]: one outbound connection plus the request cycle.
//! - [`Server`]: accepts connections and raises [`ServerEvent`]s about them.
//! - [`serve`]: the server half of one request.
//!
//! # Binary Format
//!
//! - Each packet is one frame: a big-endian `u32` body length, then the body.
//! - The body is the bincode encoding of [`Packet`] with big-endian fixed-width
//!   integers: type tag, part ordinal, part count, optional payload.
//! - Frames larger than [`MAX_FRAME_LEN`] are refused in both directions.
//!
//! # See Also
//!
//! - [`executor`](crate::executor): where the server gets its tables from.
mod client;
mod endpoint;
mod event;
mod packet;
mod server;
mod service;
mod thread;
mod transport;

pub use client::{Client, ClientOptions};
pub use endpoint::{ClientHandler, Endpoint};
pub use event::{ClientEvent, EventHandler, ServerEvent};
pub use packet::{Packet, PacketType};
pub use server::{Server, ServerError, ServerOptions, ServerState};
pub use service::{Outcome, serve, serve_request};
pub use thread::ThreadPool;
pub use transport::{
    DEFAULT_BLOCK_SIZE, MAX_FRAME_LEN, PacketTransport, ProtocolViolation, RetryPolicy,
    STRING_CHUNK_LEN, TransportError,
};
