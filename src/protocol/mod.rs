//! Client-server communication protocol.
//!
//! This module defines how tinyrpc clients and servers talk: the packet format, the socket
//! transport underneath it, the server's accept loop with its worker pool, and the client calls
//! built on top.
//!
//! # Overview
//!
//! Every remote call opens a fresh TCP connection, sends exactly one request packet, waits for
//! exactly one reply packet and closes the connection. There is no multiplexing and no reuse of
//! connections across calls.
//!
//! # Key Components
//!
//! - [`Packet`]: Header plus typed payload, with encode/decode and reply matching.
//! - [`Socket`] and [`Poller`]: Stream socket wrapper and a cancellable readiness wait.
//! - [`Connection`]: A socket bound to a packet kind namespace.
//! - [`ThreadPool`]: Workers that answer accepted connections.
//! - [`Server`]: The accept loop and the table routing requests to a [`Service`](crate::service::Service).
//! - [`Client`]: One synchronous call per operation, with connect retry.
//!
//! # Binary Format
//!
//! - Each packet begins with an 8 byte header: total size, kind, payload type and action, all
//!   `u16` little-endian. The size counts the header itself.
//! - The payload follows, encoded according to its type (empty, error code plus message, raw
//!   bytes, NUL-terminated text).
//! - A reply carries the request's action with the high bit ([`REPLY_FLAG`]) set.
mod client;
mod connection;
mod packet;
mod server;
mod thread;
mod transport;

pub use client::{Client, ClientError, connect};
pub use connection::{Connection, ConnectionError};
pub use packet::{
    Action, CodecError, Credentials, HEADER_SIZE, MAX_PACKET_SIZE, Operation, Packet, PacketKind,
    Payload, PayloadType, REPLY_FLAG, error_code,
};
pub use server::{Server, ServerError, dispatch};
pub use thread::{PoolError, ThreadPool};
pub use transport::{
    Canceller, Family, LastError, Poller, Readiness, Socket, Timeout, TransportError, resolve,
};
