//! Byte-level transports underneath the tunnel
//!
//! A transport moves whole `Message`s (header map + body) between two
//! endpoints. The tunnel core only consumes the traits defined here:
//! - TCP for real deployments
//! - in-memory channel pairs for tests and single-process setups

mod frame;
mod memory;
mod tcp;

pub use frame::{decode, encode, MAX_MESSAGE_SIZE};
pub use memory::MemoryTransport;
pub use tcp::{TcpConfig, TcpTransport};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Message too large: {0} > {1}")]
    MessageTooLarge(usize, usize),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// A single transport message: string headers plus an opaque body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: HashMap<String, String>,
    pub body: Bytes,
}

impl Message {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message with the given body and no headers
    pub fn from_body(body: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Set a header, returning self for chaining
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }
}

/// One end of an established transport connection.
///
/// Sockets are shared between a send pump and a receive pump, so both
/// operations take `&self`; implementations serialize internally.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Send a message, returning once the transport accepted the write
    async fn send(&self, msg: Message) -> Result<(), TransportError>;

    /// Receive the next message
    async fn recv(&self) -> Result<Message, TransportError>;

    /// Close the connection (idempotent)
    async fn close(&self) -> Result<(), TransportError>;

    /// Remote endpoint address
    fn remote(&self) -> String;

    /// Local endpoint address
    fn local(&self) -> String;
}

/// Accepts inbound transport connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection
    async fn accept(&self) -> Result<Box<dyn Socket>, TransportError>;

    /// The bound address
    fn addr(&self) -> String;

    /// Stop accepting connections
    async fn close(&self) -> Result<(), TransportError>;
}

/// A pluggable transport backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote endpoint
    async fn dial(&self, addr: &str) -> Result<Box<dyn Socket>, TransportError>;

    /// Bind a listener on the given address
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError>;
}
