//! # weft
//!
//! A peer-to-peer overlay tunnel that multiplexes many logical
//! end-to-end sessions over a small pool of transport connections.
//!
//! Callers open named *channels* and obtain *sessions* (independent
//! bidirectional streams) on top of them, with unicast, multicast and
//! broadcast delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │            (Session send/recv per channel)           │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Engine                      │
//! │   (outbound router, demultiplexer, reconnection)     │
//! ├─────────────────────────────────────────────────────┤
//! │                      Links                           │
//! │      (pumps, RTT probes, rate, channel mappings)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                  (TCP, in-memory)                    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use weft::{DialOptions, ListenOptions, Message, Tunnel, TunnelOptions};
//!
//! # async fn run() -> weft::Result<()> {
//! let tunnel = Tunnel::new(TunnelOptions::new().with_address("127.0.0.1:9096"));
//! tunnel.connect().await?;
//!
//! // serve an echo listener; a unicast dial completes once accepted
//! let listener = tunnel.listen("echo", ListenOptions::new()).await?;
//! tokio::spawn(async move {
//!     if let Ok(session) = listener.accept().await {
//!         if let Ok(msg) = session.recv().await {
//!             let _ = session.send(msg).await;
//!         }
//!     }
//! });
//!
//! let session = tunnel.dial("echo", DialOptions::new()).await?;
//! session.send(Message::from_body("hello")).await?;
//!
//! let echoed = session.recv().await?;
//! assert_eq!(&echoed.body[..], b"hello");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod transport;
pub mod tunnel;

pub use transport::Message;
pub use tunnel::{
    DialOptions, Error, Link, LinkState, ListenOptions, Listener, Mode, Result, Session, Tunnel,
    TunnelOptions,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
