//! Tunnel layer - multiplexed sessions over a pool of links
//!
//! Provides:
//! - Link lifecycle, RTT/rate estimation and channel mappings
//! - Session open/accept/discover/announce sub-protocol
//! - Per-channel listeners
//! - The tunnel engine: outbound router, per-link demultiplexer,
//!   reconnection monitor and housekeeping tickers

mod engine;
mod link;
mod listener;
mod message;
mod options;
mod session;

pub use engine::Tunnel;
pub use link::{Link, LinkState};
pub use listener::Listener;
pub use options::{DialOptions, ListenOptions, TunnelOptions};
pub use session::Session;

pub(crate) use message::{
    strip_tunnel_headers, Envelope, MessageType, HEADER_CHANNEL, HEADER_ID, HEADER_LINK,
    HEADER_MESSAGE, HEADER_SESSION,
};

use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Delivery semantics of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    /// Send over the first matching link
    #[default]
    Unicast,
    /// Send to every link known to host the channel
    Multicast,
    /// Send to every link
    Broadcast,
}

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("dial timeout")]
    DialTimeout,

    #[error("failed to discover channel")]
    DiscoverChannel,

    #[error("link not found")]
    LinkNotFound,

    #[error("already listening on {0}")]
    AlreadyListening(String),

    #[error("session {1} already exists on channel {0}")]
    SessionExists(String, String),

    #[error("connection closed")]
    Closed,

    #[error("tunnel not connected")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Dial timeout when none is specified
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval at which links fire discover messages
pub const DEFAULT_DISCOVER_INTERVAL: Duration = Duration::from_secs(60);

/// Interval at which links send keepalive messages
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Interval at which dead links are reaped and peers redialed
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Interval of the per-link maintenance tick (RTT probe, channel expiry).
/// Channel mappings older than twice this interval are evicted.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// The session id reserved for per-channel listeners
pub(crate) const LISTENER_SESSION: &str = "listener";
