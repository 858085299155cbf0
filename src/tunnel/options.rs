//! Tunnel, dial and listen options

use super::{
    Mode, DEFAULT_DIAL_TIMEOUT, DEFAULT_DISCOVER_INTERVAL, DEFAULT_KEEPALIVE_INTERVAL,
    DEFAULT_MAINTENANCE_INTERVAL, DEFAULT_RECONNECT_INTERVAL,
};
use crate::transport::{TcpTransport, Transport};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Options accepted by the tunnel factory.
///
/// The housekeeping intervals are process-level defaults exposed here so
/// tests can compress time.
#[derive(Clone)]
pub struct TunnelOptions {
    /// Unique tunnel id; generated when not supplied
    pub id: String,
    /// Shared token carried by every session
    pub token: String,
    /// Address the tunnel listens on
    pub address: String,
    /// Peer node addresses to link with
    pub nodes: Vec<String>,
    /// Underlying byte transport
    pub transport: Arc<dyn Transport>,
    /// Dial timeout applied when a dial does not supply one
    pub dial_timeout: Duration,
    /// Per-link discover tick
    pub discover_interval: Duration,
    /// Per-link keepalive tick
    pub keepalive_interval: Duration,
    /// Dead-link reap and peer redial tick
    pub reconnect_interval: Duration,
    /// Per-link maintenance tick (RTT probe, channel mapping expiry)
    pub maintenance_interval: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            address: "0.0.0.0:0".to_string(),
            nodes: Vec::new(),
            transport: Arc::new(TcpTransport::default()),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            discover_interval: DEFAULT_DISCOVER_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }
}

impl fmt::Debug for TunnelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelOptions")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("nodes", &self.nodes)
            .field("dial_timeout", &self.dial_timeout)
            .finish()
    }
}

impl TunnelOptions {
    /// Create options with defaults and a generated id
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tunnel id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the shared token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Set the listen address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the peer nodes
    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Set the transport backend
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Set the default dial timeout
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set all housekeeping intervals at once; used by tests to
    /// compress time
    pub fn with_intervals(
        mut self,
        discover: Duration,
        keepalive: Duration,
        reconnect: Duration,
        maintenance: Duration,
    ) -> Self {
        self.discover_interval = discover;
        self.keepalive_interval = keepalive;
        self.reconnect_interval = reconnect;
        self.maintenance_interval = maintenance;
        self
    }
}

/// Options for dialing a channel
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Overrides the tunnel's default dial timeout
    pub timeout: Option<Duration>,
    /// Pin the session to a specific link id
    pub link: String,
    /// Delivery mode
    pub mode: Mode,
}

impl DialOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound discover and open by this timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pin the session to the given link id
    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = link.into();
        self
    }

    /// Set the delivery mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

/// Options for listening on a channel
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Delivery mode of accepted sessions
    pub mode: Mode,
}

impl ListenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delivery mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}
