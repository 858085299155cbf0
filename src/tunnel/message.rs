//! Tunnel sub-protocol messages
//!
//! Every message on a link carries the `Micro-Tunnel*` headers below.
//! Inside the process, sessions and the engine exchange `Envelope`s over
//! the tunnel's central outbound channel.

use super::{Mode, Result};
use crate::transport::Message;
use tokio::sync::oneshot;

/// Message type header
pub(crate) const HEADER_MESSAGE: &str = "Micro-Tunnel";
/// Sender's tunnel id
pub(crate) const HEADER_ID: &str = "Micro-Tunnel-Id";
/// Channel name, comma-separated list for multi-announce, or empty
pub(crate) const HEADER_CHANNEL: &str = "Micro-Tunnel-Channel";
/// Session id, `"listener"`, or empty
pub(crate) const HEADER_SESSION: &str = "Micro-Tunnel-Session";
/// Link id, set on announce messages
pub(crate) const HEADER_LINK: &str = "Micro-Tunnel-Link";

/// Prefix shared by all tunnel headers, stripped before delivery
const HEADER_PREFIX: &str = "Micro-Tunnel";

/// Sub-protocol message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageType {
    /// Peer handshake, first message on every link
    Connect,
    /// Tunnel, listener or session shutdown
    Close,
    /// Link liveness
    KeepAlive,
    /// Dialer requests acceptance from a listener
    Open,
    /// Listener acknowledges an open
    Accept,
    /// Application payload
    Session,
    /// Ask peers to announce their channels
    Discover,
    /// Advertise one or more hosted channels
    Announce,
}

impl MessageType {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            MessageType::Connect => "connect",
            MessageType::Close => "close",
            MessageType::KeepAlive => "keepalive",
            MessageType::Open => "open",
            MessageType::Accept => "accept",
            MessageType::Session => "session",
            MessageType::Discover => "discover",
            MessageType::Announce => "announce",
        }
    }

    /// Parse a wire value; unknown types are blackholed by the caller
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "connect" => Some(MessageType::Connect),
            "close" => Some(MessageType::Close),
            "keepalive" => Some(MessageType::KeepAlive),
            "open" => Some(MessageType::Open),
            "accept" => Some(MessageType::Accept),
            "session" => Some(MessageType::Session),
            "discover" => Some(MessageType::Discover),
            "announce" => Some(MessageType::Announce),
            _ => None,
        }
    }
}

/// The in-memory form of a tunnel message, routed between sessions and
/// the engine before it is flattened onto a transport message.
pub(crate) struct Envelope {
    /// Message type
    pub typ: MessageType,
    /// Source tunnel id
    pub tunnel: String,
    /// Channel name
    pub channel: String,
    /// Session id
    pub session: String,
    /// Delivery mode
    pub mode: Mode,
    /// Produced by a dialled (outbound) session
    pub outbound: bool,
    /// Produced by a loopback-accepted session
    pub loopback: bool,
    /// Explicit link id; empty lets the router decide
    pub link: String,
    /// Carried application headers and body
    pub data: Option<Message>,
    /// One-shot status reply from the router, best effort
    pub status: Option<oneshot::Sender<Result<()>>>,
}

impl Envelope {
    pub(crate) fn new(typ: MessageType, tunnel: &str, channel: &str, session: &str) -> Self {
        Self {
            typ,
            tunnel: tunnel.to_string(),
            channel: channel.to_string(),
            session: session.to_string(),
            mode: Mode::Unicast,
            outbound: false,
            loopback: false,
            link: String::new(),
            data: None,
            status: None,
        }
    }
}

/// Remove all tunnel headers so the application only sees its own
pub(crate) fn strip_tunnel_headers(msg: &mut Message) {
    msg.header.retain(|k, _| !k.starts_with(HEADER_PREFIX));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for typ in [
            MessageType::Connect,
            MessageType::Close,
            MessageType::KeepAlive,
            MessageType::Open,
            MessageType::Accept,
            MessageType::Session,
            MessageType::Discover,
            MessageType::Announce,
        ] {
            assert_eq!(MessageType::parse(typ.as_str()), Some(typ));
        }
        assert_eq!(MessageType::parse("bogus"), None);
    }

    #[test]
    fn test_strip_tunnel_headers() {
        let mut msg = Message::from_body("payload")
            .with_header(HEADER_MESSAGE, "session")
            .with_header(HEADER_ID, "tunnel-1")
            .with_header(HEADER_CHANNEL, "chat")
            .with_header(HEADER_SESSION, "abc")
            .with_header("Content-Type", "text/plain");

        strip_tunnel_headers(&mut msg);

        assert_eq!(msg.header.len(), 1);
        assert_eq!(msg.header.get("Content-Type").unwrap(), "text/plain");
    }
}
