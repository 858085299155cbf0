//! A link wraps one transport socket with send/receive pumps, state
//! probes and traffic metrics.

use super::{Error, Result};
use crate::transport::{Message, Socket, TransportError};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, trace};

/// Header marking link-internal messages
const HEADER_METHOD: &str = "Micro-Method";
/// Header value for link state probes
const METHOD_LINK: &str = "link";

/// 4-byte zero body of an RTT probe request
const LINK_REQUEST: &[u8] = &[0, 0, 0, 0];
/// 4-byte one-filled body of an RTT probe response
const LINK_RESPONSE: &[u8] = &[1, 1, 1, 1];

/// Consecutive send/recv failures before a link reports `Error`
const MAX_ERRORS: u32 = 3;

/// Observable link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link is usable
    Connected,
    /// Too many consecutive failures; the monitor will reap it
    Error,
    /// Link was closed locally or remotely
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connected => write!(f, "connected"),
            LinkState::Error => write!(f, "error"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// A packet queued for the send pump
struct SendPacket {
    message: Message,
    status: oneshot::Sender<std::result::Result<(), TransportError>>,
}

/// A packet produced by the receive pump
struct RecvPacket {
    message: Message,
    err: Option<TransportError>,
}

impl RecvPacket {
    fn into_result(self) -> Result<Message> {
        match self.err {
            Some(e) => Err(Error::Transport(e)),
            None => Ok(self.message),
        }
    }
}

/// Mutable link state, guarded by the link's lock
struct Shared {
    /// Initially a generated id, replaced by the remote address once the
    /// connect handshake completes
    id: String,
    /// Whether the remote tunnel id equals ours
    loopback: bool,
    /// Dialled links set this after sending connect; accepted links wait
    /// for the connect message
    connected: bool,
    /// Last keepalive received from the remote
    last_keepalive: Instant,
    /// Channel name to last-seen mapping
    channels: HashMap<String, Instant>,
    /// Weighted moving average roundtrip in nanoseconds, 0 = unmeasured
    length: i64,
    /// Weighted moving average of bits per second, 0 = unmeasured
    rate: f64,
    /// Consecutive error count
    err_count: u32,
}

impl Shared {
    fn set_rate(&mut self, bits: i64, elapsed: Duration) {
        // bits per nanosecond, scaled to per second
        let ns = (elapsed.as_nanos().max(1)) as f64;
        let rate = bits as f64 / ns;

        if self.rate == 0.0 {
            self.rate = rate * 1e9;
        } else {
            self.rate = 0.8 * self.rate + 0.2 * (rate * 1e9);
        }
    }

    fn set_rtt(&mut self, d: Duration) {
        let ns = d.as_nanos() as i64;

        if self.length <= 0 {
            self.length = ns;
            return;
        }

        self.length = (0.8 * self.length as f64 + 0.2 * ns as f64) as i64;
    }
}

/// One underlying transport connection to a peer tunnel
pub struct Link {
    socket: Arc<dyn Socket>,
    send_tx: mpsc::Sender<SendPacket>,
    recv_tx: mpsc::Sender<RecvPacket>,
    recv_rx: Mutex<mpsc::Receiver<RecvPacket>>,
    closed: watch::Sender<bool>,
    shared: RwLock<Shared>,
}

impl Link {
    /// Wrap a socket and start its pumps and maintenance task
    pub(crate) fn new(socket: Arc<dyn Socket>, maintenance_interval: Duration) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(128);
        let (recv_tx, recv_rx) = mpsc::channel(128);
        let (state_tx, state_rx) = mpsc::channel(64);
        let (closed, _) = watch::channel(false);

        let link = Arc::new(Self {
            socket,
            send_tx,
            recv_tx,
            recv_rx: Mutex::new(recv_rx),
            closed,
            shared: RwLock::new(Shared {
                id: uuid::Uuid::new_v4().to_string(),
                loopback: false,
                connected: false,
                last_keepalive: Instant::now(),
                channels: HashMap::new(),
                length: 0,
                rate: 0.0,
                err_count: 0,
            }),
        });

        tokio::spawn(Self::send_pump(Arc::clone(&link), send_rx));
        tokio::spawn(Self::recv_pump(Arc::clone(&link), state_tx));
        tokio::spawn(Self::maintain(
            Arc::clone(&link),
            maintenance_interval,
            state_rx,
        ));

        link
    }

    /// Drain the send queue and write to the socket, reporting status
    /// back through the one-shot bundled with each packet
    async fn send_pump(link: Arc<Link>, mut send_rx: mpsc::Receiver<SendPacket>) {
        loop {
            tokio::select! {
                _ = link.closed_wait() => return,
                pk = send_rx.recv() => {
                    let Some(pk) = pk else { return };
                    let res = link.socket.send(pk.message).await;
                    let _ = pk.status.send(res);
                }
            }
        }
    }

    /// Read framed messages, diverting link probes to the state queue
    async fn recv_pump(link: Arc<Link>, state_tx: mpsc::Sender<RecvPacket>) {
        loop {
            let res = tokio::select! {
                _ = link.closed_wait() => return,
                res = link.socket.recv() => res,
            };

            match res {
                Ok(message) => {
                    let pk = RecvPacket { message, err: None };

                    if pk.message.header.get(HEADER_METHOD).map(String::as_str)
                        == Some(METHOD_LINK)
                    {
                        // probe packets never block the receive queue
                        let _ = state_tx.try_send(pk);
                        continue;
                    }

                    tokio::select! {
                        _ = link.closed_wait() => return,
                        _ = link.recv_tx.send(pk) => {}
                    }
                }
                Err(e) => {
                    link.shared.write().unwrap().err_count += 1;

                    let pk = RecvPacket {
                        message: Message::new(),
                        err: Some(e),
                    };
                    tokio::select! {
                        _ = link.closed_wait() => {}
                        _ = link.recv_tx.send(pk) => {}
                    }
                    return;
                }
            }
        }
    }

    /// Issue RTT probes, answer incoming ones and expire stale channel
    /// mappings on every maintenance tick
    async fn maintain(
        link: Arc<Link>,
        interval: Duration,
        mut state_rx: mpsc::Receiver<RecvPacket>,
    ) {
        let start = tokio::time::Instant::now() + interval;
        let mut tick = tokio::time::interval_at(start, interval);
        let expiry = interval * 2;

        let probe = |body: &'static [u8]| {
            Message::from_body(body).with_header(HEADER_METHOD, METHOD_LINK)
        };

        // initial probe
        let mut probe_sent = Instant::now();
        if let Err(e) = link.send(probe(LINK_REQUEST)).await {
            debug!("link {} failed to send probe: {}", link.id(), e);
        }

        loop {
            tokio::select! {
                _ = link.closed_wait() => return,
                Some(pk) = state_rx.recv() => {
                    if pk.err.is_some() {
                        continue;
                    }
                    if pk.message.body[..] == *LINK_REQUEST {
                        trace!("link {} received probe request", link.id());
                        if let Err(e) = link.send(probe(LINK_RESPONSE)).await {
                            debug!("link {} failed to answer probe: {}", link.id(), e);
                        }
                    } else if pk.message.body[..] == *LINK_RESPONSE {
                        let d = probe_sent.elapsed();
                        trace!("link {} probe response in {:?}", link.id(), d);
                        link.shared.write().unwrap().set_rtt(d);
                    }
                }
                _ = tick.tick() => {
                    {
                        let mut shared = link.shared.write().unwrap();
                        shared.channels.retain(|_, seen| seen.elapsed() <= expiry);
                    }

                    probe_sent = Instant::now();
                    if let Err(e) = link.send(probe(LINK_REQUEST)).await {
                        debug!("link {} failed to send probe: {}", link.id(), e);
                    }
                }
            }
        }
    }

    /// Send a message, blocking until the transport accepted the write.
    ///
    /// A successful send resets the error counter and feeds the rate
    /// estimate; a failed one increments the counter.
    pub(crate) async fn send(&self, msg: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut data_sent = msg.body.len();
        for (k, v) in &msg.header {
            data_sent += k.len() + v.len();
        }

        let (status_tx, status_rx) = oneshot::channel();
        let start = Instant::now();

        let pk = SendPacket {
            message: msg,
            status: status_tx,
        };

        tokio::select! {
            _ = self.closed_wait() => return Err(Error::Closed),
            res = self.send_tx.send(pk) => {
                if res.is_err() {
                    return Err(Error::Closed);
                }
            }
        }

        let result = tokio::select! {
            _ = self.closed_wait() => return Err(Error::Closed),
            res = status_rx => res.unwrap_or(Err(TransportError::Closed)),
        };

        let mut shared = self.shared.write().unwrap();
        match result {
            Err(e) => {
                shared.err_count += 1;
                Err(Error::Transport(e))
            }
            Ok(()) => {
                shared.err_count = 0;

                if data_sent > 0 {
                    let bits = (data_sent * 1024) as i64;
                    shared.set_rate(bits, start.elapsed());
                }
                Ok(())
            }
        }
    }

    /// Receive the next message. After close, whatever remains buffered
    /// is served before `Closed` is returned.
    pub(crate) async fn recv(&self) -> Result<Message> {
        let mut rx = self.recv_rx.lock().await;

        if self.is_closed() {
            return match rx.try_recv() {
                Ok(pk) => pk.into_result(),
                Err(_) => Err(Error::Closed),
            };
        }

        tokio::select! {
            _ = self.closed_wait() => match rx.try_recv() {
                Ok(pk) => pk.into_result(),
                Err(_) => Err(Error::Closed),
            },
            pk = rx.recv() => match pk {
                Some(pk) => pk.into_result(),
                None => Err(Error::Closed),
            },
        }
    }

    /// Close the link and its socket (idempotent)
    pub(crate) async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let _ = self.socket.close().await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the link is closed
    pub(crate) async fn closed_wait(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// The link's unique id
    pub fn id(&self) -> String {
        self.shared.read().unwrap().id.clone()
    }

    pub(crate) fn set_id(&self, id: impl Into<String>) {
        self.shared.write().unwrap().id = id.into();
    }

    /// Current load: depth of the send plus receive queues
    pub fn delay(&self) -> i64 {
        let send_depth = self.send_tx.max_capacity() - self.send_tx.capacity();
        let recv_depth = self.recv_tx.max_capacity() - self.recv_tx.capacity();
        (send_depth + recv_depth) as i64
    }

    /// Roundtrip time estimate in nanoseconds, 0 = unmeasured
    pub fn length(&self) -> i64 {
        self.shared.read().unwrap().length
    }

    /// Transfer rate estimate in bits per second, 0 = unmeasured
    pub fn rate(&self) -> f64 {
        self.shared.read().unwrap().rate
    }

    /// Observable state of the link
    pub fn state(&self) -> LinkState {
        if self.is_closed() {
            return LinkState::Closed;
        }
        if self.shared.read().unwrap().err_count > MAX_ERRORS {
            LinkState::Error
        } else {
            LinkState::Connected
        }
    }

    /// Link preference metric: delay x length x rate, lower is better
    pub(crate) fn metric(&self) -> f64 {
        let shared = self.shared.read().unwrap();
        self.delay() as f64 * shared.length as f64 * shared.rate
    }

    /// Remote address of the underlying socket
    pub fn remote(&self) -> String {
        self.socket.remote()
    }

    /// Local address of the underlying socket
    pub fn local(&self) -> String {
        self.socket.local()
    }

    pub(crate) fn connected(&self) -> bool {
        self.shared.read().unwrap().connected
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.shared.write().unwrap().connected = connected;
    }

    pub(crate) fn loopback(&self) -> bool {
        self.shared.read().unwrap().loopback
    }

    pub(crate) fn set_loopback(&self, loopback: bool) {
        self.shared.write().unwrap().loopback = loopback;
    }

    /// Record a roundtrip sample measured outside the probe cycle
    pub(crate) fn set_rtt(&self, d: Duration) {
        self.shared.write().unwrap().set_rtt(d);
    }

    /// Record a keepalive from the remote
    pub(crate) fn keepalive(&self) {
        self.shared.write().unwrap().last_keepalive = Instant::now();
    }

    pub(crate) fn last_keepalive(&self) -> Instant {
        self.shared.read().unwrap().last_keepalive
    }

    /// Last time the given channel was announced on this link
    pub(crate) fn get_channel(&self, channel: &str) -> Option<Instant> {
        self.shared.read().unwrap().channels.get(channel).copied()
    }

    /// Record the given channels as hosted behind this link
    pub(crate) fn set_channels(&self, channels: &[&str]) {
        let now = Instant::now();
        let mut shared = self.shared.write().unwrap();
        for ch in channels {
            shared.channels.insert(ch.to_string(), now);
        }
    }

    pub(crate) fn del_channel(&self, channel: &str) {
        self.shared.write().unwrap().channels.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Listener as _, MemoryTransport, Transport};

    async fn socket_pair() -> (Arc<dyn Socket>, Arc<dyn Socket>) {
        let transport = MemoryTransport::new();
        let listener = transport.listen("link-test:0").await.unwrap();
        let addr = listener.addr();
        let dialer = transport.dial(&addr).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        (Arc::from(dialer), Arc::from(accepted))
    }

    #[test]
    fn test_rtt_moving_average() {
        let mut shared = Shared {
            id: String::new(),
            loopback: false,
            connected: false,
            last_keepalive: Instant::now(),
            channels: HashMap::new(),
            length: 0,
            rate: 0.0,
            err_count: 0,
        };

        // first sample replaces the zero value
        shared.set_rtt(Duration::from_nanos(1000));
        assert_eq!(shared.length, 1000);

        // subsequent samples are weighted 0.8 / 0.2
        shared.set_rtt(Duration::from_nanos(2000));
        assert_eq!(shared.length, 1200);
    }

    #[test]
    fn test_rate_moving_average() {
        let mut shared = Shared {
            id: String::new(),
            loopback: false,
            connected: false,
            last_keepalive: Instant::now(),
            channels: HashMap::new(),
            length: 0,
            rate: 0.0,
            err_count: 0,
        };

        shared.set_rate(1_000_000, Duration::from_secs(1));
        assert!((shared.rate - 1_000_000.0).abs() < 1.0);

        shared.set_rate(2_000_000, Duration::from_secs(1));
        assert!((shared.rate - 1_200_000.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_send_recv_and_state() {
        let (a, b) = socket_pair().await;
        let link = Link::new(a, Duration::from_secs(60));

        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.length(), 0);
        assert!(link.rate() == 0.0);

        link.send(Message::from_body("ping")).await.unwrap();
        // skip any probe packets the maintenance task fired
        let got = loop {
            let m = b.recv().await.unwrap();
            if !m.header.contains_key(HEADER_METHOD) {
                break m;
            }
        };
        assert_eq!(&got.body[..], b"ping");
        // a successful send produced a rate sample
        assert!(link.rate() > 0.0);

        b.send(Message::from_body("pong")).await.unwrap();
        let got = link.recv().await.unwrap();
        assert_eq!(&got.body[..], b"pong");

        link.close().await;
        assert_eq!(link.state(), LinkState::Closed);
        // close is idempotent
        link.close().await;
        assert!(matches!(link.recv().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_keepalive_timestamp() {
        let (a, _b) = socket_pair().await;
        let link = Link::new(a, Duration::from_secs(60));

        let before = link.last_keepalive();
        tokio::time::sleep(Duration::from_millis(10)).await;

        link.keepalive();
        assert!(link.last_keepalive() > before);
    }

    #[tokio::test]
    async fn test_error_state_after_failures() {
        let (a, b) = socket_pair().await;
        let link = Link::new(a, Duration::from_secs(60));

        // remote goes away; sends start failing
        b.close().await.unwrap();

        for _ in 0..=MAX_ERRORS {
            let _ = link.send(Message::from_body("x")).await;
        }

        assert_eq!(link.state(), LinkState::Error);
    }

    #[tokio::test]
    async fn test_channel_mapping_expiry() {
        let (a, _b) = socket_pair().await;
        let link = Link::new(a, Duration::from_millis(50));

        link.set_channels(&["chat", "news"]);
        assert!(link.get_channel("chat").is_some());

        // mappings older than twice the tick are evicted
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(link.get_channel("chat").is_none());
        assert!(link.get_channel("news").is_none());
    }

    #[tokio::test]
    async fn test_probe_answered_by_peer_link() {
        let (a, b) = socket_pair().await;
        // two links probing each other at a fast tick
        let la = Link::new(a, Duration::from_millis(50));
        let _lb = Link::new(b, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(300)).await;

        // the probe cycle produced an rtt sample
        assert!(la.length() > 0);
    }
}
