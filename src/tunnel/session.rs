//! A session is one logical bidirectional stream over the tunnel.
//!
//! Sessions never hold the tunnel itself, only its outbound channel and
//! close signal; the engine routes inbound envelopes into the session's
//! bounded receive queue.

use super::{Envelope, Error, MessageType, Mode, Result};
use crate::transport::Message;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::trace;

/// Everything needed to construct a session
pub(crate) struct SessionOptions {
    /// Owning tunnel id
    pub tunnel: String,
    pub channel: String,
    pub session: String,
    /// Shared tunnel token
    pub token: String,
    pub mode: Mode,
    /// Created by a local dial
    pub outbound: bool,
    /// Spawned from a loopback-accepted connection
    pub loopback: bool,
    /// Pinned link id, empty lets the router decide
    pub link: String,
    pub remote: String,
    pub local: String,
    /// Bounds discover and open
    pub timeout: Duration,
    /// The tunnel's central outbound channel
    pub send_tx: mpsc::Sender<Envelope>,
    /// The tunnel's close signal
    pub tunnel_closed: watch::Receiver<bool>,
}

/// Fields mutated after creation
struct Shared {
    link: String,
    remote: String,
    local: String,
    discovered: bool,
    accepted: bool,
    /// First inbound message was seen; remote is set
    waited: bool,
}

/// A unique session created when dialing or accepting on the tunnel
pub struct Session {
    tunnel: String,
    channel: String,
    session: String,
    token: String,
    mode: Mode,
    outbound: bool,
    loopback: bool,
    timeout: Duration,
    send_tx: mpsc::Sender<Envelope>,
    recv_tx: mpsc::Sender<Envelope>,
    recv_rx: Mutex<mpsc::Receiver<Envelope>>,
    closed: watch::Sender<bool>,
    tunnel_closed: watch::Receiver<bool>,
    shared: RwLock<Shared>,
}

impl Session {
    pub(crate) fn new(opts: SessionOptions) -> std::sync::Arc<Self> {
        let (recv_tx, recv_rx) = mpsc::channel(128);
        let (closed, _) = watch::channel(false);

        std::sync::Arc::new(Self {
            tunnel: opts.tunnel,
            channel: opts.channel,
            session: opts.session,
            token: opts.token,
            mode: opts.mode,
            outbound: opts.outbound,
            loopback: opts.loopback,
            timeout: opts.timeout,
            send_tx: opts.send_tx,
            recv_tx,
            recv_rx: Mutex::new(recv_rx),
            closed,
            tunnel_closed: opts.tunnel_closed,
            shared: RwLock::new(Shared {
                link: opts.link,
                remote: opts.remote,
                local: opts.local,
                discovered: false,
                accepted: false,
                waited: false,
            }),
        })
    }

    /// The unique session id
    pub fn id(&self) -> &str {
        &self.session
    }

    /// The channel this session targets
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The shared tunnel token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The link the session is pinned to, empty when the router decides
    pub fn link(&self) -> String {
        self.shared.read().unwrap().link.clone()
    }

    /// Delivery mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Remote address, set once the first inbound message arrives
    pub fn remote(&self) -> String {
        self.shared.read().unwrap().remote.clone()
    }

    /// Local address
    pub fn local(&self) -> String {
        self.shared.read().unwrap().local.clone()
    }

    /// Send an application message over the tunnel.
    ///
    /// The router reports back over a one-shot channel; an unfilled
    /// reply counts as success, acknowledgement beyond that belongs in
    /// the payload protocol.
    pub async fn send(&self, msg: Message) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let mut env = self.envelope(MessageType::Session);
        env.data = Some(msg);
        env.status = Some(tx);

        self.send_envelope(env).await?;

        tokio::select! {
            _ = self.closed_wait() => Err(Error::Closed),
            res = rx => match res {
                Ok(r) => r,
                Err(_) => Ok(()),
            },
        }
    }

    /// Receive the next application message; `Closed` once the session
    /// or the tunnel has shut down.
    pub async fn recv(&self) -> Result<Message> {
        loop {
            let env = tokio::select! {
                _ = self.closed_wait() => return Err(Error::Closed),
                env = async { self.recv_rx.lock().await.recv().await } => env,
            };

            match env {
                Some(env) if env.typ == MessageType::Session => {
                    return Ok(env.data.unwrap_or_default())
                }
                // stray control envelopes are not for the application
                Some(_) => continue,
                None => return Err(Error::Closed),
            }
        }
    }

    /// Close the session (idempotent). A close message is sent best
    /// effort so the remote can tear down unicast state.
    pub async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        let env = self.envelope(MessageType::Close);
        let _ = self.send_tx.try_send(env);
        Ok(())
    }

    /// Request acceptance from the channel's listener. Waits for the
    /// accept on unicast sessions, bounded by the dial timeout.
    pub(crate) async fn open(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let mut env = self.envelope(MessageType::Open);
        env.status = Some(tx);

        self.send_envelope(env).await?;

        // multicast and broadcast sessions don't wait for an accept
        if self.mode != Mode::Unicast {
            let mut shared = self.shared.write().unwrap();
            shared.discovered = true;
            shared.accepted = true;
            return Ok(());
        }

        tokio::select! {
            _ = self.closed_wait() => return Err(Error::Closed),
            res = rx => match res {
                Ok(r) => r?,
                Err(_) => {}
            },
        }

        let wait = async {
            loop {
                let env = self.recv_rx.lock().await.recv().await;
                match env {
                    Some(env) if env.typ == MessageType::Accept => {
                        let mut shared = self.shared.write().unwrap();
                        shared.accepted = true;
                        shared.link = env.link;
                        return Ok(());
                    }
                    Some(_) => continue,
                    None => return Err(Error::Closed),
                }
            }
        };

        tokio::select! {
            _ = self.closed_wait() => Err(Error::Closed),
            res = tokio::time::timeout(self.timeout, wait) => match res {
                Ok(r) => r,
                Err(_) => Err(Error::DialTimeout),
            },
        }
    }

    /// Acknowledge an open; sent by the listener side
    pub(crate) async fn accept(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let mut env = self.envelope(MessageType::Accept);
        env.status = Some(tx);

        self.send_envelope(env).await?;

        tokio::select! {
            _ = self.closed_wait() => Err(Error::Closed),
            res = rx => match res {
                Ok(r) => r,
                Err(_) => Ok(()),
            },
        }
    }

    /// Broadcast this listener's channel to all links
    pub(crate) async fn announce(&self) -> Result<()> {
        let mut env = self.envelope(MessageType::Announce);
        env.mode = Mode::Broadcast;
        env.link = String::new();

        self.send_envelope(env).await
    }

    /// Broadcast a discover and wait for a matching announce. The first
    /// announce pins the session's link.
    pub(crate) async fn discover(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let mut env = self.envelope(MessageType::Discover);
        env.mode = Mode::Broadcast;
        env.outbound = true;
        env.link = String::new();
        env.status = Some(tx);

        self.send_envelope(env).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;

        // the router must have fanned the discover out first
        let sent = tokio::select! {
            _ = self.closed_wait() => return Err(Error::Closed),
            _ = tokio::time::sleep_until(deadline) => return Err(Error::DiscoverChannel),
            res = rx => match res {
                Ok(r) => r,
                Err(_) => Ok(()),
            },
        };
        sent?;

        let wait = async {
            loop {
                let env = self.recv_rx.lock().await.recv().await;
                match env {
                    Some(env) if env.typ == MessageType::Announce => {
                        let mut shared = self.shared.write().unwrap();
                        shared.link = env.link;
                        shared.discovered = true;
                        return Ok(());
                    }
                    Some(_) => continue,
                    None => return Err(Error::Closed),
                }
            }
        };

        tokio::select! {
            _ = self.closed_wait() => Err(Error::Closed),
            _ = tokio::time::sleep_until(deadline) => Err(Error::DiscoverChannel),
            res = wait => res,
        }
    }

    /// Push an inbound envelope into the receive queue without blocking;
    /// a full queue drops the envelope.
    pub(crate) fn deliver(&self, env: Envelope) {
        if self.recv_tx.try_send(env).is_err() {
            trace!(
                "session {} {} dropped inbound message",
                self.channel,
                self.session
            );
        }
    }

    /// Clone of the tunnel's outbound channel, for sessions spawned by
    /// a listener
    pub(crate) fn send_handle(&self) -> mpsc::Sender<Envelope> {
        self.send_tx.clone()
    }

    /// Next raw envelope; used by the listener's processor
    pub(crate) async fn next_envelope(&self) -> Option<Envelope> {
        tokio::select! {
            _ = self.closed_wait() => None,
            env = async { self.recv_rx.lock().await.recv().await } => env,
        }
    }

    /// Record the remote address when the first inbound message arrives
    pub(crate) fn set_remote_once(&self, remote: &str) {
        let mut shared = self.shared.write().unwrap();
        if !shared.waited {
            shared.remote = remote.to_string();
            shared.waited = true;
        }
    }

    pub(crate) fn discovered(&self) -> bool {
        self.shared.read().unwrap().discovered
    }

    pub(crate) fn set_discovered(&self, discovered: bool) {
        self.shared.write().unwrap().discovered = discovered;
    }

    pub(crate) fn accepted(&self) -> bool {
        self.shared.read().unwrap().accepted
    }

    pub(crate) fn set_accepted(&self, accepted: bool) {
        self.shared.write().unwrap().accepted = accepted;
    }

    pub(crate) fn set_link(&self, link: impl Into<String>) {
        self.shared.write().unwrap().link = link.into();
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow() || *self.tunnel_closed.borrow()
    }

    /// Resolves once the session or the tunnel is closed
    pub(crate) async fn closed_wait(&self) {
        let mut session = self.closed.subscribe();
        let mut tunnel = self.tunnel_closed.clone();
        tokio::select! {
            _ = session.wait_for(|c| *c) => {}
            _ = tunnel.wait_for(|c| *c) => {}
        }
    }

    /// Put an envelope onto the tunnel's outbound channel, observing
    /// both close signals
    async fn send_envelope(&self, env: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        tokio::select! {
            _ = self.closed_wait() => Err(Error::Closed),
            res = self.send_tx.send(env) => res.map_err(|_| Error::Closed),
        }
    }

    fn envelope(&self, typ: MessageType) -> Envelope {
        let shared = self.shared.read().unwrap();
        Envelope {
            typ,
            tunnel: self.tunnel.clone(),
            channel: self.channel.clone(),
            session: self.session.clone(),
            mode: self.mode,
            outbound: self.outbound,
            loopback: self.loopback,
            link: shared.link.clone(),
            data: None,
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_session(mode: Mode) -> (Arc<Session>, mpsc::Receiver<Envelope>, watch::Sender<bool>) {
        let (send_tx, send_rx) = mpsc::channel(128);
        let (tunnel_closed_tx, tunnel_closed) = watch::channel(false);

        let session = Session::new(SessionOptions {
            tunnel: "tunnel-1".to_string(),
            channel: "chat".to_string(),
            session: "abc".to_string(),
            token: "token".to_string(),
            mode,
            outbound: true,
            loopback: false,
            link: String::new(),
            remote: String::new(),
            local: "local".to_string(),
            timeout: Duration::from_millis(100),
            send_tx,
            tunnel_closed,
        });

        (session, send_rx, tunnel_closed_tx)
    }

    #[tokio::test]
    async fn test_open_multicast_is_immediate() {
        let (session, mut send_rx, _tunnel_closed) = test_session(Mode::Multicast);

        session.open().await.unwrap();
        assert!(session.accepted());
        assert!(session.discovered());

        let env = send_rx.recv().await.unwrap();
        assert_eq!(env.typ, MessageType::Open);
    }

    #[tokio::test]
    async fn test_open_unicast_waits_for_accept() {
        let (session, mut send_rx, _tunnel_closed) = test_session(Mode::Unicast);

        let router = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let env = send_rx.recv().await.unwrap();
                assert_eq!(env.typ, MessageType::Open);
                if let Some(status) = env.status {
                    status.send(Ok(())).unwrap();
                }

                // remote listener accepted
                let mut accept = Envelope::new(MessageType::Accept, "peer", "chat", "abc");
                accept.link = "link-1".to_string();
                session.deliver(accept);
            })
        };

        session.open().await.unwrap();
        assert!(session.accepted());
        assert_eq!(session.link(), "link-1");
        router.await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_pins_link() {
        let (session, mut send_rx, _tunnel_closed) = test_session(Mode::Unicast);

        let router = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let env = send_rx.recv().await.unwrap();
                assert_eq!(env.typ, MessageType::Discover);
                assert_eq!(env.mode, Mode::Broadcast);
                if let Some(status) = env.status {
                    status.send(Ok(())).unwrap();
                }

                let mut announce = Envelope::new(MessageType::Announce, "peer", "chat", "abc");
                announce.link = "link-9".to_string();
                session.deliver(announce);
            })
        };

        session.discover().await.unwrap();
        assert!(session.discovered());
        assert_eq!(session.link(), "link-9");
        router.await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_timeout() {
        let (session, mut send_rx, _tunnel_closed) = test_session(Mode::Unicast);

        // router acknowledges the send but no announce ever arrives
        let _router = tokio::spawn(async move {
            let env = send_rx.recv().await.unwrap();
            if let Some(status) = env.status {
                status.send(Ok(())).unwrap();
            }
            // hold the receiver open
            let _ = send_rx.recv().await;
        });

        assert!(matches!(
            session.discover().await,
            Err(Error::DiscoverChannel)
        ));
    }

    #[tokio::test]
    async fn test_send_and_recv() {
        let (session, mut send_rx, _tunnel_closed) = test_session(Mode::Unicast);

        let router = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let env = send_rx.recv().await.unwrap();
                assert_eq!(env.typ, MessageType::Session);
                assert_eq!(&env.data.as_ref().unwrap().body[..], b"hello");
                if let Some(status) = env.status {
                    status.send(Ok(())).unwrap();
                }

                let mut reply = Envelope::new(MessageType::Session, "peer", "chat", "abc");
                reply.data = Some(Message::from_body("world"));
                session.deliver(reply);
            })
        };

        session.send(Message::from_body("hello")).await.unwrap();
        let msg = session.recv().await.unwrap();
        assert_eq!(&msg.body[..], b"world");
        router.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _send_rx, _tunnel_closed) = test_session(Mode::Unicast);

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(session.is_closed());
        assert!(matches!(session.recv().await, Err(Error::Closed)));
        assert!(matches!(
            session.send(Message::from_body("x")).await,
            Err(Error::Closed)
        ));
    }
}
