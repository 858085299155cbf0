//! The tunnel engine
//!
//! Owns the links and sessions, runs the central outbound router, one
//! demultiplexer per link, the reconnection monitor and the per-link
//! housekeeping tickers.

use super::link::{Link, LinkState};
use super::session::SessionOptions;
use super::{
    strip_tunnel_headers, DialOptions, Envelope, Error, ListenOptions, Listener, MessageType,
    Mode, Result, Session, TunnelOptions, HEADER_CHANNEL, HEADER_ID, HEADER_LINK, HEADER_MESSAGE,
    HEADER_SESSION, LISTENER_SESSION,
};
use crate::transport::{Listener as TransportListener, Message, Socket};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace, warn};

/// A peer-to-peer overlay tunnel multiplexing sessions over links.
///
/// Cheap to clone; all clones drive the same tunnel.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

struct Inner {
    /// Unique id of this tunnel
    id: String,
    /// Shared token carried by every session
    token: String,
    options: RwLock<TunnelOptions>,
    connected: RwLock<bool>,
    /// Serializes connect and close
    lifecycle: Mutex<()>,
    /// The single central outbound channel
    send_tx: mpsc::Sender<Envelope>,
    /// Receiver side, held here between connects
    send_rx: StdMutex<Option<mpsc::Receiver<Envelope>>>,
    closed: watch::Sender<bool>,
    /// channel + session id -> session
    sessions: RwLock<HashMap<(String, String), Arc<Session>>>,
    /// node address -> link
    links: RwLock<HashMap<String, Arc<Link>>>,
    listener: StdMutex<Option<Arc<dyn TransportListener>>>,
    listen_addr: RwLock<Option<String>>,
}

impl Tunnel {
    /// Create a tunnel from the given options. Nothing runs until
    /// [`Tunnel::connect`] is called.
    pub fn new(options: TunnelOptions) -> Self {
        let (send_tx, send_rx) = mpsc::channel(128);
        let (closed, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                id: options.id.clone(),
                token: options.token.clone(),
                options: RwLock::new(options),
                connected: RwLock::new(false),
                lifecycle: Mutex::new(()),
                send_tx,
                send_rx: StdMutex::new(Some(send_rx)),
                closed,
                sessions: RwLock::new(HashMap::new()),
                links: RwLock::new(HashMap::new()),
                listener: StdMutex::new(None),
                listen_addr: RwLock::new(None),
            }),
        }
    }

    /// Re-apply options. The id and token are fixed at creation.
    pub fn init(&self, options: TunnelOptions) {
        *self.inner.options.write().unwrap() = options;
    }

    /// The unique id of this tunnel
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The address the tunnel is listening on; the configured address
    /// until connected, the bound one after.
    pub fn address(&self) -> String {
        if *self.inner.connected.read().unwrap() {
            if let Some(addr) = self.inner.listen_addr.read().unwrap().clone() {
                return addr;
            }
        }
        self.inner.options.read().unwrap().address.clone()
    }

    /// Snapshot of all links the tunnel currently holds
    pub fn links(&self) -> Vec<Arc<Link>> {
        self.inner.links.read().unwrap().values().cloned().collect()
    }

    /// Bind the transport listener, link up with all configured peers
    /// and start the engine tasks. Calling connect on a connected
    /// tunnel only re-establishes missing links.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;

        if *inner.connected.read().unwrap() {
            Inner::setup_links(inner).await;
            return Ok(());
        }

        let (transport, address) = {
            let options = inner.options.read().unwrap();
            (Arc::clone(&options.transport), options.address.clone())
        };

        let listener: Arc<dyn TransportListener> = Arc::from(transport.listen(&address).await?);
        *inner.listen_addr.write().unwrap() = Some(listener.addr());
        *inner.listener.lock().unwrap() = Some(Arc::clone(&listener));

        inner.closed.send_replace(false);
        *inner.connected.write().unwrap() = true;

        tokio::spawn(Inner::accept_loop(Arc::clone(inner), listener));

        Inner::setup_links(inner).await;

        tokio::spawn(Inner::process(Arc::clone(inner)));
        tokio::spawn(Inner::monitor(Arc::clone(inner)));

        Ok(())
    }

    /// Close the tunnel: all sessions, all links, the listener
    /// (idempotent).
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;

        if !*inner.connected.read().unwrap() {
            return Ok(());
        }

        debug!("tunnel {} closing", inner.id);
        *inner.connected.write().unwrap() = false;
        inner.closed.send_replace(true);

        let sessions: Vec<Arc<Session>> = {
            let mut sessions = inner.sessions.write().unwrap();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            let _ = session.close().await;
        }

        // tell the peers, then drop the links
        let links: Vec<Arc<Link>> = {
            let mut links = inner.links.write().unwrap();
            links.drain().map(|(_, l)| l).collect()
        };
        for link in links {
            let msg = Message::new()
                .with_header(HEADER_MESSAGE, MessageType::Close.as_str())
                .with_header(HEADER_ID, inner.id.as_str());
            let _ = link.send(msg).await;
            link.close().await;
        }

        let listener = inner.listener.lock().unwrap().take();
        if let Some(listener) = listener {
            let _ = listener.close().await;
        }

        Ok(())
    }

    /// Dial a channel, returning a session once the channel has been
    /// discovered and, for unicast, the remote listener accepted.
    pub async fn dial(&self, channel: &str, opts: DialOptions) -> Result<Arc<Session>> {
        let inner = &self.inner;
        debug!("tunnel dialing {}", channel);

        let timeout = opts
            .timeout
            .unwrap_or_else(|| inner.options.read().unwrap().dial_timeout);
        let session_id = uuid::Uuid::new_v4().to_string();

        let session = inner.new_session(
            channel,
            &session_id,
            opts.mode,
            timeout,
            true,
            channel,
            "local",
        )?;

        // find links that already know the channel
        let mut candidates = Vec::new();
        {
            let links = inner.links.read().unwrap();
            for link in links.values() {
                // loopback accepted links never carry outbound dials,
                // the dialled side of the pair does
                if link.loopback() {
                    continue;
                }
                if !opts.link.is_empty() && link.id() != opts.link {
                    continue;
                }
                if link.get_channel(channel).is_some() {
                    candidates.push(Arc::clone(link));
                    session.set_discovered(true);
                }
            }
        }

        // a pinned link must know the channel
        if candidates.is_empty() && !opts.link.is_empty() {
            inner.del_session(channel, &session_id).await;
            debug!(
                "tunnel deleting session {} {}: link not found",
                channel, session_id
            );
            return Err(Error::LinkNotFound);
        }

        let mut measured = false;

        if session.discovered() && opts.mode == Mode::Unicast {
            if let Some(link) = pick_link(&candidates) {
                session.set_link(link.id());
            }
        }

        if !session.discovered() {
            let started = Instant::now();

            if let Err(e) = session.discover().await {
                inner.del_session(channel, &session_id).await;
                debug!("tunnel deleting session {} {}: {}", channel, session_id, e);
                return Err(e);
            }

            // piggyback the discover roundtrip as an rtt sample
            if let Some(link) = inner.find_link(&session.link()) {
                link.set_rtt(started.elapsed());
                measured = true;
            }
        }

        let started = Instant::now();

        if let Err(e) = session.open().await {
            inner.del_session(channel, &session_id).await;
            debug!("tunnel deleting session {} {}: {}", channel, session_id, e);
            return Err(e);
        }

        if !measured && opts.mode == Mode::Unicast {
            if let Some(link) = inner.find_link(&session.link()) {
                link.set_rtt(started.elapsed());
            }
        }

        Ok(session)
    }

    /// Listen for sessions on a channel. Only one listener per channel
    /// may exist at a time.
    pub async fn listen(&self, channel: &str, opts: ListenOptions) -> Result<Arc<Listener>> {
        let inner = &self.inner;
        debug!("tunnel listening on {}", channel);

        let (timeout, announce_interval) = {
            let options = inner.options.read().unwrap();
            (options.dial_timeout, options.discover_interval)
        };

        let session = inner
            .new_session(
                channel,
                LISTENER_SESSION,
                opts.mode,
                timeout,
                false,
                "remote",
                channel,
            )
            .map_err(|_| Error::AlreadyListening(channel.to_string()))?;

        let del = {
            let inner = Arc::clone(inner);
            let channel = channel.to_string();
            Box::new(move || {
                inner
                    .sessions
                    .write()
                    .unwrap()
                    .remove(&(channel.clone(), LISTENER_SESSION.to_string()));
            }) as Box<dyn Fn() + Send + Sync>
        };

        Ok(Listener::new(
            channel.to_string(),
            inner.token.clone(),
            session,
            inner.closed.subscribe(),
            announce_interval,
            del,
        ))
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "weft")
    }
}

impl Inner {
    async fn closed_wait(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    fn get_session(&self, channel: &str, session: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .get(&(channel.to_string(), session.to_string()))
            .cloned()
    }

    /// Remove a session by its full key and close it
    async fn del_session(&self, channel: &str, session: &str) {
        let removed = self
            .sessions
            .write()
            .unwrap()
            .remove(&(channel.to_string(), session.to_string()));
        if let Some(session) = removed {
            let _ = session.close().await;
        }
    }

    /// Create and register a session; fails if the key is taken
    #[allow(clippy::too_many_arguments)]
    fn new_session(
        &self,
        channel: &str,
        session_id: &str,
        mode: Mode,
        timeout: Duration,
        outbound: bool,
        remote: &str,
        local: &str,
    ) -> Result<Arc<Session>> {
        let session = Session::new(SessionOptions {
            tunnel: self.id.clone(),
            channel: channel.to_string(),
            session: session_id.to_string(),
            token: self.token.clone(),
            mode,
            outbound,
            loopback: false,
            link: String::new(),
            remote: remote.to_string(),
            local: local.to_string(),
            timeout,
            send_tx: self.send_tx.clone(),
            tunnel_closed: self.closed.subscribe(),
        });

        let mut sessions = self.sessions.write().unwrap();
        let key = (channel.to_string(), session_id.to_string());
        if sessions.contains_key(&key) {
            return Err(Error::SessionExists(
                channel.to_string(),
                session_id.to_string(),
            ));
        }
        sessions.insert(key, Arc::clone(&session));

        Ok(session)
    }

    /// Channels we host a listener for
    fn list_channels(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap()
            .keys()
            .filter(|(_, sid)| sid == LISTENER_SESSION)
            .map(|(ch, _)| ch.clone())
            .collect()
    }

    /// Find a link by its id
    fn find_link(&self, id: &str) -> Option<Arc<Link>> {
        if id.is_empty() {
            return None;
        }
        self.links
            .read()
            .unwrap()
            .values()
            .find(|l| l.id() == id)
            .cloned()
    }

    /// Close and remove every link whose id matches the given remote
    async fn del_link(&self, remote: &str) {
        let removed: Vec<Arc<Link>> = {
            let mut links = self.links.write().unwrap();
            let keys: Vec<String> = links
                .iter()
                .filter(|(_, l)| l.id() == remote)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter().filter_map(|k| links.remove(&k)).collect()
        };

        for link in removed {
            debug!("tunnel deleting link {} remote {}", link.id(), link.remote());
            link.close().await;
        }
    }

    /// Dial every configured peer that has no live link yet
    async fn setup_links(inner: &Arc<Inner>) {
        let nodes = inner.options.read().unwrap().nodes.clone();

        for node in nodes {
            if node.is_empty() {
                continue;
            }
            if inner.links.read().unwrap().contains_key(&node) {
                continue;
            }

            match Inner::setup_link(inner, &node).await {
                Ok(link) => {
                    inner.links.write().unwrap().insert(node, link);
                }
                Err(e) => {
                    debug!("tunnel failed to establish link to {}: {}", node, e);
                }
            }
        }
    }

    /// Dial a node, send the connect handshake and start the link tasks
    async fn setup_link(inner: &Arc<Inner>, node: &str) -> Result<Arc<Link>> {
        debug!("tunnel {} setting up link to {}", inner.id, node);

        let (transport, maintenance) = {
            let options = inner.options.read().unwrap();
            (Arc::clone(&options.transport), options.maintenance_interval)
        };

        let socket: Arc<dyn Socket> = Arc::from(transport.dial(node).await?);
        let remote = socket.remote();

        let link = Link::new(socket, maintenance);
        link.set_id(remote);

        let msg = Message::new()
            .with_header(HEADER_MESSAGE, MessageType::Connect.as_str())
            .with_header(HEADER_ID, inner.id.as_str());
        link.send(msg).await?;

        // we made the outbound connection and sent the connect message
        link.set_connected(true);

        tokio::spawn(Inner::demux(Arc::clone(inner), Arc::clone(&link)));
        tokio::spawn(Inner::keepalive(Arc::clone(inner), Arc::clone(&link)));
        tokio::spawn(Inner::discover(Arc::clone(inner), Arc::clone(&link)));

        Ok(link)
    }

    /// Accept inbound transport connections and wrap them as links.
    /// Inbound links only join the link map once their connect message
    /// arrives.
    async fn accept_loop(inner: Arc<Inner>, listener: Arc<dyn TransportListener>) {
        loop {
            let socket = tokio::select! {
                _ = inner.closed_wait() => return,
                res = listener.accept() => match res {
                    Ok(socket) => socket,
                    Err(e) => {
                        if *inner.connected.read().unwrap() {
                            warn!("tunnel listener died: {}", e);
                        }
                        return;
                    }
                },
            };

            debug!("tunnel {} accepted connection from {}", inner.id, socket.remote());

            let maintenance = inner.options.read().unwrap().maintenance_interval;
            let link = Link::new(Arc::from(socket), maintenance);

            tokio::spawn(Inner::keepalive(Arc::clone(&inner), Arc::clone(&link)));
            tokio::spawn(Inner::discover(Arc::clone(&inner), Arc::clone(&link)));
            tokio::spawn(Inner::demux(Arc::clone(&inner), Arc::clone(&link)));
        }
    }

    /// The central outbound multiplexer: one task consuming the
    /// tunnel's send channel and fanning envelopes onto links.
    async fn process(inner: Arc<Inner>) {
        let taken = inner.send_rx.lock().unwrap().take();
        let Some(mut send_rx) = taken else { return };

        loop {
            tokio::select! {
                _ = inner.closed_wait() => break,
                env = send_rx.recv() => match env {
                    Some(env) => inner.route(env).await,
                    None => break,
                },
            }
        }

        // hand the receiver back for a future connect
        *inner.send_rx.lock().unwrap() = Some(send_rx);
    }

    /// Flatten an envelope onto a transport message and send it over
    /// the chosen link set.
    async fn route(&self, mut env: Envelope) {
        let mut tmsg = Message::new();
        if let Some(data) = env.data.take() {
            tmsg.header = data.header;
            tmsg.body = data.body;
        }
        tmsg.header
            .insert(HEADER_MESSAGE.to_string(), env.typ.as_str().to_string());
        tmsg.header.insert(HEADER_ID.to_string(), env.tunnel.clone());
        tmsg.header
            .insert(HEADER_CHANNEL.to_string(), env.channel.clone());
        tmsg.header
            .insert(HEADER_SESSION.to_string(), env.session.clone());

        // snapshot the links, then release the lock before any I/O
        let links: Vec<Arc<Link>> = self.links.read().unwrap().values().cloned().collect();

        if links.is_empty() {
            debug!(
                "no links to send message type {} channel {}",
                env.typ.as_str(),
                env.channel
            );
        }

        let mut err: Option<Error> = None;
        let mut send_to = Vec::new();

        for link in links {
            if !link.connected() {
                debug!("link {} not connected", link.id());
                err = Some(Error::NotConnected);
                continue;
            }

            // a loopback accepted link never carries outbound dials
            if link.loopback() && env.outbound {
                err = Some(Error::LinkNotFound);
                continue;
            }

            // loopback listener replies only travel the loopback link
            if env.loopback && !link.loopback() {
                err = Some(Error::LinkNotFound);
                continue;
            }

            if env.mode == Mode::Multicast {
                // multicast goes only to links that know the channel
                if link.get_channel(&env.channel).is_none() {
                    continue;
                }
            } else if !env.link.is_empty() && link.id() != env.link {
                err = Some(Error::LinkNotFound);
                continue;
            }

            send_to.push(link);
        }

        let mut sent = false;

        for link in send_to {
            trace!(
                "sending {} for {} {} to {}",
                env.typ.as_str(),
                env.channel,
                env.session,
                link.remote()
            );

            match link.send(tmsg.clone()).await {
                Ok(()) => {
                    sent = true;
                    // unicast stops at the first delivery
                    if env.mode == Mode::Unicast {
                        break;
                    }
                }
                Err(e) => {
                    debug!("tunnel error sending to {}: {}", link.remote(), e);
                    // the monitor would reap it eventually; this
                    // shortens the window
                    self.del_link(&link.id()).await;
                    err = Some(e);
                }
            }
        }

        let result = if sent {
            Ok(())
        } else {
            match err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        };

        if let Some(status) = env.status {
            // best effort, the sender may have given up
            let _ = status.send(result);
        }
    }

    /// Reply to a discover with an announce over the given link
    async fn announce(&self, channel: &str, session: &str, link: &Arc<Link>) {
        let mut msg = Message::new()
            .with_header(HEADER_MESSAGE, MessageType::Announce.as_str())
            .with_header(HEADER_ID, self.id.as_str())
            .with_header(HEADER_CHANNEL, channel)
            .with_header(HEADER_SESSION, session)
            .with_header(HEADER_LINK, link.id());

        if channel.is_empty() {
            // asked to announce everything we host
            let channels = self.list_channels();
            if channels.is_empty() {
                return;
            }
            msg.header
                .insert(HEADER_CHANNEL.to_string(), channels.join(","));
        } else {
            // only answer for channels we actually host
            if self.get_session(channel, LISTENER_SESSION).is_none() {
                return;
            }
        }

        debug!(
            "tunnel sending announce for channel(s) {}",
            msg.header[HEADER_CHANNEL]
        );

        if let Err(e) = link.send(msg).await {
            debug!("tunnel failed to send announce: {}", e);
        }
    }

    /// Per-link demultiplexer: read, classify, dispatch.
    async fn demux(inner: Arc<Inner>, link: Arc<Link>) {
        let mut loopback = false;
        let mut connected = link.connected();

        loop {
            let mut msg = match link.recv().await {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("tunnel link {} receive error: {}", link.remote(), e);
                    break;
                }
            };

            let typ = msg
                .header
                .get(HEADER_MESSAGE)
                .and_then(|t| MessageType::parse(t));
            let id = msg.header.get(HEADER_ID).cloned().unwrap_or_default();
            let channel = msg.header.get(HEADER_CHANNEL).cloned().unwrap_or_default();
            let session_id = msg.header.get(HEADER_SESSION).cloned().unwrap_or_default();

            // blackhole unknown types
            let Some(typ) = typ else { continue };

            // the first message we process needs to be connect
            if !connected && typ != MessageType::Connect {
                debug!("tunnel link {} not connected", link.id());
                break;
            }

            match typ {
                MessageType::Connect => {
                    debug!("tunnel link {} received connect message", link.remote());

                    // are we connecting to ourselves?
                    if id == inner.id {
                        link.set_loopback(true);
                        loopback = true;
                    }

                    link.set_id(link.remote());
                    link.set_connected(true);
                    connected = true;

                    // adopt the link keyed by its remote address
                    inner
                        .links
                        .write()
                        .unwrap()
                        .insert(link.remote(), Arc::clone(&link));

                    // push our channels to the other side
                    let announce_inner = Arc::clone(&inner);
                    let announce_link = Arc::clone(&link);
                    tokio::spawn(async move {
                        announce_inner.announce("", "", &announce_link).await;
                    });
                    continue;
                }
                MessageType::Close => {
                    // no channel means the link itself goes away
                    if channel.is_empty() {
                        debug!("tunnel link {} received close message", link.remote());
                        break;
                    }

                    // the remote listener went away, drop the mapping
                    if session_id == LISTENER_SESSION {
                        link.del_channel(&channel);
                        continue;
                    }

                    if let Some(session) = inner.get_session(&channel, &session_id) {
                        // only unicast sessions die on a remote close,
                        // and never over loopback
                        if !loopback && session.mode() == Mode::Unicast {
                            inner.del_session(&channel, &session_id).await;
                            continue;
                        }
                    }
                    // otherwise hand it on: a listener tears down its
                    // own spawned sessions
                }
                MessageType::KeepAlive => {
                    trace!("tunnel link {} received keepalive", link.remote());
                    link.keepalive();
                    continue;
                }
                MessageType::Announce => {
                    let channels: Vec<&str> = channel.split(',').collect();
                    link.set_channels(&channels);

                    // not directed at a pending session
                    if session_id == LISTENER_SESSION || session_id.is_empty() {
                        continue;
                    }

                    // unblock the session waiting in discover
                    if let Some(session) = inner.get_session(&channel, &session_id) {
                        if session.discovered() {
                            continue;
                        }
                        let mut env = Envelope::new(MessageType::Announce, &id, &channel, &session_id);
                        env.link = link.id();
                        session.deliver(env);
                    }
                    continue;
                }
                MessageType::Discover => {
                    let announce_inner = Arc::clone(&inner);
                    let announce_link = Arc::clone(&link);
                    let (channel, session_id) = (channel.clone(), session_id.clone());
                    tokio::spawn(async move {
                        announce_inner
                            .announce(&channel, &session_id, &announce_link)
                            .await;
                    });
                    continue;
                }
                MessageType::Open => {
                    debug!(
                        "tunnel link {} received open {} {}",
                        link.id(),
                        channel,
                        session_id
                    );
                    // passes through to the channel's listener
                }
                MessageType::Accept => {
                    if let Some(session) = inner.get_session(&channel, &session_id) {
                        // group sessions don't wait on accepts
                        if session.mode() > Mode::Unicast {
                            session.set_accepted(true);
                            continue;
                        }
                    }
                }
                MessageType::Session => {
                    trace!("received session payload from {}", link.remote());
                }
            }

            // the application only sees its own headers
            strip_tunnel_headers(&mut msg);

            if channel.is_empty() || session_id.is_empty() {
                continue;
            }

            // pick the target session. on a loopback link the listening
            // side does the listening, the dialling side the dialling.
            let target = if loopback || typ == MessageType::Open {
                inner.get_session(&channel, LISTENER_SESSION)
            } else if typ == MessageType::Accept {
                match inner.get_session(&channel, &session_id) {
                    Some(session) if session.accepted() => continue,
                    other => other,
                }
            } else {
                inner
                    .get_session(&channel, &session_id)
                    .or_else(|| inner.get_session(&channel, LISTENER_SESSION))
            };

            let Some(session) = target else {
                debug!("tunnel skipping message, no session {} {}", channel, session_id);
                continue;
            };

            if session.is_closed() {
                // remove by the full key, not just the channel
                inner.del_session(session.channel(), session.id()).await;
                continue;
            }

            trace!(
                "tunnel using channel {} session {}",
                session.channel(),
                session.id()
            );

            session.set_remote_once(&link.remote());

            let mut env = Envelope::new(typ, &id, &channel, &session_id);
            env.mode = session.mode();
            env.loopback = loopback;
            env.link = link.id();
            env.data = Some(msg);

            // append to the receive backlog without blocking
            session.deliver(env);
        }

        inner.del_link(&link.id()).await;
        link.close().await;
    }

    /// Reap dead links and redial missing peers on every tick
    async fn monitor(inner: Arc<Inner>) {
        let interval = inner.options.read().unwrap().reconnect_interval;
        let start = tokio::time::Instant::now() + interval;
        let mut tick = tokio::time::interval_at(start, interval);

        loop {
            tokio::select! {
                _ = inner.closed_wait() => return,
                _ = tick.tick() => {
                    // purge links that are closed or errored
                    let dead: Vec<String> = inner
                        .links
                        .read()
                        .unwrap()
                        .iter()
                        .filter(|(_, l)| l.state() != LinkState::Connected)
                        .map(|(node, _)| node.clone())
                        .collect();

                    if !dead.is_empty() {
                        let removed: Vec<Arc<Link>> = {
                            let mut links = inner.links.write().unwrap();
                            dead.iter().filter_map(|node| links.remove(node)).collect()
                        };
                        for link in removed {
                            debug!("tunnel deleting dead link for {}", link.remote());
                            link.close().await;
                        }
                    }

                    // redial peers that have no live link
                    let nodes = inner.options.read().unwrap().nodes.clone();
                    for node in nodes {
                        if node.is_empty() {
                            continue;
                        }
                        if inner.links.read().unwrap().contains_key(&node) {
                            continue;
                        }
                        match Inner::setup_link(&inner, &node).await {
                            Ok(link) => {
                                inner.links.write().unwrap().insert(node, link);
                            }
                            Err(e) => {
                                debug!("tunnel failed to redial {}: {}", node, e);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Periodically prove link liveness; a failed keepalive tears the
    /// link down.
    async fn keepalive(inner: Arc<Inner>, link: Arc<Link>) {
        let interval = inner.options.read().unwrap().keepalive_interval;
        let start = tokio::time::Instant::now() + interval;
        let mut tick = tokio::time::interval_at(start, interval);

        loop {
            tokio::select! {
                _ = inner.closed_wait() => return,
                _ = link.closed_wait() => return,
                _ = tick.tick() => {
                    trace!("tunnel sending keepalive to link {}", link.remote());

                    let msg = Message::new()
                        .with_header(HEADER_MESSAGE, MessageType::KeepAlive.as_str())
                        .with_header(HEADER_ID, inner.id.as_str());

                    if let Err(e) = link.send(msg).await {
                        debug!("error sending keepalive to {}: {}", link.remote(), e);
                        inner.del_link(&link.id()).await;
                        return;
                    }
                }
            }
        }
    }

    /// Periodically ask the remote side to announce all its channels
    async fn discover(inner: Arc<Inner>, link: Arc<Link>) {
        let interval = inner.options.read().unwrap().discover_interval;
        let start = tokio::time::Instant::now() + interval;
        let mut tick = tokio::time::interval_at(start, interval);

        loop {
            tokio::select! {
                _ = inner.closed_wait() => return,
                _ = link.closed_wait() => return,
                _ = tick.tick() => {
                    let msg = Message::new()
                        .with_header(HEADER_MESSAGE, MessageType::Discover.as_str())
                        .with_header(HEADER_ID, inner.id.as_str());

                    if let Err(e) = link.send(msg).await {
                        debug!("tunnel failed to send discover to {}: {}", link.remote(), e);
                    }
                }
            }
        }
    }
}

/// Pick the best link by the `delay x length x rate` metric; when no
/// candidate is connected a uniform random pick beats returning none.
fn pick_link(links: &[Arc<Link>]) -> Option<Arc<Link>> {
    if links.is_empty() {
        return None;
    }

    let best = pick_best(links, |link| {
        if link.state() == LinkState::Connected {
            Some(link.metric())
        } else {
            None
        }
    });

    match best {
        Some(i) => Some(Arc::clone(&links[i])),
        None => {
            let i = rand::thread_rng().gen_range(0..links.len());
            Some(Arc::clone(&links[i]))
        }
    }
}

/// Index of the item with the lowest metric; `None` metrics are
/// excluded.
fn pick_best<T>(items: &[T], metric: impl Fn(&T) -> Option<f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;

    for (i, item) in items.iter().enumerate() {
        let Some(m) = metric(item) else { continue };
        match best {
            None => best = Some((i, m)),
            Some((_, current)) if m < current => best = Some((i, m)),
            _ => {}
        }
    }

    best.map(|(i, _)| i)
}
