//! Per-channel listener
//!
//! A listener owns the channel's `"listener"` session in the tunnel's
//! session map. Its processor spawns one session per inbound open and
//! feeds payloads through; its announcer advertises the channel.

use super::session::SessionOptions;
use super::{Error, MessageType, Mode, Result, Session, DEFAULT_DIAL_TIMEOUT};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace};

/// Accepts sessions on a single channel
pub struct Listener {
    channel: String,
    token: String,
    session: Arc<Session>,
    accept_rx: Mutex<mpsc::Receiver<Arc<Session>>>,
    closed: watch::Sender<bool>,
    tunnel_closed: watch::Receiver<bool>,
    /// Removes the listener session from the tunnel's map
    del: Box<dyn Fn() + Send + Sync>,
}

impl Listener {
    /// Build a listener around its `"listener"` session and start the
    /// processor and announcer tasks.
    pub(crate) fn new(
        channel: String,
        token: String,
        session: Arc<Session>,
        tunnel_closed: watch::Receiver<bool>,
        announce_interval: Duration,
        del: Box<dyn Fn() + Send + Sync>,
    ) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::channel(128);
        let (closed, _) = watch::channel(false);

        let listener = Arc::new(Self {
            channel,
            token,
            session,
            accept_rx: Mutex::new(accept_rx),
            closed,
            tunnel_closed,
            del,
        });

        tokio::spawn(Self::process(Arc::clone(&listener), accept_tx));
        tokio::spawn(Self::announce(Arc::clone(&listener), announce_interval));

        listener
    }

    /// The channel this listener serves
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next inbound session and acknowledge its open
    pub async fn accept(&self) -> Result<Arc<Session>> {
        let session = tokio::select! {
            _ = self.closed_wait() => return Err(Error::Closed),
            session = async { self.accept_rx.lock().await.recv().await } => {
                session.ok_or(Error::Closed)?
            }
        };

        // send back the accept
        session.accept().await?;
        Ok(session)
    }

    /// Stop announcing and accepting (idempotent). Sessions already
    /// spawned live on until they close individually.
    pub async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        (self.del)();
        self.session.close().await
    }

    async fn closed_wait(&self) {
        let mut own = self.closed.subscribe();
        let mut tunnel = self.tunnel_closed.clone();
        tokio::select! {
            _ = own.wait_for(|c| *c) => {}
            _ = tunnel.wait_for(|c| *c) => {}
        }
    }

    /// Periodically advertise the channel; the first announce fires
    /// immediately on listen.
    async fn announce(listener: Arc<Listener>, interval: Duration) {
        let mut tick = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = listener.closed_wait() => return,
                _ = tick.tick() => {
                    if let Err(e) = listener.session.announce().await {
                        debug!("listener {} failed to announce: {}", listener.channel, e);
                        return;
                    }
                }
            }
        }
    }

    /// Drain the listener session's queue, spawning sessions for new
    /// ids and routing payloads into existing ones.
    async fn process(listener: Arc<Listener>, accept_tx: mpsc::Sender<Arc<Session>>) {
        let mut conns: HashMap<String, Arc<Session>> = HashMap::new();

        loop {
            let env = tokio::select! {
                _ = listener.closed_wait() => return,
                env = listener.session.next_envelope() => match env {
                    Some(env) => env,
                    None => return,
                },
            };

            let session = match conns.get(&env.session) {
                Some(session) => Arc::clone(session),
                None => {
                    trace!(
                        "listener {} spawning session {} from link {}",
                        listener.channel,
                        env.session,
                        env.link
                    );

                    let session = Session::new(SessionOptions {
                        // the id of the remote side
                        tunnel: env.tunnel.clone(),
                        channel: env.channel.clone(),
                        session: env.session.clone(),
                        token: listener.token.clone(),
                        mode: listener.session.mode(),
                        outbound: false,
                        loopback: env.loopback,
                        // pin replies to the link the open came in on
                        link: env.link.clone(),
                        remote: String::new(),
                        local: listener.channel.clone(),
                        timeout: DEFAULT_DIAL_TIMEOUT,
                        send_tx: listener.session.send_handle(),
                        tunnel_closed: listener.tunnel_closed.clone(),
                    });

                    conns.insert(env.session.clone(), Arc::clone(&session));

                    tokio::select! {
                        _ = listener.closed_wait() => return,
                        res = accept_tx.send(Arc::clone(&session)) => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }

                    session
                }
            };

            match env.typ {
                MessageType::Close => {
                    // group sessions ignore unilateral closes
                    if session.mode() > Mode::Unicast {
                        continue;
                    }
                    let _ = session.close().await;
                    conns.remove(&env.session);
                }
                MessageType::Session => {
                    if session.is_closed() {
                        conns.remove(&env.session);
                        continue;
                    }
                    session.deliver(env);
                }
                // open spawned the session above; other types are not
                // for the listener
                _ => continue,
            }
        }
    }
}
