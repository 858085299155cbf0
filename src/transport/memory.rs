//! In-memory transport
//!
//! Listeners register in a shared table keyed by address; dialing builds
//! a socket pair out of two crossed bounded channels. Clone the same
//! transport instance into every tunnel that should reach the others.

use super::{Listener, Message, Socket, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};

type AcceptQueue = mpsc::Sender<MemorySocket>;

/// Transport backed by process-local channels
#[derive(Clone, Default)]
pub struct MemoryTransport {
    listeners: Arc<StdMutex<HashMap<String, AcceptQueue>>>,
    next_port: Arc<AtomicU64>,
}

impl MemoryTransport {
    /// Create a new in-memory transport
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Socket>, TransportError> {
        let queue = {
            let listeners = self.listeners.lock().unwrap();
            listeners
                .get(addr)
                .cloned()
                .ok_or_else(|| TransportError::ConnectionFailed(format!("no listener on {}", addr)))?
        };

        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let local = format!("mem:{}", port);
        let (dialer, accepted) = MemorySocket::pair(local, addr.to_string());

        queue
            .send(accepted)
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("listener on {} gone", addr)))?;

        Ok(Box::new(dialer))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let addr = if addr.is_empty() || addr.ends_with(":0") {
            format!("mem:{}", self.next_port.fetch_add(1, Ordering::Relaxed))
        } else {
            addr.to_string()
        };

        let (tx, rx) = mpsc::channel(128);

        {
            let mut listeners = self.listeners.lock().unwrap();
            if listeners.contains_key(&addr) {
                return Err(TransportError::ConnectionFailed(format!(
                    "address {} in use",
                    addr
                )));
            }
            listeners.insert(addr.clone(), tx);
        }

        Ok(Box::new(MemoryListener {
            addr,
            accept: Mutex::new(rx),
            listeners: Arc::clone(&self.listeners),
        }))
    }
}

struct MemoryListener {
    addr: String,
    accept: Mutex<mpsc::Receiver<MemorySocket>>,
    listeners: Arc<StdMutex<HashMap<String, AcceptQueue>>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Box<dyn Socket>, TransportError> {
        let sock = self
            .accept
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;
        Ok(Box::new(sock))
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.listeners.lock().unwrap().remove(&self.addr);
        self.accept.lock().await.close();
        Ok(())
    }
}

/// One end of an in-memory socket pair
struct MemorySocket {
    tx: StdMutex<Option<mpsc::Sender<Message>>>,
    rx: Mutex<mpsc::Receiver<Message>>,
    local: String,
    remote: String,
}

impl MemorySocket {
    fn pair(dialer_addr: String, listener_addr: String) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(128);
        let (b_tx, b_rx) = mpsc::channel(128);

        let dialer = Self {
            tx: StdMutex::new(Some(a_tx)),
            rx: Mutex::new(b_rx),
            local: dialer_addr.clone(),
            remote: listener_addr.clone(),
        };
        let accepted = Self {
            tx: StdMutex::new(Some(b_tx)),
            rx: Mutex::new(a_rx),
            local: listener_addr,
            remote: dialer_addr,
        };

        (dialer, accepted)
    }
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send(&self, msg: Message) -> Result<(), TransportError> {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::Closed)?;
        tx.send(msg).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        // dropping our sender ends the peer's recv once it drains
        self.tx.lock().unwrap().take();
        self.rx.lock().await.close();
        Ok(())
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }

    fn local(&self) -> String {
        self.local.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_dial_listen() {
        let transport = MemoryTransport::new();
        let listener = transport.listen("node-a:0").await.unwrap();
        let addr = listener.addr();

        let dialer = transport.dial(&addr).await.unwrap();
        let accepted = listener.accept().await.unwrap();

        dialer.send(Message::from_body("ping")).await.unwrap();
        let got = accepted.recv().await.unwrap();
        assert_eq!(&got.body[..], b"ping");

        accepted.send(Message::from_body("pong")).await.unwrap();
        let got = dialer.recv().await.unwrap();
        assert_eq!(&got.body[..], b"pong");
    }

    #[tokio::test]
    async fn test_dial_without_listener() {
        let transport = MemoryTransport::new();
        assert!(transport.dial("nowhere").await.is_err());
    }

    #[tokio::test]
    async fn test_close_ends_peer_recv() {
        let transport = MemoryTransport::new();
        let listener = transport.listen("node-b").await.unwrap();

        let dialer = transport.dial("node-b").await.unwrap();
        let accepted = listener.accept().await.unwrap();

        dialer.close().await.unwrap();
        assert!(matches!(accepted.recv().await, Err(TransportError::Closed)));
    }
}
