//! TCP transport

use super::{decode, encode, Listener, Message, Socket, Transport, TransportError};
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
        }
    }
}

/// Transport over TCP with length-delimited message frames
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Socket>, TransportError> {
        let timeout = Duration::from_secs(self.config.connect_timeout);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;

        Ok(Box::new(TcpSocket::new(stream)?))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::Io)?;
        let addr = listener
            .local_addr()
            .map_err(TransportError::Io)?
            .to_string();

        Ok(Box::new(TcpSocketListener { listener, addr }))
    }
}

/// An established TCP connection carrying framed messages
pub struct TcpSocket {
    reader: Mutex<(OwnedReadHalf, BytesMut)>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    local: String,
    remote: String,
}

impl TcpSocket {
    fn new(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nodelay(true).ok();

        let local = stream.local_addr().map_err(TransportError::Io)?.to_string();
        let remote = stream.peer_addr().map_err(TransportError::Io)?.to_string();
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: Mutex::new((read_half, BytesMut::with_capacity(8192))),
            writer: Mutex::new(Some(write_half)),
            local,
            remote,
        })
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn send(&self, msg: Message) -> Result<(), TransportError> {
        let frame = encode(&msg)?;

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(TransportError::Closed)?;
        stream.write_all(&frame).await.map_err(TransportError::Io)?;
        Ok(())
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut guard = self.reader.lock().await;
        let (stream, buf) = &mut *guard;

        loop {
            if let Some(msg) = decode(buf)? {
                return Ok(msg);
            }

            let n = stream.read_buf(buf).await.map_err(TransportError::Io)?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await.ok();
        }
        Ok(())
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }

    fn local(&self) -> String {
        self.local.clone()
    }
}

struct TcpSocketListener {
    listener: TcpListener,
    addr: String,
}

#[async_trait]
impl Listener for TcpSocketListener {
    async fn accept(&self) -> Result<Box<dyn Socket>, TransportError> {
        let (stream, _) = self.listener.accept().await.map_err(TransportError::Io)?;
        Ok(Box::new(TcpSocket::new(stream)?))
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
