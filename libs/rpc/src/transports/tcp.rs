//! TCP Transport Implementation
//!
//! Length-prefixed framing over tokio TCP streams. Each connection owns a
//! reader task that decodes frames and hands them to the inbound handler; the
//! write half sits behind an async mutex so concurrent callers can share it.

use super::{next_connection_id, Connection, Connector, InboundHandler, SendError};
use crate::instance::Instance;
use crate::{Result, RpcError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest frame accepted in either direction
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// TCP connector configuration
#[derive(Debug, Clone)]
pub struct TcpConnectorConfig {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for TcpConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl TcpConnectorConfig {
    pub fn from_client_config(config: &crate::ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            write_timeout: config.write_timeout(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Opens [`TcpConnection`]s and wires their reader tasks to a handler
pub struct TcpConnector {
    config: TcpConnectorConfig,
    handler: Arc<dyn InboundHandler>,
}

impl TcpConnector {
    pub fn new(config: TcpConnectorConfig, handler: Arc<dyn InboundHandler>) -> Self {
        Self { config, handler }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, instance: &Instance) -> Result<Arc<dyn Connection>> {
        debug!(instance = %instance, "Connecting to TCP peer");

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(instance.address()),
        )
        .await
        .map_err(|_| {
            RpcError::network(
                format!(
                    "TCP connect timed out after {}ms",
                    self.config.connect_timeout.as_millis()
                ),
                Some(instance.clone()),
            )
        })?
        .map_err(|e| {
            RpcError::network_with_source("Failed to connect to TCP peer", Some(instance.clone()), e)
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let peer_addr = stream.peer_addr().map_err(|e| {
            RpcError::network_with_source("Failed to get peer address", Some(instance.clone()), e)
        })?;

        let connection = TcpConnection::start(
            stream,
            instance.clone(),
            peer_addr,
            self.config.clone(),
            Arc::clone(&self.handler),
        );

        info!(
            instance = %instance,
            connection_id = connection.id(),
            "Connected to TCP peer at {}",
            peer_addr
        );
        Ok(connection)
    }
}

/// One TCP connection with a background frame reader
pub struct TcpConnection {
    id: u64,
    remote: Instance,
    peer_addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    active: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    config: TcpConnectorConfig,
    connected_at: Instant,
    bytes_sent: AtomicU64,
    bytes_received: Arc<AtomicU64>,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("peer_addr", &self.peer_addr)
            .field("active", &self.active.load(Ordering::Acquire))
            .finish()
    }
}

impl TcpConnection {
    fn start(
        stream: TcpStream,
        remote: Instance,
        peer_addr: SocketAddr,
        config: TcpConnectorConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Arc<Self> {
        let id = next_connection_id();
        let (read_half, write_half) = stream.into_split();
        let active = Arc::new(AtomicBool::new(true));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let reader = tokio::spawn(read_loop(
            id,
            peer_addr,
            read_half,
            config.max_frame_size,
            Arc::clone(&active),
            Arc::clone(&bytes_received),
            handler,
        ));

        Arc::new(Self {
            id,
            remote,
            peer_addr,
            writer: tokio::sync::Mutex::new(write_half),
            active,
            reader: Mutex::new(Some(reader)),
            config,
            connected_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    async fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut buffer = BytesMut::with_capacity(4 + frame.len());
        buffer.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buffer.extend_from_slice(frame);

        let mut writer = self.writer.lock().await;
        writer.write_all(&buffer).await?;
        writer.flush().await
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote(&self) -> &Instance {
        &self.remote
    }

    async fn send(&self, frame: Bytes) -> std::result::Result<(), SendError> {
        if !self.is_active() {
            return Err(SendError::Closed);
        }

        if frame.len() > self.config.max_frame_size {
            return Err(SendError::Failed(RpcError::serialization(format!(
                "Frame size {} exceeds maximum {}",
                frame.len(),
                self.config.max_frame_size
            ))));
        }

        match tokio::time::timeout(self.config.write_timeout, self.write_frame(&frame)).await {
            Ok(Ok(())) => {
                self.bytes_sent
                    .fetch_add(4 + frame.len() as u64, Ordering::Relaxed);
                debug!(
                    connection_id = self.id,
                    peer = %self.peer_addr,
                    bytes = frame.len(),
                    "Sent frame over TCP"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let was_active = self.active.swap(false, Ordering::AcqRel);
                let closed = !was_active
                    || matches!(
                        e.kind(),
                        ErrorKind::BrokenPipe
                            | ErrorKind::ConnectionReset
                            | ErrorKind::ConnectionAborted
                            | ErrorKind::NotConnected
                    );
                if closed {
                    Err(SendError::Closed)
                } else {
                    Err(SendError::Failed(RpcError::network_with_source(
                        "Failed to write frame",
                        Some(self.remote.clone()),
                        e,
                    )))
                }
            }
            Err(_) => {
                // a half-written frame leaves the stream unusable
                self.active.store(false, Ordering::Release);
                Err(SendError::Failed(RpcError::network(
                    format!(
                        "TCP write timed out after {}ms",
                        self.config.write_timeout.as_millis()
                    ),
                    Some(self.remote.clone()),
                )))
            }
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    async fn close(&self) {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(connection_id = self.id, "Error shutting down TCP connection: {}", e);
        }
        if was_active {
            info!(
                connection_id = self.id,
                instance = %self.remote,
                sent = self.bytes_sent(),
                received = self.bytes_received(),
                "Closed TCP connection"
            );
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    id: u64,
    peer_addr: SocketAddr,
    mut read_half: OwnedReadHalf,
    max_frame_size: usize,
    active: Arc<AtomicBool>,
    bytes_received: Arc<AtomicU64>,
    handler: Arc<dyn InboundHandler>,
) {
    let mut buffer = BytesMut::with_capacity(64 * 1024);
    loop {
        let mut len_bytes = [0u8; 4];
        if let Err(e) = read_half.read_exact(&mut len_bytes).await {
            if e.kind() == ErrorKind::UnexpectedEof {
                debug!(connection_id = id, peer = %peer_addr, "Peer closed TCP connection");
            } else {
                debug!(connection_id = id, peer = %peer_addr, "TCP read failed: {}", e);
            }
            break;
        }

        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > max_frame_size {
            warn!(
                connection_id = id,
                peer = %peer_addr,
                "Frame size {} exceeds maximum {}, dropping connection",
                frame_len,
                max_frame_size
            );
            break;
        }

        buffer.resize(frame_len, 0);
        if let Err(e) = read_half.read_exact(&mut buffer[..frame_len]).await {
            debug!(connection_id = id, peer = %peer_addr, "TCP read failed mid-frame: {}", e);
            break;
        }
        bytes_received.fetch_add(4 + frame_len as u64, Ordering::Relaxed);

        handler.on_frame(id, buffer.split_to(frame_len).freeze());
    }

    active.store(false, Ordering::Release);
    handler.on_closed(id);
}
