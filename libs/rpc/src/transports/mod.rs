//! Transport Layer
//!
//! Raw connections to one remote instance. A connection only moves frames:
//! outbound frames go through [`Connection::send`], inbound frames are pushed
//! by the connection's reader task into an [`InboundHandler`].

use crate::instance::Instance;
use crate::{Result, RpcError};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub mod tcp;


pub use tcp::{TcpConnection, TcpConnector, TcpConnectorConfig};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique connection id
pub fn next_connection_id() -> u64 {
    CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Why a frame could not be written
#[derive(Error, Debug, Clone)]
pub enum SendError {
    /// The connection was closed, possibly concurrently with this send
    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Failed(RpcError),
}

/// A live connection to one remote instance
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> u64;

    fn remote(&self) -> &Instance;

    /// Write one frame
    async fn send(&self, frame: Bytes) -> std::result::Result<(), SendError>;

    fn is_active(&self) -> bool;

    /// Close the connection; calling it again is a no-op
    async fn close(&self);
}

/// Opens connections to remote instances
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, instance: &Instance) -> Result<Arc<dyn Connection>>;
}

/// Receives inbound frames from connection reader tasks
pub trait InboundHandler: Send + Sync + 'static {
    fn on_frame(&self, connection_id: u64, frame: Bytes);

    fn on_closed(&self, _connection_id: u64) {}
}
