//! Connection Strategies
//!
//! A strategy owns the raw connections to one remote instance and decides how
//! many are kept and how they are recycled:
//!
//! - [`PooledStrategy`]: bounded pool of persistent connections
//! - [`SingleStrategy`]: one shared persistent connection with throttled
//!   reconnects
//! - [`ShortStrategy`]: a fresh connection per call, closed afterwards
//!
//! Every variant shares the instance's [`HealthTracker`] with the client and
//! the load balancer.

use crate::config::{ClientConfig, StrategyKind};
use crate::error::AcquireError;
use crate::instance::{HealthTracker, Instance};
use crate::transports::{Connection, Connector};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub mod pooled;
pub mod short;
pub mod single;


pub use pooled::PooledStrategy;
pub use short::ShortStrategy;
pub use single::SingleStrategy;

pub type AcquireResult = std::result::Result<Arc<dyn Connection>, AcquireError>;

/// Point-in-time connection counts of one strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyStats {
    pub kind: StrategyKind,
    /// Connections currently open
    pub live: usize,
    pub idle: usize,
    /// Connections handed out and not yet released
    pub active: usize,
    pub max: usize,
}

/// How connections to one remote instance are acquired and recycled
#[async_trait]
pub trait ConnectionStrategy: Send + Sync + 'static {
    async fn acquire(&self) -> AcquireResult;

    /// Hand back a connection after the call using it resolved
    fn release(&self, connection: Arc<dyn Connection>);

    /// Evict a broken connection instead of returning it
    fn remove(&self, connection: Arc<dyn Connection>);

    /// Release every resource; calling it again is a no-op
    async fn close(&self);

    fn health(&self) -> &Arc<HealthTracker>;

    fn kind(&self) -> StrategyKind;

    /// Raise (or lower) the connection ceiling. Only the pooled strategy has one.
    fn update_max_connections(&self, _max: usize) {}

    fn stats(&self) -> StrategyStats;

    fn instance(&self) -> &Instance {
        self.health().instance()
    }
}

/// Construct the configured strategy for `instance` and start its maintenance
pub async fn build_strategy(
    kind: StrategyKind,
    instance: Instance,
    connector: Arc<dyn Connector>,
    config: &ClientConfig,
) -> Arc<dyn ConnectionStrategy> {
    let health = Arc::new(HealthTracker::new(instance, config.latency_window_size));
    match kind {
        StrategyKind::Pooled => PooledStrategy::start(health, connector, config).await,
        StrategyKind::Single => SingleStrategy::start(health, connector, config).await,
        StrategyKind::Short => ShortStrategy::new(health, connector),
    }
}

/// Close a connection without blocking the caller
pub(crate) fn spawn_close(connection: Arc<dyn Connection>) {
    debug!(connection_id = connection.id(), "Closing connection");
    tokio::spawn(async move {
        connection.close().await;
    });
}
