//! Short-Lived Connection Strategy
//!
//! Every acquisition opens a fresh connection that is closed once its call
//! resolves. Nothing is pooled, so there is no backpressure to manage.

use super::{spawn_close, AcquireResult, ConnectionStrategy, StrategyStats};
use crate::config::StrategyKind;
use crate::error::AcquireError;
use crate::instance::HealthTracker;
use crate::transports::{Connection, Connector};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

struct ShortState {
    /// Open connections keyed by connection id, one per outstanding call
    live: HashMap<u64, Arc<dyn Connection>>,
    closed: bool,
}

/// Per-call connections to one instance. Concurrent calls each get their
/// own connection, so more than one may be live at a time.
pub struct ShortStrategy {
    health: Arc<HealthTracker>,
    connector: Arc<dyn Connector>,
    state: Mutex<ShortState>,
}

impl ShortStrategy {
    pub fn new(health: Arc<HealthTracker>, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            health,
            connector,
            state: Mutex::new(ShortState {
                live: HashMap::new(),
                closed: false,
            }),
        })
    }

    fn forget(&self, connection: &Arc<dyn Connection>) {
        self.state.lock().live.remove(&connection.id());
    }
}

#[async_trait]
impl ConnectionStrategy for ShortStrategy {
    async fn acquire(&self) -> AcquireResult {
        let dead: Vec<_> = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(AcquireError::Closed);
            }
            let ids: Vec<u64> = state
                .live
                .iter()
                .filter(|(_, c)| !c.is_active())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.live.remove(&id))
                .collect()
        };
        for connection in dead {
            spawn_close(connection);
        }

        let connection = self
            .connector
            .connect(self.health.instance())
            .await
            .map_err(|e| AcquireError::ConnectFailed {
                reason: e.to_string(),
            })?;

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            spawn_close(connection);
            return Err(AcquireError::Closed);
        }
        state.live.insert(connection.id(), Arc::clone(&connection));
        debug!(
            instance = %self.health.instance(),
            connection_id = connection.id(),
            "Opened short-lived connection"
        );
        Ok(connection)
    }

    fn release(&self, connection: Arc<dyn Connection>) {
        self.forget(&connection);
        spawn_close(connection);
    }

    fn remove(&self, connection: Arc<dyn Connection>) {
        self.forget(&connection);
        spawn_close(connection);
    }

    async fn close(&self) {
        let live: Vec<_> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.live.drain().map(|(_, c)| c).collect()
        };
        info!(
            instance = %self.health.instance(),
            open = live.len(),
            "Closing short-lived connection strategy"
        );
        for connection in live {
            connection.close().await;
        }
    }

    fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Short
    }

    fn stats(&self) -> StrategyStats {
        let live = self.state.lock().live.len();
        StrategyStats {
            kind: StrategyKind::Short,
            live,
            idle: 0,
            active: live,
            max: live,
        }
    }
}
