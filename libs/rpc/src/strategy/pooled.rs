//! Pooled Connection Strategy
//!
//! Bounded pool of persistent connections with backpressure: callers wait for
//! a free slot up to the connect timeout, then fail with
//! [`AcquireError::Exhausted`]. Reserved, idle and handed-out connections
//! together never exceed the current maximum.

use super::{spawn_close, AcquireResult, ConnectionStrategy, StrategyStats};
use crate::config::{ClientConfig, StrategyKind};
use crate::error::AcquireError;
use crate::instance::HealthTracker;
use crate::transports::{Connection, Connector};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

struct PoolState {
    idle: VecDeque<Arc<dyn Connection>>,
    /// Handed out, or reserved by a caller that is connecting
    active: usize,
    /// Reserved by the pre-warm / top-up path while connecting
    warming: usize,
    max: usize,
    closed: bool,
}

impl PoolState {
    fn in_use(&self) -> usize {
        self.active + self.idle.len() + self.warming
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Active,
    Warming,
}

/// A reserved pool slot, returned to the pool if dropped before commit
struct Reservation<'a> {
    pool: &'a PoolInner,
    slot: Slot,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.pool.state.lock();
            match self.slot {
                Slot::Active => state.active = state.active.saturating_sub(1),
                Slot::Warming => state.warming = state.warming.saturating_sub(1),
            }
        }
        self.pool.available.notify_waiters();
    }
}

enum Step {
    Ready(Arc<dyn Connection>),
    Connect,
    Wait(usize),
}

struct PoolInner {
    health: Arc<HealthTracker>,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    available: Notify,
    min_idle: usize,
    wait_timeout: Duration,
}

impl PoolInner {
    async fn connect_reserved(&self) -> AcquireResult {
        let reservation = Reservation {
            pool: self,
            slot: Slot::Active,
            armed: true,
        };
        let connection = self
            .connector
            .connect(self.health.instance())
            .await
            .map_err(|e| AcquireError::ConnectFailed {
                reason: e.to_string(),
            })?;

        if self.state.lock().closed {
            spawn_close(connection);
            return Err(AcquireError::Closed);
        }
        reservation.commit();
        Ok(connection)
    }

    /// Drop idle connections that are no longer active
    fn evict_dead(&self) -> usize {
        let dead: VecDeque<_> = {
            let mut state = self.state.lock();
            let (live, dead): (VecDeque<_>, VecDeque<_>) =
                state.idle.drain(..).partition(|c| c.is_active());
            state.idle = live;
            dead
        };
        let evicted = dead.len();
        for connection in dead {
            spawn_close(connection);
        }
        if evicted > 0 {
            self.available.notify_waiters();
        }
        evicted
    }

    /// Open connections until the idle minimum is met or the pool is full
    async fn fill_idle(&self) {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed
                    || state.idle.len() + state.warming >= self.min_idle
                    || state.in_use() >= state.max
                {
                    return;
                }
                state.warming += 1;
            }
            let reservation = Reservation {
                pool: self,
                slot: Slot::Warming,
                armed: true,
            };

            match self.connector.connect(self.health.instance()).await {
                Ok(connection) => {
                    reservation.commit();
                    let rejected = {
                        let mut state = self.state.lock();
                        state.warming = state.warming.saturating_sub(1);
                        if state.closed {
                            Some(connection)
                        } else {
                            state.idle.push_back(connection);
                            None
                        }
                    };
                    self.available.notify_waiters();
                    if let Some(connection) = rejected {
                        spawn_close(connection);
                        return;
                    }
                }
                Err(e) => {
                    warn!(instance = %self.health.instance(), "Failed to pre-warm pooled connection: {}", e);
                    return;
                }
            }
        }
    }
}

/// Bounded pool of persistent connections to one instance
pub struct PooledStrategy {
    inner: Arc<PoolInner>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl PooledStrategy {
    /// Build the pool, pre-warm the idle minimum and start the health-check
    /// task. Pre-warm failures are logged, not fatal.
    pub async fn start(
        health: Arc<HealthTracker>,
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
    ) -> Arc<Self> {
        let max = config.max_connections.max(1);
        let inner = Arc::new(PoolInner {
            health,
            connector,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(max),
                active: 0,
                warming: 0,
                max,
                closed: false,
            }),
            available: Notify::new(),
            min_idle: config.min_idle_connections.min(max),
            wait_timeout: config.connect_timeout(),
        });

        inner.fill_idle().await;
        let maintenance = tokio::spawn(maintain(
            Arc::downgrade(&inner),
            config.health_check_interval(),
        ));

        Arc::new(Self {
            inner,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    /// One health-check pass; the maintenance task runs this periodically
    pub async fn check_idle(&self) -> usize {
        let evicted = self.inner.evict_dead();
        self.inner.fill_idle().await;
        evicted
    }
}

#[async_trait]
impl ConnectionStrategy for PooledStrategy {
    async fn acquire(&self) -> AcquireResult {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.wait_timeout;

        loop {
            let notified = inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut stale = Vec::new();
            let step = {
                let mut state = inner.state.lock();
                if state.closed {
                    return Err(AcquireError::Closed);
                }
                let mut ready = None;
                while let Some(connection) = state.idle.pop_front() {
                    if connection.is_active() {
                        ready = Some(connection);
                        break;
                    }
                    stale.push(connection);
                }
                if let Some(connection) = ready {
                    state.active += 1;
                    Step::Ready(connection)
                } else if state.in_use() < state.max {
                    state.active += 1;
                    Step::Connect
                } else {
                    Step::Wait(state.max)
                }
            };
            for connection in stale {
                spawn_close(connection);
            }

            match step {
                Step::Ready(connection) => return Ok(connection),
                Step::Connect => return inner.connect_reserved().await,
                Step::Wait(max) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!(instance = %inner.health.instance(), max, "Pool exhausted");
                        return Err(AcquireError::Exhausted { max });
                    }
                }
            }
        }
    }

    fn release(&self, connection: Arc<dyn Connection>) {
        let rejected = {
            let mut state = self.inner.state.lock();
            state.active = state.active.saturating_sub(1);
            if state.closed || !connection.is_active() || state.in_use() >= state.max {
                Some(connection)
            } else {
                state.idle.push_back(connection);
                None
            }
        };
        if let Some(connection) = rejected {
            spawn_close(connection);
        }
        self.inner.available.notify_waiters();
    }

    fn remove(&self, connection: Arc<dyn Connection>) {
        {
            let mut state = self.inner.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        debug!(
            instance = %self.inner.health.instance(),
            connection_id = connection.id(),
            "Evicting pooled connection"
        );
        spawn_close(connection);
        self.inner.available.notify_waiters();
    }

    async fn close(&self) {
        let idle: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        if let Some(maintenance) = self.maintenance.lock().take() {
            maintenance.abort();
        }
        self.inner.available.notify_waiters();

        info!(
            instance = %self.inner.health.instance(),
            idle = idle.len(),
            "Closing connection pool"
        );
        for connection in idle {
            connection.close().await;
        }
    }

    fn health(&self) -> &Arc<HealthTracker> {
        &self.inner.health
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Pooled
    }

    fn update_max_connections(&self, max: usize) {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = state.max;
            state.max = max.max(1);
            previous
        };
        info!(
            instance = %self.inner.health.instance(),
            previous,
            max,
            "Updated pool maximum"
        );
        self.inner.available.notify_waiters();
    }

    fn stats(&self) -> StrategyStats {
        let state = self.inner.state.lock();
        StrategyStats {
            kind: StrategyKind::Pooled,
            live: state.active + state.idle.len(),
            idle: state.idle.len(),
            active: state.active,
            max: state.max,
        }
    }
}

impl Drop for PooledStrategy {
    fn drop(&mut self) {
        if let Some(maintenance) = self.maintenance.get_mut().take() {
            maintenance.abort();
        }
    }
}

async fn maintain(pool: Weak<PoolInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        if pool.state.lock().closed {
            return;
        }
        let evicted = pool.evict_dead();
        if evicted > 0 {
            debug!(instance = %pool.health.instance(), evicted, "Evicted dead idle connections");
        }
        pool.fill_idle().await;
    }
}
