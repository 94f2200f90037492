//! Single Connection Strategy
//!
//! One persistent connection shared by every call to the instance. Reconnects
//! are serialized by a connect lock (double-checked) and throttled: within one
//! health-check window at most `reconnect_attempts` connects are tried, after
//! which acquisition fails fast until the window rolls over.

use super::{spawn_close, AcquireResult, ConnectionStrategy, StrategyStats};
use crate::config::{ClientConfig, StrategyKind};
use crate::error::AcquireError;
use crate::instance::HealthTracker;
use crate::transports::{Connection, Connector};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

struct Throttle {
    window_start: Instant,
    attempts: u32,
}

struct SingleInner {
    health: Arc<HealthTracker>,
    connector: Arc<dyn Connector>,
    current: RwLock<Option<Arc<dyn Connection>>>,
    connect_lock: tokio::sync::Mutex<()>,
    throttle: Mutex<Throttle>,
    window: Duration,
    max_attempts: u32,
    closed: AtomicBool,
}

impl SingleInner {
    fn active_connection(&self) -> Option<Arc<dyn Connection>> {
        self.current
            .read()
            .as_ref()
            .filter(|c| c.is_active())
            .map(Arc::clone)
    }

    /// Count one connect attempt against the current window
    fn begin_attempt(&self) -> Result<(), AcquireError> {
        let mut throttle = self.throttle.lock();
        if throttle.window_start.elapsed() >= self.window {
            throttle.window_start = Instant::now();
            throttle.attempts = 0;
        }
        if throttle.attempts >= self.max_attempts {
            return Err(AcquireError::Throttled {
                attempts: throttle.attempts,
            });
        }
        throttle.attempts += 1;
        Ok(())
    }

    /// Connect unless a live connection appeared meanwhile. Callers must hold
    /// `connect_lock`.
    async fn connect_locked(&self) -> AcquireResult {
        if self.closed.load(Ordering::Acquire) {
            return Err(AcquireError::Closed);
        }
        if let Some(connection) = self.active_connection() {
            return Ok(connection);
        }
        self.begin_attempt()?;

        let stale = self.current.write().take();
        if let Some(stale) = stale {
            spawn_close(stale);
        }

        match self.connector.connect(self.health.instance()).await {
            Ok(connection) => {
                if self.closed.load(Ordering::Acquire) {
                    spawn_close(connection);
                    return Err(AcquireError::Closed);
                }
                self.throttle.lock().attempts = 0;
                *self.current.write() = Some(Arc::clone(&connection));
                Ok(connection)
            }
            Err(e) => {
                warn!(instance = %self.health.instance(), "Single connection connect failed: {}", e);
                Err(AcquireError::ConnectFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn reconnect(&self) -> AcquireResult {
        let _guard = self.connect_lock.lock().await;
        self.connect_locked().await
    }
}

/// One shared persistent connection with throttled reconnects
pub struct SingleStrategy {
    inner: Arc<SingleInner>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl SingleStrategy {
    /// Connect eagerly and start the reconnect task. An initial connect
    /// failure is logged; the next acquire retries.
    pub async fn start(
        health: Arc<HealthTracker>,
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
    ) -> Arc<Self> {
        let inner = Arc::new(SingleInner {
            health,
            connector,
            current: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            throttle: Mutex::new(Throttle {
                window_start: Instant::now(),
                attempts: 0,
            }),
            window: config.health_check_interval(),
            max_attempts: config.reconnect_attempts.max(1),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = inner.reconnect().await {
            warn!(instance = %inner.health.instance(), "Initial connect failed: {}", e);
        }
        let maintenance = tokio::spawn(maintain(
            Arc::downgrade(&inner),
            config.health_check_interval(),
        ));

        Arc::new(Self {
            inner,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    /// Connect attempts made in the current throttle window
    pub fn attempts_in_window(&self) -> u32 {
        self.inner.throttle.lock().attempts
    }
}

#[async_trait]
impl ConnectionStrategy for SingleStrategy {
    async fn acquire(&self) -> AcquireResult {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(AcquireError::Closed);
        }
        if let Some(connection) = self.inner.active_connection() {
            return Ok(connection);
        }
        self.inner.reconnect().await
    }

    fn release(&self, connection: Arc<dyn Connection>) {
        if !connection.is_active() {
            self.remove(connection);
        }
    }

    fn remove(&self, connection: Arc<dyn Connection>) {
        let evicted = {
            let mut current = self.inner.current.write();
            let is_current = current
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &connection));
            if is_current {
                current.take()
            } else {
                None
            }
        };
        spawn_close(connection);
        if evicted.is_none() || self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match inner.reconnect().await {
                Ok(connection) => {
                    debug!(connection_id = connection.id(), "Background reconnect succeeded")
                }
                Err(e) => debug!(instance = %inner.health.instance(), "Background reconnect skipped: {}", e),
            }
        });
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(maintenance) = self.maintenance.lock().take() {
            maintenance.abort();
        }
        let current = self.inner.current.write().take();
        info!(instance = %self.inner.health.instance(), "Closing single connection strategy");
        if let Some(connection) = current {
            connection.close().await;
        }
    }

    fn health(&self) -> &Arc<HealthTracker> {
        &self.inner.health
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Single
    }

    fn stats(&self) -> StrategyStats {
        let live = usize::from(self.inner.active_connection().is_some());
        StrategyStats {
            kind: StrategyKind::Single,
            live,
            idle: 0,
            active: live,
            max: 1,
        }
    }
}

impl Drop for SingleStrategy {
    fn drop(&mut self) {
        if let Some(maintenance) = self.maintenance.get_mut().take() {
            maintenance.abort();
        }
    }
}

async fn maintain(single: Weak<SingleInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(single) = single.upgrade() else {
            return;
        };
        if single.closed.load(Ordering::Acquire) {
            return;
        }
        if single.active_connection().is_some() {
            continue;
        }
        match single.reconnect().await {
            Ok(_) => info!(instance = %single.health.instance(), "Reconnected single connection"),
            Err(AcquireError::Throttled { attempts }) => {
                debug!(instance = %single.health.instance(), attempts, "Reconnect throttled")
            }
            Err(e) => error!(instance = %single.health.instance(), "Reconnect failed: {}", e),
        }
    }
}
