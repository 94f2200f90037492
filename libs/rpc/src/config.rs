//! Client Configuration
//!
//! Plain scalar knobs consumed by the runtime. Values are milliseconds unless
//! the name says otherwise.

use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which connection strategy each instance uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Bounded pool of persistent connections
    #[default]
    Pooled,
    /// One shared persistent connection with background reconnect
    Single,
    /// A fresh connection per call, closed afterwards
    Short,
}

/// Which load-balancing policy picks instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceKind {
    #[default]
    Random,
    RoundRobin,
    FailureWeighted,
    LatencyFair,
}

/// Latency-fair balancer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FairConfig {
    /// Weight tree rebuild period
    pub rebuild_interval_ms: u64,
    /// Fewer full-window instances than this disables the tree
    pub min_full_instances: usize,
    /// Minimum share of full-window instances among all candidates
    pub min_full_ratio: f64,
}

impl Default for FairConfig {
    fn default() -> Self {
        Self {
            rebuild_interval_ms: 60_000,
            min_full_instances: 2,
            min_full_ratio: 0.5,
        }
    }
}

/// Configuration for a service client and its per-instance strategies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_connections: usize,
    pub min_idle_connections: usize,
    pub latency_window_size: usize,
    pub health_check_interval_ms: u64,
    /// Extra attempts after the first one, against other instances
    pub retries: u32,
    pub load_balance: LoadBalanceKind,
    pub connection: StrategyKind,
    /// Upper bound on in-flight calls per correlation registry
    pub max_pending_calls: usize,
    /// Single strategy: connect attempts allowed per health-check window
    pub reconnect_attempts: u32,
    /// Concurrent user callbacks allowed off the I/O tasks
    pub callback_workers: usize,
    pub fair: FairConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            read_timeout_ms: 3_000,
            write_timeout_ms: 3_000,
            max_connections: 8,
            min_idle_connections: 1,
            latency_window_size: 10,
            health_check_interval_ms: 30_000,
            retries: 2,
            load_balance: LoadBalanceKind::default(),
            connection: StrategyKind::default(),
            max_pending_calls: 65_536,
            reconnect_attempts: 2,
            callback_workers: 16,
            fair: FairConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a flat TOML document and validate it
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_millis(self.fair.rebuild_interval_ms)
    }

    /// Validate the client configuration
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("fair.rebuild_interval_ms", self.fair.rebuild_interval_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(RpcError::configuration(
                    format!("{} cannot be zero", field),
                    Some(field),
                ));
            }
        }

        if self.max_connections == 0 {
            return Err(RpcError::configuration(
                "max_connections cannot be zero",
                Some("max_connections"),
            ));
        }

        if self.min_idle_connections > self.max_connections {
            return Err(RpcError::configuration(
                format!(
                    "min_idle_connections ({}) exceeds max_connections ({})",
                    self.min_idle_connections, self.max_connections
                ),
                Some("min_idle_connections"),
            ));
        }

        if self.latency_window_size == 0 {
            return Err(RpcError::configuration(
                "latency_window_size cannot be zero",
                Some("latency_window_size"),
            ));
        }

        if self.max_pending_calls == 0 {
            return Err(RpcError::configuration(
                "max_pending_calls cannot be zero",
                Some("max_pending_calls"),
            ));
        }

        if self.callback_workers == 0 {
            return Err(RpcError::configuration(
                "callback_workers cannot be zero",
                Some("callback_workers"),
            ));
        }

        if !(0.0..=1.0).contains(&self.fair.min_full_ratio) {
            return Err(RpcError::configuration(
                format!("fair.min_full_ratio {} is outside [0, 1]", self.fair.min_full_ratio),
                Some("fair.min_full_ratio"),
            ));
        }

        Ok(())
    }
}
