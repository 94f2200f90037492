//! Remote Instances and Health Tracking
//!
//! Identity of a remote server instance plus the health bookkeeping shared by
//! its connection strategy, its communication client and the load balancer.

use crate::{Result, RpcError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// A remote server instance, identified by host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instance {
    pub host: String,
    pub port: u16,
}

impl Instance {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form usable by socket connect calls
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Instance {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            RpcError::configuration(format!("instance '{}' is not host:port", s), Some("instance"))
        })?;
        if host.is_empty() {
            return Err(RpcError::configuration(
                format!("instance '{}' has an empty host", s),
                Some("instance"),
            ));
        }
        let port = port.parse::<u16>().map_err(|e| {
            RpcError::configuration(format!("instance '{}' has a bad port: {}", s, e), Some("instance"))
        })?;
        Ok(Self::new(host, port))
    }
}

/// Fixed-capacity FIFO of recent round-trip latencies in milliseconds
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest once over capacity
    pub fn push(&mut self, latency_ms: u64) {
        self.samples.push_back(latency_ms);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    /// Samples from oldest to newest
    pub fn samples(&self) -> Vec<u64> {
        self.samples.iter().copied().collect()
    }
}

/// Per-instance health counters, shared across calling and I/O tasks
#[derive(Debug)]
pub struct HealthTracker {
    instance: Instance,
    failed: AtomicU64,
    acquired: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl HealthTracker {
    pub fn new(instance: Instance, window_size: usize) -> Self {
        Self {
            instance,
            failed: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow::new(window_size)),
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Record an observed failure against this instance
    pub fn inc_failed_num(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn failed_num(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    /// Record a successful connection acquisition
    pub fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acquired_num(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn update_latency(&self, latency_ms: u64) {
        self.latency.lock().push(latency_ms);
    }

    /// A timed-out call counts as twice the read timeout
    pub fn update_latency_with_read_timeout(&self, read_timeout_ms: u64) {
        self.latency.lock().push(read_timeout_ms.saturating_mul(2));
    }

    pub fn is_window_full(&self) -> bool {
        self.latency.lock().is_full()
    }

    pub fn average_latency_ms(&self) -> Option<u64> {
        self.latency.lock().average()
    }

    pub fn latency_samples(&self) -> Vec<u64> {
        self.latency.lock().samples()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_instance_parse_and_display() {
        let instance: Instance = "10.1.2.3:8080".parse().unwrap();
        assert_eq!(instance, Instance::new("10.1.2.3", 8080));
        assert_eq!(instance.to_string(), "10.1.2.3:8080");
        assert_eq!(instance.address(), "10.1.2.3:8080");
    }

    #[test]
    fn test_instance_parse_rejects_garbage() {
        assert!("no-port".parse::<Instance>().is_err());
        assert!(":80".parse::<Instance>().is_err());
        assert!("host:99999".parse::<Instance>().is_err());
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = LatencyWindow::new(3);
        for sample in [5, 6, 7, 8] {
            window.push(sample);
        }
        assert!(window.is_full());
        assert_eq!(window.samples(), vec![6, 7, 8]);
        assert_eq!(window.average(), Some(7));
    }

    #[test]
    fn test_health_counters() {
        let health = HealthTracker::new(Instance::new("a", 1), 2);
        assert_eq!(health.inc_failed_num(), 1);
        assert_eq!(health.inc_failed_num(), 2);
        health.record_acquired();
        assert_eq!(health.failed_num(), 2);
        assert_eq!(health.acquired_num(), 1);

        health.update_latency(10);
        assert!(!health.is_window_full());
        health.update_latency_with_read_timeout(100);
        assert!(health.is_window_full());
        assert_eq!(health.latency_samples(), vec![10, 200]);
    }

    proptest! {
        #[test]
        fn window_keeps_most_recent_samples(
            capacity in 1usize..32,
            samples in proptest::collection::vec(0u64..10_000, 0..128),
        ) {
            let mut window = LatencyWindow::new(capacity);
            for s in &samples {
                window.push(*s);
            }
            let keep = samples.len().min(capacity);
            let expected: Vec<u64> = samples[samples.len() - keep..].to_vec();
            prop_assert_eq!(window.samples(), expected);
            prop_assert!(window.len() <= capacity);
        }
    }
}
