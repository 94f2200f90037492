use super::{untried, LoadBalancer};
use crate::config::LoadBalanceKind;
use crate::instance::{HealthTracker, Instance};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counter modulo the number of untried candidates
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(
        &self,
        candidates: &[Arc<HealthTracker>],
        tried: &HashSet<Instance>,
    ) -> Option<Arc<HealthTracker>> {
        let pool = untried(candidates, tried);
        if pool.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % pool.len();
        Some(Arc::clone(pool[index]))
    }

    fn kind(&self) -> LoadBalanceKind {
        LoadBalanceKind::RoundRobin
    }
}
