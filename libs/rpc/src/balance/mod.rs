//! Load Balancing
//!
//! Picks the instance that serves a call from the healthy candidates,
//! avoiding instances already tried by earlier attempts of the same call.

use crate::config::{ClientConfig, LoadBalanceKind};
use crate::instance::{HealthTracker, Instance};
use std::collections::HashSet;
use std::sync::Arc;

pub mod fair;
pub mod failure;
pub mod random;
pub mod round_robin;

pub use fair::{fair_weight, FairBalancer, WeightTree};
pub use failure::FailureWeightedBalancer;
pub use random::RandomBalancer;
pub use round_robin::RoundRobinBalancer;

/// Instance selection policy
pub trait LoadBalancer: Send + Sync + 'static {
    /// Choose one of `candidates`, preferring instances not in `tried`
    fn select(
        &self,
        candidates: &[Arc<HealthTracker>],
        tried: &HashSet<Instance>,
    ) -> Option<Arc<HealthTracker>>;

    /// Report that `instance` just failed a call
    fn mark_invalid(&self, _instance: &Instance) {}

    /// Periodic rebuild hook driven by the service client
    fn refresh(&self, _candidates: &[Arc<HealthTracker>]) {}

    fn kind(&self) -> LoadBalanceKind;
}

pub fn build_balancer(kind: LoadBalanceKind, config: &ClientConfig) -> Arc<dyn LoadBalancer> {
    match kind {
        LoadBalanceKind::Random => Arc::new(RandomBalancer::new()),
        LoadBalanceKind::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LoadBalanceKind::FailureWeighted => Arc::new(FailureWeightedBalancer::new()),
        LoadBalanceKind::LatencyFair => Arc::new(FairBalancer::new(
            config.fair.clone(),
            config.read_timeout_ms,
        )),
    }
}

/// Candidates not yet tried, or every candidate when all were tried
pub(crate) fn untried<'a>(
    candidates: &'a [Arc<HealthTracker>],
    tried: &HashSet<Instance>,
) -> Vec<&'a Arc<HealthTracker>> {
    let fresh: Vec<_> = candidates
        .iter()
        .filter(|c| !tried.contains(c.instance()))
        .collect();
    if fresh.is_empty() {
        candidates.iter().collect()
    } else {
        fresh
    }
}

#[cfg(test)]
pub(crate) fn trackers(ports: &[u16]) -> Vec<Arc<HealthTracker>> {
    ports
        .iter()
        .map(|port| Arc::new(HealthTracker::new(Instance::new("10.0.0.1", *port), 4)))
        .collect()
}
