use super::{untried, LoadBalancer};
use crate::config::LoadBalanceKind;
use crate::instance::{HealthTracker, Instance};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

/// Uniform choice among untried candidates
#[derive(Debug, Default, Clone)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn select_with<R: Rng + ?Sized>(
        &self,
        candidates: &[Arc<HealthTracker>],
        tried: &HashSet<Instance>,
        rng: &mut R,
    ) -> Option<Arc<HealthTracker>> {
        let pool = untried(candidates, tried);
        if pool.is_empty() {
            return None;
        }
        Some(Arc::clone(pool[rng.gen_range(0..pool.len())]))
    }
}

impl LoadBalancer for RandomBalancer {
    fn select(
        &self,
        candidates: &[Arc<HealthTracker>],
        tried: &HashSet<Instance>,
    ) -> Option<Arc<HealthTracker>> {
        self.select_with(candidates, tried, &mut rand::thread_rng())
    }

    fn kind(&self) -> LoadBalanceKind {
        LoadBalanceKind::Random
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::trackers;

    #[test]
    fn test_skips_tried_instances() {
        let candidates = trackers(&[1, 2, 3]);
        let tried: HashSet<_> = candidates[..2].iter().map(|c| c.instance().clone()).collect();
        let balancer = RandomBalancer::new();
        for _ in 0..1_000 {
            let picked = balancer.select(&candidates, &tried).unwrap();
            assert_eq!(picked.instance(), candidates[2].instance());
        }
    }

    #[test]
    fn test_all_tried_picks_any() {
        let candidates = trackers(&[1, 2, 3]);
        let tried: HashSet<_> = candidates.iter().map(|c| c.instance().clone()).collect();
        let balancer = RandomBalancer::new();
        let mut seen = HashSet::new();
        for _ in 0..1_000 {
            seen.insert(balancer.select(&candidates, &tried).unwrap().instance().clone());
        }
        assert_eq!(seen.len(), 3);
    }
}
