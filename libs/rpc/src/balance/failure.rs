use super::{untried, LoadBalancer};
use crate::config::LoadBalanceKind;
use crate::instance::{HealthTracker, Instance};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

/// Weighted draw with weight `1 / (1 + failures)` per instance
#[derive(Debug, Default, Clone)]
pub struct FailureWeightedBalancer;

impl FailureWeightedBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn weight(health: &HealthTracker) -> f64 {
        1.0 / (1.0 + health.failed_num() as f64)
    }

    pub fn select_with<R: Rng + ?Sized>(
        &self,
        candidates: &[Arc<HealthTracker>],
        tried: &HashSet<Instance>,
        rng: &mut R,
    ) -> Option<Arc<HealthTracker>> {
        let pool = untried(candidates, tried);
        let last = pool.last()?;

        let weights: Vec<f64> = pool.iter().map(|c| Self::weight(c)).collect();
        let total: f64 = weights.iter().sum();
        let mut draw = rng.gen::<f64>() * total;
        for (candidate, weight) in pool.iter().zip(&weights) {
            if draw < *weight {
                return Some(Arc::clone(*candidate));
            }
            draw -= weight;
        }
        // float rounding can leave a sliver past the last bucket
        Some(Arc::clone(*last))
    }
}

impl LoadBalancer for FailureWeightedBalancer {
    fn select(
        &self,
        candidates: &[Arc<HealthTracker>],
        tried: &HashSet<Instance>,
    ) -> Option<Arc<HealthTracker>> {
        self.select_with(candidates, tried, &mut rand::thread_rng())
    }

    fn kind(&self) -> LoadBalanceKind {
        LoadBalanceKind::FailureWeighted
    }
}
