//! Latency-Fair Load Balancing
//!
//! Instances with a full latency window get an integer weight that shrinks as
//! their average latency approaches the read timeout. The weights are
//! arranged in a binary [`WeightTree`] whose internal nodes hold the sum of
//! their children, so a weighted random draw costs O(log N).
//!
//! The tree is an immutable snapshot rebuilt on a fixed period and published
//! through [`ArcSwapOption`]; selections in flight keep reading the snapshot
//! they loaded. Instances marked invalid are avoided until the next rebuild,
//! which clears the invalid set. An instance that goes bad after a rebuild may
//! therefore be picked again until the following one.

use super::random::RandomBalancer;
use super::LoadBalancer;
use crate::config::{FairConfig, LoadBalanceKind};
use crate::instance::{HealthTracker, Instance};
use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Weight of an instance whose latency window averages `avg_latency_ms`
///
/// `max(1, 100 - avg * 100 / (read_timeout + 10))`
pub fn fair_weight(avg_latency_ms: u64, read_timeout_ms: u64) -> u64 {
    let normalized = avg_latency_ms.saturating_mul(100) / read_timeout_ms.saturating_add(10);
    100u64.saturating_sub(normalized).max(1)
}

#[derive(Debug)]
enum Node {
    Leaf {
        health: Option<Arc<HealthTracker>>,
        weight: u64,
    },
    Branch {
        left: usize,
        right: usize,
        weight: u64,
    },
}

impl Node {
    fn weight(&self) -> u64 {
        match self {
            Node::Leaf { weight, .. } | Node::Branch { weight, .. } => *weight,
        }
    }
}

/// Immutable weighted selection tree stored as an arena
#[derive(Debug)]
pub struct WeightTree {
    nodes: Vec<Node>,
    root: usize,
    leaves: usize,
}

impl WeightTree {
    /// Build bottom-up; an odd level is padded with a zero-weight sentinel.
    /// Returns `None` when there are no leaves.
    pub fn build(leaves: Vec<(Arc<HealthTracker>, u64)>) -> Option<Self> {
        if leaves.is_empty() {
            return None;
        }
        let count = leaves.len();
        let mut nodes = Vec::with_capacity(count * 2 + 1);
        let mut level: Vec<usize> = leaves
            .into_iter()
            .map(|(health, weight)| {
                nodes.push(Node::Leaf {
                    health: Some(health),
                    weight,
                });
                nodes.len() - 1
            })
            .collect();

        while level.len() > 1 {
            if level.len() % 2 == 1 {
                nodes.push(Node::Leaf {
                    health: None,
                    weight: 0,
                });
                level.push(nodes.len() - 1);
            }
            level = level
                .chunks(2)
                .map(|pair| {
                    let (left, right) = (pair[0], pair[1]);
                    let weight = nodes[left].weight() + nodes[right].weight();
                    nodes.push(Node::Branch { left, right, weight });
                    nodes.len() - 1
                })
                .collect();
        }

        Some(Self {
            root: level[0],
            nodes,
            leaves: count,
        })
    }

    pub fn total_weight(&self) -> u64 {
        self.nodes[self.root].weight()
    }

    /// Number of real (non-sentinel) leaves
    pub fn len(&self) -> usize {
        self.leaves
    }

    pub fn is_empty(&self) -> bool {
        self.leaves == 0
    }

    /// Draw uniformly in `[0, total)` and descend: left while the draw is
    /// below the left subtree's weight, otherwise right with the draw offset.
    pub fn select_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Arc<HealthTracker>> {
        let total = self.total_weight();
        if total == 0 {
            return None;
        }
        let mut draw = rng.gen_range(0..total);
        let mut node = self.root;
        loop {
            match &self.nodes[node] {
                Node::Leaf { health, .. } => return health.as_ref(),
                Node::Branch { left, right, .. } => {
                    let left_weight = self.nodes[*left].weight();
                    if draw < left_weight {
                        node = *left;
                    } else {
                        draw -= left_weight;
                        node = *right;
                    }
                }
            }
        }
    }
}

/// Latency-weighted selection over a periodically rebuilt [`WeightTree`]
pub struct FairBalancer {
    tree: ArcSwapOption<WeightTree>,
    invalid: RwLock<HashSet<Instance>>,
    config: FairConfig,
    read_timeout_ms: u64,
    fallback: RandomBalancer,
}

impl FairBalancer {
    pub fn new(config: FairConfig, read_timeout_ms: u64) -> Self {
        Self {
            tree: ArcSwapOption::new(None),
            invalid: RwLock::new(HashSet::new()),
            config,
            read_timeout_ms,
            fallback: RandomBalancer::new(),
        }
    }

    /// Current snapshot, if enough data existed at the last rebuild
    pub fn tree(&self) -> Option<Arc<WeightTree>> {
        self.tree.load_full()
    }

    pub fn is_invalid(&self, instance: &Instance) -> bool {
        self.invalid.read().contains(instance)
    }

    /// Build and publish a new tree from `candidates`, then clear the
    /// invalid set. Too little latency data publishes no tree.
    pub fn rebuild(&self, candidates: &[Arc<HealthTracker>]) {
        let full: Vec<&Arc<HealthTracker>> =
            candidates.iter().filter(|c| c.is_window_full()).collect();
        let ratio = if candidates.is_empty() {
            0.0
        } else {
            full.len() as f64 / candidates.len() as f64
        };

        if full.len() < self.config.min_full_instances.max(1) || ratio < self.config.min_full_ratio {
            debug!(
                full = full.len(),
                candidates = candidates.len(),
                "Not enough latency data for a weight tree, selecting randomly"
            );
            self.tree.store(None);
        } else {
            let leaves = full
                .into_iter()
                .map(|health| {
                    let average = health.average_latency_ms().unwrap_or(self.read_timeout_ms);
                    (Arc::clone(health), fair_weight(average, self.read_timeout_ms))
                })
                .collect();
            let tree = WeightTree::build(leaves).map(Arc::new);
            if let Some(tree) = &tree {
                debug!(
                    leaves = tree.len(),
                    total_weight = tree.total_weight(),
                    "Rebuilt weight tree"
                );
            }
            self.tree.store(tree);
        }

        self.invalid.write().clear();
    }

    pub fn select_with<R: Rng + ?Sized>(
        &self,
        candidates: &[Arc<HealthTracker>],
        tried: &HashSet<Instance>,
        rng: &mut R,
    ) -> Option<Arc<HealthTracker>> {
        let snapshot = self.tree.load();
        let picked = snapshot.as_ref().and_then(|tree| {
            let drawn = catch_unwind(AssertUnwindSafe(|| {
                tree.select_with(&mut *rng).map(|health| health.instance().clone())
            }));
            drawn.unwrap_or_else(|_| {
                warn!("Weight tree selection panicked, selecting randomly");
                None
            })
        });

        if let Some(instance) = picked {
            let usable = !tried.contains(&instance) && !self.is_invalid(&instance);
            if usable {
                if let Some(candidate) = candidates.iter().find(|c| c.instance() == &instance) {
                    return Some(Arc::clone(candidate));
                }
            }
        }
        self.fallback.select_with(candidates, tried, rng)
    }
}

impl LoadBalancer for FairBalancer {
    fn select(
        &self,
        candidates: &[Arc<HealthTracker>],
        tried: &HashSet<Instance>,
    ) -> Option<Arc<HealthTracker>> {
        self.select_with(candidates, tried, &mut rand::thread_rng())
    }

    fn mark_invalid(&self, instance: &Instance) {
        self.invalid.write().insert(instance.clone());
    }

    fn refresh(&self, candidates: &[Arc<HealthTracker>]) {
        self.rebuild(candidates);
    }

    fn kind(&self) -> LoadBalanceKind {
        LoadBalanceKind::LatencyFair
    }
}
