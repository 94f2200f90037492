//! Service Discovery
//!
//! Discovery backends supply the instance list and push membership changes.
//! Only the in-memory [`StaticDiscovery`] ships here; real backends implement
//! [`ServiceDiscovery`].

use crate::instance::Instance;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Receives membership changes
pub trait DiscoveryListener: Send + Sync + 'static {
    fn on_change(&self, added: Vec<Instance>, removed: Vec<Instance>);
}

/// Source of the instances serving one service
pub trait ServiceDiscovery: Send + Sync + 'static {
    fn lookup(&self) -> Vec<Instance>;

    fn subscribe(&self, listener: Arc<dyn DiscoveryListener>);
}

/// Fixed instance list, changed explicitly through [`StaticDiscovery::update`]
#[derive(Default)]
pub struct StaticDiscovery {
    instances: RwLock<BTreeSet<Instance>>,
    listeners: RwLock<Vec<Arc<dyn DiscoveryListener>>>,
}

impl StaticDiscovery {
    pub fn new(instances: impl IntoIterator<Item = Instance>) -> Self {
        Self {
            instances: RwLock::new(instances.into_iter().collect()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Replace the instance list and notify listeners of the difference
    pub fn update(&self, instances: impl IntoIterator<Item = Instance>) {
        let next: BTreeSet<Instance> = instances.into_iter().collect();
        let (added, removed) = {
            let mut current = self.instances.write();
            let added: Vec<_> = next.difference(&current).cloned().collect();
            let removed: Vec<_> = current.difference(&next).cloned().collect();
            *current = next;
            (added, removed)
        };
        if added.is_empty() && removed.is_empty() {
            return;
        }

        info!(added = added.len(), removed = removed.len(), "Service membership changed");
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_change(added.clone(), removed.clone());
        }
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn lookup(&self) -> Vec<Instance> {
        self.instances.read().iter().cloned().collect()
    }

    fn subscribe(&self, listener: Arc<dyn DiscoveryListener>) {
        self.listeners.write().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<(Vec<Instance>, Vec<Instance>)>>,
    }

    impl DiscoveryListener for Recorder {
        fn on_change(&self, added: Vec<Instance>, removed: Vec<Instance>) {
            self.changes.lock().push((added, removed));
        }
    }

    fn at(port: u16) -> Instance {
        Instance::new("10.0.0.2", port)
    }

    #[test]
    fn test_update_notifies_diff() {
        let discovery = StaticDiscovery::new([at(1), at(2)]);
        let recorder = Arc::new(Recorder::default());
        discovery.subscribe(recorder.clone());

        discovery.update([at(2), at(3)]);
        discovery.update([at(3), at(2)]);

        let changes = recorder.changes.lock();
        assert_eq!(changes.len(), 1, "unchanged membership must not notify");
        assert_eq!(changes[0], (vec![at(3)], vec![at(1)]));
        assert_eq!(discovery.lookup(), vec![at(2), at(3)]);
    }
}
