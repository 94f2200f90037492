//! Correlation Registry
//!
//! Maps correlation ids of in-flight calls to their [`PendingCall`]s. Backed
//! by a sharded [`DashMap`] so unrelated calls never contend on one lock.

use crate::message::{CorrelationId, Response};
use crate::pending::PendingCall;
use crate::{Result, RpcError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Registry of in-flight calls keyed by correlation id
#[derive(Debug)]
pub struct CorrelationRegistry {
    calls: DashMap<CorrelationId, Arc<PendingCall>>,
    next_id: AtomicU32,
    capacity: usize,
}

impl CorrelationRegistry {
    pub fn new(capacity: usize) -> Self {
        // keep at least half the id space free so the id scan stays short
        let capacity = capacity.clamp(1, (u32::MAX / 2) as usize);
        Self {
            calls: DashMap::with_capacity(capacity.min(1024)),
            next_id: AtomicU32::new(1),
            capacity,
        }
    }

    fn next_candidate(&self) -> CorrelationId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Assign a fresh id to `call` and insert it
    pub fn register(&self, call: Arc<PendingCall>) -> Result<CorrelationId> {
        if self.calls.len() >= self.capacity {
            return Err(RpcError::network(
                format!("too many in-flight calls (limit {})", self.capacity),
                Some(call.health().instance().clone()),
            ));
        }

        loop {
            let id = self.next_candidate();
            if let Entry::Vacant(slot) = self.calls.entry(id) {
                call.assign_id(id);
                slot.insert(call);
                return Ok(id);
            }
        }
    }

    /// Remove and complete the call registered under `id`. A miss, e.g. after
    /// the call already timed out, is a no-op returning `false`.
    pub fn resolve(&self, id: CorrelationId, outcome: Result<Response>) -> bool {
        match self.calls.remove(&id) {
            Some((_, call)) => call.complete(outcome),
            None => {
                debug!(correlation_id = id, "No pending call for correlation id");
                false
            }
        }
    }

    pub fn get(&self, id: CorrelationId) -> Option<Arc<PendingCall>> {
        self.calls.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: CorrelationId) -> Option<Arc<PendingCall>> {
        self.calls.remove(&id).map(|(_, call)| call)
    }

    /// Remove the entry only if it still holds `call`; the id may have been
    /// reused by a newer call after this one resolved.
    pub fn remove_if_same(&self, id: CorrelationId, call: &Arc<PendingCall>) -> bool {
        self.calls
            .remove_if(&id, |_, current| Arc::ptr_eq(current, call))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new(65536)
    }
}
