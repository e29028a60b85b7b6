//! Reference-counted activation of scarce external handles.
//!
//! Any number of logical owners may activate a pooled resource; the
//! backing handle is acquired on the first activation and released only
//! when the active count drops back to zero. Counts are mutated under the
//! map's per-entry lock, so the count mutation is atomic even though the
//! backing acquire/release only fires on the 0→1 and 1→0 transitions.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

/// Identity of one activatable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Resource{}", self.0)
    }
}

/// Acquire/release hooks for the scarce backing handle.
///
/// Implemented by the resource collaborator owning the actual native
/// handles (driver objects, file descriptors).
pub trait ResourceLifecycle: Send + Sync {
    /// Called on the 0→1 activation transition.
    fn acquire(&self, id: ResourceId);
    /// Called on the 1→0 deactivation transition.
    fn release(&self, id: ResourceId);
}

/// Reference-counted activation pool over a [`ResourceLifecycle`].
///
/// The only engine state mutated from multiple concurrent submitters;
/// everything else lives inside single-threaded actor loops.
pub struct ActivationPool {
    counts: DashMap<ResourceId, usize>,
    lifecycle: Arc<dyn ResourceLifecycle>,
}

impl ActivationPool {
    /// Creates a pool delegating handle acquisition to `lifecycle`.
    pub fn new(lifecycle: Arc<dyn ResourceLifecycle>) -> Self {
        Self {
            counts: DashMap::new(),
            lifecycle,
        }
    }

    /// Increments the active count, acquiring the backing handle on the
    /// first activation.
    pub fn activate(&self, id: ResourceId) {
        let mut entry = self.counts.entry(id).or_insert(0);
        *entry += 1;
        if *entry == 1 {
            debug!(resource = %id, "Acquiring backing handle");
            self.lifecycle.acquire(id);
        }
    }

    /// Decrements the active count, releasing the backing handle when it
    /// reaches zero.
    ///
    /// # Panics
    ///
    /// Deactivating a resource that is not active is bookkeeping
    /// corruption and aborts the caller.
    pub fn deactivate(&self, id: ResourceId) {
        let mut entry = self
            .counts
            .get_mut(&id)
            .unwrap_or_else(|| panic!("deactivate of inactive {}", id));
        assert!(*entry > 0, "deactivate of inactive {}", id);
        *entry -= 1;
        if *entry == 0 {
            debug!(resource = %id, "Releasing backing handle");
            self.lifecycle.release(id);
        }
    }

    /// Net outstanding activations for `id`.
    pub fn active_count(&self, id: ResourceId) -> usize {
        self.counts.get(&id).map(|e| *e).unwrap_or(0)
    }

    /// Returns true iff `active_count(id) > 0`.
    pub fn active(&self, id: ResourceId) -> bool {
        self.active_count(id) > 0
    }

    /// Drops every activation still held by `id`, releasing the backing
    /// handle if it was active.
    ///
    /// Called when a resource owner closes, guaranteeing no leaked active
    /// references.
    pub fn close(&self, id: ResourceId) {
        if let Some((_, count)) = self.counts.remove(&id) {
            if count > 0 {
                debug!(resource = %id, dropped = count, "Releasing backing handle on close");
                self.lifecycle.release(id);
            }
        }
    }
}
