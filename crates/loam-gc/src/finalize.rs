//! Finalizer registration and deferred finalization.
//!
//! Sweeping never destroys an object with registered finalizers; it parks
//! the slot on the deferred list instead. A separate pass, invoked by the
//! mutator, runs the closures and only then recycles the slot. Closure
//! failures are isolated per closure so one failing finalizer cannot starve
//! the rest of the queue.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::value::ObjectId;

/// A registered finalizer closure.
pub(crate) struct FinalizerEntry {
    /// Permission level captured at registration time, handed back to the
    /// closure when it runs.
    permission: u8,
    func: Box<dyn FnMut(ObjectId, u8)>,
}

/// Object identity to its ordered finalizer list.
#[derive(Default)]
pub(crate) struct FinalizerTable {
    map: HashMap<ObjectId, Vec<FinalizerEntry>>,
}

impl FinalizerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a finalizer for `id`, creating the entry if absent.
    pub(crate) fn register(
        &mut self,
        id: ObjectId,
        permission: u8,
        func: Box<dyn FnMut(ObjectId, u8)>,
    ) {
        self.map
            .entry(id)
            .or_default()
            .push(FinalizerEntry { permission, func });
    }

    /// Drop every finalizer registered for `id`.
    pub(crate) fn unregister(&mut self, id: ObjectId) -> bool {
        self.map.remove(&id).is_some()
    }

    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.map.contains_key(&id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Run every finalizer registered for `id`, in registration order,
    /// removing the entry. A panicking closure is caught and logged; the
    /// remaining closures still run.
    pub(crate) fn run(&mut self, id: ObjectId) {
        let Some(entries) = self.map.remove(&id) else {
            return;
        };
        for mut entry in entries {
            let permission = entry.permission;
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.func)(id, permission)));
            if outcome.is_err() {
                tracing::warn!(id, "finalizer raised; continuing with remaining queue");
            }
        }
    }
}

impl std::fmt::Debug for FinalizerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizerTable")
            .field("entries", &self.map.len())
            .finish()
    }
}
