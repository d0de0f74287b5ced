//! Structured rehash lifecycle events.
//!
//! Mirrors the lifecycle-record pattern used for allocator tracing elsewhere
//! in this codebase: an in-process structured event log rather than a
//! dependency on an external logging crate. Collection costs one `Mutex`
//! push per rehash-related step, which is negligible relative to the cost
//! of a rehash itself.

use std::sync::Mutex;

/// One step of a core's rehash lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehashEvent {
    /// A thread began migrating `from_capacity` pairs into a successor of
    /// `to_capacity` pairs. May be recorded more than once for the same
    /// migration under contention: rehash is idempotent and helpable.
    Started { from_capacity: u32, to_capacity: u32 },
    /// A live value at `old_index` was frozen (negated) by this thread,
    /// ahead of copying it to the successor.
    SlotFrozen { old_index: usize },
    /// The value at `old_index` was copied to the successor and this
    /// thread won the CAS marking the slot STOLEN.
    SlotMigrated { old_index: usize },
    /// Every pair in the core has reached a terminal state (STOLEN).
    Completed { from_capacity: u32, to_capacity: u32 },
}

#[derive(Debug, Default)]
pub(crate) struct DiagnosticsSink {
    events: Mutex<Vec<RehashEvent>>,
}

impl DiagnosticsSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, event: RehashEvent) {
        self.events
            .lock()
            .expect("diagnostics mutex poisoned")
            .push(event);
    }

    /// Returns and clears every event recorded since the last drain.
    pub(crate) fn drain(&self) -> Vec<RehashEvent> {
        std::mem::take(&mut *self.events.lock().expect("diagnostics mutex poisoned"))
    }
}
