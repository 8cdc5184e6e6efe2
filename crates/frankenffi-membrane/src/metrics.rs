//! Atomic counters for interop observability.
//!
//! All counters use relaxed ordering; they are diagnostic only and never
//! used for synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global operation counters shared by every layer.
pub struct FfiMetrics {
    /// Arenas opened.
    pub arenas_opened: AtomicU64,
    /// Arenas whose storage was released.
    pub arenas_closed: AtomicU64,
    /// Segments carved from arenas.
    pub segments_allocated: AtomicU64,
    /// Bytes handed out to segments.
    pub bytes_allocated: AtomicU64,
    /// Accesses rejected for falling outside a segment.
    pub bounds_violations: AtomicU64,
    /// Accesses rejected because the arena was closed.
    pub closed_accesses: AtomicU64,
    /// Accesses to confined arenas from a foreign owner.
    pub owner_violations: AtomicU64,
    /// Shared-arena writes that found the write gate busy.
    pub write_contentions: AtomicU64,
    /// Native symbols resolved.
    pub symbols_resolved: AtomicU64,
    /// Descriptors accepted at bind time.
    pub bindings_created: AtomicU64,
    /// Descriptors rejected at bind time.
    pub bindings_rejected: AtomicU64,
    /// Native calls issued.
    pub native_calls: AtomicU64,
    /// Invocations rejected before reaching native code.
    pub invocations_rejected: AtomicU64,
    /// Tasks spawned.
    pub tasks_spawned: AtomicU64,
    /// Tasks that completed successfully.
    pub tasks_completed: AtomicU64,
    /// Tasks that failed (including cancellation).
    pub tasks_failed: AtomicU64,
    /// Tasks terminated by cancellation.
    pub tasks_cancelled: AtomicU64,
    /// Times a running task suspended.
    pub suspensions: AtomicU64,
    /// Failed tasks nobody joined.
    pub unjoined_failures: AtomicU64,
}

impl FfiMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            arenas_opened: AtomicU64::new(0),
            arenas_closed: AtomicU64::new(0),
            segments_allocated: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            bounds_violations: AtomicU64::new(0),
            closed_accesses: AtomicU64::new(0),
            owner_violations: AtomicU64::new(0),
            write_contentions: AtomicU64::new(0),
            symbols_resolved: AtomicU64::new(0),
            bindings_created: AtomicU64::new(0),
            bindings_rejected: AtomicU64::new(0),
            native_calls: AtomicU64::new(0),
            invocations_rejected: AtomicU64::new(0),
            tasks_spawned: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            suspensions: AtomicU64::new(0),
            unjoined_failures: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            arenas_opened: Self::get(&self.arenas_opened),
            arenas_closed: Self::get(&self.arenas_closed),
            segments_allocated: Self::get(&self.segments_allocated),
            bytes_allocated: Self::get(&self.bytes_allocated),
            bounds_violations: Self::get(&self.bounds_violations),
            closed_accesses: Self::get(&self.closed_accesses),
            owner_violations: Self::get(&self.owner_violations),
            write_contentions: Self::get(&self.write_contentions),
            symbols_resolved: Self::get(&self.symbols_resolved),
            bindings_created: Self::get(&self.bindings_created),
            bindings_rejected: Self::get(&self.bindings_rejected),
            native_calls: Self::get(&self.native_calls),
            invocations_rejected: Self::get(&self.invocations_rejected),
            tasks_spawned: Self::get(&self.tasks_spawned),
            tasks_completed: Self::get(&self.tasks_completed),
            tasks_failed: Self::get(&self.tasks_failed),
            tasks_cancelled: Self::get(&self.tasks_cancelled),
            suspensions: Self::get(&self.suspensions),
            unjoined_failures: Self::get(&self.unjoined_failures),
        }
    }
}

impl Default for FfiMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub arenas_opened: u64,
    pub arenas_closed: u64,
    pub segments_allocated: u64,
    pub bytes_allocated: u64,
    pub bounds_violations: u64,
    pub closed_accesses: u64,
    pub owner_violations: u64,
    pub write_contentions: u64,
    pub symbols_resolved: u64,
    pub bindings_created: u64,
    pub bindings_rejected: u64,
    pub native_calls: u64,
    pub invocations_rejected: u64,
    pub tasks_spawned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub suspensions: u64,
    pub unjoined_failures: u64,
}

/// Global metrics instance.
static GLOBAL_METRICS: FfiMetrics = FfiMetrics::new();

/// Access the global metrics singleton.
#[must_use]
pub fn global_metrics() -> &'static FfiMetrics {
    &GLOBAL_METRICS
}
