//! Operational counters for the execution core.
//!
//! Process-wide, shared by every engine. Flushed (logged) by the runner
//! on its health interval and once at shutdown; nothing is persisted.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Thread-safe counters over the trading core.
#[derive(Debug)]
pub struct CoreMetrics {
    entries_submitted: AtomicU64,
    entries_rejected: AtomicU64,
    fills_applied: AtomicU64,
    stops_placed: AtomicU64,
    stops_replaced: AtomicU64,
    stop_place_failures: AtomicU64,
    force_exits: AtomicU64,
    reconcile_repairs: AtomicU64,
    orphans_cancelled: AtomicU64,
    admission_rejections: AtomicU64,
    started_at: RwLock<Instant>,
}

impl Default for CoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self {
            entries_submitted: AtomicU64::new(0),
            entries_rejected: AtomicU64::new(0),
            fills_applied: AtomicU64::new(0),
            stops_placed: AtomicU64::new(0),
            stops_replaced: AtomicU64::new(0),
            stop_place_failures: AtomicU64::new(0),
            force_exits: AtomicU64::new(0),
            reconcile_repairs: AtomicU64::new(0),
            orphans_cancelled: AtomicU64::new(0),
            admission_rejections: AtomicU64::new(0),
            started_at: RwLock::new(Instant::now()),
        }
    }

    /// Shared handle for all engines in the process.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn inc_entries_submitted(&self) {
        self.entries_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_entries_rejected(&self) {
        self.entries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fills_applied(&self) {
        self.fills_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stops_placed(&self) {
        self.stops_placed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stops_replaced(&self) {
        self.stops_replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stop_place_failures(&self) {
        self.stop_place_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_force_exits(&self) {
        self.force_exits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reconcile_repairs(&self) {
        self.reconcile_repairs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orphans_cancelled(&self) {
        self.orphans_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_admission_rejections(&self) {
        self.admission_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time view of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.read().elapsed().as_secs(),
            entries_submitted: self.entries_submitted.load(Ordering::Relaxed),
            entries_rejected: self.entries_rejected.load(Ordering::Relaxed),
            fills_applied: self.fills_applied.load(Ordering::Relaxed),
            stops_placed: self.stops_placed.load(Ordering::Relaxed),
            stops_replaced: self.stops_replaced.load(Ordering::Relaxed),
            stop_place_failures: self.stop_place_failures.load(Ordering::Relaxed),
            force_exits: self.force_exits.load(Ordering::Relaxed),
            reconcile_repairs: self.reconcile_repairs.load(Ordering::Relaxed),
            orphans_cancelled: self.orphans_cancelled.load(Ordering::Relaxed),
            admission_rejections: self.admission_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub entries_submitted: u64,
    pub entries_rejected: u64,
    pub fills_applied: u64,
    pub stops_placed: u64,
    pub stops_replaced: u64,
    pub stop_place_failures: u64,
    pub force_exits: u64,
    pub reconcile_repairs: u64,
    pub orphans_cancelled: u64,
    pub admission_rejections: u64,
}
