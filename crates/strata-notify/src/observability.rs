//! Notification-core metrics.
//!
//! Lock-free counters incremented on the hot paths of the async-query
//! state machine. Counters use `Relaxed` ordering; they are diagnostics,
//! not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

static STRATA_NOTIFY_RUNS_TOTAL: AtomicU64 = AtomicU64::new(0);
static STRATA_NOTIFY_RUNS_SKIPPED_TOTAL: AtomicU64 = AtomicU64::new(0);
static STRATA_NOTIFY_HANDOVERS_TOTAL: AtomicU64 = AtomicU64::new(0);
static STRATA_NOTIFY_DELIVERIES_TOTAL: AtomicU64 = AtomicU64::new(0);
static STRATA_NOTIFY_DELIVERIES_STALE_TOTAL: AtomicU64 = AtomicU64::new(0);
static STRATA_NOTIFY_CALLBACK_INVOCATIONS_TOTAL: AtomicU64 = AtomicU64::new(0);
static STRATA_NOTIFY_ERRORS_LATCHED_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the notification-core counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct NotifyMetricsSnapshot {
    pub strata_notify_runs_total: u64,
    pub strata_notify_runs_skipped_total: u64,
    pub strata_notify_handovers_total: u64,
    pub strata_notify_deliveries_total: u64,
    pub strata_notify_deliveries_stale_total: u64,
    pub strata_notify_callback_invocations_total: u64,
    pub strata_notify_errors_latched_total: u64,
}

/// Read the current counter values.
#[must_use]
pub fn notify_metrics() -> NotifyMetricsSnapshot {
    NotifyMetricsSnapshot {
        strata_notify_runs_total: STRATA_NOTIFY_RUNS_TOTAL.load(Ordering::Relaxed),
        strata_notify_runs_skipped_total: STRATA_NOTIFY_RUNS_SKIPPED_TOTAL.load(Ordering::Relaxed),
        strata_notify_handovers_total: STRATA_NOTIFY_HANDOVERS_TOTAL.load(Ordering::Relaxed),
        strata_notify_deliveries_total: STRATA_NOTIFY_DELIVERIES_TOTAL.load(Ordering::Relaxed),
        strata_notify_deliveries_stale_total: STRATA_NOTIFY_DELIVERIES_STALE_TOTAL
            .load(Ordering::Relaxed),
        strata_notify_callback_invocations_total: STRATA_NOTIFY_CALLBACK_INVOCATIONS_TOTAL
            .load(Ordering::Relaxed),
        strata_notify_errors_latched_total: STRATA_NOTIFY_ERRORS_LATCHED_TOTAL
            .load(Ordering::Relaxed),
    }
}

/// Reset all counters (for tests).
pub fn reset_notify_metrics() {
    STRATA_NOTIFY_RUNS_TOTAL.store(0, Ordering::Relaxed);
    STRATA_NOTIFY_RUNS_SKIPPED_TOTAL.store(0, Ordering::Relaxed);
    STRATA_NOTIFY_HANDOVERS_TOTAL.store(0, Ordering::Relaxed);
    STRATA_NOTIFY_DELIVERIES_TOTAL.store(0, Ordering::Relaxed);
    STRATA_NOTIFY_DELIVERIES_STALE_TOTAL.store(0, Ordering::Relaxed);
    STRATA_NOTIFY_CALLBACK_INVOCATIONS_TOTAL.store(0, Ordering::Relaxed);
    STRATA_NOTIFY_ERRORS_LATCHED_TOTAL.store(0, Ordering::Relaxed);
}

pub(crate) fn record_run() {
    STRATA_NOTIFY_RUNS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_run_skipped() {
    STRATA_NOTIFY_RUNS_SKIPPED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_handover() {
    STRATA_NOTIFY_HANDOVERS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_delivery() {
    STRATA_NOTIFY_DELIVERIES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_stale_delivery() {
    STRATA_NOTIFY_DELIVERIES_STALE_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_callback_invocation() {
    STRATA_NOTIFY_CALLBACK_INVOCATIONS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_error_latched() {
    STRATA_NOTIFY_ERRORS_LATCHED_TOTAL.fetch_add(1, Ordering::Relaxed);
}
