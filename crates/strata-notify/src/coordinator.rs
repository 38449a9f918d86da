//! The scheduling layer's contract, as consumed by the core.
//!
//! The coordinator owns the background worker and decides *when* queries
//! run; this module pins down the narrow interface the core needs back
//! from it, plus the canonical per-cycle sequence the coordinator drives
//! over every live query.
//!
//! The coordinator must uphold two ordering guarantees the core's lock
//! discipline relies on: the worker owns exactly one snapshot at a time
//! (so the whole background phase of a cycle is a single sequential block
//! on one thread), and a cycle's background phase happens-before the
//! delivery it produces is scheduled on the consumer thread.

use std::sync::Arc;

use tracing::warn;

use crate::engine::QueryEngine;
use crate::query::AsyncQuery;
use crate::record::ChangeRecordSet;

/// What the core asks of the scheduling layer.
pub trait Coordinator: Send + Sync {
    /// Ask the underlying engine to wake this process when a commit is
    /// made anywhere, including other processes. Invoked when a callback
    /// is registered outside a delivery iteration; idempotent.
    fn request_commit_notifications(&self);
}

/// Run one background cycle over a batch of live queries against the
/// worker's current snapshot.
///
/// Each query goes through `attach → run → prepare_handover → detach` in
/// sequence. A failure latches into that query, surfaces to its callbacks
/// on the next delivery, and never propagates to the other queries in the
/// batch. Queries that already latched an error are skipped entirely.
pub fn run_background_cycle<E: QueryEngine>(
    queries: &[Arc<AsyncQuery<E>>],
    snapshot: &E::Snapshot,
    records: &ChangeRecordSet,
) {
    for query in queries {
        if query.is_errored() {
            continue;
        }
        if let Err(error) = cycle_one(query, snapshot, records) {
            warn!(%error, "background cycle failed; latching");
            query.store_error(error);
            // The compiled query may be stranded mid-phase; drop it so the
            // worker can advance. The query stays releasable.
            query.abandon_worker();
        }
    }
}

fn cycle_one<E: QueryEngine>(
    query: &AsyncQuery<E>,
    snapshot: &E::Snapshot,
    records: &ChangeRecordSet,
) -> strata_error::Result<()> {
    query.attach(snapshot)?;
    query.run(snapshot, records)?;
    query.prepare_handover(snapshot)?;
    query.detach(snapshot)
}
