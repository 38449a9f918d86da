//! Async-query state machine.
//!
//! One [`AsyncQuery`] exists per live results handle. Its lifecycle is a
//! loop between two threads: on the coordinator's background worker the
//! query attaches to the worker snapshot, re-runs, diffs against the last
//! delivered materialization and exports a fresh view; on the consumer
//! thread the view is imported, rebound into the results handle, and the
//! registered callbacks fire with the accumulated changeset.
//!
//! # Thread safety
//!
//! Most inter-thread synchronization is done by the coordinator external
//! to this code: `attach`, `run`, `prepare_handover` and `detach` are only
//! ever called on the single background worker, and `deliver` /
//! `call_callbacks` only on the consumer thread, with the background phase
//! of a cycle ordered before its delivery. Within that contract three
//! mutexes partition the state:
//!
//! - `worker` guards the compiled query, the pending view and the diff
//!   bookkeeping. Only the background phase locks it for real work; it is
//!   uncontended in practice.
//! - `shared` guards the target back-reference, the handover slots, the
//!   snapshot version, the latched error and the accumulated changeset:
//!   everything `deliver` reads. Locked briefly from both sides.
//! - `callbacks` guards the registry and its iteration cursor. Never held
//!   while a callback function executes.
//!
//! Lock order is worker → shared → callbacks; no path acquires them in
//! any other order.

use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use strata_error::{NotifyError, Result};
use strata_types::{CallbackToken, ColumnPath, RowIndex, SnapshotVersion, SortSpec};

use crate::changeset::ChangeSet;
use crate::coordinator::Coordinator;
use crate::diff::{
    diff_rows, records_affect_query, row_did_change, sorted_row_positions, DEFAULT_MAX_LINK_DEPTH,
};
use crate::engine::{QueryEngine, SnapshotAccess};
use crate::handover::HandoverPacket;
use crate::observability;
use crate::record::ChangeRecordSet;
use crate::registry::CallbackRegistry;

/// Tunables for one async query.
#[derive(Debug, Clone, Copy)]
pub struct NotifyConfig {
    /// Bound on watched-path link traversal depth.
    pub max_link_depth: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_link_depth: DEFAULT_MAX_LINK_DEPTH,
        }
    }
}

/// Consumer-side results handle, as seen by the notification core.
///
/// The async query holds only a weak reference to its target: the handle
/// owns the query, never the other way around. `set_view` rebinds a
/// freshly imported materialization; it is only ever called on the
/// consumer thread.
pub trait DeliveryTarget<V>: Send + Sync {
    /// Whether the handle wants background refreshes even with no
    /// callbacks registered.
    fn wants_background_updates(&self) -> bool;

    /// Rebind the delivered view into the handle.
    fn set_view(&self, view: V);
}

/// Background-phase position of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unattached,
    Attached,
    Ran,
    HandedOver,
}

/// State owned by the background worker.
struct WorkerState<E: QueryEngine> {
    phase: Phase,
    query: Option<E::Query>,
    view: Option<E::View>,
    /// Rows of the last materialization, in view order.
    previous_rows: Vec<RowIndex>,
    /// Rows underlying the last *delivered* view: the basis every diff is
    /// computed against. Pinned while a handover is starved so a replaced
    /// changeset stays correct relative to what the consumer last saw.
    diff_base: Vec<RowIndex>,
    /// Folded change records of every commit since `diff_base` was
    /// current. The diff resolves moves and modification tests against
    /// this window, never against a single commit's records: a starved
    /// handover can span many commits, and each one's edits must stay
    /// visible until the consumer catches up.
    base_records: ChangeRecordSet,
    /// Folded change records of every commit since `previous_rows` was
    /// materialized, including cycles that skipped running. Becomes the
    /// new `base_records` window when the base advances.
    records_since_run: ChangeRecordSet,
    /// Changeset computed by `run`, awaiting `prepare_handover`.
    new_changes: ChangeSet,
}

/// State read from both sides under the `shared` mutex.
struct SharedState<E: QueryEngine> {
    target: Option<Weak<dyn DeliveryTarget<E::View>>>,
    /// Version the last background cycle ran against.
    snapshot_version: SnapshotVersion,
    query_packet: Option<HandoverPacket<E::Payload>>,
    view_packet: Option<HandoverPacket<E::Payload>>,
    error: Option<Arc<NotifyError>>,
    initial_run_complete: bool,
    /// Bumped on every successful view rebind; callbacks compare their
    /// own last-seen value against it.
    delivered_version: u64,
    /// Changeset pending delivery to callbacks.
    changes: ChangeSet,
}

/// State machine for a single live query.
pub struct AsyncQuery<E: QueryEngine> {
    engine: Arc<E>,
    coordinator: Arc<dyn Coordinator>,
    sort: Option<SortSpec>,
    config: NotifyConfig,
    consumer_thread: ThreadId,
    worker: Mutex<WorkerState<E>>,
    shared: Mutex<SharedState<E>>,
    callbacks: Mutex<CallbackRegistry>,
}

impl<E: QueryEngine> AsyncQuery<E> {
    /// Register a live query for the given results handle.
    ///
    /// Must be called on the consumer thread: the thread is recorded and
    /// deliveries to any other thread are rejected. The compiled query is
    /// exported immediately so the background worker can pick it up on
    /// its own snapshot.
    pub fn new(
        engine: Arc<E>,
        coordinator: Arc<dyn Coordinator>,
        target: Weak<dyn DeliveryTarget<E::View>>,
        snapshot: &E::Snapshot,
        query: E::Query,
        sort: Option<SortSpec>,
        config: NotifyConfig,
    ) -> Result<Self> {
        let version = snapshot.current_version();
        let query_packet = engine.export_query(snapshot, query)?;
        debug!(version = version.get(), "async query registered");
        Ok(Self {
            engine,
            coordinator,
            sort,
            config,
            consumer_thread: thread::current().id(),
            worker: Mutex::new(WorkerState {
                phase: Phase::Unattached,
                query: None,
                view: None,
                previous_rows: Vec::new(),
                diff_base: Vec::new(),
                base_records: ChangeRecordSet::new(),
                records_since_run: ChangeRecordSet::new(),
                new_changes: ChangeSet::new(),
            }),
            shared: Mutex::new(SharedState {
                target: Some(target),
                snapshot_version: version,
                query_packet: Some(query_packet),
                view_packet: None,
                error: None,
                initial_run_complete: false,
                delivered_version: 0,
                changes: ChangeSet::new(),
            }),
            callbacks: Mutex::new(CallbackRegistry::new()),
        })
    }

    // -----------------------------------------------------------------
    // Consumer-facing callback management
    // -----------------------------------------------------------------

    /// Register a callback watching the given column paths.
    ///
    /// An empty path set means "changes to the root table's matching rows
    /// only". The first delivery after registration always fires, even if
    /// no data changed in between.
    pub fn add_callback(
        &self,
        watched_paths: Vec<ColumnPath>,
        function: impl FnMut(&ChangeSet, Option<&NotifyError>) + Send + 'static,
    ) -> CallbackToken {
        let (token, wake) = {
            let mut registry = self.callbacks.lock();
            // No need to wake the coordinator if we're already in the
            // middle of sending notifications.
            let wake = !registry.is_iterating();
            (registry.add(watched_paths, Box::new(function)), wake)
        };
        if wake {
            self.coordinator.request_commit_notifications();
        }
        token
    }

    /// Register a callback that only cares about errors.
    pub fn add_error_callback(
        &self,
        mut function: impl FnMut(Option<&NotifyError>) + Send + 'static,
    ) -> CallbackToken {
        self.add_callback(Vec::new(), move |_, error| function(error))
    }

    /// Remove a callback. Once this returns the callback will never fire
    /// again, even if a delivery iteration is in progress on the consumer
    /// thread.
    pub fn remove_callback(&self, token: CallbackToken) {
        let removed = self.callbacks.lock().remove(token);
        if !removed {
            // The only legitimate miss is a token bulk-removed by an
            // error delivery.
            debug_assert!(
                self.shared.lock().error.is_some(),
                "removed an unknown callback token"
            );
        }
    }

    /// Whether any callbacks are registered.
    #[must_use]
    pub fn have_callbacks(&self) -> bool {
        !self.callbacks.lock().is_empty()
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Whether the consumer still holds the results handle.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared
            .lock()
            .target
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some()
    }

    /// Clear the target back-reference. Idempotent; may be called from
    /// any thread. After this returns, `deliver` short-circuits and no
    /// further callbacks fire.
    pub fn unregister(&self) {
        self.shared.lock().target = None;
    }

    /// Drop the compiled query and its handover packet. Only legal once
    /// the query is unregistered.
    pub fn release_query(&self) {
        debug_assert!(
            self.shared.lock().target.is_none(),
            "release_query on a registered query"
        );
        {
            let mut worker = self.worker.lock();
            worker.query = None;
            worker.view = None;
            worker.phase = Phase::Unattached;
        }
        self.shared.lock().query_packet = None;
    }

    /// The number of views delivered so far. Monotone non-decreasing.
    #[must_use]
    pub fn delivered_version(&self) -> u64 {
        self.shared.lock().delivered_version
    }

    // -----------------------------------------------------------------
    // Background phase (coordinator worker thread)
    // -----------------------------------------------------------------

    /// Import the compiled query against the worker snapshot.
    pub fn attach(&self, snapshot: &E::Snapshot) -> Result<()> {
        let mut worker = self.worker.lock();
        debug_assert_eq!(worker.phase, Phase::Unattached, "attach while attached");
        debug_assert!(worker.query.is_none());

        let packet = self.shared.lock().query_packet.take();
        let Some(packet) = packet else {
            return Err(NotifyError::internal("attach without a query handover"));
        };
        worker.query = Some(self.engine.import_query(snapshot, packet)?);
        worker.phase = Phase::Attached;
        trace!(
            version = snapshot.current_version().get(),
            "attached to worker snapshot"
        );
        Ok(())
    }

    /// Re-run the query and compute the changeset against the last
    /// delivered materialization.
    ///
    /// Does nothing when the consumer is gone, when nobody is listening,
    /// or when the change records provably cannot affect the result.
    pub fn run(&self, snapshot: &E::Snapshot, records: &ChangeRecordSet) -> Result<()> {
        let mut worker = self.worker.lock();
        debug_assert_eq!(worker.phase, Phase::Attached, "run before attach");
        debug_assert!(worker.view.is_none(), "view left attached by a previous run");

        let root = {
            let Some(query) = worker.query.as_ref() else {
                return Err(NotifyError::internal("run without an attached query"));
            };
            self.engine.root_table(query)
        };

        let (initial_run_complete, pending_delivery, listening) = {
            let shared = self.shared.lock();
            if shared.error.is_some() {
                worker.phase = Phase::Ran;
                return Ok(());
            }
            let target = shared.target.as_ref().and_then(Weak::upgrade);
            let Some(target) = target else {
                observability::record_run_skipped();
                worker.phase = Phase::Ran;
                return Ok(());
            };
            let listening =
                target.wants_background_updates() || !self.callbacks.lock().is_empty();
            (
                shared.initial_run_complete,
                !shared.changes.is_empty() || shared.view_packet.is_some(),
                listening,
            )
        };

        // Fold this commit's records into the diff window before any
        // skip: a cycle that does no work still advances the database,
        // and the next diff must see every commit since the base.
        if initial_run_complete {
            worker.records_since_run.merge_newer(records);
            if pending_delivery {
                // A starved handover pins the diff base: the changeset
                // must stay relative to what the consumer actually has.
                worker.base_records.merge_newer(records);
            } else {
                worker.diff_base = worker.previous_rows.clone();
                worker.base_records = worker.records_since_run.clone();
            }
        }

        // Don't run the query if the results aren't actually going to be
        // used.
        if !listening {
            observability::record_run_skipped();
            worker.phase = Phase::Ran;
            return Ok(());
        }

        let watched = self.callbacks.lock().watched_paths();

        // With a handover already pending the current commit alone
        // decides; otherwise the whole unmaterialized window does.
        let affecting = if !initial_run_complete {
            true
        } else if pending_delivery {
            records_affect_query(snapshot, records, root, &watched, self.config.max_link_depth)
        } else {
            records_affect_query(
                snapshot,
                &worker.base_records,
                root,
                &watched,
                self.config.max_link_depth,
            )
        };
        if !affecting {
            observability::record_run_skipped();
            trace!(table = root.get(), "change records cannot affect query; skipping run");
            worker.phase = Phase::Ran;
            return Ok(());
        }

        let (view, new_rows) = {
            let Some(query) = worker.query.as_ref() else {
                return Err(NotifyError::internal("run without an attached query"));
            };
            let view = self.engine.execute(snapshot, query, self.sort.as_ref())?;
            let rows = self.engine.view_rows(snapshot, &view);
            (view, rows)
        };
        observability::record_run();

        if initial_run_complete {
            let window = &worker.base_records;
            let old_pairs = sorted_row_positions(&worker.diff_base, window.get(root));
            let new_pairs = sorted_row_positions(&new_rows, None);
            let changes = diff_rows(&old_pairs, &new_pairs, |row| {
                row_did_change(snapshot, window, root, row, &watched, self.config.max_link_depth)
            });

            if changes.is_empty() {
                // The fresh materialization matches the delivered state;
                // nothing to hand over. A starved packet from an earlier
                // cycle is obsolete too.
                {
                    let mut shared = self.shared.lock();
                    shared.changes.clear();
                    shared.view_packet = None;
                }
                worker.previous_rows = new_rows;
                worker.records_since_run = ChangeRecordSet::new();
                worker.phase = Phase::Ran;
                trace!("query re-ran clean; discarding view");
                return Ok(());
            }
            trace!(changes = changes.len(), rows = new_rows.len(), "changeset computed");
            worker.new_changes = changes;
        }

        worker.previous_rows = new_rows;
        worker.records_since_run = ChangeRecordSet::new();
        worker.view = Some(view);
        worker.phase = Phase::Ran;
        Ok(())
    }

    /// Export the fresh view for the consumer thread.
    ///
    /// Records the worker's snapshot version even when there is nothing
    /// to hand over, since delivery matches versions, not packets. A pending
    /// packet that was never delivered is replaced, and the accumulated
    /// changeset with it (it was computed against the same pinned base).
    pub fn prepare_handover(&self, snapshot: &E::Snapshot) -> Result<()> {
        let mut worker = self.worker.lock();
        debug_assert_eq!(worker.phase, Phase::Ran, "prepare_handover before run");

        let version = snapshot.current_version();
        let Some(view) = worker.view.take() else {
            self.shared.lock().snapshot_version = version;
            worker.phase = Phase::HandedOver;
            return Ok(());
        };

        let packet = self.engine.export_view(snapshot, view)?;
        {
            let mut shared = self.shared.lock();
            shared.snapshot_version = version;
            shared.initial_run_complete = true;
            shared.view_packet = Some(packet);
            shared.changes = std::mem::take(&mut worker.new_changes);
        }
        worker.phase = Phase::HandedOver;
        observability::record_handover();
        trace!(version = version.get(), "view handed over");
        Ok(())
    }

    /// Export the compiled query back into its handover packet so it
    /// survives the worker advancing to the next snapshot.
    pub fn detach(&self, snapshot: &E::Snapshot) -> Result<()> {
        let mut worker = self.worker.lock();
        debug_assert!(worker.view.is_none(), "detach with a view still attached");

        let Some(query) = worker.query.take() else {
            return Err(NotifyError::internal("detach without an attached query"));
        };
        let packet = self.engine.export_query(snapshot, query)?;
        self.shared.lock().query_packet = Some(packet);
        worker.phase = Phase::Unattached;
        Ok(())
    }

    /// Latch a background failure so it rides the next delivery.
    pub(crate) fn store_error(&self, error: NotifyError) {
        let mut shared = self.shared.lock();
        latch_error(&mut shared, error);
    }

    /// Drop worker-side state after a failed cycle. The query can no
    /// longer run, but the consumer handle stays queryable and
    /// releasable.
    pub(crate) fn abandon_worker(&self) {
        let mut worker = self.worker.lock();
        worker.query = None;
        worker.view = None;
        worker.new_changes.clear();
        worker.base_records = ChangeRecordSet::new();
        worker.records_since_run = ChangeRecordSet::new();
        worker.phase = Phase::Unattached;
    }

    /// Whether a background error has been latched.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.shared.lock().error.is_some()
    }

    // -----------------------------------------------------------------
    // Consumer phase
    // -----------------------------------------------------------------

    /// Import and rebind the pending view, if any. Returns whether there
    /// are callbacks to fire.
    ///
    /// Rejects silently when called off the consumer thread, when the
    /// target handle is gone, before the first background run completes,
    /// or when the consumer snapshot's version does not match the
    /// handover (the coordinator retries once versions realign).
    pub fn deliver(&self, snapshot: &E::Snapshot, error: Option<NotifyError>) -> bool {
        if thread::current().id() != self.consumer_thread {
            debug!("deliver rejected: not the consumer thread");
            return false;
        }

        let mut shared = self.shared.lock();

        // A dead target here means the results handle was destroyed while
        // the background phase was still in flight.
        let Some(target) = shared.target.as_ref().and_then(Weak::upgrade) else {
            return false;
        };

        if let Some(error) = error {
            latch_error(&mut shared, error);
            drop(shared);
            return self.have_callbacks();
        }
        if shared.error.is_some() {
            drop(shared);
            return self.have_callbacks();
        }

        // We can get called before the query has had a chance to run, if
        // we were registered immediately before a different query's
        // results were delivered.
        if !shared.initial_run_complete {
            return false;
        }

        let consumer_version = snapshot.current_version();
        if consumer_version != shared.snapshot_version {
            // The consumer can be newer (a local commit or manual
            // refresh) or older (we're ahead of its notification); either
            // way the handover stays put for the next realigned attempt.
            observability::record_stale_delivery();
            trace!(
                consumer = consumer_version.get(),
                handover = shared.snapshot_version.get(),
                "stale handover; delivery skipped"
            );
            return false;
        }

        if let Some(packet) = shared.view_packet.take() {
            match self.engine.import_view(snapshot, packet) {
                Ok(view) => {
                    target.set_view(view);
                    shared.delivered_version += 1;
                    observability::record_delivery();
                    trace!(
                        version = consumer_version.get(),
                        delivered = shared.delivered_version,
                        "view delivered"
                    );
                }
                Err(error) => latch_error(&mut shared, error),
            }
        }
        drop(shared);
        self.have_callbacks()
    }

    /// Invoke every callback pending for the current delivery with the
    /// accumulated changeset, then clear it. After an error delivery the
    /// registry is cleared: nothing will ever fire again.
    pub fn call_callbacks(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.consumer_thread,
            "call_callbacks off the consumer thread"
        );

        let (changes, error, version) = {
            let shared = self.shared.lock();
            (
                shared.changes.clone(),
                shared.error.clone(),
                shared.delivered_version,
            )
        };

        loop {
            let next = self.callbacks.lock().next_pending(version, error.is_some());
            let Some((token, mut function)) = next else {
                break;
            };
            function(&changes, error.as_deref());
            observability::record_callback_invocation();
            self.callbacks.lock().restore(token, function);
        }

        if error.is_some() {
            // Nothing will ever need to be called again after an error
            // delivery.
            self.callbacks.lock().clear();
        }
        self.shared.lock().changes.clear();
    }
}

/// Write-once error latch. Clears any pending view packet: an errored
/// query never delivers data again.
fn latch_error<E: QueryEngine>(shared: &mut SharedState<E>, error: NotifyError) {
    if shared.error.is_some() {
        debug!(%error, "error already latched; dropping");
        return;
    }
    warn!(%error, "background error latched");
    shared.view_packet = None;
    shared.error = Some(Arc::new(error));
    observability::record_error_latched();
}
