//! Live-query notification core for StrataDB.
//!
//! A consumer declares a query whose materialized result auto-updates: on
//! every commit, from any thread, the query is re-run on a background
//! worker against a consistent snapshot, a minimal positional changeset is
//! computed against the previously delivered result, and the fresh view is
//! handed off to the consumer thread where registered callbacks fire.
//!
//! The crate owns three things:
//!
//! - the per-query state machine ([`AsyncQuery`]) that shuttles a compiled
//!   query and its view between threads via the engine's zero-copy
//!   handover packets;
//! - the callback registry: token allocation, watched column paths, and
//!   reentrancy-safe delivery iteration;
//! - the row-diff engine ([`diff`]) that turns two ordered row sequences
//!   plus a commit's change records into inserts, deletes, moves and
//!   in-place modifications.
//!
//! The storage engine, query compiler and MVCC machinery stay behind the
//! [`QueryEngine`] / [`SnapshotAccess`] port; the scheduling layer stays
//! behind [`Coordinator`].

pub mod changeset;
pub mod coordinator;
pub mod diff;
pub mod engine;
pub mod handover;
pub mod observability;
pub mod query;
pub mod record;
pub mod registry;

pub use changeset::{Change, ChangeSet, POS_NONE};
pub use coordinator::{run_background_cycle, Coordinator};
pub use diff::{
    diff_rows, records_affect_query, row_did_change, sorted_row_positions, RowPosition,
    DEFAULT_MAX_LINK_DEPTH,
};
pub use engine::{QueryEngine, SnapshotAccess};
pub use handover::HandoverPacket;
pub use observability::{notify_metrics, reset_notify_metrics, NotifyMetricsSnapshot};
pub use query::{AsyncQuery, DeliveryTarget, NotifyConfig};
pub use record::{ChangeRecord, ChangeRecordSet};
pub use registry::{CallbackRegistry, ChangeCallback, DELIVERY_NONE};
