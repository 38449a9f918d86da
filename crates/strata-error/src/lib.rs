//! Error types for the StrataDB live-query subsystem.
//!
//! Background-phase failures are never thrown across threads: they are
//! latched into the owning query and ride the delivery path to the
//! consumer thread, where every registered callback observes them exactly
//! once. The variants here distinguish the failures that can latch (engine
//! and handover faults) from the ones that are plain misuse.

use strata_types::{PacketKind, SnapshotVersion};
use thiserror::Error;

/// Primary error type for live-query operations.
#[derive(Error, Debug)]
pub enum NotifyError {
    /// Executing the compiled query against the worker snapshot failed.
    #[error("query execution failed: {detail}")]
    QueryFailed { detail: String },

    /// Exporting a query or view into a handover packet failed.
    #[error("handover export of {kind} failed: {detail}")]
    HandoverExport { kind: PacketKind, detail: String },

    /// Importing a handover packet into the destination snapshot failed.
    #[error("handover import of {kind} failed: {detail}")]
    HandoverImport { kind: PacketKind, detail: String },

    /// A handover packet was produced against a newer version than the
    /// snapshot it is being imported into.
    #[error("handover packet at {packet} cannot attach to older snapshot at {snapshot}")]
    HandoverVersionMismatch {
        packet: SnapshotVersion,
        snapshot: SnapshotVersion,
    },

    /// A handover packet's payload was taken twice.
    #[error("handover packet already consumed")]
    PacketConsumed,

    /// A handover packet held the wrong payload kind.
    #[error("handover packet holds a {actual} payload, expected {expected}")]
    PacketKindMismatch {
        expected: PacketKind,
        actual: PacketKind,
    },

    /// The storage engine reported inconsistent schema or table state.
    #[error("schema corrupt: {detail}")]
    SchemaCorrupt { detail: String },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl NotifyError {
    /// Create a query-execution failure.
    pub fn query_failed(detail: impl Into<String>) -> Self {
        Self::QueryFailed {
            detail: detail.into(),
        }
    }

    /// Create a handover-export failure.
    pub fn export_failed(kind: PacketKind, detail: impl Into<String>) -> Self {
        Self::HandoverExport {
            kind,
            detail: detail.into(),
        }
    }

    /// Create a handover-import failure.
    pub fn import_failed(kind: PacketKind, detail: impl Into<String>) -> Self {
        Self::HandoverImport {
            kind,
            detail: detail.into(),
        }
    }

    /// Create a schema-corruption error.
    pub fn schema_corrupt(detail: impl Into<String>) -> Self {
        Self::SchemaCorrupt {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying against a newer snapshot may succeed.
    ///
    /// Version mismatches are transient by construction: the coordinator
    /// retries once the consumer and worker snapshots realign. Everything
    /// else latches.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::HandoverVersionMismatch { .. })
    }
}

/// Result type alias using [`NotifyError`].
pub type Result<T> = std::result::Result<T, NotifyError>;
