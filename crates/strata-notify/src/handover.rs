//! Version-tagged handover packets.
//!
//! A handover packet is the only object the subsystem passes between
//! threads: a serialized query or materialized view produced by the storage
//! engine on one snapshot and reconstituted on another. Packets are
//! move-only. The payload can be taken exactly once; a second take is a
//! run-time error rather than undefined reuse, because packets sit in
//! `Option` slots that outlive the transfer.

use strata_error::{NotifyError, Result};
use strata_types::{PacketKind, SnapshotVersion};

/// A move-only bundle carrying an exported query or view across threads.
///
/// `P` is the storage engine's opaque payload type. The packet records the
/// snapshot version it was exported against; engines must refuse to import
/// it into any snapshot older than that version.
#[derive(Debug)]
pub struct HandoverPacket<P> {
    kind: PacketKind,
    version: SnapshotVersion,
    payload: Option<P>,
}

impl<P> HandoverPacket<P> {
    /// Wrap an exported query.
    #[must_use]
    pub fn for_query(payload: P, version: SnapshotVersion) -> Self {
        Self {
            kind: PacketKind::Query,
            version,
            payload: Some(payload),
        }
    }

    /// Wrap an exported view.
    #[must_use]
    pub fn for_view(payload: P, version: SnapshotVersion) -> Self {
        Self {
            kind: PacketKind::View,
            version,
            payload: Some(payload),
        }
    }

    /// The payload kind this packet was created with.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// The snapshot version the payload was exported against.
    #[inline]
    #[must_use]
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    /// Whether the payload has already been taken.
    #[inline]
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.payload.is_none()
    }

    /// Take the payload out, consuming the packet's single use.
    ///
    /// Fails with [`NotifyError::PacketKindMismatch`] when the caller
    /// expected the other payload kind and with
    /// [`NotifyError::PacketConsumed`] when the payload is already gone.
    pub fn take(&mut self, expected: PacketKind) -> Result<P> {
        if self.kind != expected {
            return Err(NotifyError::PacketKindMismatch {
                expected,
                actual: self.kind,
            });
        }
        self.payload.take().ok_or(NotifyError::PacketConsumed)
    }
}
