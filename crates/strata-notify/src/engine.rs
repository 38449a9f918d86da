//! Storage-engine port.
//!
//! The notification core never touches the storage engine directly; it
//! reaches it through these two traits. [`SnapshotAccess`] is the read
//! surface of one consistent database snapshot, [`QueryEngine`] the set of
//! operations the core needs: cross-thread export/import of queries and
//! views, query execution, and view materialization.
//!
//! Thread contract: `export_*` is only legal on the thread currently
//! holding the source snapshot; `import_*` is legal on any thread holding
//! the destination snapshot. The core upholds this by construction: the
//! worker exports/imports on the background thread and the consumer
//! imports delivered views on its own thread.

use strata_error::Result;
use strata_types::{ColumnIndex, RowIndex, SnapshotVersion, SortSpec, TableIndex};

use crate::handover::HandoverPacket;

/// Read access to one consistent database snapshot.
///
/// Link traversal is the only schema knowledge the core needs: watched
/// column paths walk link and link-list columns, and each hop asks the
/// snapshot where the column points.
pub trait SnapshotAccess {
    /// The monotone version of this snapshot.
    fn current_version(&self) -> SnapshotVersion;

    /// Target table of a link or link-list column, or `None` when the
    /// column holds plain values.
    fn link_target(&self, table: TableIndex, column: ColumnIndex) -> Option<TableIndex>;

    /// Rows reachable from `(table, row)` through `column`: empty for an
    /// unset link, one entry for a set link, any number for a link list.
    fn linked_rows(&self, table: TableIndex, row: RowIndex, column: ColumnIndex) -> Vec<RowIndex>;
}

/// Operations the notification core requires from the storage engine.
///
/// `Payload` is the engine's opaque handover representation; the core only
/// ever moves it inside a [`HandoverPacket`] and never inspects it.
pub trait QueryEngine: Send + Sync + 'static {
    type Snapshot: SnapshotAccess;
    type Query: Send + 'static;
    type View: Send + 'static;
    type Payload: Send + 'static;

    /// Export a compiled query into a version-bound packet. The query is
    /// consumed; it is only valid on the snapshot it was compiled against.
    fn export_query(
        &self,
        snapshot: &Self::Snapshot,
        query: Self::Query,
    ) -> Result<HandoverPacket<Self::Payload>>;

    /// Reattach an exported query on the destination snapshot.
    ///
    /// Must fail with [`strata_error::NotifyError::HandoverVersionMismatch`]
    /// when the snapshot is older than the packet.
    fn import_query(
        &self,
        snapshot: &Self::Snapshot,
        packet: HandoverPacket<Self::Payload>,
    ) -> Result<Self::Query>;

    /// Export a materialized view into a version-bound packet.
    fn export_view(
        &self,
        snapshot: &Self::Snapshot,
        view: Self::View,
    ) -> Result<HandoverPacket<Self::Payload>>;

    /// Reconstitute an exported view on the destination snapshot. Same
    /// version rule as [`Self::import_query`].
    fn import_view(
        &self,
        snapshot: &Self::Snapshot,
        packet: HandoverPacket<Self::Payload>,
    ) -> Result<Self::View>;

    /// Run the query against the snapshot and materialize the result,
    /// applying the sort when present.
    fn execute(
        &self,
        snapshot: &Self::Snapshot,
        query: &Self::Query,
        sort: Option<&SortSpec>,
    ) -> Result<Self::View>;

    /// The row indices of a materialized view, in view order.
    fn view_rows(&self, snapshot: &Self::Snapshot, view: &Self::View) -> Vec<RowIndex>;

    /// The table the query matches rows in.
    fn root_table(&self, query: &Self::Query) -> TableIndex;
}
