//! Shared identifier and value types for the StrataDB live-query subsystem.
//!
//! Everything here is a small, copyable vocabulary type used across the
//! notification core and the storage-engine port: row/table/column
//! identifiers, snapshot versions, callback tokens, sort specifications,
//! and watched column paths.

use std::fmt;

/// Index of a row within its table.
///
/// Row indices are assigned by the storage engine and are stable between
/// commits except where a commit's change record reports a move. They are
/// *not* positions in a query result; see the notify crate's changeset
/// types for those.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct RowIndex(u64);

impl RowIndex {
    /// Create a row index from a raw u64.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RowIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RowIndex {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Index of a table within the database group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TableIndex(u32);

impl TableIndex {
    /// Create a table index from a raw u32.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The table index as a usize, for indexing per-table vectors.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordinal of a column within its table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ColumnIndex(u32);

impl ColumnIndex {
    /// Create a column ordinal from a raw u32.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ColumnIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone identifier of a database snapshot.
///
/// Produced by the storage engine; a larger value means a strictly newer
/// consistent read view. Handover packets are tagged with the version they
/// were exported against and can only be imported into a snapshot at the
/// same or a newer version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SnapshotVersion(u64);

impl SnapshotVersion {
    /// The version before any commit.
    pub const ZERO: Self = Self(0);

    /// Create a snapshot version from a raw u64.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Token identifying a registered notification callback.
///
/// Unique within one query's lifetime; never reused even after the
/// callback is removed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct CallbackToken(u64);

impl CallbackToken {
    /// Create a token from a raw u64.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload kind carried by a handover packet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum PacketKind {
    /// A compiled, executable query.
    Query,
    /// A materialized table view.
    View,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => f.write_str("query"),
            Self::View => f.write_str("view"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sort specification
// ---------------------------------------------------------------------------

/// One column of a sort specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SortColumn {
    pub column: ColumnIndex,
    pub ascending: bool,
}

/// Ordered list of (column, direction) pairs applied to a query result.
///
/// Columns earlier in the list take precedence; the materialized order is a
/// stable sort over the underlying row order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SortSpec {
    columns: Vec<SortColumn>,
}

impl SortSpec {
    /// Create a sort over the given columns.
    #[must_use]
    pub fn new(columns: Vec<SortColumn>) -> Self {
        Self { columns }
    }

    /// Sort ascending by a single column.
    #[must_use]
    pub fn ascending(column: ColumnIndex) -> Self {
        Self {
            columns: vec![SortColumn {
                column,
                ascending: true,
            }],
        }
    }

    /// Sort descending by a single column.
    #[must_use]
    pub fn descending(column: ColumnIndex) -> Self {
        Self {
            columns: vec![SortColumn {
                column,
                ascending: false,
            }],
        }
    }

    /// The sort columns in precedence order.
    #[inline]
    #[must_use]
    pub fn columns(&self) -> &[SortColumn] {
        &self.columns
    }

    /// Whether this spec sorts at all.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Watched column paths
// ---------------------------------------------------------------------------

/// A sequence of column ordinals through link / link-list columns, starting
/// at a query's root table.
///
/// A callback that watches a path is notified when a row reachable through
/// the path from one of its query's matching rows is modified. An empty
/// path set means "changes to the root table's matching rows only".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ColumnPath {
    columns: Vec<ColumnIndex>,
}

impl ColumnPath {
    /// Create a path from column ordinals, root-first.
    #[must_use]
    pub fn new(columns: Vec<ColumnIndex>) -> Self {
        Self { columns }
    }

    /// The column ordinals, root-first.
    #[inline]
    #[must_use]
    pub fn columns(&self) -> &[ColumnIndex] {
        &self.columns
    }

    /// Number of hops in the path.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the path has no hops.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl From<Vec<ColumnIndex>> for ColumnPath {
    fn from(columns: Vec<ColumnIndex>) -> Self {
        Self { columns }
    }
}

impl From<&[u32]> for ColumnPath {
    fn from(raw: &[u32]) -> Self {
        Self {
            columns: raw.iter().copied().map(ColumnIndex::new).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_index_roundtrip() {
        let r = RowIndex::new(42);
        assert_eq!(r.get(), 42);
        assert_eq!(r.to_string(), "42");
        assert_eq!(RowIndex::from(42), r);
    }

    #[test]
    fn snapshot_version_ordering() {
        assert!(SnapshotVersion::ZERO < SnapshotVersion::new(1));
        assert!(SnapshotVersion::new(7) < SnapshotVersion::new(8));
        assert_eq!(SnapshotVersion::new(3).to_string(), "v3");
    }

    #[test]
    fn packet_kind_display() {
        assert_eq!(PacketKind::Query.to_string(), "query");
        assert_eq!(PacketKind::View.to_string(), "view");
    }

    #[test]
    fn sort_spec_constructors() {
        let asc = SortSpec::ascending(ColumnIndex::new(2));
        assert_eq!(asc.columns().len(), 1);
        assert!(asc.columns()[0].ascending);

        let desc = SortSpec::descending(ColumnIndex::new(2));
        assert!(!desc.columns()[0].ascending);

        assert!(SortSpec::default().is_empty());
    }

    #[test]
    fn column_path_from_raw() {
        let path = ColumnPath::from(&[1u32, 0][..]);
        assert_eq!(path.len(), 2);
        assert_eq!(path.columns()[0], ColumnIndex::new(1));
        assert!(!path.is_empty());
        assert!(ColumnPath::default().is_empty());
    }
}
