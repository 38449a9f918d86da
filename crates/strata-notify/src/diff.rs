//! Row-diff engine.
//!
//! Computes the ordered changeset between two materializations of the same
//! query: which rows entered, which left, which moved, and which were
//! modified in place. Both inputs are `(row, position)` pair sequences
//! sorted ascending by row index; the walk is a two-pointer merge with a
//! running shift that converts row-identity differences into positional
//! deltas.
//!
//! Modification detection optionally reaches through link and link-list
//! columns: a row counts as modified when one of the registered watched
//! paths leads from it to a row that a change record marks as modified.
//! Traversal depth is bounded to keep cyclic link graphs from recursing
//! forever.

use strata_types::{ColumnIndex, ColumnPath, RowIndex, TableIndex};

use crate::changeset::{Change, ChangeSet};
use crate::engine::SnapshotAccess;
use crate::record::ChangeRecordSet;

/// Default bound on watched-path traversal depth.
pub const DEFAULT_MAX_LINK_DEPTH: usize = 16;

/// A row identity paired with its position in a materialized result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowPosition {
    pub row: RowIndex,
    pub position: usize,
}

/// Build the diff input for one materialization: `(row, position)` pairs
/// sorted ascending by row index.
///
/// When a change record is supplied, each row index is first mapped
/// through the record's moves so that pre-commit identities line up with
/// post-commit ones. Positions always refer to the materialized order the
/// rows came in.
#[must_use]
pub fn sorted_row_positions(
    rows: &[RowIndex],
    record: Option<&crate::record::ChangeRecord>,
) -> Vec<RowPosition> {
    let mut pairs: Vec<RowPosition> = rows
        .iter()
        .enumerate()
        .map(|(position, &row)| RowPosition {
            row: record.map_or(row, |r| r.resolve_moved(row)),
            position,
        })
        .collect();
    pairs.sort_by_key(|pair| pair.row);
    pairs
}

/// Diff two sorted `(row, position)` sequences.
///
/// `is_modified` is consulted once per row that survives in both
/// materializations at an unchanged position; it receives the post-commit
/// row index.
pub fn diff_rows(
    old: &[RowPosition],
    new: &[RowPosition],
    mut is_modified: impl FnMut(RowIndex) -> bool,
) -> ChangeSet {
    let mut changes = ChangeSet::new();
    let mut i = 0;
    let mut j = 0;
    let mut shift: isize = 0;

    while i < old.len() && j < new.len() {
        let o = old[i];
        let n = new[j];
        if o.row == n.row {
            #[allow(clippy::cast_possible_wrap)]
            let shifted = n.position as isize + shift;
            if o.position as isize != shifted {
                // Sorted views can drive the shift heuristic negative; the
                // true new position is the fallback target.
                let target = usize::try_from(shifted).unwrap_or(n.position);
                changes.push(Change::moved(o.position, target));
            } else if is_modified(n.row) {
                changes.push(Change::modification(o.position));
            }
            i += 1;
            j += 1;
        } else if o.row < n.row {
            changes.push(Change::deletion(o.position));
            shift += 1;
            i += 1;
        } else {
            changes.push(Change::insertion(n.position));
            shift -= 1;
            j += 1;
        }
    }

    for o in &old[i..] {
        changes.push(Change::deletion(o.position));
    }
    for n in &new[j..] {
        changes.push(Change::insertion(n.position));
    }

    changes
}

/// Whether a root-table row changed, either directly or through one of the
/// watched column paths.
///
/// The root test resolves the row through the root table's moves before
/// consulting the modified set; each path hop does the same against its
/// own table's record. Hops past `max_depth` report "not modified".
pub fn row_did_change<S: SnapshotAccess>(
    snapshot: &S,
    records: &ChangeRecordSet,
    table: TableIndex,
    row: RowIndex,
    paths: &[ColumnPath],
    max_depth: usize,
) -> bool {
    if records.get(table).is_some_and(|record| record.did_modify(row)) {
        return true;
    }
    paths.iter().any(|path| {
        path_reaches_change(snapshot, records, table, row, path.columns(), 1, max_depth)
    })
}

fn path_reaches_change<S: SnapshotAccess>(
    snapshot: &S,
    records: &ChangeRecordSet,
    table: TableIndex,
    row: RowIndex,
    columns: &[ColumnIndex],
    depth: usize,
    max_depth: usize,
) -> bool {
    let Some((&column, rest)) = columns.split_first() else {
        return false;
    };
    if depth > max_depth {
        return false;
    }
    let Some(target) = snapshot.link_target(table, column) else {
        // Terminal payload column: a change here is a change to the row
        // itself, which the caller already tested.
        return false;
    };
    let record = records.get(target);
    for linked in snapshot.linked_rows(table, row, column) {
        let linked = record.map_or(linked, |r| r.resolve_moved(linked));
        if record.is_some_and(|r| r.modified.contains(&linked)) {
            return true;
        }
        if path_reaches_change(snapshot, records, target, linked, rest, depth + 1, max_depth) {
            return true;
        }
    }
    false
}

/// Short-circuit test: whether a commit's change records can possibly
/// affect a query rooted at `root` with the given watched paths.
///
/// Returns `false` only when the root table has no modified rows and no
/// moves, and no table reachable through a watched path has modified
/// rows. In that case re-running the query is provably unnecessary.
pub fn records_affect_query<S: SnapshotAccess>(
    snapshot: &S,
    records: &ChangeRecordSet,
    root: TableIndex,
    paths: &[ColumnPath],
    max_depth: usize,
) -> bool {
    if records.get(root).is_some() {
        return true;
    }
    paths
        .iter()
        .any(|path| path_table_touched(snapshot, records, root, path.columns(), 1, max_depth))
}

fn path_table_touched<S: SnapshotAccess>(
    snapshot: &S,
    records: &ChangeRecordSet,
    table: TableIndex,
    columns: &[ColumnIndex],
    depth: usize,
    max_depth: usize,
) -> bool {
    let Some((&column, rest)) = columns.split_first() else {
        return false;
    };
    if depth > max_depth {
        return false;
    }
    let Some(target) = snapshot.link_target(table, column) else {
        return false;
    };
    if records
        .get(target)
        .is_some_and(|record| !record.modified.is_empty())
    {
        return true;
    }
    path_table_touched(snapshot, records, target, rest, depth + 1, max_depth)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap, HashSet};

    use proptest::prelude::*;

    use super::*;
    use crate::record::ChangeRecord;

    fn rows(raw: &[u64]) -> Vec<RowIndex> {
        raw.iter().copied().map(RowIndex::new).collect()
    }

    fn diff_plain(old: &[u64], new: &[u64]) -> Vec<Change> {
        let old_pairs = sorted_row_positions(&rows(old), None);
        let new_pairs = sorted_row_positions(&rows(new), None);
        diff_rows(&old_pairs, &new_pairs, |_| false)
            .iter()
            .copied()
            .collect()
    }

    #[test]
    fn tail_insert() {
        assert_eq!(diff_plain(&[1, 2, 3], &[1, 2, 3, 10]), vec![Change::insertion(3)]);
    }

    #[test]
    fn middle_delete_shifts_without_moves() {
        // Row 2 leaves; rows after it keep their relative order, so the
        // shift absorbs the positional difference and only the deletion
        // is reported.
        assert_eq!(diff_plain(&[1, 2, 3, 4], &[1, 3, 4]), vec![Change::deletion(1)]);
    }

    #[test]
    fn insert_and_delete_together() {
        assert_eq!(
            diff_plain(&[1, 2, 3], &[0, 1, 3]),
            vec![Change::insertion(0), Change::deletion(1)]
        );
    }

    #[test]
    fn modification_in_place() {
        let old_pairs = sorted_row_positions(&rows(&[1, 2, 3]), None);
        let new_pairs = sorted_row_positions(&rows(&[1, 2, 3]), None);
        let changes = diff_rows(&old_pairs, &new_pairs, |row| row == RowIndex::new(2));
        assert_eq!(changes.as_slice(), &[Change::modification(1)]);
    }

    #[test]
    fn move_mapping_produces_position_moves() {
        // A move-last-over delete: row 4 fills slot 0. The old
        // materialization [1, 2, 3, 4] becomes [0, 1, 2, 3] with the old
        // row 4 now first.
        let mut record = ChangeRecord::new();
        record.moves.insert(RowIndex::new(4), RowIndex::new(0));

        let old_pairs = sorted_row_positions(&rows(&[1, 2, 3, 4]), Some(&record));
        let new_pairs = sorted_row_positions(&rows(&[0, 1, 2, 3]), None);
        let changes = diff_rows(&old_pairs, &new_pairs, |_| false);

        assert_eq!(
            changes.as_slice(),
            &[
                Change::moved(3, 0),
                Change::moved(0, 1),
                Change::moved(1, 2),
                Change::moved(2, 3),
            ]
        );
    }

    #[test]
    fn sorted_view_is_position_stable_under_moves() {
        // Same commit as above, but the view was sorted by a payload
        // column so the materialized order did not change: old positions
        // after move mapping equal the new ones and nothing is emitted.
        let mut record = ChangeRecord::new();
        record.moves.insert(RowIndex::new(4), RowIndex::new(0));

        let old_view = rows(&[4, 3, 2, 1]);
        let new_view = rows(&[0, 3, 2, 1]);
        let old_pairs = sorted_row_positions(&old_view, Some(&record));
        let new_pairs = sorted_row_positions(&new_view, None);
        let changes = diff_rows(&old_pairs, &new_pairs, |_| false);
        assert!(changes.is_empty());
    }

    #[test]
    fn disjoint_results_flush_both_tails() {
        assert_eq!(
            diff_plain(&[1, 2], &[5, 6]),
            vec![
                Change::deletion(0),
                Change::deletion(1),
                Change::insertion(0),
                Change::insertion(1),
            ]
        );
    }

    // -----------------------------------------------------------------
    // Link-path traversal
    // -----------------------------------------------------------------

    /// Minimal snapshot stub: a link-column topology plus per-cell links.
    #[derive(Default)]
    struct LinkGraph {
        targets: HashMap<(TableIndex, ColumnIndex), TableIndex>,
        cells: HashMap<(TableIndex, RowIndex, ColumnIndex), Vec<RowIndex>>,
    }

    impl LinkGraph {
        fn column(mut self, table: u32, column: u32, target: u32) -> Self {
            self.targets.insert(
                (TableIndex::new(table), ColumnIndex::new(column)),
                TableIndex::new(target),
            );
            self
        }

        fn link(mut self, table: u32, row: u64, column: u32, to: &[u64]) -> Self {
            self.cells.insert(
                (
                    TableIndex::new(table),
                    RowIndex::new(row),
                    ColumnIndex::new(column),
                ),
                to.iter().copied().map(RowIndex::new).collect(),
            );
            self
        }
    }

    impl SnapshotAccess for LinkGraph {
        fn current_version(&self) -> strata_types::SnapshotVersion {
            strata_types::SnapshotVersion::ZERO
        }

        fn link_target(&self, table: TableIndex, column: ColumnIndex) -> Option<TableIndex> {
            self.targets.get(&(table, column)).copied()
        }

        fn linked_rows(
            &self,
            table: TableIndex,
            row: RowIndex,
            column: ColumnIndex,
        ) -> Vec<RowIndex> {
            self.cells.get(&(table, row, column)).cloned().unwrap_or_default()
        }
    }

    fn modified_record(rows_modified: &[u64]) -> ChangeRecord {
        let mut record = ChangeRecord::new();
        record.modified = rows_modified.iter().copied().map(RowIndex::new).collect();
        record
    }

    #[test]
    fn watched_path_reaches_modified_child() {
        // Table 0 row 7 links to table 1 row 3 through column 2; the
        // commit modified that child row.
        let graph = LinkGraph::default().column(0, 2, 1).link(0, 7, 2, &[3]);
        let mut records = ChangeRecordSet::new();
        *records.record_mut(TableIndex::new(1)) = modified_record(&[3]);

        let paths = vec![ColumnPath::from(&[2u32, 0][..])];
        assert!(row_did_change(
            &graph,
            &records,
            TableIndex::new(0),
            RowIndex::new(7),
            &paths,
            DEFAULT_MAX_LINK_DEPTH,
        ));
        // A different parent row with no link to the child stays clean.
        assert!(!row_did_change(
            &graph,
            &records,
            TableIndex::new(0),
            RowIndex::new(8),
            &paths,
            DEFAULT_MAX_LINK_DEPTH,
        ));
    }

    #[test]
    fn link_list_fan_out_checks_every_target() {
        let graph = LinkGraph::default().column(0, 0, 1).link(0, 1, 0, &[4, 5, 6]);
        let mut records = ChangeRecordSet::new();
        *records.record_mut(TableIndex::new(1)) = modified_record(&[6]);

        let paths = vec![ColumnPath::from(&[0u32][..])];
        assert!(row_did_change(
            &graph,
            &records,
            TableIndex::new(0),
            RowIndex::new(1),
            &paths,
            DEFAULT_MAX_LINK_DEPTH,
        ));
    }

    #[test]
    fn moved_link_target_is_resolved_before_lookup() {
        // The child moved from row 9 to row 2 in the same commit that
        // modified it; the parent's link still names the old index.
        let graph = LinkGraph::default().column(0, 0, 1).link(0, 0, 0, &[9]);
        let mut records = ChangeRecordSet::new();
        let child = records.record_mut(TableIndex::new(1));
        child.moves.insert(RowIndex::new(9), RowIndex::new(2));
        child.modified.insert(RowIndex::new(2));

        let paths = vec![ColumnPath::from(&[0u32][..])];
        assert!(row_did_change(
            &graph,
            &records,
            TableIndex::new(0),
            RowIndex::new(0),
            &paths,
            DEFAULT_MAX_LINK_DEPTH,
        ));
    }

    #[test]
    fn traversal_depth_is_bounded() {
        // Self-link cycle on table 0: row 0 -> row 1 -> row 0 -> ...
        // Only a row 17 hops down a long watched path is modified; with
        // the default bound of 16 the traversal must give up first.
        let graph = LinkGraph::default()
            .column(0, 0, 0)
            .link(0, 0, 0, &[1])
            .link(0, 1, 0, &[0]);

        let deep_path = ColumnPath::new(vec![ColumnIndex::new(0); 20]);
        // With nothing modified the walk terminates despite the cycle.
        assert!(!row_did_change(
            &graph,
            &ChangeRecordSet::new(),
            TableIndex::new(0),
            RowIndex::new(0),
            &[deep_path],
            DEFAULT_MAX_LINK_DEPTH,
        ));

        // A bound of 2 stops before hop 3 can see a modified row.
        let chain = LinkGraph::default()
            .column(0, 0, 0)
            .link(0, 0, 0, &[1])
            .link(0, 1, 0, &[2])
            .link(0, 2, 0, &[3]);
        let mut deep_records = ChangeRecordSet::new();
        *deep_records.record_mut(TableIndex::new(0)) = modified_record(&[3]);
        let path = ColumnPath::new(vec![ColumnIndex::new(0); 3]);
        assert!(!row_did_change(
            &chain,
            &deep_records,
            TableIndex::new(0),
            RowIndex::new(0),
            &[path.clone()],
            2,
        ));
        // Raising the bound lets hop 3 reach the modified row.
        assert!(row_did_change(
            &chain,
            &deep_records,
            TableIndex::new(0),
            RowIndex::new(0),
            &[path],
            3,
        ));
    }

    #[test]
    fn short_circuit_sees_root_moves_and_linked_modifications() {
        let graph = LinkGraph::default().column(0, 1, 2);
        let paths = vec![ColumnPath::from(&[1u32][..])];

        // Nothing touched: skip.
        assert!(!records_affect_query(
            &graph,
            &ChangeRecordSet::new(),
            TableIndex::new(0),
            &paths,
            DEFAULT_MAX_LINK_DEPTH,
        ));

        // Root-table moves alone force a run.
        let mut moved = ChangeRecordSet::new();
        moved
            .record_mut(TableIndex::new(0))
            .moves
            .insert(RowIndex::new(4), RowIndex::new(0));
        assert!(records_affect_query(
            &graph,
            &moved,
            TableIndex::new(0),
            &paths,
            DEFAULT_MAX_LINK_DEPTH,
        ));

        // Modifications in the watched linked table force a run.
        let mut linked = ChangeRecordSet::new();
        *linked.record_mut(TableIndex::new(2)) = modified_record(&[0]);
        assert!(records_affect_query(
            &graph,
            &linked,
            TableIndex::new(0),
            &paths,
            DEFAULT_MAX_LINK_DEPTH,
        ));

        // Modifications in an unrelated table do not.
        let mut unrelated = ChangeRecordSet::new();
        *unrelated.record_mut(TableIndex::new(5)) = modified_record(&[0]);
        assert!(!records_affect_query(
            &graph,
            &unrelated,
            TableIndex::new(0),
            &paths,
            DEFAULT_MAX_LINK_DEPTH,
        ));
    }

    // -----------------------------------------------------------------
    // Diff round-trip property
    // -----------------------------------------------------------------

    proptest! {
        /// Applying an insert/delete/modify changeset to the old rows
        /// reproduces the new rows exactly.
        #[test]
        fn diff_roundtrip(
            old in prop::collection::btree_set(0u64..64, 0..14),
            new in prop::collection::btree_set(0u64..64, 0..14),
            touched in prop::collection::btree_set(0u64..64, 0..10),
        ) {
            let old_rows = rows(&old.iter().copied().collect::<Vec<_>>());
            let new_rows = rows(&new.iter().copied().collect::<Vec<_>>());
            let old_pairs = sorted_row_positions(&old_rows, None);
            let new_pairs = sorted_row_positions(&new_rows, None);
            let changes = diff_rows(&old_pairs, &new_pairs, |row| touched.contains(&row.get()));

            // No record moves and ascending materializations: the shift
            // heuristic fully absorbs positional drift, so no move
            // entries can appear.
            prop_assert!(changes.iter().all(|c| !c.is_move()));

            let deleted: HashSet<usize> =
                changes.iter().filter(|c| c.is_deletion()).map(|c| c.old_pos).collect();
            let inserted: HashSet<usize> =
                changes.iter().filter(|c| c.is_insertion()).map(|c| c.new_pos).collect();

            let mut survivors = old_rows
                .iter()
                .enumerate()
                .filter(|(pos, _)| !deleted.contains(pos))
                .map(|(_, &row)| row);
            let mut rebuilt = Vec::with_capacity(new_rows.len());
            for pos in 0..new_rows.len() {
                if inserted.contains(&pos) {
                    rebuilt.push(new_rows[pos]);
                } else {
                    let survivor = survivors.next();
                    prop_assert!(survivor.is_some());
                    rebuilt.push(survivor.unwrap());
                }
            }
            prop_assert!(survivors.next().is_none());
            prop_assert_eq!(rebuilt, new_rows);

            // Modifications fire exactly for surviving touched rows.
            let surviving_touched: BTreeSet<u64> = old
                .intersection(&new)
                .copied()
                .filter(|row| touched.contains(row))
                .collect();
            let reported: BTreeSet<u64> = changes
                .iter()
                .filter(|c| c.is_modification())
                .map(|c| old_rows[c.old_pos].get())
                .collect();
            prop_assert_eq!(reported, surviving_touched);
        }
    }
}
