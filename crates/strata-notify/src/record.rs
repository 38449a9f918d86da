//! Per-table records of row-level edits in a committed transaction.
//!
//! The coordinator builds one [`ChangeRecord`] per table touched by a
//! commit and hands the full [`ChangeRecordSet`] to every live query's
//! background run. The diff engine uses the records twice: to line up
//! pre-commit row identities with post-commit ones (`moves`) and to test
//! whether a surviving row's contents changed (`modified`).

use std::collections::{HashMap, HashSet};

use strata_types::{RowIndex, TableIndex};

/// Row-level edits one commit made to one table.
#[derive(Debug, Clone, Default)]
pub struct ChangeRecord {
    /// Rows whose contents changed.
    pub modified: HashSet<RowIndex>,
    /// Old index → new index for rows that shifted position.
    pub moves: HashMap<RowIndex, RowIndex>,
}

impl ChangeRecord {
    /// A record with no edits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the commit left this table untouched.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.moves.is_empty()
    }

    /// Map a pre-commit row index to its post-commit identity. Rows that
    /// did not move map to themselves.
    #[inline]
    #[must_use]
    pub fn resolve_moved(&self, row: RowIndex) -> RowIndex {
        self.moves.get(&row).copied().unwrap_or(row)
    }

    /// Whether the row's contents changed, after move resolution.
    #[inline]
    #[must_use]
    pub fn did_modify(&self, row: RowIndex) -> bool {
        self.modified.contains(&self.resolve_moved(row))
    }

    /// Fold a later commit's record into this one, so the result maps
    /// this record's pre-commit identities all the way into the newer
    /// commit's post-state.
    ///
    /// Moves compose (`old → mid` then `mid → new` becomes `old → new`)
    /// and modified rows are carried forward through the newer moves. A
    /// newer move whose source index was itself the image of an earlier
    /// move is already covered by the composition and is not added as a
    /// fresh entry.
    pub fn merge_newer(&mut self, newer: &ChangeRecord) {
        let mut moves = HashMap::with_capacity(self.moves.len() + newer.moves.len());
        for (&old, &mid) in &self.moves {
            moves.insert(old, newer.resolve_moved(mid));
        }
        for (&mid, &new) in &newer.moves {
            let already_composed = self.moves.values().any(|&image| image == mid);
            if !already_composed && !moves.contains_key(&mid) {
                moves.insert(mid, new);
            }
        }
        self.moves = moves;
        self.modified = self
            .modified
            .iter()
            .map(|&row| newer.resolve_moved(row))
            .chain(newer.modified.iter().copied())
            .collect();
    }
}

/// The change records of one commit, indexed by table.
#[derive(Debug, Clone, Default)]
pub struct ChangeRecordSet {
    records: Vec<ChangeRecord>,
}

impl ChangeRecordSet {
    /// An empty set (a commit that touched nothing).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The record for `table`, if the commit touched it.
    #[must_use]
    pub fn get(&self, table: TableIndex) -> Option<&ChangeRecord> {
        self.records
            .get(table.as_usize())
            .filter(|record| !record.is_empty())
    }

    /// Record edits for `table`, growing the set as needed. Merges into
    /// any record already present for the table.
    pub fn record_mut(&mut self, table: TableIndex) -> &mut ChangeRecord {
        let idx = table.as_usize();
        if idx >= self.records.len() {
            self.records.resize_with(idx + 1, ChangeRecord::default);
        }
        &mut self.records[idx]
    }

    /// Whether no table has any edits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.iter().all(ChangeRecord::is_empty)
    }

    /// Fold a later commit's records into this set, table by table.
    #[allow(clippy::cast_possible_truncation)]
    pub fn merge_newer(&mut self, newer: &ChangeRecordSet) {
        for (idx, record) in newer.records.iter().enumerate() {
            if record.is_empty() {
                continue;
            }
            self.record_mut(TableIndex::new(idx as u32)).merge_newer(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(raw: u64) -> RowIndex {
        RowIndex::new(raw)
    }

    #[test]
    fn resolve_moved_maps_only_moved_rows() {
        let mut record = ChangeRecord::new();
        record.moves.insert(row(9), row(0));

        assert_eq!(record.resolve_moved(row(9)), row(0));
        assert_eq!(record.resolve_moved(row(3)), row(3));
    }

    #[test]
    fn did_modify_resolves_moves_first() {
        let mut record = ChangeRecord::new();
        record.moves.insert(row(5), row(1));
        record.modified.insert(row(1));

        // Row 5 moved to slot 1 and slot 1 is marked modified.
        assert!(record.did_modify(row(5)));
        assert!(record.did_modify(row(1)));
        assert!(!record.did_modify(row(2)));
    }

    #[test]
    fn merge_newer_composes_moves() {
        // Row 4 moved to slot 0, then the commit after that moved slot 0
        // on to slot 2: the folded record maps 4 straight to 2.
        let mut acc = ChangeRecord::new();
        acc.moves.insert(row(4), row(0));

        let mut newer = ChangeRecord::new();
        newer.moves.insert(row(0), row(2));

        acc.merge_newer(&newer);
        assert_eq!(acc.moves.len(), 1);
        assert_eq!(acc.resolve_moved(row(4)), row(2));
        // The intermediate index is covered by the composition and must
        // not resurface as a fresh move source.
        assert_eq!(acc.resolve_moved(row(0)), row(0));
    }

    #[test]
    fn merge_newer_carries_modified_rows_through_later_moves() {
        let mut acc = ChangeRecord::new();
        acc.modified.insert(row(0));

        let mut newer = ChangeRecord::new();
        newer.moves.insert(row(0), row(2));
        newer.modified.insert(row(5));

        acc.merge_newer(&newer);
        assert_eq!(acc.modified.len(), 2);
        assert!(acc.modified.contains(&row(2)));
        assert!(acc.modified.contains(&row(5)));
        assert!(!acc.modified.contains(&row(0)));
    }

    #[test]
    fn merge_newer_unions_disjoint_edits() {
        let mut acc = ChangeRecord::new();
        acc.moves.insert(row(9), row(1));

        let mut newer = ChangeRecord::new();
        newer.modified.insert(row(5));

        acc.merge_newer(&newer);
        assert_eq!(acc.resolve_moved(row(9)), row(1));
        assert!(acc.did_modify(row(5)));
    }

    #[test]
    fn record_set_merge_newer_grows_and_folds_per_table() {
        let mut acc = ChangeRecordSet::new();
        acc.record_mut(TableIndex::new(0)).modified.insert(row(1));

        let mut newer = ChangeRecordSet::new();
        newer.record_mut(TableIndex::new(0)).modified.insert(row(2));
        newer
            .record_mut(TableIndex::new(3))
            .moves
            .insert(row(7), row(0));

        acc.merge_newer(&newer);
        let root = acc.get(TableIndex::new(0)).unwrap();
        assert!(root.modified.contains(&row(1)));
        assert!(root.modified.contains(&row(2)));
        let far = acc.get(TableIndex::new(3)).unwrap();
        assert_eq!(far.resolve_moved(row(7)), row(0));
    }

    #[test]
    fn record_set_skips_empty_records() {
        let mut set = ChangeRecordSet::new();
        assert!(set.is_empty());

        set.record_mut(TableIndex::new(2)).modified.insert(row(7));
        assert!(!set.is_empty());
        assert!(set.get(TableIndex::new(2)).is_some());
        // Tables 0 and 1 were grown as placeholders but hold no edits.
        assert!(set.get(TableIndex::new(0)).is_none());
        assert!(set.get(TableIndex::new(1)).is_none());
        // Beyond the vector entirely.
        assert!(set.get(TableIndex::new(9)).is_none());
    }
}
