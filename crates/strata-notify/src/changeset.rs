//! Positional changesets between two result materializations.
//!
//! A [`Change`] pairs a position in the previously delivered result with a
//! position in the fresh one. The sentinel [`POS_NONE`] marks absence on
//! either side: an insertion has no old position, a deletion no new one.
//! Equal non-sentinel positions mean the row was modified in place;
//! unequal ones mean it moved.

use std::slice;

/// Sentinel position meaning "not present on this side".
pub const POS_NONE: usize = usize::MAX;

/// One positional delta between two result materializations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Change {
    /// Position in the previous result, or [`POS_NONE`] for an insertion.
    pub old_pos: usize,
    /// Position in the new result, or [`POS_NONE`] for a deletion.
    pub new_pos: usize,
}

impl Change {
    /// A row that entered the result at `new_pos`.
    #[inline]
    #[must_use]
    pub const fn insertion(new_pos: usize) -> Self {
        Self {
            old_pos: POS_NONE,
            new_pos,
        }
    }

    /// A row that left the result from `old_pos`.
    #[inline]
    #[must_use]
    pub const fn deletion(old_pos: usize) -> Self {
        Self {
            old_pos,
            new_pos: POS_NONE,
        }
    }

    /// A row whose contents changed without moving.
    #[inline]
    #[must_use]
    pub const fn modification(pos: usize) -> Self {
        Self {
            old_pos: pos,
            new_pos: pos,
        }
    }

    /// A row that shifted from `old_pos` to `new_pos`.
    #[inline]
    #[must_use]
    pub const fn moved(old_pos: usize, new_pos: usize) -> Self {
        Self { old_pos, new_pos }
    }

    #[inline]
    #[must_use]
    pub const fn is_insertion(&self) -> bool {
        self.old_pos == POS_NONE
    }

    #[inline]
    #[must_use]
    pub const fn is_deletion(&self) -> bool {
        self.new_pos == POS_NONE
    }

    #[inline]
    #[must_use]
    pub const fn is_modification(&self) -> bool {
        self.old_pos != POS_NONE && self.old_pos == self.new_pos
    }

    #[inline]
    #[must_use]
    pub const fn is_move(&self) -> bool {
        self.old_pos != POS_NONE && self.new_pos != POS_NONE && self.old_pos != self.new_pos
    }
}

/// Ordered list of positional deltas, emitted in merge order by the diff
/// engine and delivered as-is to callbacks.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    /// An empty changeset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one change.
    #[inline]
    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// Number of changes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether there are no changes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// The changes in emission order.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[Change] {
        &self.changes
    }

    /// Iterate the changes in emission order.
    pub fn iter(&self) -> slice::Iter<'_, Change> {
        self.changes.iter()
    }

    /// Drop all changes.
    pub fn clear(&mut self) {
        self.changes.clear();
    }
}

impl From<Vec<Change>> for ChangeSet {
    fn from(changes: Vec<Change>) -> Self {
        Self { changes }
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}
