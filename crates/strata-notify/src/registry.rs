//! Callback registry for one live query.
//!
//! An ordered collection of callback entries, each with a token, the
//! column paths it watches, and the delivery version it last observed.
//! The registry supports add and remove from any thread while the
//! consumer thread walks it delivering notifications, including add and
//! remove from *inside* a callback.
//!
//! The non-obvious piece is the iteration cursor: removing an entry at or
//! before the cursor pulls the cursor back one slot so no later entry is
//! skipped, and a callback function is checked out of its entry while it
//! runs so the registry lock is never held across user code. A checked-out
//! function is restored only if its entry still exists, which is what
//! makes self-removal from inside the callback safe.

use strata_error::NotifyError;
use strata_types::{CallbackToken, ColumnPath};

use crate::changeset::ChangeSet;

/// Sentinel delivery version: "has never observed a delivery".
///
/// A fresh entry compares unequal to every real version, so its first
/// delivery always fires.
pub const DELIVERY_NONE: u64 = u64::MAX;

/// Type-erased notification callback.
///
/// Receives the accumulated changeset and the latched error, if any.
/// Move-only; invoked on the consumer thread exclusively.
pub type ChangeCallback = Box<dyn FnMut(&ChangeSet, Option<&NotifyError>) + Send>;

struct CallbackEntry {
    token: CallbackToken,
    /// `None` while the function is checked out for invocation, or after
    /// the entry was removed mid-invocation.
    function: Option<ChangeCallback>,
    watched_paths: Vec<ColumnPath>,
    delivered_version: u64,
}

/// Ordered, reentrancy-safe collection of callback entries.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Vec<CallbackEntry>,
    /// Next entry index to examine, or `None` when no iteration is in
    /// progress.
    cursor: Option<usize>,
    /// High-water mark for token allocation. Never decreases, so tokens
    /// are unique across the registry's whole lifetime even after the
    /// highest entry is removed.
    next_token: u64,
}

impl CallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Tokens allocate strictly increasing.
    pub fn add(&mut self, watched_paths: Vec<ColumnPath>, function: ChangeCallback) -> CallbackToken {
        let token = CallbackToken::new(self.next_token);
        self.next_token += 1;
        self.entries.push(CallbackEntry {
            token,
            function: Some(function),
            watched_paths,
            delivered_version: DELIVERY_NONE,
        });
        token
    }

    /// Remove a callback in place. Returns whether the token was found.
    ///
    /// When an iteration is in progress and the removed entry sits before
    /// the cursor, the cursor is pulled back so the entries behind the
    /// removed one are not skipped. Once this returns, the callback will
    /// never be invoked again.
    pub fn remove(&mut self, token: CallbackToken) -> bool {
        let Some(index) = self.entries.iter().position(|entry| entry.token == token) else {
            return false;
        };
        self.entries.remove(index);
        if let Some(cursor) = self.cursor.as_mut() {
            if index < *cursor {
                *cursor -= 1;
            }
        }
        true
    }

    /// Whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether a delivery iteration is currently in progress.
    #[must_use]
    pub fn is_iterating(&self) -> bool {
        self.cursor.is_some()
    }

    /// The union of all entries' watched paths.
    #[must_use]
    pub fn watched_paths(&self) -> Vec<ColumnPath> {
        let mut paths: Vec<ColumnPath> = Vec::new();
        for entry in &self.entries {
            for path in &entry.watched_paths {
                if !paths.contains(path) {
                    paths.push(path.clone());
                }
            }
        }
        paths
    }

    /// Check out the next callback that has not yet observed
    /// `current_version` (or any callback at all when `error` is set),
    /// marking it as having observed the version in the same step.
    ///
    /// Returns `None` when the iteration is exhausted, resetting the
    /// cursor. The returned function must be handed back through
    /// [`Self::restore`] after invocation.
    pub fn next_pending(
        &mut self,
        current_version: u64,
        error: bool,
    ) -> Option<(CallbackToken, ChangeCallback)> {
        let mut index = self.cursor.unwrap_or(0);
        while index < self.entries.len() {
            let entry = &mut self.entries[index];
            let pending = error || entry.delivered_version != current_version;
            if pending && entry.function.is_some() {
                entry.delivered_version = current_version;
                let token = entry.token;
                let function = entry.function.take();
                self.cursor = Some(index + 1);
                return function.map(|f| (token, f));
            }
            index += 1;
        }
        self.cursor = None;
        None
    }

    /// Return a checked-out function to its entry. Dropped silently when
    /// the entry was removed while the function ran.
    pub fn restore(&mut self, token: CallbackToken, function: ChangeCallback) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.token == token) {
            if entry.function.is_none() {
                entry.function = Some(function);
            }
        }
    }

    /// Drop every entry and any in-progress cursor.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = None;
    }
}
