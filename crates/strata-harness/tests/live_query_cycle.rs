//! End-to-end lifecycle tests: commit → background cycle → delivery →
//! callbacks, against a single-table store.

use std::sync::Arc;
use std::thread;

use strata_harness::{ChangeLog, LiveQuery, MockStore, MockTable, MockValue, RangeQuery};
use strata_notify::{Change, ChangeRecordSet};
use strata_types::{ColumnIndex, RowIndex, SortSpec, TableIndex};

const T0: TableIndex = TableIndex::new(0);

fn rows(raw: &[u64]) -> Vec<RowIndex> {
    raw.iter().copied().map(RowIndex::new).collect()
}

/// One table, one integer column holding `values`.
fn store(values: &[i64]) -> Arc<MockStore> {
    Arc::new(MockStore::new(vec![MockTable::new().int(values.to_vec())]))
}

/// `0 < value < 5` over the store's only table.
fn narrow_query() -> RangeQuery {
    RangeQuery {
        table: T0,
        column: ColumnIndex::new(0),
        lo: 0,
        hi: 5,
    }
}

/// Spawn, attach a logging callback, and run the initial cycle through
/// its first delivery.
fn booted(values: &[i64], sort: Option<SortSpec>) -> (LiveQuery, Arc<ChangeLog>) {
    let lq = LiveQuery::spawn(store(values), narrow_query(), sort).unwrap();
    let log = ChangeLog::new();
    lq.query.add_callback(Vec::new(), log.callback());
    lq.cycle(&ChangeRecordSet::new());
    assert!(lq.deliver());
    (lq, log)
}

#[test]
fn initial_delivery_carries_empty_changeset() {
    let (lq, log) = booted(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], None);

    assert_eq!(lq.target.delivery_count(), 1);
    assert_eq!(lq.target.last_rows(), rows(&[1, 2, 3, 4]));
    assert_eq!(log.len(), 1);
    assert!(log.entry(0).changes.is_empty());
    assert!(log.entry(0).error.is_none());
    // Registering the callback asked the coordinator for commit
    // notifications.
    assert!(lq.coordinator.count() >= 1);
}

#[test]
fn insert_matching_row_reports_one_insertion() {
    let (lq, log) = booted(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], None);

    assert!(lq.commit_and_notify(|txn| {
        txn.insert_row(T0, vec![MockValue::Int(3)]);
    }));

    assert_eq!(log.len(), 2);
    assert_eq!(log.entry(1).changes, vec![Change::insertion(4)]);
    assert_eq!(lq.target.last_rows(), rows(&[1, 2, 3, 4, 10]));
}

#[test]
fn insert_non_matching_row_fires_no_callback() {
    let (lq, log) = booted(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], None);

    lq.commit_and_notify(|txn| {
        txn.insert_row(T0, vec![MockValue::Int(10)]);
    });

    assert_eq!(log.len(), 1);
    assert_eq!(lq.target.delivery_count(), 1);
}

#[test]
fn modification_out_of_match_set_reports_deletion() {
    let (lq, log) = booted(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], None);

    assert!(lq.commit_and_notify(|txn| {
        txn.set_int(T0, 3, 0, 5);
    }));

    assert_eq!(log.len(), 2);
    assert_eq!(log.entry(1).changes, vec![Change::deletion(2)]);
    assert_eq!(lq.target.last_rows(), rows(&[1, 2, 4]));
}

#[test]
fn modification_within_match_set_reports_in_place_change() {
    let (lq, log) = booted(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], None);

    assert!(lq.commit_and_notify(|txn| {
        txn.set_int(T0, 3, 0, 4);
    }));

    assert_eq!(log.len(), 2);
    assert_eq!(log.entry(1).changes, vec![Change::modification(2)]);
    // Same rows, same order; only the contents changed.
    assert_eq!(lq.target.last_rows(), rows(&[1, 2, 3, 4]));
}

#[test]
fn unsorted_delete_shifts_positions_as_moves() {
    // Removing row 0 (value 0, not in the match set) moves the last row
    // (value 4, matching) into its slot, reshuffling the unsorted view.
    let (lq, log) = booted(&[0, 1, 2, 3, 4], None);
    assert_eq!(lq.target.last_rows(), rows(&[1, 2, 3, 4]));

    assert!(lq.commit_and_notify(|txn| {
        txn.remove_row(T0, 0);
    }));

    assert_eq!(log.len(), 2);
    assert_eq!(
        log.entry(1).changes,
        vec![
            Change::moved(3, 0),
            Change::moved(0, 1),
            Change::moved(1, 2),
            Change::moved(2, 3),
        ]
    );
    assert_eq!(lq.target.last_rows(), rows(&[0, 1, 2, 3]));
}

#[test]
fn sorted_view_absorbs_the_same_delete() {
    // Same commit as above, but the view is sorted by value descending:
    // the sort removes the positional dependence on underlying row order,
    // so nothing changes and no callback fires.
    let sort = SortSpec::descending(ColumnIndex::new(0));
    let (lq, log) = booted(&[0, 1, 2, 3, 4], Some(sort));
    assert_eq!(lq.target.last_rows(), rows(&[4, 3, 2, 1]));

    lq.commit_and_notify(|txn| {
        txn.remove_row(T0, 0);
    });

    assert_eq!(log.len(), 1);
    assert_eq!(lq.target.delivery_count(), 1);
}

#[test]
fn starved_cycles_compose_moves_across_commits() {
    let (lq, log) = booted(&[0, 1, 2, 3, 4], None);
    assert_eq!(lq.target.last_rows(), rows(&[1, 2, 3, 4]));

    // Two starved cycles: a move-last-over delete reshuffles the rows,
    // then a separate commit modifies a survivor without mentioning the
    // move. The delivered changeset diffs against the pre-delete base,
    // so the first commit's move map must still line identities up;
    // losing it would misread the moved row as a delete plus an insert.
    let records = lq.store.commit(|txn| {
        txn.remove_row(T0, 0);
    });
    lq.cycle(&records);
    let records = lq.store.commit(|txn| {
        txn.set_int(T0, 1, 0, 2);
    });
    lq.cycle(&records);

    assert!(lq.deliver());
    assert_eq!(lq.target.delivery_count(), 2);
    assert_eq!(lq.target.last_rows(), rows(&[0, 1, 2, 3]));

    assert_eq!(log.len(), 2);
    let changes = log.entry(1).changes;
    assert!(changes.iter().all(Change::is_move));
    assert_eq!(
        changes,
        vec![
            Change::moved(3, 0),
            Change::moved(0, 1),
            Change::moved(1, 2),
            Change::moved(2, 3),
        ]
    );
}

#[test]
fn no_listeners_means_no_background_work() {
    let lq = LiveQuery::spawn(store(&[1, 2, 3]), narrow_query(), None).unwrap();
    lq.target.set_wants_updates(false);

    lq.cycle(&ChangeRecordSet::new());
    // The query never ran, so there is nothing to deliver.
    assert!(!lq.deliver());
    assert_eq!(lq.target.delivery_count(), 0);

    // Re-enabling background updates makes the next cycle materialize,
    // even with no callbacks registered.
    lq.target.set_wants_updates(true);
    let records = lq.store.touch();
    lq.cycle(&records);
    assert!(!lq.deliver()); // no callbacks to fire...
    assert_eq!(lq.target.delivery_count(), 1); // ...but the view arrived
}

#[test]
fn callback_added_between_deliveries_gets_an_initial_firing() {
    let (lq, first) = booted(&[0, 1, 2, 3, 4], None);

    let late = ChangeLog::new();
    lq.query.add_callback(Vec::new(), late.callback());

    // A commit this query cannot see: the run short-circuits, yet the
    // fresh callback still receives its initial (empty) notification.
    let records = lq.store.touch();
    lq.cycle(&records);
    assert!(lq.deliver());

    assert_eq!(late.len(), 1);
    assert!(late.entry(0).changes.is_empty());
    // The older callback saw this delivered version already.
    assert_eq!(first.len(), 1);
}

#[test]
fn stale_consumer_snapshot_defers_delivery() {
    let lq = LiveQuery::spawn(store(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]), narrow_query(), None).unwrap();
    let log = ChangeLog::new();
    lq.query.add_callback(Vec::new(), log.callback());

    // Initial cycle at version 1, then a commit the worker has not seen.
    lq.cycle(&ChangeRecordSet::new());
    let records = lq.store.commit(|txn| {
        txn.insert_row(T0, vec![MockValue::Int(3)]);
    });

    // Consumer is at version 2, handover at version 1: skip.
    assert!(!lq.deliver());
    assert_eq!(lq.target.delivery_count(), 0);
    assert!(log.is_empty());

    // The worker catches up; the realigned delivery carries everything
    // as insertions relative to the never-delivered state.
    lq.cycle(&records);
    assert!(lq.deliver());
    assert_eq!(lq.target.last_rows(), rows(&[1, 2, 3, 4, 10]));
    assert_eq!(log.len(), 1);
    assert_eq!(log.entry(0).changes.len(), 5);
    assert!(log.entry(0).changes.iter().all(Change::is_insertion));
}

#[test]
fn delivery_on_foreign_thread_is_rejected() {
    let (lq, log) = booted(&[0, 1, 2, 3, 4], None);
    let lq = Arc::new(lq);

    let records = lq.store.commit(|txn| {
        txn.set_int(T0, 2, 0, 3);
    });
    lq.cycle(&records);

    let remote = lq.clone();
    let delivered = thread::spawn(move || remote.deliver()).join().unwrap();
    assert!(!delivered);
    assert_eq!(log.len(), 1);

    // The registered consumer thread picks it up instead.
    assert!(lq.deliver());
    assert_eq!(log.len(), 2);
}

#[test]
fn unregister_stops_deliveries_and_allows_release() {
    let (lq, log) = booted(&[0, 1, 2, 3, 4], None);

    let records = lq.store.commit(|txn| {
        txn.set_int(T0, 2, 0, 3);
    });
    lq.cycle(&records);

    lq.query.unregister();
    assert!(!lq.query.is_alive());
    assert!(!lq.deliver());
    assert_eq!(log.len(), 1);

    lq.query.unregister(); // idempotent
    lq.query.release_query();
}

#[test]
fn delivered_version_is_monotone_across_commits() {
    let (lq, _log) = booted(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9], None);

    let mut last = lq.query.delivered_version();
    for value in [3, 1, 4, 12] {
        lq.commit_and_notify(|txn| {
            txn.insert_row(T0, vec![MockValue::Int(value)]);
        });
        let version = lq.query.delivered_version();
        assert!(version >= last);
        last = version;
    }
}
