//! Test harness for the live-query notification core.
//!
//! Provides an in-memory, versioned, multi-table store with integer,
//! link, and link-list columns; an engine implementation over it; and the
//! consumer-side scaffolding (delivery target, wake-counting coordinator,
//! change log) the end-to-end tests in `tests/` are written against.
//!
//! The store is honest about the contracts the core depends on: commits
//! produce real per-table change records, row removal uses move-last-over
//! so records carry moves, and handover payloads enforce the
//! snapshot-version rule.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use strata_error::{NotifyError, Result};
use strata_notify::{
    AsyncQuery, Change, ChangeRecordSet, ChangeSet, Coordinator, DeliveryTarget, HandoverPacket,
    NotifyConfig, QueryEngine, SnapshotAccess, run_background_cycle,
};
use strata_types::{ColumnIndex, PacketKind, RowIndex, SnapshotVersion, SortSpec, TableIndex};

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// One column of a mock table.
#[derive(Debug, Clone)]
enum MockColumn {
    Int(Vec<i64>),
    Link {
        target: TableIndex,
        cells: Vec<Option<RowIndex>>,
    },
    LinkList {
        target: TableIndex,
        cells: Vec<Vec<RowIndex>>,
    },
}

impl MockColumn {
    fn len(&self) -> usize {
        match self {
            Self::Int(cells) => cells.len(),
            Self::Link { cells, .. } => cells.len(),
            Self::LinkList { cells, .. } => cells.len(),
        }
    }
}

/// A mock table under construction or inside a snapshot.
#[derive(Debug, Clone, Default)]
pub struct MockTable {
    columns: Vec<MockColumn>,
}

impl MockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an integer column with the given initial cells.
    #[must_use]
    pub fn int(mut self, cells: Vec<i64>) -> Self {
        self.columns.push(MockColumn::Int(cells));
        self
    }

    /// Add a single-link column pointing into `target`.
    #[must_use]
    pub fn link(mut self, target: TableIndex, cells: Vec<Option<u64>>) -> Self {
        self.columns.push(MockColumn::Link {
            target,
            cells: cells.into_iter().map(|c| c.map(RowIndex::new)).collect(),
        });
        self
    }

    /// Add a link-list column pointing into `target`.
    #[must_use]
    pub fn link_list(mut self, target: TableIndex, cells: Vec<Vec<u64>>) -> Self {
        self.columns.push(MockColumn::LinkList {
            target,
            cells: cells
                .into_iter()
                .map(|list| list.into_iter().map(RowIndex::new).collect())
                .collect(),
        });
        self
    }

    fn row_count(&self) -> usize {
        self.columns.first().map_or(0, MockColumn::len)
    }
}

/// One cell value, for row insertion.
#[derive(Debug, Clone)]
pub enum MockValue {
    Int(i64),
    Link(Option<u64>),
    Links(Vec<u64>),
}

#[derive(Debug, Clone)]
struct StoreState {
    version: u64,
    tables: Vec<MockTable>,
}

/// A versioned in-memory store. Snapshots are cheap immutable clones.
pub struct MockStore {
    state: Mutex<StoreState>,
}

impl MockStore {
    #[must_use]
    pub fn new(tables: Vec<MockTable>) -> Self {
        Self {
            state: Mutex::new(StoreState { version: 1, tables }),
        }
    }

    /// A consistent read view of the current version.
    #[must_use]
    pub fn snapshot(&self) -> MockSnapshot {
        let state = self.state.lock();
        MockSnapshot {
            version: SnapshotVersion::new(state.version),
            tables: state.tables.clone(),
        }
    }

    /// Apply a mutation, bump the version, and return the commit's
    /// per-table change records.
    pub fn commit(&self, mutate: impl FnOnce(&mut MockTxn<'_>)) -> ChangeRecordSet {
        let mut state = self.state.lock();
        let mut txn = MockTxn {
            tables: &mut state.tables,
            records: ChangeRecordSet::new(),
        };
        mutate(&mut txn);
        let records = txn.records;
        state.version += 1;
        debug!(version = state.version, "mock store committed");
        records
    }

    /// A commit that changes nothing.
    pub fn touch(&self) -> ChangeRecordSet {
        self.commit(|_| {})
    }
}

/// Mutation surface inside [`MockStore::commit`].
///
/// Every edit records itself: value changes and inserted rows mark the
/// row modified, move-last-over removal records the filling row's move.
pub struct MockTxn<'a> {
    tables: &'a mut Vec<MockTable>,
    records: ChangeRecordSet,
}

impl MockTxn<'_> {
    /// Append a row. Values must match the table's columns in order.
    pub fn insert_row(&mut self, table: TableIndex, values: Vec<MockValue>) -> RowIndex {
        let t = &mut self.tables[table.as_usize()];
        assert_eq!(values.len(), t.columns.len(), "cell count mismatch");
        for (column, value) in t.columns.iter_mut().zip(values) {
            match (column, value) {
                (MockColumn::Int(cells), MockValue::Int(v)) => cells.push(v),
                (MockColumn::Link { cells, .. }, MockValue::Link(to)) => {
                    cells.push(to.map(RowIndex::new));
                }
                (MockColumn::LinkList { cells, .. }, MockValue::Links(to)) => {
                    cells.push(to.into_iter().map(RowIndex::new).collect());
                }
                _ => panic!("cell kind mismatch"),
            }
        }
        let row = RowIndex::new(t.row_count() as u64 - 1);
        self.records.record_mut(table).modified.insert(row);
        row
    }

    /// Overwrite an integer cell.
    pub fn set_int(&mut self, table: TableIndex, row: u64, column: u32, value: i64) {
        let t = &mut self.tables[table.as_usize()];
        match &mut t.columns[column as usize] {
            MockColumn::Int(cells) => cells[row as usize] = value,
            _ => panic!("not an integer column"),
        }
        self.records
            .record_mut(table)
            .modified
            .insert(RowIndex::new(row));
    }

    /// Overwrite a single-link cell.
    pub fn set_link(&mut self, table: TableIndex, row: u64, column: u32, to: Option<u64>) {
        let t = &mut self.tables[table.as_usize()];
        match &mut t.columns[column as usize] {
            MockColumn::Link { cells, .. } => cells[row as usize] = to.map(RowIndex::new),
            _ => panic!("not a link column"),
        }
        self.records
            .record_mut(table)
            .modified
            .insert(RowIndex::new(row));
    }

    /// Replace a link-list cell.
    pub fn set_links(&mut self, table: TableIndex, row: u64, column: u32, to: Vec<u64>) {
        let t = &mut self.tables[table.as_usize()];
        match &mut t.columns[column as usize] {
            MockColumn::LinkList { cells, .. } => {
                cells[row as usize] = to.into_iter().map(RowIndex::new).collect();
            }
            _ => panic!("not a link-list column"),
        }
        self.records
            .record_mut(table)
            .modified
            .insert(RowIndex::new(row));
    }

    /// Remove a row with move-last-over semantics: the last row fills the
    /// vacated slot and the change record gains the corresponding move.
    /// Links into the table are fixed up: references to the removed row
    /// are cleared (marking the referencing row modified), references to
    /// the moved row are retargeted.
    pub fn remove_row(&mut self, table: TableIndex, row: u64) {
        let last = {
            let t = &self.tables[table.as_usize()];
            assert!((row as usize) < t.row_count(), "row out of range");
            t.row_count() as u64 - 1
        };

        self.fix_incoming_links(table, RowIndex::new(row), RowIndex::new(last));

        let t = &mut self.tables[table.as_usize()];
        for column in &mut t.columns {
            match column {
                MockColumn::Int(cells) => {
                    cells.swap_remove(row as usize);
                }
                MockColumn::Link { cells, .. } => {
                    cells.swap_remove(row as usize);
                }
                MockColumn::LinkList { cells, .. } => {
                    cells.swap_remove(row as usize);
                }
            }
        }

        let record = self.records.record_mut(table);
        if row == last {
            // Tail removal: no survivor takes the slot. The dead index
            // marks the table as changed without colliding with any live
            // row.
            record.modified.insert(RowIndex::new(row));
        } else {
            record.moves.insert(RowIndex::new(last), RowIndex::new(row));
        }
    }

    /// Clear links to `removed` and retarget links to `moved` across
    /// every table.
    fn fix_incoming_links(&mut self, target: TableIndex, removed: RowIndex, moved: RowIndex) {
        for (table_idx, t) in self.tables.iter_mut().enumerate() {
            let table = TableIndex::new(table_idx as u32);
            for column in &mut t.columns {
                match column {
                    MockColumn::Link {
                        target: link_target,
                        cells,
                    } if *link_target == target => {
                        for (row_idx, cell) in cells.iter_mut().enumerate() {
                            if *cell == Some(removed) {
                                *cell = None;
                                self.records
                                    .record_mut(table)
                                    .modified
                                    .insert(RowIndex::new(row_idx as u64));
                            } else if *cell == Some(moved) && moved != removed {
                                *cell = Some(removed);
                            }
                        }
                    }
                    MockColumn::LinkList {
                        target: link_target,
                        cells,
                    } if *link_target == target => {
                        for (row_idx, list) in cells.iter_mut().enumerate() {
                            let before = list.len();
                            list.retain(|&r| r != removed);
                            if list.len() != before {
                                self.records
                                    .record_mut(table)
                                    .modified
                                    .insert(RowIndex::new(row_idx as u64));
                            }
                            for r in list.iter_mut() {
                                if *r == moved && moved != removed {
                                    *r = removed;
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot & engine
// ---------------------------------------------------------------------------

/// An immutable view of the store at one version.
#[derive(Debug, Clone)]
pub struct MockSnapshot {
    version: SnapshotVersion,
    tables: Vec<MockTable>,
}

impl MockSnapshot {
    fn int_cells(&self, table: TableIndex, column: ColumnIndex) -> Result<&[i64]> {
        let t = self
            .tables
            .get(table.as_usize())
            .ok_or_else(|| NotifyError::query_failed(format!("no table {table}")))?;
        match t.columns.get(column.get() as usize) {
            Some(MockColumn::Int(cells)) => Ok(cells),
            Some(_) => Err(NotifyError::query_failed(format!(
                "column {column} of table {table} is not an integer column"
            ))),
            None => Err(NotifyError::query_failed(format!(
                "no column {column} in table {table}"
            ))),
        }
    }
}

impl SnapshotAccess for MockSnapshot {
    fn current_version(&self) -> SnapshotVersion {
        self.version
    }

    fn link_target(&self, table: TableIndex, column: ColumnIndex) -> Option<TableIndex> {
        match self
            .tables
            .get(table.as_usize())?
            .columns
            .get(column.get() as usize)?
        {
            MockColumn::Link { target, .. } | MockColumn::LinkList { target, .. } => Some(*target),
            MockColumn::Int(_) => None,
        }
    }

    fn linked_rows(&self, table: TableIndex, row: RowIndex, column: ColumnIndex) -> Vec<RowIndex> {
        let Some(t) = self.tables.get(table.as_usize()) else {
            return Vec::new();
        };
        match t.columns.get(column.get() as usize) {
            Some(MockColumn::Link { cells, .. }) => cells
                .get(row.get() as usize)
                .copied()
                .flatten()
                .into_iter()
                .collect(),
            Some(MockColumn::LinkList { cells, .. }) => {
                cells.get(row.get() as usize).cloned().unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }
}

/// A half-open integer range query: matches rows where `lo < value < hi`.
#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub table: TableIndex,
    pub column: ColumnIndex,
    pub lo: i64,
    pub hi: i64,
}

/// A materialized result: row indices in view order.
#[derive(Debug, Clone)]
pub struct MockView {
    rows: Vec<RowIndex>,
}

impl MockView {
    #[must_use]
    pub fn rows(&self) -> &[RowIndex] {
        &self.rows
    }
}

/// Opaque handover payload for the mock engine.
#[derive(Debug)]
pub enum MockPayload {
    Query(RangeQuery),
    View(Vec<RowIndex>),
}

/// Engine implementation over [`MockStore`] snapshots.
#[derive(Debug, Default)]
pub struct MockEngine;

impl MockEngine {
    fn check_version(snapshot: &MockSnapshot, packet: &HandoverPacket<MockPayload>) -> Result<()> {
        if snapshot.version < packet.version() {
            return Err(NotifyError::HandoverVersionMismatch {
                packet: packet.version(),
                snapshot: snapshot.version,
            });
        }
        Ok(())
    }
}

impl QueryEngine for MockEngine {
    type Snapshot = MockSnapshot;
    type Query = RangeQuery;
    type View = MockView;
    type Payload = MockPayload;

    fn export_query(
        &self,
        snapshot: &MockSnapshot,
        query: RangeQuery,
    ) -> Result<HandoverPacket<MockPayload>> {
        Ok(HandoverPacket::for_query(
            MockPayload::Query(query),
            snapshot.version,
        ))
    }

    fn import_query(
        &self,
        snapshot: &MockSnapshot,
        mut packet: HandoverPacket<MockPayload>,
    ) -> Result<RangeQuery> {
        Self::check_version(snapshot, &packet)?;
        match packet.take(PacketKind::Query)? {
            MockPayload::Query(query) => Ok(query),
            MockPayload::View(_) => Err(NotifyError::internal("query payload expected")),
        }
    }

    fn export_view(
        &self,
        snapshot: &MockSnapshot,
        view: MockView,
    ) -> Result<HandoverPacket<MockPayload>> {
        Ok(HandoverPacket::for_view(
            MockPayload::View(view.rows),
            snapshot.version,
        ))
    }

    fn import_view(
        &self,
        snapshot: &MockSnapshot,
        mut packet: HandoverPacket<MockPayload>,
    ) -> Result<MockView> {
        Self::check_version(snapshot, &packet)?;
        match packet.take(PacketKind::View)? {
            MockPayload::View(rows) => Ok(MockView { rows }),
            MockPayload::Query(_) => Err(NotifyError::internal("view payload expected")),
        }
    }

    fn execute(
        &self,
        snapshot: &MockSnapshot,
        query: &RangeQuery,
        sort: Option<&SortSpec>,
    ) -> Result<MockView> {
        let cells = snapshot.int_cells(query.table, query.column)?;
        let mut rows: Vec<RowIndex> = cells
            .iter()
            .enumerate()
            .filter(|(_, &value)| query.lo < value && value < query.hi)
            .map(|(row, _)| RowIndex::new(row as u64))
            .collect();

        if let Some(sort) = sort {
            let mut keyed: Vec<(Vec<i64>, RowIndex)> = Vec::with_capacity(rows.len());
            for row in rows {
                let mut key = Vec::with_capacity(sort.columns().len());
                for sc in sort.columns() {
                    let cells = snapshot.int_cells(query.table, sc.column)?;
                    key.push(cells[row.get() as usize]);
                }
                keyed.push((key, row));
            }
            let columns = sort.columns().to_vec();
            keyed.sort_by(|a, b| {
                for (idx, sc) in columns.iter().enumerate() {
                    let ord = a.0[idx].cmp(&b.0[idx]);
                    let ord = if sc.ascending { ord } else { ord.reverse() };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
            rows = keyed.into_iter().map(|(_, row)| row).collect();
        }

        Ok(MockView { rows })
    }

    fn view_rows(&self, _snapshot: &MockSnapshot, view: &MockView) -> Vec<RowIndex> {
        view.rows.clone()
    }

    fn root_table(&self, query: &RangeQuery) -> TableIndex {
        query.table
    }
}

// ---------------------------------------------------------------------------
// Consumer-side scaffolding
// ---------------------------------------------------------------------------

/// Delivery target standing in for a consumer's results handle.
pub struct ResultsTarget {
    wants_updates: AtomicBool,
    views: Mutex<Vec<Vec<RowIndex>>>,
}

impl ResultsTarget {
    #[must_use]
    pub fn new(wants_updates: bool) -> Arc<Self> {
        Arc::new(Self {
            wants_updates: AtomicBool::new(wants_updates),
            views: Mutex::new(Vec::new()),
        })
    }

    /// Flip whether the handle wants refreshes with no callbacks around.
    pub fn set_wants_updates(&self, wants: bool) {
        self.wants_updates.store(wants, Ordering::SeqCst);
    }

    /// Number of views delivered so far.
    #[must_use]
    pub fn delivery_count(&self) -> usize {
        self.views.lock().len()
    }

    /// Rows of the most recently delivered view.
    #[must_use]
    pub fn last_rows(&self) -> Vec<RowIndex> {
        self.views.lock().last().cloned().unwrap_or_default()
    }
}

impl DeliveryTarget<MockView> for ResultsTarget {
    fn wants_background_updates(&self) -> bool {
        self.wants_updates.load(Ordering::SeqCst)
    }

    fn set_view(&self, view: MockView) {
        self.views.lock().push(view.rows);
    }
}

/// Coordinator stub that counts wake-up requests.
#[derive(Debug, Default)]
pub struct WakeCounter {
    wakes: AtomicUsize,
}

impl WakeCounter {
    #[must_use]
    pub fn count(&self) -> usize {
        self.wakes.load(Ordering::SeqCst)
    }
}

impl Coordinator for WakeCounter {
    fn request_commit_notifications(&self) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records what callbacks observed, delivery by delivery.
#[derive(Debug, Default)]
pub struct ChangeLog {
    entries: Mutex<Vec<LogEntry>>,
}

/// One callback invocation.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub changes: Vec<Change>,
    pub error: Option<String>,
}

impl ChangeLog {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A callback function feeding this log.
    pub fn callback(
        self: &Arc<Self>,
    ) -> impl FnMut(&ChangeSet, Option<&NotifyError>) + Send + 'static {
        let log = Arc::clone(self);
        move |changes, error| {
            log.entries.lock().push(LogEntry {
                changes: changes.iter().copied().collect(),
                error: error.map(ToString::to_string),
            });
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    pub fn entry(&self, index: usize) -> LogEntry {
        self.entries.lock()[index].clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<LogEntry> {
        self.entries.lock().last().cloned()
    }
}

/// A live query wired to a mock store: everything the end-to-end tests
/// need in one bundle.
pub struct LiveQuery {
    pub store: Arc<MockStore>,
    pub engine: Arc<MockEngine>,
    pub coordinator: Arc<WakeCounter>,
    pub target: Arc<ResultsTarget>,
    pub query: Arc<AsyncQuery<MockEngine>>,
}

impl LiveQuery {
    /// Register a live query on the store with default tunables.
    pub fn spawn(
        store: Arc<MockStore>,
        query: RangeQuery,
        sort: Option<SortSpec>,
    ) -> Result<Self> {
        Self::spawn_with_config(store, query, sort, NotifyConfig::default())
    }

    /// Register a live query with explicit tunables.
    pub fn spawn_with_config(
        store: Arc<MockStore>,
        query: RangeQuery,
        sort: Option<SortSpec>,
        config: NotifyConfig,
    ) -> Result<Self> {
        let engine = Arc::new(MockEngine);
        let coordinator = Arc::new(WakeCounter::default());
        let target = ResultsTarget::new(true);
        let weak = Arc::downgrade(&target) as Weak<dyn DeliveryTarget<MockView>>;
        let snapshot = store.snapshot();
        let query = Arc::new(AsyncQuery::new(
            engine.clone(),
            coordinator.clone() as Arc<dyn Coordinator>,
            weak,
            &snapshot,
            query,
            sort,
            config,
        )?);
        Ok(Self {
            store,
            engine,
            coordinator,
            target,
            query,
        })
    }

    /// Run one background cycle against the store's current version.
    pub fn cycle(&self, records: &ChangeRecordSet) {
        let snapshot = self.store.snapshot();
        run_background_cycle(&[self.query.clone()], &snapshot, records);
    }

    /// Deliver on the current thread and fire callbacks. Returns whether
    /// the delivery was accepted with callbacks to run.
    pub fn deliver(&self) -> bool {
        let snapshot = self.store.snapshot();
        let fire = self.query.deliver(&snapshot, None);
        if fire {
            self.query.call_callbacks();
        }
        fire
    }

    /// Commit, run the background cycle, deliver, and fire callbacks.
    pub fn commit_and_notify(&self, mutate: impl FnOnce(&mut MockTxn<'_>)) -> bool {
        let records = self.store.commit(mutate);
        self.cycle(&records);
        self.deliver()
    }
}
