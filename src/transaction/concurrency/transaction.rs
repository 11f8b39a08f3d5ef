use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states plus the two terminal states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a transaction was aborted by the lock manager
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock requested in the shrinking phase")]
    LockOnShrinking,
    #[error("another upgrade is already in progress on this target")]
    UpgradeConflict,
    #[error("requested mode is not an upgrade of the held mode")]
    IncompatibleUpgrade,
    #[error("shared locks are not permitted under READ_UNCOMMITTED")]
    LockSharedOnReadUncommitted,
    #[error("intention locks cannot be taken on rows")]
    AttemptedIntentionLockOnRow,
    #[error("no qualifying table lock is held for the requested row lock")]
    TableLockNotPresent,
    #[error("table unlocked while rows on it are still locked")]
    TableUnlockedBeforeUnlockingRows,
    #[error("unlock requested but no lock is held")]
    AttemptedUnlockButNoLockHeld,
}

/// Structured abort: the transaction has already been moved to ABORTED when
/// this value is returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbort {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

/// Tuple visibility metadata kept by a table heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TupleMeta {
    pub is_deleted: bool,
}

/// Seam to the table heap the executors write through. Abort reversal only
/// needs visibility toggles and before-image restoration, so the heap
/// itself stays out of this crate.
pub trait TableHeap: Send + Sync {
    fn tuple_meta(&self, rid: Rid) -> TupleMeta;
    fn set_tuple_meta(&self, rid: Rid, meta: TupleMeta);
    fn restore_tuple(&self, rid: Rid, tuple: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Insert,
    Delete,
    Update,
}

/// One tuple mutation recorded for abort reversal. Updates carry the
/// before-image so they can be undone in place.
pub struct TableWriteRecord {
    pub rid: Rid,
    pub oid: TableOid,
    pub wtype: WriteType,
    pub heap: Arc<dyn TableHeap>,
    pub old_tuple: Option<Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct LockSets {
    pub shared_table: HashSet<TableOid>,
    pub exclusive_table: HashSet<TableOid>,
    pub intention_shared_table: HashSet<TableOid>,
    pub intention_exclusive_table: HashSet<TableOid>,
    pub shared_intention_exclusive_table: HashSet<TableOid>,
    pub shared_rows: HashMap<TableOid, HashSet<Rid>>,
    pub exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

impl LockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_table,
            LockMode::Exclusive => &mut self.exclusive_table,
            LockMode::IntentionShared => &mut self.intention_shared_table,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_table,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_table,
        }
    }
}

/// An active transaction: state machine, isolation level, the lock sets
/// mirroring its granted queue entries, and the write set for abort
/// reversal. Shared across threads behind an Arc; all interior state is
/// synchronized.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    lock_sets: Mutex<LockSets>,
    write_set: Mutex<Vec<TableWriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            lock_sets: Mutex::new(LockSets::default()),
            write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn add_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).remove(&oid);
    }

    pub(crate) fn add_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => return,
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => return,
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
            if set.is_empty() {
                rows.remove(&oid);
            }
        }
    }

    /// The table-lock mode held on an oid, if any
    pub fn table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        let sets = self.lock_sets.lock();
        if sets.exclusive_table.contains(&oid) {
            Some(LockMode::Exclusive)
        } else if sets.shared_intention_exclusive_table.contains(&oid) {
            Some(LockMode::SharedIntentionExclusive)
        } else if sets.intention_exclusive_table.contains(&oid) {
            Some(LockMode::IntentionExclusive)
        } else if sets.shared_table.contains(&oid) {
            Some(LockMode::Shared)
        } else if sets.intention_shared_table.contains(&oid) {
            Some(LockMode::IntentionShared)
        } else {
            None
        }
    }

    /// True when any row on the table is still locked by this transaction
    pub fn has_rows_locked_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).map_or(false, |s| !s.is_empty())
            || sets.exclusive_rows.get(&oid).map_or(false, |s| !s.is_empty())
    }

    /// Snapshot of every held lock, rows and tables separately, for release
    /// at commit/abort.
    pub(crate) fn held_locks(&self) -> (Vec<(LockMode, TableOid)>, Vec<(LockMode, TableOid, Rid)>) {
        let sets = self.lock_sets.lock();
        let mut tables = Vec::new();
        for &oid in &sets.intention_shared_table {
            tables.push((LockMode::IntentionShared, oid));
        }
        for &oid in &sets.intention_exclusive_table {
            tables.push((LockMode::IntentionExclusive, oid));
        }
        for &oid in &sets.shared_table {
            tables.push((LockMode::Shared, oid));
        }
        for &oid in &sets.shared_intention_exclusive_table {
            tables.push((LockMode::SharedIntentionExclusive, oid));
        }
        for &oid in &sets.exclusive_table {
            tables.push((LockMode::Exclusive, oid));
        }

        let mut rows = Vec::new();
        for (&oid, rids) in &sets.shared_rows {
            for &rid in rids {
                rows.push((LockMode::Shared, oid, rid));
            }
        }
        for (&oid, rids) in &sets.exclusive_rows {
            for &rid in rids {
                rows.push((LockMode::Exclusive, oid, rid));
            }
        }
        (tables, rows)
    }

    pub fn append_write_record(&self, record: TableWriteRecord) {
        self.write_set.lock().push(record);
    }

    pub(crate) fn take_write_set(&self) -> Vec<TableWriteRecord> {
        std::mem::take(&mut *self.write_set.lock())
    }
}
