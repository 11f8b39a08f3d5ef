use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::types::{Rid, TableOid, TxnId, INVALID_TXN_ID};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionAbort, TransactionState,
};

/// Hierarchical lock modes, table granularity plus S/X at row granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error(transparent)]
    Abort(#[from] TransactionAbort),

    #[error("transaction {0} is not active")]
    TransactionInactive(TxnId),
}

/// held x requested -> may they coexist?
fn compatible(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    match held {
        IntentionShared => !matches!(requested, Exclusive),
        IntentionExclusive => matches!(requested, IntentionShared | IntentionExclusive),
        Shared => matches!(requested, IntentionShared | Shared),
        SharedIntentionExclusive => matches!(requested, IntentionShared),
        Exclusive => false,
    }
}

/// current -> target: is this a legal upgrade?
fn can_upgrade(current: LockMode, target: LockMode) -> bool {
    use LockMode::*;
    match current {
        IntentionShared => matches!(
            target,
            Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
        ),
        Shared => matches!(target, Exclusive | SharedIntentionExclusive),
        IntentionExclusive => matches!(target, Exclusive | SharedIntentionExclusive),
        SharedIntentionExclusive => matches!(target, Exclusive),
        Exclusive => false,
    }
}

struct LockRequest {
    txn: Arc<Transaction>,
    lock_mode: LockMode,
    oid: TableOid,
    rid: Option<Rid>,
    granted: bool,
}

impl LockRequest {
    fn new(txn: Arc<Transaction>, lock_mode: LockMode, oid: TableOid, rid: Option<Rid>) -> Self {
        Self {
            txn,
            lock_mode,
            oid,
            rid,
            granted: false,
        }
    }

    fn txn_id(&self) -> TxnId {
        self.txn.id()
    }
}

struct QueueInner {
    requests: Vec<LockRequest>,
    upgrading: TxnId,
}

/// Per-target request queue: FIFO of requests, a condition variable for
/// waiters, and the id of the transaction currently upgrading (if any).
struct LockRequestQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                requests: Vec::new(),
                upgrading: INVALID_TXN_ID,
            }),
            cv: Condvar::new(),
        }
    }
}

/// Two-phase lock table over tables and rows. Requests queue per target and
/// block on the queue's condition variable until the grant rule admits
/// them or their transaction is aborted underneath them. Every invalid
/// request aborts the offending transaction and surfaces a structured
/// TransactionAbort.
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    detector_running: AtomicBool,
    detector_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            detector_running: AtomicBool::new(false),
            detector_handle: Mutex::new(None),
        }
    }

    /// Acquire a table lock, upgrading an already-held weaker mode when the
    /// upgrade matrix allows it. Blocks until granted.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<(), LockError> {
        Self::validate_table_request(txn, mode)?;

        let queue = {
            let mut map = self.table_lock_map.lock();
            Arc::clone(map.entry(oid).or_insert_with(|| Arc::new(LockRequestQueue::new())))
        };

        let mut inner = queue.inner.lock();

        let mut found_existing = false;
        if let Some(pos) = inner.requests.iter().position(|r| r.txn_id() == txn.id()) {
            if inner.requests[pos].lock_mode == mode {
                return Ok(());
            }
            if inner.upgrading != INVALID_TXN_ID {
                return Self::abort_txn(txn, AbortReason::UpgradeConflict);
            }
            if !can_upgrade(inner.requests[pos].lock_mode, mode) {
                return Self::abort_txn(txn, AbortReason::IncompatibleUpgrade);
            }

            // Drop the held lock and queue the upgrade ahead of newcomers
            inner.upgrading = txn.id();
            let old = inner.requests.remove(pos);
            txn.remove_table_lock(old.lock_mode, oid);
            let insert_at = inner
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(inner.requests.len());
            inner
                .requests
                .insert(insert_at, LockRequest::new(Arc::clone(txn), mode, oid, None));
            found_existing = true;
        }

        if !found_existing {
            inner
                .requests
                .push(LockRequest::new(Arc::clone(txn), mode, oid, None));
        }

        while !Self::try_grant(txn, mode, &mut inner) {
            queue.cv.wait(&mut inner);
        }

        if txn.state() == TransactionState::Aborted {
            queue.cv.notify_all();
            return Err(LockError::TransactionInactive(txn.id()));
        }

        txn.add_table_lock(mode, oid);
        Ok(())
    }

    /// Release a table lock. Every row lock on the table must already be
    /// gone, and the 2PL state transition follows the isolation level.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> Result<(), LockError> {
        if txn.has_rows_locked_on(oid) {
            return Self::abort_txn(txn, AbortReason::TableUnlockedBeforeUnlockingRows);
        }

        let queue = {
            let map = self.table_lock_map.lock();
            match map.get(&oid) {
                Some(queue) => Arc::clone(queue),
                None => return Self::abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld),
            }
        };

        let mut inner = queue.inner.lock();
        let pos = inner
            .requests
            .iter()
            .position(|r| r.txn_id() == txn.id() && r.granted);
        let pos = match pos {
            Some(pos) => pos,
            None => return Self::abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld),
        };

        let request = inner.requests.remove(pos);
        queue.cv.notify_all();
        drop(inner);

        Self::shrink_on_unlock(txn, request.lock_mode);
        txn.remove_table_lock(request.lock_mode, oid);
        Ok(())
    }

    /// Acquire a row lock (S or X only). A missing table lock is repaired
    /// by taking the matching intention lock first; when even that cannot
    /// be granted the transaction aborts.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), LockError> {
        if !matches!(mode, LockMode::Shared | LockMode::Exclusive) {
            return Self::abort_txn(txn, AbortReason::AttemptedIntentionLockOnRow);
        }
        Self::validate_row_request(txn, mode)?;
        self.ensure_table_lock_for_row(txn, mode, oid)?;

        let queue = {
            let mut map = self.row_lock_map.lock();
            Arc::clone(map.entry(rid).or_insert_with(|| Arc::new(LockRequestQueue::new())))
        };

        let mut inner = queue.inner.lock();

        let mut found_existing = false;
        if let Some(pos) = inner.requests.iter().position(|r| r.txn_id() == txn.id()) {
            if inner.requests[pos].lock_mode == mode {
                return Ok(());
            }
            if inner.upgrading != INVALID_TXN_ID {
                return Self::abort_txn(txn, AbortReason::UpgradeConflict);
            }
            if !can_upgrade(inner.requests[pos].lock_mode, mode) {
                return Self::abort_txn(txn, AbortReason::IncompatibleUpgrade);
            }

            inner.upgrading = txn.id();
            let old = inner.requests.remove(pos);
            txn.remove_row_lock(old.lock_mode, oid, rid);
            let insert_at = inner
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(inner.requests.len());
            inner.requests.insert(
                insert_at,
                LockRequest::new(Arc::clone(txn), mode, oid, Some(rid)),
            );
            found_existing = true;
        }

        if !found_existing {
            inner
                .requests
                .push(LockRequest::new(Arc::clone(txn), mode, oid, Some(rid)));
        }

        while !Self::try_grant(txn, mode, &mut inner) {
            queue.cv.wait(&mut inner);
        }

        if txn.state() == TransactionState::Aborted {
            queue.cv.notify_all();
            return Err(LockError::TransactionInactive(txn.id()));
        }

        txn.add_row_lock(mode, oid, rid);
        Ok(())
    }

    /// Release a row lock. `force` skips the 2PL state transition; it is
    /// used when commit/abort sweeps the remaining locks.
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
        force: bool,
    ) -> Result<(), LockError> {
        let queue = {
            let map = self.row_lock_map.lock();
            match map.get(&rid) {
                Some(queue) => Arc::clone(queue),
                None => return Self::abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld),
            }
        };

        let mut inner = queue.inner.lock();
        let pos = inner
            .requests
            .iter()
            .position(|r| r.txn_id() == txn.id() && r.granted);
        let pos = match pos {
            Some(pos) => pos,
            None => return Self::abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld),
        };

        let request = inner.requests.remove(pos);
        queue.cv.notify_all();
        drop(inner);

        if !force {
            Self::shrink_on_unlock(txn, request.lock_mode);
        }
        txn.remove_row_lock(request.lock_mode, oid, rid);
        Ok(())
    }

    /// Release everything a finished transaction still holds: rows first,
    /// then tables, notifying waiters along the way.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let (tables, rows) = txn.held_locks();
        for (_, oid, rid) in rows {
            let _ = self.unlock_row(txn, oid, rid, true);
        }
        for (_, oid) in tables {
            let _ = self.unlock_table(txn, oid);
        }
    }

    /// Grant rule, evaluated under the queue mutex. An aborted waiter's
    /// request is removed and the wait loop is released so the caller can
    /// observe the abort.
    fn try_grant(txn: &Arc<Transaction>, mode: LockMode, inner: &mut QueueInner) -> bool {
        if txn.state() == TransactionState::Aborted {
            inner.requests.retain(|r| r.txn_id() != txn.id());
            if inner.upgrading == txn.id() {
                inner.upgrading = INVALID_TXN_ID;
            }
            return true;
        }

        for r in &inner.requests {
            if r.granted && !compatible(r.lock_mode, mode) {
                return false;
            }
        }

        if inner.upgrading != INVALID_TXN_ID {
            if inner.upgrading != txn.id() {
                // A pending upgrade outranks every other waiter
                return false;
            }
            for r in inner.requests.iter_mut() {
                if r.txn_id() == txn.id() && !r.granted {
                    inner.upgrading = INVALID_TXN_ID;
                    r.granted = true;
                    return true;
                }
            }
            return false;
        }

        for r in inner.requests.iter_mut().filter(|r| !r.granted) {
            if r.txn_id() == txn.id() {
                r.granted = true;
                return true;
            }
            if !compatible(r.lock_mode, mode) {
                return false;
            }
        }
        false
    }

    /// Table 1: acquire validity by state and isolation level
    fn validate_table_request(txn: &Arc<Transaction>, mode: LockMode) -> Result<(), LockError> {
        use LockMode::*;
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                Err(LockError::TransactionInactive(txn.id()))
            }
            TransactionState::Growing => {
                if txn.isolation_level() == IsolationLevel::ReadUncommitted
                    && matches!(mode, Shared | IntentionShared | SharedIntentionExclusive)
                {
                    return Self::abort_txn(txn, AbortReason::LockSharedOnReadUncommitted);
                }
                Ok(())
            }
            TransactionState::Shrinking => match txn.isolation_level() {
                IsolationLevel::ReadCommitted if matches!(mode, Shared | IntentionShared) => Ok(()),
                _ => Self::abort_txn(txn, AbortReason::LockOnShrinking),
            },
        }
    }

    /// Row-mode variant of Table 1 (modes are already narrowed to S/X)
    fn validate_row_request(txn: &Arc<Transaction>, mode: LockMode) -> Result<(), LockError> {
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                Err(LockError::TransactionInactive(txn.id()))
            }
            TransactionState::Growing => {
                if txn.isolation_level() == IsolationLevel::ReadUncommitted
                    && mode == LockMode::Shared
                {
                    return Self::abort_txn(txn, AbortReason::LockSharedOnReadUncommitted);
                }
                Ok(())
            }
            TransactionState::Shrinking => match txn.isolation_level() {
                IsolationLevel::ReadCommitted if mode == LockMode::Shared => Ok(()),
                _ => Self::abort_txn(txn, AbortReason::LockOnShrinking),
            },
        }
    }

    /// Row locks require a table lock: any mode for S rows; IX, SIX or X
    /// for X rows. A missing one is taken automatically (IS/IX); if that
    /// fails the transaction aborts with TableLockNotPresent.
    fn ensure_table_lock_for_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<(), LockError> {
        let held = txn.table_lock_mode(oid);
        let (satisfied, wanted) = match mode {
            LockMode::Shared => (held.is_some(), LockMode::IntentionShared),
            _ => (
                matches!(
                    held,
                    Some(LockMode::IntentionExclusive)
                        | Some(LockMode::SharedIntentionExclusive)
                        | Some(LockMode::Exclusive)
                ),
                LockMode::IntentionExclusive,
            ),
        };
        if satisfied {
            return Ok(());
        }

        debug!(
            "txn {} auto-acquiring {:?} on table {} for a row lock",
            txn.id(),
            wanted,
            oid
        );
        self.lock_table(txn, wanted, oid).map_err(|_| {
            txn.set_state(TransactionState::Aborted);
            LockError::Abort(TransactionAbort {
                txn_id: txn.id(),
                reason: AbortReason::TableLockNotPresent,
            })
        })?;
        Ok(())
    }

    /// Table 2: unlock-driven state transitions. Only a growing
    /// transaction moves to SHRINKING.
    fn shrink_on_unlock(txn: &Arc<Transaction>, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrink {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn abort_txn(txn: &Arc<Transaction>, reason: AbortReason) -> Result<(), LockError> {
        txn.set_state(TransactionState::Aborted);
        debug!("aborting txn {}: {}", txn.id(), reason);
        Err(LockError::Abort(TransactionAbort {
            txn_id: txn.id(),
            reason,
        }))
    }

    // ---- deadlock detection -------------------------------------------

    /// One wait-for-graph pass: build waiter -> holder edges from the live
    /// queues, and abort the youngest transaction on each cycle found.
    /// Returns the victims.
    pub fn detect_and_resolve(&self) -> Vec<TxnId> {
        let mut victims = Vec::new();
        loop {
            let (edges, txns) = self.build_wait_for_graph();
            let cycle = match Self::find_cycle(&edges) {
                Some(cycle) => cycle,
                None => break,
            };

            // The youngest transaction (largest id) dies
            let victim = match cycle.iter().copied().max() {
                Some(victim) => victim,
                None => break,
            };
            info!("deadlock detected among {:?}, aborting txn {}", cycle, victim);
            if let Some(txn) = txns.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            victims.push(victim);
            self.notify_all_queues();
        }
        victims
    }

    /// Start the periodic background detector. The library never starts it
    /// implicitly.
    pub fn spawn_cycle_detection(self: &Arc<Self>, interval: Duration) {
        if self.detector_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            while manager.detector_running.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                manager.detect_and_resolve();
            }
        });
        *self.detector_handle.lock() = Some(handle);
    }

    /// Stop the background detector and join its thread
    pub fn shutdown_cycle_detection(&self) {
        self.detector_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector_handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn snapshot_queues(&self) -> Vec<Arc<LockRequestQueue>> {
        let mut queues: Vec<Arc<LockRequestQueue>> =
            self.table_lock_map.lock().values().cloned().collect();
        queues.extend(self.row_lock_map.lock().values().cloned());
        queues
    }

    #[allow(clippy::type_complexity)]
    fn build_wait_for_graph(
        &self,
    ) -> (HashMap<TxnId, Vec<TxnId>>, HashMap<TxnId, Arc<Transaction>>) {
        let mut edges: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
        let mut txns: HashMap<TxnId, Arc<Transaction>> = HashMap::new();

        for queue in self.snapshot_queues() {
            let inner = queue.inner.lock();
            let holders: Vec<TxnId> = inner
                .requests
                .iter()
                .filter(|r| r.granted)
                .map(|r| r.txn_id())
                .collect();
            for r in &inner.requests {
                txns.entry(r.txn_id()).or_insert_with(|| Arc::clone(&r.txn));
                // Aborted waiters are about to unwind; their edges are gone
                if r.granted || r.txn.state() == TransactionState::Aborted {
                    continue;
                }
                let out = edges.entry(r.txn_id()).or_default();
                for &holder in &holders {
                    if holder != r.txn_id() {
                        out.push(holder);
                    }
                }
            }
        }

        for out in edges.values_mut() {
            out.sort_unstable();
            out.dedup();
        }
        (edges, txns)
    }

    /// Deterministic DFS from the lowest transaction id; returns the first
    /// cycle's members.
    fn find_cycle(edges: &HashMap<TxnId, Vec<TxnId>>) -> Option<Vec<TxnId>> {
        let mut starts: Vec<TxnId> = edges.keys().copied().collect();
        starts.sort_unstable();

        let mut visited: std::collections::HashSet<TxnId> = std::collections::HashSet::new();
        for start in starts {
            if visited.contains(&start) {
                continue;
            }
            let mut path: Vec<TxnId> = Vec::new();
            if let Some(cycle) = Self::dfs(start, edges, &mut visited, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs(
        node: TxnId,
        edges: &HashMap<TxnId, Vec<TxnId>>,
        visited: &mut std::collections::HashSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> Option<Vec<TxnId>> {
        if let Some(at) = path.iter().position(|&t| t == node) {
            return Some(path[at..].to_vec());
        }
        if visited.contains(&node) {
            return None;
        }
        visited.insert(node);
        path.push(node);
        if let Some(next) = edges.get(&node) {
            for &n in next {
                if let Some(cycle) = Self::dfs(n, edges, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        None
    }

    fn notify_all_queues(&self) {
        for queue in self.snapshot_queues() {
            let _inner = queue.inner.lock();
            queue.cv.notify_all();
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.detector_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector_handle.lock().take() {
            let _ = handle.join();
        }
    }
}
