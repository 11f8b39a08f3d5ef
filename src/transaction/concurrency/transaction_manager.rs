use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use log::debug;
use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState, TupleMeta, WriteType,
};

/// Creates and tracks transactions and drives their commit/abort
/// transitions against the lock manager and the recorded write set.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Begin a new transaction in the GROWING state
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions
            .lock()
            .insert(txn_id, Arc::clone(&txn));
        txn
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    pub fn transaction_exists(&self, txn_id: TxnId) -> bool {
        self.active_transactions.lock().contains_key(&txn_id)
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }

    /// Commit: release every held lock, then transition to COMMITTED. The
    /// write set is discarded; the mutations stay.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        self.lock_manager.release_all_locks(txn);
        txn.take_write_set();
        txn.set_state(TransactionState::Committed);
        self.active_transactions.lock().remove(&txn.id());
        debug!("txn {} committed", txn.id());
    }

    /// Abort: walk the write set backwards undoing each mutation, then
    /// release every held lock and transition to ABORTED. Inserts are
    /// re-hidden, deletes re-surfaced, and updates restored from their
    /// before-image.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        let write_set = txn.take_write_set();
        for record in write_set.iter().rev() {
            match record.wtype {
                WriteType::Insert => {
                    record
                        .heap
                        .set_tuple_meta(record.rid, TupleMeta { is_deleted: true });
                }
                WriteType::Delete => {
                    record
                        .heap
                        .set_tuple_meta(record.rid, TupleMeta { is_deleted: false });
                }
                WriteType::Update => {
                    if let Some(old_tuple) = &record.old_tuple {
                        record.heap.restore_tuple(record.rid, old_tuple);
                    }
                }
            }
        }

        self.lock_manager.release_all_locks(txn);
        txn.set_state(TransactionState::Aborted);
        self.active_transactions.lock().remove(&txn.id());
        debug!("txn {} aborted", txn.id());
    }
}
