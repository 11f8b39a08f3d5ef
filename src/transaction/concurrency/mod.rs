pub mod lock_manager;
pub mod transaction;
pub mod transaction_manager;

pub use transaction::{
    AbortReason, IsolationLevel, TableHeap, TableWriteRecord, Transaction, TransactionAbort,
    TransactionState, TupleMeta, WriteType,
};
