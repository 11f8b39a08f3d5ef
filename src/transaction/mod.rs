pub mod concurrency;

pub use concurrency::{
    IsolationLevel, Transaction, TransactionAbort, TransactionState,
};
pub use concurrency::lock_manager::{LockError, LockManager, LockMode};
pub use concurrency::transaction_manager::TransactionManager;
