use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stratadb::common::types::Rid;
use stratadb::transaction::concurrency::lock_manager::{LockError, LockManager, LockMode};
use stratadb::transaction::concurrency::{
    AbortReason, IsolationLevel, TransactionState,
};
use stratadb::transaction::TransactionManager;

const TABLE_A: u32 = 1;
const TABLE_B: u32 = 2;

fn setup() -> (Arc<LockManager>, TransactionManager) {
    let lock_manager = Arc::new(LockManager::new());
    let tm = TransactionManager::new(Arc::clone(&lock_manager));
    (lock_manager, tm)
}

fn abort_reason(err: LockError) -> AbortReason {
    match err {
        LockError::Abort(abort) => abort.reason,
        other => panic!("expected an abort, got {:?}", other),
    }
}

#[test]
fn test_shared_locks_coexist() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap();
    lm.lock_table(&t2, LockMode::Shared, TABLE_A).unwrap();

    assert_eq!(t1.table_lock_mode(TABLE_A), Some(LockMode::Shared));
    assert_eq!(t2.table_lock_mode(TABLE_A), Some(LockMode::Shared));
}

#[test]
fn test_exclusive_blocks_until_released() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap();

    let (tx, rx) = mpsc::channel();
    let lm2 = Arc::clone(&lm);
    let t2c = Arc::clone(&t2);
    let waiter = thread::spawn(move || {
        lm2.lock_table(&t2c, LockMode::Shared, TABLE_A).unwrap();
        tx.send(()).unwrap();
    });

    // The S request must stay blocked behind the held X lock
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    lm.unlock_table(&t1, TABLE_A).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    waiter.join().unwrap();

    assert_eq!(t2.table_lock_mode(TABLE_A), Some(LockMode::Shared));
}

#[test]
fn test_intention_modes_follow_compatibility_matrix() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let t3 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::IntentionShared, TABLE_A).unwrap();
    lm.lock_table(&t2, LockMode::IntentionExclusive, TABLE_A).unwrap();
    // IS + SIX coexist, IX + SIX do not; take SIX on a different table
    lm.lock_table(&t3, LockMode::SharedIntentionExclusive, TABLE_B).unwrap();
    lm.lock_table(&t1, LockMode::IntentionShared, TABLE_B).unwrap();

    assert_eq!(t1.table_lock_mode(TABLE_B), Some(LockMode::IntentionShared));
}

// Scenario: a transaction holding S upgrades to X with no other grants in
// the way; the S entry disappears and the X entry is granted.
#[test]
fn test_lock_upgrade() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap();
    lm.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap();

    assert_eq!(t1.table_lock_mode(TABLE_A), Some(LockMode::Exclusive));
    assert_eq!(t1.state(), TransactionState::Growing);
}

#[test]
fn test_same_mode_relock_is_noop() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap();
    lm.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap();
    assert_eq!(t1.table_lock_mode(TABLE_A), Some(LockMode::Shared));
}

#[test]
fn test_incompatible_upgrade_aborts() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap();
    let err = lm.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::IncompatibleUpgrade);
    assert_eq!(t1.state(), TransactionState::Aborted);
}

// Scenario: T2's upgrade is pending; T1 requesting its own upgrade on the
// same queue aborts with UpgradeConflict.
#[test]
fn test_upgrade_conflict_aborts_second_upgrader() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap();
    lm.lock_table(&t2, LockMode::Shared, TABLE_A).unwrap();

    let (tx, rx) = mpsc::channel();
    let lm2 = Arc::clone(&lm);
    let t2c = Arc::clone(&t2);
    let upgrader = thread::spawn(move || {
        // Blocks: T1's S lock is incompatible with X
        let result = lm2.lock_table(&t2c, LockMode::Exclusive, TABLE_A);
        tx.send(result.is_ok()).unwrap();
    });

    // Let T2 enter the upgrade before T1 tries its own
    thread::sleep(Duration::from_millis(100));

    let err = lm.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::UpgradeConflict);
    assert_eq!(t1.state(), TransactionState::Aborted);

    // T1's abort releases its S lock; T2's upgrade can then complete
    lm.release_all_locks(&t1);
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    upgrader.join().unwrap();
    assert_eq!(t2.table_lock_mode(TABLE_A), Some(LockMode::Exclusive));
}

// Scenario: releasing an X lock under REPEATABLE_READ enters the shrinking
// phase; any further acquisition aborts.
#[test]
fn test_lock_on_shrinking_aborts() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap();
    lm.unlock_table(&t1, TABLE_A).unwrap();
    assert_eq!(t1.state(), TransactionState::Shrinking);

    let err = lm.lock_table(&t1, LockMode::Shared, TABLE_B).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::LockOnShrinking);
    assert_eq!(t1.state(), TransactionState::Aborted);
}

#[test]
fn test_read_committed_allows_shared_while_shrinking() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::ReadCommitted);

    lm.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap();
    lm.unlock_table(&t1, TABLE_A).unwrap();
    assert_eq!(t1.state(), TransactionState::Shrinking);

    // RC still admits S and IS in the shrinking phase
    lm.lock_table(&t1, LockMode::IntentionShared, TABLE_B).unwrap();
    lm.lock_table(&t1, LockMode::Shared, TABLE_B).unwrap();

    let err = lm.lock_table(&t1, LockMode::Exclusive, TABLE_B).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::LockOnShrinking);
}

#[test]
fn test_read_uncommitted_rejects_shared() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::ReadUncommitted);

    let err = lm.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::LockSharedOnReadUncommitted);
}

#[test]
fn test_unlock_state_transitions_by_isolation() {
    let (lm, tm) = setup();

    // RR: releasing S already shrinks
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap();
    lm.unlock_table(&t1, TABLE_A).unwrap();
    assert_eq!(t1.state(), TransactionState::Shrinking);

    // RC: releasing S does not shrink
    let t2 = tm.begin(IsolationLevel::ReadCommitted);
    lm.lock_table(&t2, LockMode::Shared, TABLE_A).unwrap();
    lm.unlock_table(&t2, TABLE_A).unwrap();
    assert_eq!(t2.state(), TransactionState::Growing);

    // Intention locks never shrink
    let t3 = tm.begin(IsolationLevel::RepeatableRead);
    lm.lock_table(&t3, LockMode::IntentionExclusive, TABLE_A).unwrap();
    lm.unlock_table(&t3, TABLE_A).unwrap();
    assert_eq!(t3.state(), TransactionState::Growing);
}

#[test]
fn test_intention_lock_on_row_aborts() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    let err = lm
        .lock_row(&t1, LockMode::IntentionExclusive, TABLE_A, Rid::new(1, 1))
        .unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::AttemptedIntentionLockOnRow);
}

// Scenario: an X row lock with no table lock in place auto-acquires IX on
// the table first.
#[test]
fn test_row_lock_auto_acquires_intention_lock() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(3, 7);

    lm.lock_row(&t1, LockMode::Exclusive, TABLE_A, rid).unwrap();

    assert_eq!(t1.table_lock_mode(TABLE_A), Some(LockMode::IntentionExclusive));
    assert!(t1.has_rows_locked_on(TABLE_A));
}

#[test]
fn test_row_lock_under_existing_table_lock() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(3, 7);

    lm.lock_table(&t1, LockMode::SharedIntentionExclusive, TABLE_A).unwrap();
    lm.lock_row(&t1, LockMode::Exclusive, TABLE_A, rid).unwrap();

    // SIX already qualifies, no IX was added on top
    assert_eq!(
        t1.table_lock_mode(TABLE_A),
        Some(LockMode::SharedIntentionExclusive)
    );
}

#[test]
fn test_unlock_table_with_locked_rows_aborts() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(3, 7);

    lm.lock_row(&t1, LockMode::Exclusive, TABLE_A, rid).unwrap();

    let err = lm.unlock_table(&t1, TABLE_A).unwrap_err();
    assert_eq!(
        abort_reason(err),
        AbortReason::TableUnlockedBeforeUnlockingRows
    );
}

#[test]
fn test_rows_then_table_unlock_in_order() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(3, 7);

    lm.lock_row(&t1, LockMode::Exclusive, TABLE_A, rid).unwrap();
    lm.unlock_row(&t1, TABLE_A, rid, false).unwrap();
    lm.unlock_table(&t1, TABLE_A).unwrap();

    assert_eq!(t1.table_lock_mode(TABLE_A), None);
    assert!(!t1.has_rows_locked_on(TABLE_A));
}

#[test]
fn test_unlock_without_lock_aborts() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    let err = lm.unlock_table(&t1, TABLE_A).unwrap_err();
    assert_eq!(abort_reason(err), AbortReason::AttemptedUnlockButNoLockHeld);
}

// Conflicting modes are never simultaneously granted: a mutual-exclusion
// check under concurrent X table locks.
#[test]
fn test_exclusive_lock_mutual_exclusion() {
    let (lm, tm) = setup();
    let tm = Arc::new(tm);
    let in_section = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let lm = Arc::clone(&lm);
        let tm = Arc::clone(&tm);
        let in_section = Arc::clone(&in_section);
        handles.push(thread::spawn(move || {
            // Unlocking X always enters the shrinking phase, so every
            // iteration runs in a fresh transaction
            for _ in 0..25 {
                let txn = tm.begin(IsolationLevel::RepeatableRead);
                lm.lock_table(&txn, LockMode::Exclusive, TABLE_A).unwrap();
                let now = in_section.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(now, 0, "two exclusive holders at once");
                thread::yield_now();
                in_section.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                lm.unlock_table(&txn, TABLE_A).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

// Two transactions holding one table each and requesting the other's form
// a cycle; the detector aborts the younger one and the older proceeds.
#[test]
fn test_deadlock_detection_aborts_youngest() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap();
    lm.lock_table(&t2, LockMode::Exclusive, TABLE_B).unwrap();

    let lm1 = Arc::clone(&lm);
    let t1c = Arc::clone(&t1);
    let h1 = thread::spawn(move || lm1.lock_table(&t1c, LockMode::Exclusive, TABLE_B));

    let lm2 = Arc::clone(&lm);
    let t2c = Arc::clone(&t2);
    let lm_for_release = Arc::clone(&lm);
    let t2r = Arc::clone(&t2);
    let h2 = thread::spawn(move || {
        let result = lm2.lock_table(&t2c, LockMode::Exclusive, TABLE_A);
        // The victim unwinds by releasing everything it still holds
        if result.is_err() {
            lm_for_release.release_all_locks(&t2r);
        }
        result
    });

    // Give both waiters time to block, then break the cycle
    thread::sleep(Duration::from_millis(200));
    let victims = lm.detect_and_resolve();
    assert_eq!(victims, vec![t2.id()]);

    let r2 = h2.join().unwrap();
    assert!(matches!(r2, Err(LockError::TransactionInactive(_))));
    assert_eq!(t2.state(), TransactionState::Aborted);

    // T1 gets table B once the victim's locks are gone
    let r1 = h1.join().unwrap();
    assert!(r1.is_ok());
    assert_eq!(t1.table_lock_mode(TABLE_B), Some(LockMode::Exclusive));
}

#[test]
fn test_background_detector_breaks_cycles() {
    let (lm, tm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    lm.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap();
    lm.lock_table(&t2, LockMode::Exclusive, TABLE_B).unwrap();

    lm.spawn_cycle_detection(Duration::from_millis(20));

    let lm1 = Arc::clone(&lm);
    let t1c = Arc::clone(&t1);
    let h1 = thread::spawn(move || lm1.lock_table(&t1c, LockMode::Exclusive, TABLE_B));

    let lm2 = Arc::clone(&lm);
    let t2c = Arc::clone(&t2);
    let lm_for_release = Arc::clone(&lm);
    let t2r = Arc::clone(&t2);
    let h2 = thread::spawn(move || {
        let result = lm2.lock_table(&t2c, LockMode::Exclusive, TABLE_A);
        if result.is_err() {
            lm_for_release.release_all_locks(&t2r);
        }
        result
    });

    assert!(h2.join().unwrap().is_err());
    assert!(h1.join().unwrap().is_ok());

    lm.shutdown_cycle_detection();
}
