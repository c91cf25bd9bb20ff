//! Transaction phase sequencing, per-controller exclusion, upgrade and
//! downgrade, hold handles and restart.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::CallLog;
use servisor::{TaskOutcome, TransactionController, TxnError, TxnPhase};

#[tokio::test]
async fn commit_requires_prepare() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let err = control.commit(&txn).await.unwrap_err();
    assert!(matches!(
        err,
        TxnError::InvalidState {
            phase: TxnPhase::Active,
            ..
        }
    ));
    control.abort(&txn).await.unwrap();
}

#[tokio::test]
async fn phase_transitions_are_one_way() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();
    txn.new_task()
        .execute(|_ctx| async { TaskOutcome::Completed })
        .commit({
            let log = log.clone();
            move || async move { log.push("commit") }
        })
        .release()
        .unwrap();

    control.prepare(&txn).await.unwrap();
    // prepare-after-prepare
    assert!(matches!(
        control.prepare(&txn).await.unwrap_err(),
        TxnError::InvalidState { .. }
    ));
    control.commit(&txn).await.unwrap();
    // commit-after-commit
    assert!(matches!(
        control.commit(&txn).await.unwrap_err(),
        TxnError::InvalidState { .. }
    ));
    // prepare-after-commit
    assert!(matches!(
        control.prepare(&txn).await.unwrap_err(),
        TxnError::InvalidState { .. }
    ));
    // abort-after-commit
    assert!(matches!(
        control.abort(&txn).await.unwrap_err(),
        TxnError::InvalidState { .. }
    ));
    // the repeated attempts had no side effects
    assert_eq!(log.count("commit"), 1);
}

#[tokio::test]
async fn commit_after_abort_fails() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    control.abort(&txn).await.unwrap();
    assert!(matches!(
        control.commit(&txn).await.unwrap_err(),
        TxnError::InvalidState {
            phase: TxnPhase::Aborted,
            ..
        }
    ));
}

#[tokio::test]
async fn update_transactions_are_serialized_per_controller() {
    let control = TransactionController::new();
    let first = control.create_update().await;

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let control = control.clone();
        let acquired = acquired.clone();
        tokio::spawn(async move {
            let second = control.create_update().await;
            acquired.store(true, Ordering::SeqCst);
            second
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!acquired.load(Ordering::SeqCst));

    control.prepare(&first).await.unwrap();
    control.commit(&first).await.unwrap();
    drop(first);

    let second = waiter.await.unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    control.abort(&second).await.unwrap();
}

#[tokio::test]
async fn dropping_an_update_transaction_frees_the_controller() {
    let control = TransactionController::new();
    let first = control.create_update().await;
    drop(first);
    // would hang forever if the slot leaked
    let second = control.create_update().await;
    control.abort(&second).await.unwrap();
}

#[tokio::test]
async fn readers_share_but_exclude_updates() {
    let control = TransactionController::new();
    let r1 = control.create_read().await;
    let r2 = control.create_read().await;

    let acquired = Arc::new(AtomicBool::new(false));
    let waiter = {
        let control = control.clone();
        let acquired = acquired.clone();
        tokio::spawn(async move {
            let txn = control.create_update().await;
            acquired.store(true, Ordering::SeqCst);
            txn
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!acquired.load(Ordering::SeqCst));

    drop(r1);
    drop(r2);
    let txn = waiter.await.unwrap();
    control.abort(&txn).await.unwrap();
}

#[tokio::test]
async fn upgrade_succeeds_for_the_sole_reader() {
    let control = TransactionController::new();
    let read = control.create_read().await;
    let update = control.upgrade(read).expect("sole reader upgrades");
    assert_eq!(update.phase(), TxnPhase::Active);
    control.abort(&update).await.unwrap();
}

#[tokio::test]
async fn upgrade_fails_with_concurrent_readers() {
    let control = TransactionController::new();
    let read = control.create_read().await;
    let other = control.create_read().await;
    let read = control.upgrade(read).expect_err("two readers cannot upgrade");
    // no side effects: both readers still usable, a later sole upgrade works
    drop(other);
    let update = control.upgrade(read).expect("upgrade after other reader left");
    control.abort(&update).await.unwrap();
}

#[tokio::test]
async fn downgrade_succeeds_only_before_mutations() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let read = control.downgrade(txn).expect("untouched txn downgrades");
    drop(read);

    let txn = control.create_update().await;
    txn.new_task()
        .execute(|_ctx| async { TaskOutcome::Completed })
        .release()
        .unwrap();
    let txn = control
        .downgrade(txn)
        .expect_err("staged work blocks downgrade");
    control.abort(&txn).await.unwrap();
}

#[tokio::test]
async fn hold_handle_blocks_prepare_until_released() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let hold = txn.acquire_hold().unwrap();

    let prepared = Arc::new(AtomicBool::new(false));
    let prepare = {
        let control = control.clone();
        let txn = txn.clone();
        let prepared = prepared.clone();
        tokio::spawn(async move {
            control.prepare(&txn).await.unwrap();
            prepared.store(true, Ordering::SeqCst);
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!prepared.load(Ordering::SeqCst));

    drop(hold);
    prepare.await.unwrap();
    assert!(prepared.load(Ordering::SeqCst));
    control.commit(&txn).await.unwrap();
}

#[tokio::test]
async fn restart_reverts_and_reenters_active() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();

    txn.new_task()
        .execute({
            let log = log.clone();
            move |_ctx| async move {
                log.push("first:e");
                TaskOutcome::Completed
            }
        })
        .revert({
            let log = log.clone();
            move || async move { log.push("first:r") }
        })
        .release()
        .unwrap();
    txn.add_post_restart({
        let log = log.clone();
        move |_txn| log.push("post-restart")
    })
    .unwrap();

    control.prepare(&txn).await.unwrap();
    control.restart(&txn).await.unwrap();
    assert_eq!(txn.phase(), TxnPhase::Active);
    assert_eq!(log.snapshot(), ["first:e", "first:r", "post-restart"]);

    txn.new_task()
        .execute({
            let log = log.clone();
            move |_ctx| async move {
                log.push("second:e");
                TaskOutcome::Completed
            }
        })
        .release()
        .unwrap();
    control.prepare(&txn).await.unwrap();
    control.commit(&txn).await.unwrap();
    assert_eq!(
        log.snapshot(),
        ["first:e", "first:r", "post-restart", "second:e"]
    );
}

#[tokio::test]
async fn restart_from_active_runs_staged_bodies_then_reverts_them() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();

    // a token-respecting body, like the built-in lifecycle tasks; restart
    // leaves the token uncancelled, so the body must actually run
    txn.new_task()
        .execute({
            let log = log.clone();
            move |ctx| async move {
                if ctx.is_cancelled() {
                    return TaskOutcome::Cancelled;
                }
                log.push("staged:e");
                TaskOutcome::Completed
            }
        })
        .revert({
            let log = log.clone();
            move || async move { log.push("staged:r") }
        })
        .release()
        .unwrap();

    control.restart(&txn).await.unwrap();
    assert_eq!(txn.phase(), TxnPhase::Active);
    assert_eq!(log.snapshot(), ["staged:e", "staged:r"]);

    // the fresh round is fully usable: its bodies are not cancelled either
    txn.new_task()
        .execute({
            let log = log.clone();
            move |ctx| async move {
                if ctx.is_cancelled() {
                    return TaskOutcome::Cancelled;
                }
                log.push("next:e");
                TaskOutcome::Completed
            }
        })
        .release()
        .unwrap();
    control.prepare(&txn).await.unwrap();
    control.commit(&txn).await.unwrap();
    assert_eq!(log.snapshot(), ["staged:e", "staged:r", "next:e"]);
}

struct PlainMarker(u32);
struct SurvivorMarker(u32);

#[tokio::test]
async fn only_survivable_attachments_outlive_restart() {
    let control = TransactionController::new();
    let txn = control.create_update().await;

    let plain = txn.attachment(|| PlainMarker(1));
    let survivor = txn.attachment_survivable(|| SurvivorMarker(1));
    assert_eq!(plain.0, 1);
    assert_eq!(survivor.0, 1);

    control.prepare(&txn).await.unwrap();
    control.restart(&txn).await.unwrap();

    let plain = txn.attachment(|| PlainMarker(2));
    let survivor = txn.attachment_survivable(|| SurvivorMarker(2));
    assert_eq!(plain.0, 2, "plain attachments are dropped by restart");
    assert_eq!(survivor.0, 1, "survivable attachments are kept");
    control.abort(&txn).await.unwrap();
}

#[tokio::test]
async fn abort_of_a_never_prepared_transaction_runs_no_user_work() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();

    // a body that respects the cancellation token, like the built-in
    // lifecycle tasks
    txn.new_task()
        .execute({
            let log = log.clone();
            move |ctx| async move {
                if ctx.is_cancelled() {
                    return TaskOutcome::Cancelled;
                }
                log.push("worked");
                TaskOutcome::Completed
            }
        })
        .revert({
            let log = log.clone();
            move || async move { log.push("reverted") }
        })
        .release()
        .unwrap();

    control.abort(&txn).await.unwrap();
    assert!(log.snapshot().is_empty());
}
