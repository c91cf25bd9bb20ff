//! Task DAG semantics: execute ordering, parent/child containment,
//! cancellation, and the commit/revert hook contracts.

mod common;

use common::CallLog;
use servisor::{Severity, TaskOutcome, TransactionController, TxnError};

#[tokio::test]
async fn chain_executes_in_order_and_reverts_in_reverse() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();

    let e0 = txn
        .new_task()
        .execute({
            let log = log.clone();
            move |_ctx| async move {
                log.push("e0");
                TaskOutcome::Completed
            }
        })
        .revert({
            let log = log.clone();
            move || async move { log.push("r0") }
        })
        .release()
        .unwrap();
    txn.new_task()
        .after(e0)
        .execute({
            let log = log.clone();
            move |_ctx| async move {
                log.push("e1");
                TaskOutcome::Completed
            }
        })
        .revert({
            let log = log.clone();
            move || async move { log.push("r1") }
        })
        .release()
        .unwrap();

    control.prepare(&txn).await.unwrap();
    assert_eq!(log.snapshot(), ["e0", "e1"]);
    assert!(control.can_commit(&txn));

    control.abort(&txn).await.unwrap();
    assert_eq!(log.snapshot(), ["e0", "e1", "r1", "r0"]);
}

async fn run_parent_child_abort(parent_cancels: bool, child_cancels: bool) -> Vec<String> {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();

    txn.new_task()
        .execute({
            let log = log.clone();
            move |ctx| async move {
                log.push("parent:e");
                ctx.new_task()
                    .execute({
                        let log = log.clone();
                        move |_ctx| async move {
                            log.push("child:e");
                            if child_cancels {
                                TaskOutcome::Cancelled
                            } else {
                                TaskOutcome::Completed
                            }
                        }
                    })
                    .revert({
                        let log = log.clone();
                        move || async move { log.push("child:r") }
                    })
                    .release()
                    .unwrap();
                if parent_cancels {
                    TaskOutcome::Cancelled
                } else {
                    TaskOutcome::Completed
                }
            }
        })
        .revert({
            let log = log.clone();
            move || async move { log.push("parent:r") }
        })
        .release()
        .unwrap();

    control.prepare(&txn).await.unwrap();
    // the child ran, and only after its parent entered EXECUTE
    log.assert_order("parent:e", "child:e");
    assert!(control.can_commit(&txn));
    control.abort(&txn).await.unwrap();
    log.snapshot()
}

#[tokio::test]
async fn parent_and_child_complete_then_abort_reverts_child_first() {
    let calls = run_parent_child_abort(false, false).await;
    assert_eq!(calls, ["parent:e", "child:e", "child:r", "parent:r"]);
}

#[tokio::test]
async fn cancelled_child_is_not_reverted() {
    let calls = run_parent_child_abort(false, true).await;
    assert_eq!(calls, ["parent:e", "child:e", "parent:r"]);
}

#[tokio::test]
async fn cancelled_parent_and_child_revert_nothing() {
    let calls = run_parent_child_abort(true, true).await;
    assert_eq!(calls, ["parent:e", "child:e"]);
}

#[tokio::test]
async fn cancelled_parent_with_completed_child_reverts_child_only() {
    let calls = run_parent_child_abort(true, false).await;
    assert_eq!(calls, ["parent:e", "child:e", "child:r"]);
}

#[tokio::test]
async fn commit_hooks_run_in_topological_order() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();

    let a = txn
        .new_task()
        .execute({
            let log = log.clone();
            move |_ctx| async move {
                log.push("ea");
                TaskOutcome::Completed
            }
        })
        .commit({
            let log = log.clone();
            move || async move { log.push("ca") }
        })
        .release()
        .unwrap();
    txn.new_task()
        .after(a)
        .execute({
            let log = log.clone();
            move |_ctx| async move {
                log.push("eb");
                TaskOutcome::Completed
            }
        })
        .commit({
            let log = log.clone();
            move || async move { log.push("cb") }
        })
        .release()
        .unwrap();

    control.prepare(&txn).await.unwrap();
    control.commit(&txn).await.unwrap();
    assert_eq!(log.snapshot(), ["ea", "eb", "ca", "cb"]);
}

#[tokio::test]
async fn cancelled_task_skips_its_commit_hook() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();

    txn.new_task()
        .execute(|_ctx| async { TaskOutcome::Cancelled })
        .commit({
            let log = log.clone();
            move || async move { log.push("commit:cancelled") }
        })
        .release()
        .unwrap();
    txn.new_task()
        .execute(|_ctx| async { TaskOutcome::Completed })
        .commit({
            let log = log.clone();
            move || async move { log.push("commit:completed") }
        })
        .release()
        .unwrap();

    control.prepare(&txn).await.unwrap();
    control.commit(&txn).await.unwrap();
    assert_eq!(log.snapshot(), ["commit:completed"]);
}

#[tokio::test]
async fn error_problem_blocks_commit() {
    let control = TransactionController::new();
    let txn = control.create_update().await;

    txn.new_task()
        .execute(|ctx| async move {
            ctx.add_problem(Severity::Error, "backing store unavailable");
            TaskOutcome::Completed
        })
        .release()
        .unwrap();

    control.prepare(&txn).await.unwrap();
    assert!(!control.can_commit(&txn));
    let err = control.commit(&txn).await.unwrap_err();
    assert!(matches!(err, TxnError::CannotCommit { problems: 1 }));
    // still abortable
    control.abort(&txn).await.unwrap();
}

#[tokio::test]
async fn warning_problem_does_not_block_commit() {
    let control = TransactionController::new();
    let txn = control.create_update().await;

    txn.new_task()
        .execute(|ctx| async move {
            ctx.add_problem(Severity::Warning, "falling back to defaults");
            TaskOutcome::Completed
        })
        .release()
        .unwrap();

    control.prepare(&txn).await.unwrap();
    assert!(control.can_commit(&txn));
    control.commit(&txn).await.unwrap();
}

#[tokio::test]
async fn panicking_executable_becomes_critical_problem() {
    let control = TransactionController::new();
    let txn = control.create_update().await;

    txn.new_task()
        .execute(|_ctx| async { panic!("boom") })
        .release()
        .unwrap();

    control.prepare(&txn).await.unwrap();
    assert_eq!(txn.report().max_severity(), Some(Severity::Critical));
    assert!(!control.can_commit(&txn));
    control.abort(&txn).await.unwrap();
}

#[tokio::test]
async fn post_prepare_listener_work_executes_before_prepared() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();

    txn.new_task()
        .execute({
            let log = log.clone();
            move |_ctx| async move {
                log.push("e0");
                TaskOutcome::Completed
            }
        })
        .release()
        .unwrap();
    txn.add_post_prepare({
        let log = log.clone();
        move |txn| {
            log.push("listener");
            txn.new_task()
                .execute({
                    let log = log.clone();
                    move |_ctx| async move {
                        log.push("late");
                        TaskOutcome::Completed
                    }
                })
                .release()
                .unwrap();
        }
    })
    .unwrap();

    control.prepare(&txn).await.unwrap();
    assert_eq!(log.snapshot(), ["e0", "listener", "late"]);
    assert!(txn.is_prepared());
    control.commit(&txn).await.unwrap();
}

#[tokio::test]
async fn validate_hook_runs_at_prepare_and_gates_commit() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();

    txn.new_task()
        .execute(|_ctx| async { TaskOutcome::Completed })
        .validate({
            let log = log.clone();
            move |ctx| {
                log.push("validate");
                ctx.add_problem(Severity::Error, "inconsistent configuration");
            }
        })
        .release()
        .unwrap();

    control.prepare(&txn).await.unwrap();
    assert_eq!(log.snapshot(), ["validate"]);
    assert!(!control.can_commit(&txn));
    control.abort(&txn).await.unwrap();
}

#[tokio::test]
async fn independent_tasks_all_run() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    let log = CallLog::new();

    for i in 0..8 {
        txn.new_task()
            .execute({
                let log = log.clone();
                move |_ctx| async move {
                    log.push(format!("task{i}"));
                    TaskOutcome::Completed
                }
            })
            .release()
            .unwrap();
    }

    control.prepare(&txn).await.unwrap();
    let mut calls = log.snapshot();
    calls.sort();
    assert_eq!(calls.len(), 8);
    control.commit(&txn).await.unwrap();
}

#[tokio::test]
async fn tasks_cannot_be_staged_after_prepare() {
    let control = TransactionController::new();
    let txn = control.create_update().await;
    control.prepare(&txn).await.unwrap();
    let err = txn
        .new_task()
        .execute(|_ctx| async { TaskOutcome::Completed })
        .release()
        .unwrap_err();
    assert!(matches!(err, TxnError::InvalidState { .. }));
    control.commit(&txn).await.unwrap();
}
