//! # Lifecycle task subgraphs.
//!
//! The state machine stages one of these subgraphs whenever it decides to
//! move a service. Bodies observe the transaction's cancellation token and
//! self-cancel when an abort flushes never-executed work, so rollback never
//! starts services only to tear them down again.

use std::sync::Arc;

use crate::service::controller::{ServiceController, State};
use crate::service::service::{StartContext, StartOutcome, StopContext};
use crate::txn::{TaskHandle, TaskOutcome, UpdateTransaction};

/// Start subgraph: one task invoking the service's start, then folding the
/// outcome back into the state machine and broadcasting UP to incoming
/// edges. The revert obligation is the mirror stop.
pub(crate) fn stage_start(controller: Arc<ServiceController>, txn: &UpdateTransaction) -> TaskHandle {
    let exec_ctl = controller.clone();
    let revert_ctl = controller;
    txn.new_task()
        .execute(move |ctx| async move {
            if ctx.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
            exec_ctl.publish_starting(ctx.txn_id());
            let service = exec_ctl.service();
            let start_ctx = StartContext::new(ctx.clone(), exec_ctl.clone());
            match service.start(start_ctx).await {
                StartOutcome::Up(value) => {
                    let txn = ctx.update_txn();
                    exec_ctl.set_service_up(value, &txn);
                    exec_ctl.notify_service_up(&txn);
                }
                StartOutcome::Failed => {
                    let txn = ctx.update_txn();
                    exec_ctl.set_service_failed(&txn);
                }
            }
            TaskOutcome::Completed
        })
        .revert(move || async move {
            if revert_ctl.state() == State::Up {
                revert_ctl.service().stop(StopContext::detached()).await;
                revert_ctl.set_service_down_silent();
            }
        })
        .release_internal()
}

/// Stop subgraph: dependents transition down first (their staged lifecycle
/// tasks gate the stop), then the service's stop runs, then DOWN is applied
/// and broadcast. Returns the terminal set-down task.
pub(crate) fn stage_stop(controller: Arc<ServiceController>, txn: &UpdateTransaction) -> TaskHandle {
    let dependents = controller.notify_service_down(txn);
    let stop_ctl = controller.clone();
    let stop = txn
        .new_task()
        .after_all(dependents)
        .execute(move |ctx| async move {
            if ctx.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
            let service = stop_ctl.service();
            service.stop(StopContext::from_task(ctx.clone())).await;
            TaskOutcome::Completed
        })
        .release_internal();
    let down_ctl = controller;
    txn.new_task()
        .after(stop)
        .execute(move |ctx| async move {
            if ctx.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
            let txn = ctx.update_txn();
            down_ctl.set_service_down(&txn);
            // edges that already observed DOWN ignore the re-broadcast
            down_ctl.notify_service_down(&txn);
            TaskOutcome::Completed
        })
        .release_internal()
}

/// A FAILED service has nothing running to stop; its stop subgraph only
/// applies DOWN, which re-runs the state machine (retry cycles back up).
pub(crate) fn stage_stop_failed(
    controller: Arc<ServiceController>,
    txn: &UpdateTransaction,
) -> TaskHandle {
    txn.new_task()
        .execute(move |ctx| async move {
            if ctx.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
            let txn = ctx.update_txn();
            controller.set_service_down(&txn);
            TaskOutcome::Completed
        })
        .release_internal()
}

/// Remove subgraph: detaches the controller from all registrations and
/// edges, firing every retained listener exactly once.
pub(crate) fn stage_remove(
    controller: Arc<ServiceController>,
    txn: &UpdateTransaction,
) -> TaskHandle {
    txn.new_task()
        .execute(move |ctx| async move {
            if ctx.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
            let txn = ctx.update_txn();
            controller.set_service_removed(&txn);
            TaskOutcome::Completed
        })
        .release_internal()
}
