//! Service controller lifecycle: install/start, failure and retry, replace,
//! enable/disable, removal, and demand-driven chains.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{flaky_service, recording_service, CallLog};
use servisor::{
    DependencyFlags, EventKind, ServiceError, ServiceFn, ServiceMode, StartOutcome, State,
    TransactionController,
};

#[tokio::test]
async fn install_then_start_active_mode() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();
    let log = CallLog::new();

    let txn = control.create_update().await;
    let ctx = control.service_context(&txn).unwrap();
    let controller = ctx
        .add_service(&registry, "a")
        .unwrap()
        .set_mode(ServiceMode::Active)
        .set_service(recording_service(&log, "a"))
        .install()
        .unwrap();
    assert_eq!(controller.state(), State::Starting);

    control.prepare(&txn).await.unwrap();
    control.commit(&txn).await.unwrap();

    assert_eq!(controller.state(), State::Up);
    assert_eq!(log.count("start:a"), 1);
    assert_eq!(log.count("stop:a"), 0);
}

#[tokio::test]
async fn linear_chain_demand_propagation() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();
    let log = CallLog::new();

    let t1 = control.create_update().await;
    let ctx = control.service_context(&t1).unwrap();
    let a = ctx
        .add_service(&registry, "a")
        .unwrap()
        .set_mode(ServiceMode::OnDemand)
        .set_service(recording_service(&log, "a"))
        .install()
        .unwrap();
    let b = ctx
        .add_service(&registry, "b")
        .unwrap()
        .set_mode(ServiceMode::OnDemand)
        .set_service(recording_service(&log, "b"))
        .add_dependency("a")
        .install()
        .unwrap();
    control.prepare(&t1).await.unwrap();
    control.commit(&t1).await.unwrap();

    assert_eq!(a.state(), State::Down);
    assert_eq!(b.state(), State::Down);
    assert!(log.snapshot().is_empty());

    let t2 = control.create_update().await;
    let ctx = control.service_context(&t2).unwrap();
    let c = ctx
        .add_service(&registry, "c")
        .unwrap()
        .set_mode(ServiceMode::Active)
        .set_service(recording_service(&log, "c"))
        .add_dependency("b")
        .install()
        .unwrap();
    control.prepare(&t2).await.unwrap();
    control.commit(&t2).await.unwrap();

    assert_eq!(a.state(), State::Up);
    assert_eq!(b.state(), State::Up);
    assert_eq!(c.state(), State::Up);
    log.assert_order("start:a", "start:b");
    log.assert_order("start:b", "start:c");
    assert!(b.demanded_by_count() > 0);
    assert!(a.demanded_by_count() > 0);

    // removing the demander winds the on-demand chain back down
    let t3 = control.create_update().await;
    c.remove(&t3).unwrap();
    control.prepare(&t3).await.unwrap();
    control.commit(&t3).await.unwrap();

    assert_eq!(c.state(), State::Removed);
    assert_eq!(b.state(), State::Down);
    assert_eq!(a.state(), State::Down);
    log.assert_order("stop:c", "stop:b");
    log.assert_order("stop:b", "stop:a");
}

#[tokio::test]
async fn replace_started_service() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();
    let log = CallLog::new();

    let t1 = control.create_update().await;
    let ctx = control.service_context(&t1).unwrap();
    let controller = ctx
        .add_service(&registry, "s")
        .unwrap()
        .set_service(recording_service(&log, "s1"))
        .install()
        .unwrap();
    control.prepare(&t1).await.unwrap();
    control.commit(&t1).await.unwrap();
    assert_eq!(controller.state(), State::Up);

    let replaced = Arc::new(AtomicUsize::new(0));
    let s2 = recording_service(&log, "s2");
    let t2 = control.create_update().await;
    controller
        .replace_with(&t2, s2.clone(), {
            let replaced = replaced.clone();
            move |_c| {
                replaced.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    control.prepare(&t2).await.unwrap();
    control.commit(&t2).await.unwrap();

    assert_eq!(controller.state(), State::Up);
    log.assert_order("stop:s1", "start:s2");
    assert_eq!(replaced.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&controller.service(), &s2));
}

#[tokio::test]
async fn failed_start_is_retryable() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();
    let log = CallLog::new();

    let t1 = control.create_update().await;
    let ctx = control.service_context(&t1).unwrap();
    let controller = ctx
        .add_service(&registry, "flaky")
        .unwrap()
        .set_service(flaky_service(&log, "flaky", 1))
        .install()
        .unwrap();
    control.prepare(&t1).await.unwrap();
    control.commit(&t1).await.unwrap();
    assert_eq!(controller.state(), State::Failed);
    assert_eq!(log.count("start:flaky"), 1);

    let settled = Arc::new(AtomicUsize::new(0));
    let t2 = control.create_update().await;
    controller
        .retry_with(&t2, {
            let settled = settled.clone();
            move |_c| {
                settled.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    control.prepare(&t2).await.unwrap();
    control.commit(&t2).await.unwrap();

    assert_eq!(controller.state(), State::Up);
    assert_eq!(log.count("start:flaky"), 2);
    assert_eq!(settled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_requires_failed_state() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();

    let t1 = control.create_update().await;
    let ctx = control.service_context(&t1).unwrap();
    let controller = ctx.add_service(&registry, "x").unwrap().install().unwrap();
    control.prepare(&t1).await.unwrap();
    control.commit(&t1).await.unwrap();
    assert_eq!(controller.state(), State::Up);

    let t2 = control.create_update().await;
    assert!(matches!(
        controller.retry(&t2).unwrap_err(),
        ServiceError::NotInFailedState { .. }
    ));
    control.abort(&t2).await.unwrap();
}

#[tokio::test]
async fn restart_cycles_an_up_service() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();
    let log = CallLog::new();

    let t1 = control.create_update().await;
    let ctx = control.service_context(&t1).unwrap();
    let controller = ctx
        .add_service(&registry, "r")
        .unwrap()
        .set_service(recording_service(&log, "r"))
        .install()
        .unwrap();
    control.prepare(&t1).await.unwrap();
    control.commit(&t1).await.unwrap();

    let t2 = control.create_update().await;
    controller.restart(&t2).unwrap();
    control.prepare(&t2).await.unwrap();
    control.commit(&t2).await.unwrap();

    assert_eq!(controller.state(), State::Up);
    log.assert_order("start:r", "stop:r");
    assert_eq!(log.count("start:r"), 2);
    assert_eq!(log.count("stop:r"), 1);

    // restart of a DOWN service is refused
    let t3 = control.create_update().await;
    controller.disable(&t3).unwrap();
    control.prepare(&t3).await.unwrap();
    control.commit(&t3).await.unwrap();
    assert_eq!(controller.state(), State::Down);

    let t4 = control.create_update().await;
    assert!(matches!(
        controller.restart(&t4).unwrap_err(),
        ServiceError::NotInUpState { .. }
    ));
    control.abort(&t4).await.unwrap();
}

#[tokio::test]
async fn disable_and_enable_with_listeners() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();
    let log = CallLog::new();

    let t1 = control.create_update().await;
    let ctx = control.service_context(&t1).unwrap();
    let controller = ctx
        .add_service(&registry, "svc")
        .unwrap()
        .set_service(recording_service(&log, "svc"))
        .install()
        .unwrap();
    control.prepare(&t1).await.unwrap();
    control.commit(&t1).await.unwrap();

    let down = Arc::new(AtomicUsize::new(0));
    let t2 = control.create_update().await;
    controller
        .disable_with(&t2, {
            let down = down.clone();
            move |c| {
                assert_eq!(c.state(), State::Down);
                down.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    control.prepare(&t2).await.unwrap();
    control.commit(&t2).await.unwrap();
    assert_eq!(controller.state(), State::Down);
    assert_eq!(down.load(Ordering::SeqCst), 1);

    let up = Arc::new(AtomicUsize::new(0));
    let t3 = control.create_update().await;
    controller
        .enable_with(&t3, {
            let up = up.clone();
            move |c| {
                assert_eq!(c.state(), State::Up);
                up.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    control.prepare(&t3).await.unwrap();
    control.commit(&t3).await.unwrap();
    assert_eq!(controller.state(), State::Up);
    assert_eq!(up.load(Ordering::SeqCst), 1);
    assert_eq!(log.count("start:svc"), 2);
}

#[tokio::test]
async fn removed_services_are_terminal() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();
    let log = CallLog::new();

    let t1 = control.create_update().await;
    let ctx = control.service_context(&t1).unwrap();
    let controller = ctx
        .add_service(&registry, "gone")
        .unwrap()
        .set_service(recording_service(&log, "gone"))
        .install()
        .unwrap();
    control.prepare(&t1).await.unwrap();
    control.commit(&t1).await.unwrap();

    let removed = Arc::new(AtomicUsize::new(0));
    let t2 = control.create_update().await;
    controller
        .remove_with(&t2, {
            let removed = removed.clone();
            move |c| {
                assert_eq!(c.state(), State::Removed);
                removed.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
    control.prepare(&t2).await.unwrap();
    control.commit(&t2).await.unwrap();

    assert_eq!(controller.state(), State::Removed);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(log.count("stop:gone"), 1);
    assert!(registry.get_service("gone").is_none());

    let t3 = control.create_update().await;
    assert!(matches!(
        controller.enable(&t3).unwrap_err(),
        ServiceError::CannotOperateOnRemoved { .. }
    ));
    assert!(matches!(
        controller.disable(&t3).unwrap_err(),
        ServiceError::CannotOperateOnRemoved { .. }
    ));
    assert!(matches!(
        controller.retry(&t3).unwrap_err(),
        ServiceError::CannotOperateOnRemoved { .. }
    ));
    control.abort(&t3).await.unwrap();
}

#[tokio::test]
async fn unsatisfied_counter_tracks_missing_dependencies() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();
    let log = CallLog::new();

    let t1 = control.create_update().await;
    let ctx = control.service_context(&t1).unwrap();
    let b = ctx
        .add_service(&registry, "b")
        .unwrap()
        .set_service(recording_service(&log, "b"))
        .add_dependency_with("a", DependencyFlags::unrequired())
        .install()
        .unwrap();
    control.prepare(&t1).await.unwrap();
    control.commit(&t1).await.unwrap();
    assert_eq!(b.state(), State::Down);
    assert_eq!(b.unsatisfied_count(), 1);

    let t2 = control.create_update().await;
    let ctx = control.service_context(&t2).unwrap();
    let a = ctx
        .add_service(&registry, "a")
        .unwrap()
        .set_service(recording_service(&log, "a"))
        .install()
        .unwrap();
    control.prepare(&t2).await.unwrap();
    control.commit(&t2).await.unwrap();

    assert_eq!(a.state(), State::Up);
    assert_eq!(b.state(), State::Up);
    assert_eq!(b.unsatisfied_count(), 0);
    log.assert_order("start:a", "start:b");
}

#[tokio::test]
async fn start_value_is_exposed_while_up() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();

    let service = ServiceFn::arc(
        |_ctx| async { StartOutcome::up_with(42u32) },
        |_ctx| async {},
    );
    let t1 = control.create_update().await;
    let ctx = control.service_context(&t1).unwrap();
    let controller = ctx
        .add_service(&registry, "valued")
        .unwrap()
        .set_service(service)
        .install()
        .unwrap();
    control.prepare(&t1).await.unwrap();
    control.commit(&t1).await.unwrap();

    let value = controller.value().expect("value while UP");
    assert_eq!(value.downcast_ref::<u32>(), Some(&42));

    let t2 = control.create_update().await;
    controller.disable(&t2).unwrap();
    control.prepare(&t2).await.unwrap();
    control.commit(&t2).await.unwrap();
    assert!(controller.value().is_none());
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();
    let mut events = control.subscribe();

    let t1 = control.create_update().await;
    let ctx = control.service_context(&t1).unwrap();
    ctx.add_service(&registry, "observed")
        .unwrap()
        .install()
        .unwrap();
    control.prepare(&t1).await.unwrap();
    control.commit(&t1).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::ServiceStarting));
    assert!(kinds.contains(&EventKind::ServiceUp));
    assert!(kinds.contains(&EventKind::TxnPrepared));
    assert!(kinds.contains(&EventKind::TxnCommitted));
    let starting = kinds
        .iter()
        .position(|k| *k == EventKind::ServiceStarting)
        .unwrap();
    let up = kinds.iter().position(|k| *k == EventKind::ServiceUp).unwrap();
    assert!(starting < up);
}

#[tokio::test]
async fn aborting_an_installation_stops_and_detaches_the_service() {
    let control = TransactionController::new();
    let registry = control.create_container().new_registry();
    let log = CallLog::new();

    let txn = control.create_update().await;
    let ctx = control.service_context(&txn).unwrap();
    let controller = ctx
        .add_service(&registry, "undone")
        .unwrap()
        .set_service(recording_service(&log, "undone"))
        .install()
        .unwrap();
    control.prepare(&txn).await.unwrap();
    assert_eq!(log.count("start:undone"), 1);

    control.abort(&txn).await.unwrap();
    assert_eq!(log.count("stop:undone"), 1);
    assert_eq!(controller.state(), State::Removed);
    assert!(registry.get_service("undone").is_none());
}
