//! # The transaction controller: root of the container.
//!
//! A [`TransactionController`] issues read and update transactions and
//! drives their phases. Per controller instance at most one update
//! transaction is active at a time; read transactions may run concurrently
//! with each other but never with an update transaction.
//!
//! Everything reachable from one controller — containers, registries,
//! registrations, service controllers — shares its identity; handing a
//! transaction to entities of a different controller fails synchronously.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, Notify, Semaphore};

use crate::config::Config;
use crate::error::TxnError;
use crate::events::{Bus, Event, EventKind};
use crate::observers::Observer;
use crate::service::{ServiceContainer, ServiceContext};
use crate::txn::transaction::{ReadTransaction, TxnInner, TxnPhase, UpdateTransaction};

static CONTROLLER_IDS: AtomicU64 = AtomicU64::new(0);

/// Reader/writer accounting shared by every transaction of one controller.
pub(crate) struct ExclShared {
    state: Mutex<ExclState>,
    notify: Notify,
}

struct ExclState {
    readers: usize,
    writer: bool,
}

impl ExclShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ExclState {
                readers: 0,
                writer: false,
            }),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ExclState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire_update(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if !state.writer && state.readers == 0 {
                    state.writer = true;
                    return;
                }
            }
            notified.await;
        }
    }

    async fn acquire_read(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if !state.writer {
                    state.readers += 1;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Read → update, legal only when the caller holds the sole read slot.
    fn try_upgrade(&self) -> bool {
        let mut state = self.lock();
        if !state.writer && state.readers == 1 {
            state.readers = 0;
            state.writer = true;
            true
        } else {
            false
        }
    }

    fn downgrade_slot(&self) {
        let mut state = self.lock();
        state.writer = false;
        state.readers = 1;
        drop(state);
        self.notify.notify_waiters();
    }

    pub(crate) fn release_update(&self) {
        let mut state = self.lock();
        state.writer = false;
        drop(state);
        self.notify.notify_waiters();
    }

    pub(crate) fn release_read(&self) {
        let mut state = self.lock();
        state.readers = state.readers.saturating_sub(1);
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Issues transactions and drives prepare/commit/abort/restart.
pub struct TransactionController {
    id: u64,
    config: Config,
    bus: Bus,
    excl: Arc<ExclShared>,
    sem: Option<Arc<Semaphore>>,
    txn_ids: AtomicU64,
}

impl TransactionController {
    /// Creates a controller with the default [`Config`].
    pub fn new() -> Arc<Self> {
        Self::with_config(Config::default())
    }

    /// Creates a controller with an explicit [`Config`].
    pub fn with_config(config: Config) -> Arc<Self> {
        let sem = match config.max_concurrent_tasks {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Arc::new(Self {
            id: CONTROLLER_IDS.fetch_add(1, Ordering::Relaxed),
            bus: Bus::new(config.bus_capacity),
            config,
            excl: ExclShared::new(),
            sem,
            txn_ids: AtomicU64::new(0),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Subscribes to the controller's event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Attaches an observer on a dedicated forwarding task.
    pub fn attach_observer<O: Observer>(&self, observer: O) {
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => observer.on_event(&ev).await,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
    }

    /// Creates a service container rooted at this controller.
    pub fn create_container(&self) -> Arc<ServiceContainer> {
        ServiceContainer::new(self.id, self.bus.clone())
    }

    /// Binds a service context to `txn` for installing services.
    pub fn service_context(&self, txn: &UpdateTransaction) -> Result<ServiceContext, TxnError> {
        self.check_update(txn)?;
        Ok(ServiceContext::new(txn.clone()))
    }

    /// Creates an update transaction, waiting until neither another update
    /// transaction nor any read transaction is active.
    pub async fn create_update(&self) -> UpdateTransaction {
        self.excl.acquire_update().await;
        UpdateTransaction {
            inner: TxnInner::new_update(
                self.txn_ids.fetch_add(1, Ordering::Relaxed),
                self.id,
                self.excl.clone(),
                self.bus.clone(),
                self.sem.clone(),
            ),
        }
    }

    /// Creates a read transaction, waiting while an update transaction is
    /// active. The read slot is returned when the last handle drops.
    pub async fn create_read(&self) -> ReadTransaction {
        self.excl.acquire_read().await;
        ReadTransaction {
            inner: TxnInner::new_read(
                self.txn_ids.fetch_add(1, Ordering::Relaxed),
                self.id,
                self.excl.clone(),
                self.bus.clone(),
                self.sem.clone(),
            ),
        }
    }

    /// Drives the transaction's EXECUTE phase to its fixed point.
    ///
    /// Blocks until every hold handle is released, runs all staged tasks
    /// plus whatever post-prepare listeners stage, then marks the
    /// transaction Prepared. One-way; only legal from Active.
    pub async fn prepare(&self, txn: &UpdateTransaction) -> Result<(), TxnError> {
        self.check_update(txn)?;
        txn.inner
            .begin_phase(&[TxnPhase::Active], TxnPhase::Preparing, "prepare")?;
        txn.inner.wait_no_holds().await;
        txn.inner.drive_prepare(txn).await;
        txn.inner.set_phase(TxnPhase::Prepared);
        self.bus
            .publish(Event::now(EventKind::TxnPrepared).with_txn(txn.id()));
        Ok(())
    }

    /// True when the transaction could commit right now: it belongs to this
    /// controller, has not moved past Prepared, and its problem report
    /// carries nothing at ERROR severity or above.
    pub fn can_commit(&self, txn: &UpdateTransaction) -> bool {
        txn.inner.matches_controller(self.id)
            && matches!(
                txn.phase(),
                TxnPhase::Active | TxnPhase::Preparing | TxnPhase::Prepared
            )
            && txn.report().allows_commit()
    }

    /// Commits a prepared transaction: commit hooks run in topological
    /// order, then the controller's update slot is released.
    pub async fn commit(&self, txn: &UpdateTransaction) -> Result<(), TxnError> {
        self.check_update(txn)?;
        if txn.phase() == TxnPhase::Prepared && !txn.report().allows_commit() {
            return Err(TxnError::CannotCommit {
                problems: txn.report().blocking_count(),
            });
        }
        txn.inner
            .begin_phase(&[TxnPhase::Prepared], TxnPhase::Committing, "commit")?;
        txn.inner.drive_commit().await;
        txn.inner.set_phase(TxnPhase::Committed);
        txn.inner.release_exclusion();
        self.bus
            .publish(Event::now(EventKind::TxnCommitted).with_txn(txn.id()));
        Ok(())
    }

    /// Aborts a transaction: every executed task is reverted in reverse
    /// topological order; cancelled tasks are skipped.
    ///
    /// Aborting an Active transaction first flushes staged task bodies so
    /// their revert obligations are known; lifecycle bodies observe the
    /// cancelled token and self-cancel instead of doing work.
    pub async fn abort(&self, txn: &UpdateTransaction) -> Result<(), TxnError> {
        self.check_update(txn)?;
        let prev = txn.inner.begin_phase(
            &[TxnPhase::Active, TxnPhase::Prepared],
            TxnPhase::Aborting,
            "abort",
        )?;
        txn.inner.token().cancel();
        if prev == TxnPhase::Active {
            txn.inner.drive_execute().await;
        }
        txn.inner.drive_revert().await;
        txn.inner.set_phase(TxnPhase::Aborted);
        txn.inner.release_exclusion();
        self.bus
            .publish(Event::now(EventKind::TxnAborted).with_txn(txn.id()));
        Ok(())
    }

    /// Reverts all tasks, clears the task set, report and non-survivable
    /// attachments, then re-enters the Active phase and fires post-restart
    /// listeners.
    ///
    /// Unlike `abort`, the cancellation token stays uncancelled — the
    /// transaction lives on and later rounds still need it — so restarting
    /// an Active transaction first runs its staged bodies and then reverts
    /// them.
    pub async fn restart(&self, txn: &UpdateTransaction) -> Result<(), TxnError> {
        self.check_update(txn)?;
        let prev = txn.inner.begin_phase(
            &[TxnPhase::Active, TxnPhase::Prepared],
            TxnPhase::Restarting,
            "restart",
        )?;
        if prev == TxnPhase::Active {
            txn.inner.drive_execute().await;
        }
        txn.inner.drive_revert().await;
        let listeners = txn.inner.reset_for_restart();
        txn.inner.set_phase(TxnPhase::Active);
        for listener in listeners {
            txn.inner.call_listener(listener, txn);
        }
        self.bus
            .publish(Event::now(EventKind::TxnRestarted).with_txn(txn.id()));
        Ok(())
    }

    /// Read → update upgrade. Succeeds only when the caller holds the sole
    /// active transaction; on failure the read transaction is handed back
    /// untouched.
    pub fn upgrade(&self, txn: ReadTransaction) -> Result<UpdateTransaction, ReadTransaction> {
        if !txn.inner.matches_controller(self.id)
            || txn.phase() != TxnPhase::Active
            || !self.excl.try_upgrade()
        {
            return Err(txn);
        }
        txn.inner.make_update();
        let ReadTransaction { inner } = txn;
        Ok(UpdateTransaction { inner })
    }

    /// Update → read downgrade. Succeeds only while the transaction is
    /// Active and has staged nothing; on failure the update transaction is
    /// handed back untouched.
    pub fn downgrade(&self, txn: UpdateTransaction) -> Result<ReadTransaction, UpdateTransaction> {
        if !txn.inner.matches_controller(self.id)
            || txn.phase() != TxnPhase::Active
            || txn.inner.is_modified()
            || txn.inner.task_count() > 0
        {
            return Err(txn);
        }
        self.excl.downgrade_slot();
        txn.inner.make_read();
        let UpdateTransaction { inner } = txn;
        Ok(ReadTransaction { inner })
    }

    fn check_update(&self, txn: &UpdateTransaction) -> Result<(), TxnError> {
        if txn.inner.matches_controller(self.id) {
            Ok(())
        } else {
            Err(TxnError::ForeignTransaction)
        }
    }
}
