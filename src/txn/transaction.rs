//! # Transactions: staged task DAGs with prepare/commit/rollback semantics.
//!
//! A transaction is a unit of atomic change to the container. Mutations are
//! staged as tasks; the phase machinery in
//! [`TransactionController`](crate::TransactionController)
//! drives EXECUTE to a fixed point at prepare time and then either commits
//! (commit hooks in topological order) or aborts (revert hooks in reverse
//! topological order).
//!
//! ## Ordering guarantees
//! Within one transaction the happens-before order is exactly the task DAG:
//! a predecessor's EXECUTE completion happens-before its successor's EXECUTE
//! entry, every EXECUTE happens-before PREPARE, and PREPARE happens-before
//! COMMIT or REVERT. Between PREPARE and COMMIT/REVERT no task executes.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::TxnError;
use crate::events::{Bus, Event, EventKind};
use crate::txn::controller::ExclShared;
use crate::txn::graph::TaskGraph;
use crate::txn::problem::{Problem, ProblemReport, Severity};
use crate::txn::task::{TaskBuilder, TaskContext, TaskId, TaskOutcome, ValidateContext};
use crate::txn::task::{CommitFn, ExecFn, RevertFn, ValidateFn};

/// Phase of a transaction. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    /// Accepting mutations and new tasks.
    Active,
    /// Driving EXECUTE to its fixed point.
    Preparing,
    /// Fixed point reached; awaiting commit or abort.
    Prepared,
    /// Running commit hooks.
    Committing,
    /// Terminal: all task effects applied.
    Committed,
    /// Running revert hooks.
    Aborting,
    /// Terminal: all executed tasks reverted.
    Aborted,
    /// Reverting back into a fresh Active phase.
    Restarting,
}

const KIND_READ: u8 = 0;
const KIND_UPDATE: u8 = 1;

pub(crate) type PhaseListener = Box<dyn FnOnce(&UpdateTransaction) + Send>;

struct AttachmentEntry {
    value: Arc<dyn Any + Send + Sync>,
    survives_restart: bool,
}

pub(crate) struct TxnInner {
    id: u64,
    controller_id: u64,
    kind: AtomicU8,
    phase: Mutex<TxnPhase>,
    graph: Mutex<TaskGraph>,
    sched: tokio::sync::Notify,
    report: ProblemReport,
    attachments: Mutex<HashMap<TypeId, AttachmentEntry>>,
    post_prepare: Mutex<Vec<PhaseListener>>,
    post_restart: Mutex<Vec<PhaseListener>>,
    holds: AtomicUsize,
    holds_notify: tokio::sync::Notify,
    modified: AtomicBool,
    token: CancellationToken,
    excl: Arc<ExclShared>,
    released: AtomicBool,
    bus: Bus,
    sem: Option<Arc<Semaphore>>,
}

impl TxnInner {
    pub(crate) fn new_update(
        id: u64,
        controller_id: u64,
        excl: Arc<ExclShared>,
        bus: Bus,
        sem: Option<Arc<Semaphore>>,
    ) -> Arc<Self> {
        Self::new(KIND_UPDATE, id, controller_id, excl, bus, sem)
    }

    pub(crate) fn new_read(
        id: u64,
        controller_id: u64,
        excl: Arc<ExclShared>,
        bus: Bus,
        sem: Option<Arc<Semaphore>>,
    ) -> Arc<Self> {
        Self::new(KIND_READ, id, controller_id, excl, bus, sem)
    }

    fn new(
        kind: u8,
        id: u64,
        controller_id: u64,
        excl: Arc<ExclShared>,
        bus: Bus,
        sem: Option<Arc<Semaphore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            controller_id,
            kind: AtomicU8::new(kind),
            phase: Mutex::new(TxnPhase::Active),
            graph: Mutex::new(TaskGraph::new()),
            sched: tokio::sync::Notify::new(),
            report: ProblemReport::new(),
            attachments: Mutex::new(HashMap::new()),
            post_prepare: Mutex::new(Vec::new()),
            post_restart: Mutex::new(Vec::new()),
            holds: AtomicUsize::new(0),
            holds_notify: tokio::sync::Notify::new(),
            modified: AtomicBool::new(false),
            token: CancellationToken::new(),
            excl,
            released: AtomicBool::new(false),
            bus,
            sem,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn matches_controller(&self, controller_id: u64) -> bool {
        self.controller_id == controller_id
    }

    pub(crate) fn report(&self) -> &ProblemReport {
        &self.report
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn phase(&self) -> TxnPhase {
        *lock(&self.phase)
    }

    pub(crate) fn set_phase(&self, to: TxnPhase) {
        *lock(&self.phase) = to;
    }

    /// Atomically moves from one of `from` to `to`; anything else fails
    /// without side effects.
    pub(crate) fn begin_phase(
        &self,
        from: &[TxnPhase],
        to: TxnPhase,
        op: &'static str,
    ) -> Result<TxnPhase, TxnError> {
        let mut phase = lock(&self.phase);
        if from.contains(&*phase) {
            let prev = *phase;
            *phase = to;
            Ok(prev)
        } else {
            Err(TxnError::InvalidState { op, phase: *phase })
        }
    }

    pub(crate) fn ensure_active(&self, op: &'static str) -> Result<(), TxnError> {
        let phase = self.phase();
        if phase == TxnPhase::Active {
            Ok(())
        } else {
            Err(TxnError::InvalidState { op, phase })
        }
    }

    /// Tasks may be staged while the transaction is Active, and by tasks and
    /// listeners while the prepare fixed point is still being driven.
    pub(crate) fn ensure_accepts_tasks(&self, op: &'static str) -> Result<(), TxnError> {
        let phase = self.phase();
        if matches!(phase, TxnPhase::Active | TxnPhase::Preparing) {
            Ok(())
        } else {
            Err(TxnError::InvalidState { op, phase })
        }
    }

    pub(crate) fn set_modified(&self) {
        self.modified.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Relaxed)
    }

    pub(crate) fn kind_is_update(&self) -> bool {
        self.kind.load(Ordering::SeqCst) == KIND_UPDATE
    }

    pub(crate) fn make_update(&self) {
        self.kind.store(KIND_UPDATE, Ordering::SeqCst);
    }

    pub(crate) fn make_read(&self) {
        self.kind.store(KIND_READ, Ordering::SeqCst);
    }

    pub(crate) fn stage_task(
        &self,
        exec: ExecFn,
        revert: Option<RevertFn>,
        commit: Option<CommitFn>,
        validate: Option<ValidateFn>,
        deps: Vec<TaskId>,
        parent: Option<TaskId>,
    ) -> TaskId {
        let id = self
            .graph_lock()
            .add(exec, revert, commit, validate, deps, parent);
        self.sched.notify_one();
        id
    }

    pub(crate) fn task_count(&self) -> usize {
        self.graph_lock().len()
    }

    pub(crate) fn add_post_prepare_internal(&self, listener: PhaseListener) {
        lock(&self.post_prepare).push(listener);
    }

    pub(crate) fn add_post_restart_internal(&self, listener: PhaseListener) {
        lock(&self.post_restart).push(listener);
    }

    /// Typed attachment lookup-or-insert; returns whether this call created
    /// the value.
    pub(crate) fn attachment_or_init<T, F>(&self, survives_restart: bool, init: F) -> (Arc<T>, bool)
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut map = lock(&self.attachments);
        if let Some(entry) = map.get(&TypeId::of::<T>()) {
            if let Ok(value) = entry.value.clone().downcast::<T>() {
                return (value, false);
            }
        }
        let value = Arc::new(init());
        map.insert(
            TypeId::of::<T>(),
            AttachmentEntry {
                value: value.clone(),
                survives_restart,
            },
        );
        (value, true)
    }

    fn graph_lock(&self) -> MutexGuard<'_, TaskGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs staged tasks until nothing is running and nothing is eligible.
    ///
    /// Eligible tasks are spawned concurrently; mid-flight task creation
    /// wakes the loop through `sched`.
    pub(crate) async fn drive_execute(self: &Arc<Self>) {
        let mut join: JoinSet<(TaskId, TaskOutcome, Option<String>)> = JoinSet::new();
        loop {
            let batch = self.graph_lock().take_ready();
            for (id, exec) in batch {
                let ctx = TaskContext::new(self.clone(), id);
                let sem = self.sem.clone();
                join.spawn(async move {
                    let _permit = match sem {
                        Some(sem) => sem.acquire_owned().await.ok(),
                        None => None,
                    };
                    match AssertUnwindSafe(exec(ctx)).catch_unwind().await {
                        Ok(outcome) => (id, outcome, None),
                        Err(panic) => (id, TaskOutcome::Completed, Some(panic_reason(&panic))),
                    }
                });
            }
            if self.graph_lock().idle() {
                break;
            }
            tokio::select! {
                Some(res) = join.join_next() => {
                    // The wrapper future cannot panic (user panics are caught
                    // above), so join errors carry nothing to reconcile.
                    if let Ok((id, outcome, panicked)) = res {
                        if let Some(reason) = panicked {
                            self.report.add(Problem::new(Severity::Critical, reason));
                        }
                        self.graph_lock().complete_body(id, outcome);
                    }
                }
                _ = self.sched.notified() => {}
            }
        }
    }

    /// Drives EXECUTE and the post-prepare listeners to a fixed point, then
    /// runs validate hooks.
    pub(crate) async fn drive_prepare(self: &Arc<Self>, handle: &UpdateTransaction) {
        loop {
            self.drive_execute().await;
            let listeners: Vec<PhaseListener> = lock(&self.post_prepare).drain(..).collect();
            if listeners.is_empty() {
                break;
            }
            for listener in listeners {
                self.call_listener(listener, handle);
            }
        }
        let validates = self.graph_lock().validate_batch();
        let ctx = ValidateContext::new(&self.report);
        for validate in validates {
            if std::panic::catch_unwind(AssertUnwindSafe(|| validate(&ctx))).is_err() {
                self.report
                    .add(Problem::new(Severity::Critical, "validate hook panicked"));
            }
        }
    }

    /// Runs revert hooks of executed tasks in reverse topological order.
    pub(crate) async fn drive_revert(&self) {
        let batch = self.graph_lock().revert_batch();
        for revert in batch {
            if AssertUnwindSafe(revert()).catch_unwind().await.is_err() {
                self.report
                    .add(Problem::new(Severity::Critical, "revert hook panicked"));
            }
        }
    }

    /// Runs commit hooks of executed tasks in topological order.
    pub(crate) async fn drive_commit(&self) {
        let batch = self.graph_lock().commit_batch();
        for commit in batch {
            if AssertUnwindSafe(commit()).catch_unwind().await.is_err() {
                self.report
                    .add(Problem::new(Severity::Critical, "commit hook panicked"));
            }
        }
    }

    /// Resets task, problem and attachment state for restart; post-restart
    /// listeners fire on the fresh Active phase.
    pub(crate) fn reset_for_restart(&self) -> Vec<PhaseListener> {
        self.graph_lock().clear();
        self.report.clear();
        lock(&self.attachments).retain(|_, entry| entry.survives_restart);
        lock(&self.post_prepare).clear();
        lock(&self.post_restart).drain(..).collect()
    }

    pub(crate) fn call_listener(&self, listener: PhaseListener, handle: &UpdateTransaction) {
        if std::panic::catch_unwind(AssertUnwindSafe(|| listener(handle))).is_err() {
            self.bus
                .publish(Event::now(EventKind::ListenerPanicked).with_txn(self.id));
        }
    }

    pub(crate) async fn wait_no_holds(&self) {
        loop {
            let notified = self.holds_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.holds.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }

    /// Returns the exclusion slot to the controller. Idempotent; also runs
    /// on final drop so abandoned transactions cannot wedge the controller.
    pub(crate) fn release_exclusion(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.kind_is_update() {
            self.excl.release_update();
        } else {
            self.excl.release_read();
        }
    }
}

impl Drop for TxnInner {
    fn drop(&mut self) {
        self.release_exclusion();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task hook panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task hook panicked: {s}")
    } else {
        "task hook panicked".to_string()
    }
}

/// An update transaction: exclusive per controller, stages mutations.
///
/// Handles are cheap clones of one underlying transaction. The exclusion
/// slot is returned when the transaction commits, aborts, or the last handle
/// is dropped.
#[derive(Clone)]
pub struct UpdateTransaction {
    pub(crate) inner: Arc<TxnInner>,
}

impl UpdateTransaction {
    /// Unique id of this transaction.
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    /// Current phase.
    pub fn phase(&self) -> TxnPhase {
        self.inner.phase()
    }

    /// True once the prepare fixed point was reached.
    pub fn is_prepared(&self) -> bool {
        self.inner.phase() == TxnPhase::Prepared
    }

    /// Starts building a root-level task.
    pub fn new_task(&self) -> TaskBuilder {
        TaskBuilder::new(self.inner.clone(), None)
    }

    /// The transaction's problem report.
    pub fn report(&self) -> &ProblemReport {
        self.inner.report()
    }

    /// Records a problem on the report.
    pub fn add_problem(&self, severity: Severity, message: impl Into<String>) {
        self.inner.report().add(Problem::new(severity, message));
    }

    /// Registers a post-prepare listener; it runs after EXECUTE reaches its
    /// fixed point and may stage further tasks, which execute before the
    /// transaction becomes Prepared.
    pub fn add_post_prepare<F>(&self, listener: F) -> Result<(), TxnError>
    where
        F: FnOnce(&UpdateTransaction) + Send + 'static,
    {
        self.inner.ensure_active("add post-prepare listener")?;
        self.inner.add_post_prepare_internal(Box::new(listener));
        Ok(())
    }

    /// Registers a post-restart listener, invoked after `restart` reverted
    /// the task set and re-entered the Active phase.
    pub fn add_post_restart<F>(&self, listener: F) -> Result<(), TxnError>
    where
        F: FnOnce(&UpdateTransaction) + Send + 'static,
    {
        self.inner.ensure_active("add post-restart listener")?;
        self.inner.add_post_restart_internal(Box::new(listener));
        Ok(())
    }

    /// Pins the transaction in its Active phase; `prepare` blocks until
    /// every hold handle is dropped.
    pub fn acquire_hold(&self) -> Result<HoldHandle, TxnError> {
        self.inner.ensure_active("acquire hold handle")?;
        self.inner.holds.fetch_add(1, Ordering::SeqCst);
        Ok(HoldHandle {
            inner: self.inner.clone(),
        })
    }

    /// Typed attachment, created on first access. Dropped on restart.
    pub fn attachment<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.inner.attachment_or_init(false, init).0
    }

    /// Typed attachment that survives `restart`.
    pub fn attachment_survivable<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.inner.attachment_or_init(true, init).0
    }

    /// Token cancelled when the transaction aborts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token().clone()
    }
}

impl std::fmt::Debug for UpdateTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateTransaction")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

/// A read transaction: shares the controller with other readers, never
/// overlaps an update transaction. Ends when the last handle is dropped.
#[derive(Clone)]
pub struct ReadTransaction {
    pub(crate) inner: Arc<TxnInner>,
}

impl ReadTransaction {
    /// Unique id of this transaction.
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    /// Current phase.
    pub fn phase(&self) -> TxnPhase {
        self.inner.phase()
    }
}

impl std::fmt::Debug for ReadTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

/// RAII pin keeping an update transaction in its Active phase.
pub struct HoldHandle {
    inner: Arc<TxnInner>,
}

impl Drop for HoldHandle {
    fn drop(&mut self) {
        self.inner.holds.fetch_sub(1, Ordering::SeqCst);
        self.inner.holds_notify.notify_waiters();
    }
}
