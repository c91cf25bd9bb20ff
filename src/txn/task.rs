//! # The task surface of a transaction.
//!
//! Every mutation a transaction performs is staged as a task: a unit with an
//! async executable plus optional revert, commit and validate hooks. Tasks
//! form a DAG through predecessor links ([`TaskBuilder::after`]) and
//! parent/child containment ([`TaskContext::new_task`]).
//!
//! ## Rules
//! - A task enters EXECUTE only after all its predecessors terminated and
//!   its parent entered EXECUTE.
//! - A parent is not EXECUTED until its own body and all children have
//!   terminated.
//! - A task that returns [`TaskOutcome::Cancelled`] never has its revert or
//!   commit hook invoked; successors simply observe it as terminated.
//! - Revert hooks run in reverse creation order on abort; commit hooks run
//!   in creation order on commit. Creation order is a topological order by
//!   construction, so predecessors commit before successors and children
//!   revert before parents.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::TxnError;
use crate::txn::problem::{Problem, ProblemReport, Severity};
use crate::txn::transaction::{TxnInner, UpdateTransaction};

pub(crate) type TaskId = usize;

/// Result of a task executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task did its work; revert/commit hooks participate in the
    /// transaction outcome.
    Completed,
    /// The task declined to act; its revert and commit hooks are skipped.
    Cancelled,
}

pub(crate) type ExecFn = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, TaskOutcome> + Send>;
pub(crate) type RevertFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
pub(crate) type CommitFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
pub(crate) type ValidateFn = Box<dyn FnOnce(&ValidateContext) + Send>;

/// Lifecycle of a single task inside its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    New,
    Executing,
    Executed,
    Cancelled,
    Committed,
    Reverted,
}

/// Identifies a released task; used to order other tasks after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    pub(crate) id: TaskId,
}

/// Builder for a single task.
///
/// Obtained from [`UpdateTransaction::new_task`] (root tasks) or
/// [`TaskContext::new_task`] (child tasks). Dropping the builder without
/// calling [`release`](TaskBuilder::release) stages nothing.
pub struct TaskBuilder {
    txn: Arc<TxnInner>,
    parent: Option<TaskId>,
    exec: Option<ExecFn>,
    revert: Option<RevertFn>,
    commit: Option<CommitFn>,
    validate: Option<ValidateFn>,
    deps: Vec<TaskId>,
}

impl TaskBuilder {
    pub(crate) fn new(txn: Arc<TxnInner>, parent: Option<TaskId>) -> Self {
        Self {
            txn,
            parent,
            exec: None,
            revert: None,
            commit: None,
            validate: None,
            deps: Vec::new(),
        }
    }

    /// Sets the executable. Without one the task completes immediately.
    pub fn execute<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        self.exec = Some(Box::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Sets the revert hook, run when the transaction aborts (skipped for
    /// cancelled tasks).
    pub fn revert<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.revert = Some(Box::new(move || Box::pin(f())));
        self
    }

    /// Sets the commit hook, run when the transaction commits.
    pub fn commit<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.commit = Some(Box::new(move || Box::pin(f())));
        self
    }

    /// Sets the validate hook, run at the end of PREPARE for executed tasks.
    pub fn validate<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&ValidateContext) + Send + 'static,
    {
        self.validate = Some(Box::new(f));
        self
    }

    /// Orders this task after `handle`.
    pub fn after(mut self, handle: TaskHandle) -> Self {
        self.deps.push(handle.id);
        self
    }

    /// Orders this task after every handle in `handles`.
    pub fn after_all<I>(mut self, handles: I) -> Self
    where
        I: IntoIterator<Item = TaskHandle>,
    {
        self.deps.extend(handles.into_iter().map(|h| h.id));
        self
    }

    /// Stages the task into the transaction's DAG.
    ///
    /// Fails with [`TxnError::InvalidState`] once the transaction has moved
    /// past its prepare fixed point.
    pub fn release(self) -> Result<TaskHandle, TxnError> {
        self.txn.ensure_accepts_tasks("release task")?;
        Ok(self.release_internal())
    }

    pub(crate) fn release_internal(self) -> TaskHandle {
        let exec = self
            .exec
            .unwrap_or_else(|| Box::new(|_ctx| Box::pin(async { TaskOutcome::Completed })));
        let id = self.txn.stage_task(
            exec,
            self.revert,
            self.commit,
            self.validate,
            self.deps,
            self.parent,
        );
        TaskHandle { id }
    }
}

/// Handed to every task executable; the task's window into its transaction.
#[derive(Clone)]
pub struct TaskContext {
    txn: Arc<TxnInner>,
    task: TaskId,
}

impl TaskContext {
    pub(crate) fn new(txn: Arc<TxnInner>, task: TaskId) -> Self {
        Self { txn, task }
    }

    /// Creates a child task of the running task. The parent is not
    /// considered EXECUTED until the child terminates.
    pub fn new_task(&self) -> TaskBuilder {
        TaskBuilder::new(self.txn.clone(), Some(self.task))
    }

    /// Records a problem on the transaction's report.
    pub fn add_problem(&self, severity: Severity, message: impl Into<String>) {
        self.txn.report().add(Problem::new(severity, message));
    }

    /// The transaction's problem report.
    pub fn report(&self) -> &ProblemReport {
        self.txn.report()
    }

    /// True once the transaction was asked to abort; long-running bodies
    /// should observe this and return [`TaskOutcome::Cancelled`] promptly.
    pub fn is_cancelled(&self) -> bool {
        self.txn.token().is_cancelled()
    }

    /// Token cancelled when the transaction aborts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.txn.token().clone()
    }

    pub(crate) fn txn_id(&self) -> u64 {
        self.txn.id()
    }

    pub(crate) fn update_txn(&self) -> UpdateTransaction {
        UpdateTransaction {
            inner: self.txn.clone(),
        }
    }
}

/// Passed to validate hooks at the end of PREPARE.
pub struct ValidateContext<'a> {
    report: &'a ProblemReport,
}

impl<'a> ValidateContext<'a> {
    pub(crate) fn new(report: &'a ProblemReport) -> Self {
        Self { report }
    }

    /// Records a problem; ERROR or above blocks commit.
    pub fn add_problem(&self, severity: Severity, message: impl Into<String>) {
        self.report.add(Problem::new(severity, message));
    }

    /// The transaction's problem report.
    pub fn report(&self) -> &ProblemReport {
        self.report
    }
}
