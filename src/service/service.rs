//! # The user-facing service contract.
//!
//! A [`Service`] is an async, stoppable unit of work managed by the
//! container. The container invokes [`start`](Service::start) and
//! [`stop`](Service::stop) from inside transactional tasks; a service never
//! observes container locks being held across its own code.
//!
//! ## Rules
//! - `start` terminates exactly once, by returning a [`StartOutcome`].
//!   Problems may be attached to the transaction before returning.
//! - Timeouts are the service author's responsibility; the container only
//!   exposes the transaction's cancellation token.
//! - The crate provides [`ServiceFn`] — a function-backed implementation
//!   that wraps a pair of closures as a service.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::name::ServiceName;
use crate::service::builder::ServiceContext;
use crate::service::controller::ServiceController;
use crate::txn::{Problem, Severity, TaskContext};

/// Shared handle to a service object.
pub type ServiceRef = Arc<dyn Service>;

/// Type-erased value produced by a successful start.
pub type ServiceValue = Arc<dyn Any + Send + Sync>;

/// Terminating result of a service start.
pub enum StartOutcome {
    /// The service is up, optionally exposing a value to readers.
    Up(Option<ServiceValue>),
    /// The start failed; the controller moves to FAILED and can be retried.
    Failed,
}

impl StartOutcome {
    /// Successful start without a value.
    pub fn up() -> Self {
        StartOutcome::Up(None)
    }

    /// Successful start exposing `value` through the controller.
    pub fn up_with<V: Any + Send + Sync>(value: V) -> Self {
        StartOutcome::Up(Some(Arc::new(value)))
    }

    /// Failed start.
    pub fn failed() -> Self {
        StartOutcome::Failed
    }
}

/// Asynchronous unit of work with a transactional lifecycle.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Brings the service up. Runs inside the starting transaction's task;
    /// long-running work should observe [`StartContext::is_cancelled`].
    async fn start(&self, ctx: StartContext) -> StartOutcome;

    /// Brings the service down. Runs inside the stopping transaction's task
    /// (or inside a rollback when a started transaction aborts).
    async fn stop(&self, ctx: StopContext);
}

/// Context handed to [`Service::start`].
pub struct StartContext {
    task: TaskContext,
    controller: Arc<ServiceController>,
}

impl StartContext {
    pub(crate) fn new(task: TaskContext, controller: Arc<ServiceController>) -> Self {
        Self { task, controller }
    }

    /// Name of the starting service.
    pub fn name(&self) -> &ServiceName {
        self.controller.name()
    }

    /// Attaches a problem to the transaction's report.
    pub fn add_problem(&self, severity: Severity, message: impl Into<String>) {
        self.task
            .report()
            .add(Problem::new(severity, message).with_service(self.name().clone()));
    }

    /// True once the owning transaction was asked to abort.
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// Token cancelled when the owning transaction aborts.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.task.cancellation_token()
    }

    /// A service context for installing child services of this service.
    ///
    /// Children are contained in the parent's start task and removed when
    /// the parent goes down.
    pub fn service_context(&self) -> ServiceContext {
        ServiceContext::for_parent(self.task.clone(), self.controller.clone())
    }
}

enum StopContextInner {
    Task(TaskContext),
    /// Rollback of a start; there is no live task to report through.
    Detached,
}

/// Context handed to [`Service::stop`].
pub struct StopContext {
    inner: StopContextInner,
}

impl StopContext {
    pub(crate) fn from_task(task: TaskContext) -> Self {
        Self {
            inner: StopContextInner::Task(task),
        }
    }

    pub(crate) fn detached() -> Self {
        Self {
            inner: StopContextInner::Detached,
        }
    }

    /// Attaches a problem to the transaction's report, when one is live.
    pub fn add_problem(&self, severity: Severity, message: impl Into<String>) {
        if let StopContextInner::Task(task) = &self.inner {
            task.add_problem(severity, message);
        }
    }

    /// True once the owning transaction was asked to abort.
    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            StopContextInner::Task(task) => task.is_cancelled(),
            StopContextInner::Detached => false,
        }
    }
}

type StartFn = Box<dyn Fn(StartContext) -> BoxFuture<'static, StartOutcome> + Send + Sync>;
type StopFn = Box<dyn Fn(StopContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Function-backed [`Service`] implementation.
///
/// ## Example
///
/// ```
/// use servisor::{ServiceFn, StartOutcome};
///
/// let svc = ServiceFn::arc(
///     |_ctx| async { StartOutcome::up() },
///     |_ctx| async {},
/// );
/// # let _ = svc;
/// ```
pub struct ServiceFn {
    start: StartFn,
    stop: StopFn,
}

impl ServiceFn {
    /// Wraps a start and a stop closure as a shared service handle.
    pub fn arc<FS, SFut, FT, TFut>(start: FS, stop: FT) -> ServiceRef
    where
        FS: Fn(StartContext) -> SFut + Send + Sync + 'static,
        SFut: Future<Output = StartOutcome> + Send + 'static,
        FT: Fn(StopContext) -> TFut + Send + Sync + 'static,
        TFut: Future<Output = ()> + Send + 'static,
    {
        Arc::new(Self {
            start: Box::new(move |ctx| Box::pin(start(ctx))),
            stop: Box::new(move |ctx| Box::pin(stop(ctx))),
        })
    }
}

#[async_trait]
impl Service for ServiceFn {
    async fn start(&self, ctx: StartContext) -> StartOutcome {
        (self.start)(ctx).await
    }

    async fn stop(&self, ctx: StopContext) {
        (self.stop)(ctx).await
    }
}

/// Placeholder installed when a builder supplies no service.
pub(crate) struct VoidService;

#[async_trait]
impl Service for VoidService {
    async fn start(&self, _ctx: StartContext) -> StartOutcome {
        StartOutcome::up()
    }

    async fn stop(&self, _ctx: StopContext) {}
}
