//! # servisor
//!
//! **Servisor** is a transactional service orchestration library.
//!
//! It brings user-defined services up and down in a dependency graph,
//! subject to mode-driven admission and demand propagation, with every
//! mutation staged inside a transaction that prepares, commits, or rolls
//! back as a whole.
//!
//! ## Features
//!
//! | Area             | Description                                                         | Key types / traits                               |
//! |------------------|---------------------------------------------------------------------|--------------------------------------------------|
//! | **Transactions** | Read/update transactions with prepare/commit/abort/restart.         | [`TransactionController`], [`UpdateTransaction`] |
//! | **Task runtime** | DAG of tasks with execute/validate/commit/revert phases.            | [`TaskBuilder`], [`TaskContext`], [`TaskOutcome`]|
//! | **Services**     | Async start/stop units managed per dependency graph.                | [`Service`], [`ServiceFn`], [`ServiceBuilder`]   |
//! | **Controllers**  | Per-service state machine with modes and enable bits.               | [`ServiceController`], [`ServiceMode`], [`State`]|
//! | **Registries**   | Named slots, demand propagation, registry-wide enable.              | [`ServiceRegistry`], [`ServiceContainer`]        |
//! | **Problems**     | Severity-ranked failure reporting that gates commit.                | [`Problem`], [`ProblemReport`], [`Severity`]     |
//! | **Events**       | Broadcast bus with lifecycle and transaction events.                | [`Bus`], [`Event`], [`Observer`]                 |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] observer _(demo/reference only)_.
//!
//! ```no_run
//! use servisor::{ServiceFn, ServiceMode, StartOutcome, TransactionController};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let control = TransactionController::new();
//!     let container = control.create_container();
//!     let registry = container.new_registry();
//!
//!     let txn = control.create_update().await;
//!     let ctx = control.service_context(&txn)?;
//!     ctx.add_service(&registry, "demo.hello")?
//!         .set_mode(ServiceMode::Active)
//!         .set_service(ServiceFn::arc(
//!             |_ctx| async {
//!                 println!("Hello from a service!");
//!                 StartOutcome::up()
//!             },
//!             |_ctx| async {},
//!         ))
//!         .install()?;
//!     control.prepare(&txn).await?;
//!     control.commit(&txn).await?;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod config;
mod error;
mod events;
mod name;
mod observers;
mod service;
mod txn;

// ---- Public re-exports ----

pub use config::Config;
pub use error::{ServiceError, TxnError};
pub use events::{Bus, Event, EventKind};
pub use name::ServiceName;
pub use observers::Observer;
pub use service::{
    DependencyFlags, Service, ServiceBuilder, ServiceContainer, ServiceContext, ServiceController,
    ServiceFn, ServiceMode, ServiceRef, ServiceRegistry, ServiceValue, StartContext, StartOutcome,
    State, StopContext,
};
pub use txn::{
    HoldHandle, Problem, ProblemReport, ReadTransaction, Severity, TaskBuilder, TaskContext,
    TaskHandle, TaskOutcome, TransactionController, TxnPhase, UpdateTransaction, ValidateContext,
};

// Optional: expose a simple built-in logging observer (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use observers::LogWriter;
