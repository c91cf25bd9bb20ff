//! Transactions, the task runtime, and the transaction controller.

mod controller;
mod graph;
mod problem;
mod task;
mod transaction;

pub use controller::TransactionController;
pub use problem::{Problem, ProblemReport, Severity};
pub use task::{TaskBuilder, TaskContext, TaskHandle, TaskOutcome, ValidateContext};
pub use transaction::{HoldHandle, ReadTransaction, TxnPhase, UpdateTransaction};
