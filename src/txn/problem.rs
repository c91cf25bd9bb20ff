//! # Problem reporting for asynchronous, user-level failures.
//!
//! Task executables never fail through the return channel; they describe
//! what went wrong by attaching [`Problem`]s to the transaction's
//! [`ProblemReport`] and still terminate normally from the runtime's
//! perspective. A problem at [`Severity::Error`] or above blocks commit:
//! the transaction must be aborted.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use crate::name::ServiceName;

/// Severity of a reported problem.
///
/// Ordered: `Info < Warning < Error < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational; never blocks commit.
    Info,
    /// Something suspicious happened; commit still allowed.
    Warning,
    /// A task-level failure; the transaction cannot commit.
    Error,
    /// An unexpected failure (e.g. a panicking hook); the transaction
    /// cannot commit.
    Critical,
}

impl Severity {
    /// True when a problem at this severity prevents the transaction from
    /// committing.
    pub fn blocks_commit(self) -> bool {
        matches!(self, Severity::Error | Severity::Critical)
    }

    /// Returns a short stable label.
    pub fn as_label(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// A single reported problem.
#[derive(Debug, Clone)]
pub struct Problem {
    /// How severe the problem is.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// The service the problem relates to, if any.
    pub service: Option<ServiceName>,
}

impl Problem {
    /// Creates a problem with the given severity and message.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            service: None,
        }
    }

    /// Attaches the service the problem relates to.
    pub fn with_service(mut self, name: ServiceName) -> Self {
        self.service = Some(name);
        self
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Some(name) => write!(f, "[{}] {name}: {}", self.severity.as_label(), self.message),
            None => write!(f, "[{}] {}", self.severity.as_label(), self.message),
        }
    }
}

/// Accumulates the problems reported during one transaction.
#[derive(Default)]
pub struct ProblemReport {
    problems: Mutex<Vec<Problem>>,
}

impl ProblemReport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a problem.
    pub fn add(&self, problem: Problem) {
        self.lock().push(problem);
    }

    /// Highest severity reported so far, if any.
    pub fn max_severity(&self) -> Option<Severity> {
        self.lock().iter().map(|p| p.severity).max()
    }

    /// Number of problems that block commit.
    pub fn blocking_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|p| p.severity.blocks_commit())
            .count()
    }

    /// True when no reported problem blocks commit.
    pub fn allows_commit(&self) -> bool {
        !self.lock().iter().any(|p| p.severity.blocks_commit())
    }

    /// True when nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of all problems in report order.
    pub fn snapshot(&self) -> Vec<Problem> {
        self.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Problem>> {
        self.problems.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
