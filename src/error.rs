//! # Error types used by the transaction runtime and the service layer.
//!
//! This module defines two main error enums:
//!
//! - [`TxnError`] errors raised by transaction lifecycle operations.
//! - [`ServiceError`] errors raised by service, builder and registry
//!   operations.
//!
//! Both types are synchronous failures: the operation that produced them had
//! no effect on container state. Asynchronous, user-level failures travel
//! through the transaction's [`ProblemReport`](crate::ProblemReport) instead.
//!
//! Both types provide `as_label` returning a short stable label for
//! logs/metrics.

use thiserror::Error;

use crate::name::ServiceName;
use crate::txn::TxnPhase;

/// # Errors produced by transaction lifecycle operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TxnError {
    /// The transaction is not in a phase from which the requested operation
    /// is legal. Phase transitions are one-way; repeating or reordering them
    /// fails here with no side effects.
    #[error("transaction is {phase:?}; cannot {op}")]
    InvalidState {
        /// The operation that was attempted.
        op: &'static str,
        /// The phase the transaction was in.
        phase: TxnPhase,
    },

    /// The problem report holds error-or-worse problems; the transaction
    /// must be aborted instead.
    #[error("{problems} blocking problem(s) reported; commit refused")]
    CannotCommit {
        /// Number of problems at ERROR severity or above.
        problems: usize,
    },

    /// The transaction was created by a different transaction controller.
    #[error("transaction belongs to a different transaction controller")]
    ForeignTransaction,
}

impl TxnError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TxnError::InvalidState { .. } => "txn_invalid_state",
            TxnError::CannotCommit { .. } => "txn_cannot_commit",
            TxnError::ForeignTransaction => "txn_foreign_controller",
        }
    }
}

/// # Errors produced by service, builder and registry operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A service is already installed under this name.
    #[error("service '{name}' is already installed")]
    DuplicateService {
        /// The contested name.
        name: ServiceName,
    },

    /// Installing the service would create a dependency cycle.
    #[error("installation would create a dependency cycle: {}", fmt_cycle(.path))]
    Cycle {
        /// The names along the detected cycle, starting and ending at the
        /// service being installed.
        path: Vec<ServiceName>,
    },

    /// A required service lookup found nothing under the name.
    #[error("required service '{name}' not found")]
    ServiceNotFound {
        /// The missing name.
        name: ServiceName,
    },

    /// The target service has been removed (or is being removed); removed
    /// services are terminal.
    #[error("service '{name}' has been removed")]
    CannotOperateOnRemoved {
        /// The removed service's name.
        name: ServiceName,
    },

    /// `retry` requires the service to be in the FAILED state.
    #[error("service '{name}' is not in the FAILED state")]
    NotInFailedState {
        /// The service's name.
        name: ServiceName,
    },

    /// `restart` requires the service to be in the UP state.
    #[error("service '{name}' is not in the UP state")]
    NotInUpState {
        /// The service's name.
        name: ServiceName,
    },

    /// A dependency (or installation target) referenced a registry created
    /// by a different transaction controller.
    #[error("registry belongs to a different transaction controller")]
    ForeignRegistry,

    /// Child services can only be added while their parent's start is
    /// running.
    #[error("parent service '{name}' is not starting")]
    ParentNotStarting {
        /// The would-be parent's name.
        name: ServiceName,
    },

    /// The underlying transaction refused the operation.
    #[error(transparent)]
    Txn(#[from] TxnError),
}

impl ServiceError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ServiceError::DuplicateService { .. } => "service_duplicate",
            ServiceError::Cycle { .. } => "service_cycle",
            ServiceError::ServiceNotFound { .. } => "service_not_found",
            ServiceError::CannotOperateOnRemoved { .. } => "service_removed",
            ServiceError::NotInFailedState { .. } => "service_not_failed",
            ServiceError::NotInUpState { .. } => "service_not_up",
            ServiceError::ForeignRegistry => "service_foreign_registry",
            ServiceError::ParentNotStarting { .. } => "service_parent_not_starting",
            ServiceError::Txn(e) => e.as_label(),
        }
    }
}

fn fmt_cycle(path: &[ServiceName]) -> String {
    let mut out = String::new();
    for (i, name) in path.iter().enumerate() {
        if i > 0 {
            out.push_str(" -> ");
        }
        out.push_str(&name.to_string());
    }
    out
}
