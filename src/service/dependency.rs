//! # Dependency edges.
//!
//! An edge connects a dependent controller to a dependency registration.
//! Edges translate the target's UP/DOWN broadcasts into
//! `dependency_satisfied` / `dependency_unsatisfied` on the dependent
//! according to the edge's polarity, forward demand when configured to, and
//! cache the last observed target state so redundant broadcasts are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crate::service::controller::ServiceController;
use crate::service::registration::Registration;
use crate::txn::{Problem, ProblemReport, Severity, TaskHandle, UpdateTransaction};

/// Behavior of a single dependency edge.
#[derive(Debug, Clone, Copy)]
pub struct DependencyFlags {
    /// A required dependency must have a holder at PREPARE; a missing one
    /// is reported and blocks commit.
    pub required: bool,
    /// Forward demand/undemand through this edge to the target.
    pub propagate_demand: bool,
    /// Satisfied while the target is UP; with `false` the edge is satisfied
    /// while the target is *not* UP (mutual-exclusion relations).
    pub require_up: bool,
    /// Parent/child containment: when the target goes DOWN the dependent is
    /// removed instead of merely stopping.
    pub parent: bool,
}

impl Default for DependencyFlags {
    fn default() -> Self {
        Self {
            required: true,
            propagate_demand: true,
            require_up: true,
            parent: false,
        }
    }
}

impl DependencyFlags {
    /// A dependency that may be absent at PREPARE without blocking commit.
    pub fn unrequired() -> Self {
        Self {
            required: false,
            ..Self::default()
        }
    }

    /// An edge satisfied while its target is *not* UP.
    pub fn require_down() -> Self {
        Self {
            require_up: false,
            ..Self::default()
        }
    }

    pub(crate) fn parent_edge() -> Self {
        Self {
            required: false,
            propagate_demand: false,
            require_up: true,
            parent: true,
        }
    }
}

/// The up/down relation between a dependent controller and a dependency
/// registration. Owned by the dependent; borrows the registration.
pub(crate) struct Dependency {
    target: Arc<Registration>,
    flags: DependencyFlags,
    dependent: OnceLock<Weak<ServiceController>>,
    /// Last observed target state; written under the target's lock.
    target_up: AtomicBool,
}

impl Dependency {
    pub(crate) fn new(target: Arc<Registration>, flags: DependencyFlags) -> Arc<Self> {
        Arc::new(Self {
            target,
            flags,
            dependent: OnceLock::new(),
            target_up: AtomicBool::new(false),
        })
    }

    pub(crate) fn target(&self) -> &Arc<Registration> {
        &self.target
    }

    pub(crate) fn flags(&self) -> DependencyFlags {
        self.flags
    }

    fn dependent(&self) -> Option<Arc<ServiceController>> {
        self.dependent.get()?.upgrade()
    }

    /// Binds the dependent and folds the target's current state into the
    /// dependent's unsatisfied counter (which starts at the edge count).
    pub(crate) fn set_dependent(
        self: &Arc<Self>,
        controller: &Arc<ServiceController>,
        txn: &UpdateTransaction,
    ) {
        let _ = self.dependent.set(Arc::downgrade(controller));
        // the cached bit is seeded under the target's lock so a concurrent
        // broadcast cannot interleave between binding and seeding
        let up = self.target.add_incoming(self.clone(), txn);
        if up == self.flags.require_up {
            controller.dependency_satisfied(txn);
        }
    }

    /// Seeds the cached bit. Only called under the target's lock.
    pub(crate) fn seed_target_state(&self, up: bool) {
        self.target_up.store(up, Ordering::SeqCst);
    }

    /// Target went UP. Called under the target registration's lock.
    pub(crate) fn on_target_up(&self, txn: &UpdateTransaction) -> Option<TaskHandle> {
        if self.target_up.swap(true, Ordering::SeqCst) {
            return None;
        }
        let dependent = self.dependent()?;
        if self.flags.require_up {
            dependent.dependency_satisfied(txn)
        } else {
            dependent.dependency_unsatisfied(txn)
        }
    }

    /// Target went DOWN. Called under the target registration's lock.
    pub(crate) fn on_target_down(&self, txn: &UpdateTransaction) -> Option<TaskHandle> {
        if !self.target_up.swap(false, Ordering::SeqCst) {
            return None;
        }
        if self.flags.parent {
            let dependent = self.dependent()?;
            return dependent.remove_cascade(txn);
        }
        let dependent = self.dependent()?;
        if self.flags.require_up {
            dependent.dependency_unsatisfied(txn)
        } else {
            dependent.dependency_satisfied(txn)
        }
    }

    pub(crate) fn demand(&self, txn: &UpdateTransaction) {
        if self.flags.propagate_demand {
            self.target.add_demand(txn);
        }
    }

    pub(crate) fn undemand(&self, txn: &UpdateTransaction) {
        if self.flags.propagate_demand {
            self.target.remove_demand(txn);
        }
    }

    /// Counter-only undemand used while rolling back an installation; no
    /// lifecycle transitions are forced.
    pub(crate) fn undemand_silent(&self) {
        if self.flags.propagate_demand {
            self.target.remove_demand_silent();
        }
    }

    /// Detaches this edge from its target when the dependent is removed.
    pub(crate) fn clear_dependent(self: &Arc<Self>) {
        self.target.remove_incoming(self);
    }

    /// Required-dependency check run at PREPARE.
    pub(crate) fn validate(&self, holder_present: bool, report: &ProblemReport) {
        if !self.flags.required || holder_present {
            return;
        }
        let mut problem = Problem::new(
            Severity::Error,
            format!("missing required dependency '{}'", self.target.name()),
        );
        if let Some(dependent) = self.dependent() {
            problem = problem.with_service(dependent.name().clone());
        }
        report.add(problem);
    }
}
