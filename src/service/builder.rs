//! # Service installation.
//!
//! A [`ServiceBuilder`] collects the name, aliases, mode, service object and
//! dependency edges, then [`install`](ServiceBuilder::install)s the lot
//! atomically: the holder slots are bound (duplicates unwind), the cycle
//! check runs over the bound graph (cycles unwind), and only then do edges
//! bind and the state machine run. The installation stages a revert
//! obligation so an aborting transaction detaches the controller again.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::ServiceError;
use crate::name::ServiceName;
use crate::service::controller::{ServiceController, State};
use crate::service::dependency::{Dependency, DependencyFlags};
use crate::service::mode::ServiceMode;
use crate::service::registry::ServiceRegistry;
use crate::service::service::{ServiceRef, VoidService};
use crate::txn::{TaskContext, UpdateTransaction};

/// Entry point for installing services inside an update transaction.
///
/// Obtained from
/// [`TransactionController::service_context`](crate::TransactionController::service_context),
/// or from [`StartContext::service_context`](crate::StartContext::service_context)
/// for child services.
pub struct ServiceContext {
    txn: UpdateTransaction,
    parent: Option<ParentLink>,
}

#[derive(Clone)]
struct ParentLink {
    task: TaskContext,
    controller: Arc<ServiceController>,
}

impl ServiceContext {
    pub(crate) fn new(txn: UpdateTransaction) -> Self {
        Self { txn, parent: None }
    }

    pub(crate) fn for_parent(task: TaskContext, controller: Arc<ServiceController>) -> Self {
        Self {
            txn: task.update_txn(),
            parent: Some(ParentLink { task, controller }),
        }
    }

    /// The transaction this context is bound to.
    pub fn txn(&self) -> &UpdateTransaction {
        &self.txn
    }

    /// Starts building a service under `name` in `registry`.
    ///
    /// For a parent-bound context the parent must currently be STARTING;
    /// the new service gets a parent edge and is removed when the parent
    /// goes down.
    pub fn add_service(
        &self,
        registry: &Arc<ServiceRegistry>,
        name: impl Into<ServiceName>,
    ) -> Result<ServiceBuilder, ServiceError> {
        self.txn.inner.ensure_accepts_tasks("add service")?;
        if !self.txn.inner.matches_controller(registry.controller_id()) {
            return Err(ServiceError::ForeignRegistry);
        }
        if let Some(parent) = &self.parent {
            if parent.controller.state() != State::Starting {
                return Err(ServiceError::ParentNotStarting {
                    name: parent.controller.name().clone(),
                });
            }
        }
        Ok(ServiceBuilder {
            txn: self.txn.clone(),
            registry: registry.clone(),
            name: name.into(),
            aliases: Vec::new(),
            service: None,
            mode: ServiceMode::default(),
            deps: Vec::new(),
            parent: self.parent.clone(),
        })
    }
}

struct DepSpec {
    registry: Option<Arc<ServiceRegistry>>,
    name: ServiceName,
    flags: DependencyFlags,
}

/// Collects a service definition and installs it.
pub struct ServiceBuilder {
    txn: UpdateTransaction,
    registry: Arc<ServiceRegistry>,
    name: ServiceName,
    aliases: Vec<ServiceName>,
    service: Option<ServiceRef>,
    mode: ServiceMode,
    deps: Vec<DepSpec>,
    parent: Option<ParentLink>,
}

impl std::fmt::Debug for ServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ServiceBuilder {
    /// Sets the service mode (default: [`ServiceMode::Active`]).
    pub fn set_mode(mut self, mode: ServiceMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the service object (default: a no-op placeholder).
    pub fn set_service(mut self, service: ServiceRef) -> Self {
        self.service = Some(service);
        self
    }

    /// Adds alias names resolving to the same controller.
    pub fn add_aliases<I, N>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<ServiceName>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Adds a dependency on `name` in the same registry with default flags.
    pub fn add_dependency(self, name: impl Into<ServiceName>) -> Self {
        self.add_dependency_with(name, DependencyFlags::default())
    }

    /// Adds a dependency on `name` in the same registry.
    pub fn add_dependency_with(mut self, name: impl Into<ServiceName>, flags: DependencyFlags) -> Self {
        self.deps.push(DepSpec {
            registry: None,
            name: name.into(),
            flags,
        });
        self
    }

    /// Adds a dependency on `name` in another registry of the same
    /// transaction controller.
    pub fn add_dependency_on(
        mut self,
        registry: &Arc<ServiceRegistry>,
        name: impl Into<ServiceName>,
        flags: DependencyFlags,
    ) -> Self {
        self.deps.push(DepSpec {
            registry: Some(registry.clone()),
            name: name.into(),
            flags,
        });
        self
    }

    /// Atomically installs the service.
    ///
    /// Fails with `DuplicateService` when any of the names is taken, with
    /// `Cycle` when the new edges would close a dependency loop, and with
    /// `ForeignRegistry` when a dependency registry belongs to a different
    /// transaction controller. Failure leaves every holder slot unchanged.
    pub fn install(self) -> Result<Arc<ServiceController>, ServiceError> {
        let ServiceBuilder {
            txn,
            registry,
            name,
            aliases,
            service,
            mode,
            deps,
            parent,
        } = self;
        txn.inner.ensure_accepts_tasks("install service")?;
        txn.inner.set_modified();
        for dep in &deps {
            if let Some(dep_registry) = &dep.registry {
                if dep_registry.controller_id() != registry.controller_id() {
                    return Err(ServiceError::ForeignRegistry);
                }
            }
        }

        let primary = registry.get_or_create_registration(&name);
        let mut alias_regs = Vec::new();
        let mut seen = HashSet::new();
        for alias in aliases {
            if alias != name && seen.insert(alias.clone()) {
                alias_regs.push(registry.get_or_create_registration(&alias));
            }
        }
        let mut edges = Vec::new();
        for dep in &deps {
            let target_registry = dep.registry.as_ref().unwrap_or(&registry);
            let target = target_registry.get_or_create_registration(&dep.name);
            edges.push(Dependency::new(target, dep.flags));
        }
        if let Some(parent) = &parent {
            edges.push(Dependency::new(
                parent.controller.primary_registration().clone(),
                DependencyFlags::parent_edge(),
            ));
        }

        let controller = Arc::new(ServiceController::new(
            registry.controller_id(),
            primary.clone(),
            alias_regs.clone(),
            edges,
            service.unwrap_or_else(|| Arc::new(VoidService)),
            mode,
            registry.bus().clone(),
        ));

        primary.install_holder(&controller)?;
        for (bound, alias_reg) in alias_regs.iter().enumerate() {
            if let Err(e) = alias_reg.install_holder(&controller) {
                for reg in &alias_regs[..bound] {
                    reg.rollback_holder();
                }
                primary.rollback_holder();
                return Err(e);
            }
        }
        if let Err(e) = detect_cycle(&controller) {
            for reg in &alias_regs {
                reg.rollback_holder();
            }
            primary.rollback_holder();
            return Err(e);
        }

        // created before any lifecycle task so its revert runs last on
        // abort, after started services were stopped again
        let revert_ctl = controller.clone();
        let task = match &parent {
            Some(parent) => parent.task.new_task(),
            None => txn.new_task(),
        };
        task.revert(move || async move { revert_ctl.revert_install() })
            .release_internal();

        registry.keep_alive(&controller);
        controller.complete_install(&txn);
        Ok(controller)
    }
}

/// DFS over the outgoing edges of the freshly bound controller, recursing
/// through each target's holder. Reaching the new controller again is a
/// cycle; the registration binding is unwound by the caller.
fn detect_cycle(root: &Arc<ServiceController>) -> Result<(), ServiceError> {
    let root_ptr = Arc::as_ptr(root);
    let mut visited: HashSet<*const ServiceController> = HashSet::new();
    let mut path: Vec<ServiceName> = vec![root.name().clone()];
    let mut stack: Vec<(Arc<ServiceController>, usize)> = vec![(root.clone(), 0)];
    loop {
        let (controller, edge_idx) = match stack.last_mut() {
            None => break,
            Some(frame) => {
                let idx = frame.1;
                frame.1 += 1;
                (frame.0.clone(), idx)
            }
        };
        let edges = controller.dependency_edges();
        if edge_idx >= edges.len() {
            stack.pop();
            path.pop();
            continue;
        }
        let Some(next) = edges[edge_idx].target().holder() else {
            continue;
        };
        if Arc::as_ptr(&next) == root_ptr {
            path.push(next.name().clone());
            return Err(ServiceError::Cycle { path });
        }
        if visited.insert(Arc::as_ptr(&next)) {
            path.push(next.name().clone());
            stack.push((next, 0));
        }
    }
    Ok(())
}
