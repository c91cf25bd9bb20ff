//! # Registrations: named slots inside a registry.
//!
//! A registration holds at most one controller (weakly; the registry keeps
//! the strong reference), the set of incoming dependency edges pointing at
//! the name, and a demand counter whose 0↔1 transitions are forwarded to
//! the holder. Registrations are visible to readers as soon as created and
//! disappear once both the holder and the incoming edges are gone.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ServiceError;
use crate::name::ServiceName;
use crate::service::controller::ServiceController;
use crate::service::dependency::Dependency;
use crate::service::registry::ServiceRegistry;
use crate::service::State;
use crate::txn::{TaskHandle, UpdateTransaction};

pub(crate) struct Registration {
    name: ServiceName,
    registry: Weak<ServiceRegistry>,
    inner: Mutex<RegistrationInner>,
}

struct RegistrationInner {
    holder: Weak<ServiceController>,
    incoming: Vec<Arc<Dependency>>,
    demand: usize,
}

impl Registration {
    pub(crate) fn new(name: ServiceName, registry: &Arc<ServiceRegistry>) -> Arc<Self> {
        Arc::new(Self {
            name,
            registry: Arc::downgrade(registry),
            inner: Mutex::new(RegistrationInner {
                holder: Weak::new(),
                incoming: Vec::new(),
                demand: 0,
            }),
        })
    }

    pub(crate) fn name(&self) -> &ServiceName {
        &self.name
    }

    pub(crate) fn registry(&self) -> Option<Arc<ServiceRegistry>> {
        self.registry.upgrade()
    }

    pub(crate) fn holder(&self) -> Option<Arc<ServiceController>> {
        self.lock().holder.upgrade()
    }

    /// Check-and-set of the holder slot; at most one controller per name.
    pub(crate) fn install_holder(
        &self,
        controller: &Arc<ServiceController>,
    ) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        if inner.holder.upgrade().is_some() {
            return Err(ServiceError::DuplicateService {
                name: self.name.clone(),
            });
        }
        inner.holder = Arc::downgrade(controller);
        Ok(())
    }

    /// Unwinds a partially bound installation; no transaction bookkeeping.
    pub(crate) fn rollback_holder(self: &Arc<Self>) {
        self.lock().holder = Weak::new();
        self.maybe_gc();
    }

    /// Removes the holder and schedules the required-dependencies check for
    /// the next PREPARE pass.
    pub(crate) fn clear_holder(self: &Arc<Self>, txn: &UpdateTransaction) {
        self.touch_validation(txn);
        self.lock().holder = Weak::new();
        self.maybe_gc();
    }

    /// Adds an incoming edge, seeding its cached bit under this lock;
    /// returns whether the holder is currently UP.
    pub(crate) fn add_incoming(
        self: &Arc<Self>,
        edge: Arc<Dependency>,
        txn: &UpdateTransaction,
    ) -> bool {
        self.touch_validation(txn);
        let mut inner = self.lock();
        let up = inner
            .holder
            .upgrade()
            .is_some_and(|c| c.state() == State::Up);
        edge.seed_target_state(up);
        inner.incoming.push(edge);
        up
    }

    pub(crate) fn remove_incoming(self: &Arc<Self>, edge: &Arc<Dependency>) {
        self.lock().incoming.retain(|e| !Arc::ptr_eq(e, edge));
        self.maybe_gc();
    }

    /// Broadcasts UP to every incoming edge. Edge state is cached, so edges
    /// that already observed UP ignore the broadcast.
    pub(crate) fn service_up(&self, txn: &UpdateTransaction) {
        let inner = self.lock();
        for edge in &inner.incoming {
            edge.on_target_up(txn);
        }
    }

    /// Broadcasts DOWN to every incoming edge, collecting the lifecycle
    /// tasks the dependents staged in response.
    pub(crate) fn service_down(&self, txn: &UpdateTransaction) -> Vec<TaskHandle> {
        let inner = self.lock();
        inner
            .incoming
            .iter()
            .filter_map(|edge| edge.on_target_down(txn))
            .collect()
    }

    /// Demand forwarded from an edge; the 0→1 boundary reaches the holder.
    pub(crate) fn add_demand(&self, txn: &UpdateTransaction) {
        let holder = {
            let mut inner = self.lock();
            inner.demand += 1;
            if inner.demand > 1 {
                None
            } else {
                inner.holder.upgrade()
            }
        };
        if let Some(controller) = holder {
            controller.demand(txn);
        }
    }

    /// Undemand forwarded from an edge; the 1→0 boundary reaches the holder.
    pub(crate) fn remove_demand(&self, txn: &UpdateTransaction) {
        let holder = {
            let mut inner = self.lock();
            inner.demand = inner.demand.saturating_sub(1);
            if inner.demand > 0 {
                None
            } else {
                inner.holder.upgrade()
            }
        };
        if let Some(controller) = holder {
            controller.undemand(txn);
        }
    }

    /// Counter-only variant used by installation rollback.
    pub(crate) fn remove_demand_silent(&self) {
        let holder = {
            let mut inner = self.lock();
            inner.demand = inner.demand.saturating_sub(1);
            if inner.demand > 0 {
                None
            } else {
                inner.holder.upgrade()
            }
        };
        if let Some(controller) = holder {
            controller.undemand_silent();
        }
    }

    pub(crate) fn enable_registry(&self, txn: &UpdateTransaction) {
        if let Some(controller) = self.holder() {
            controller.enable_registry(txn);
        }
    }

    pub(crate) fn disable_registry(&self, txn: &UpdateTransaction) {
        if let Some(controller) = self.holder() {
            controller.disable_registry(txn);
        }
    }

    pub(crate) fn remove_service(&self, txn: &UpdateTransaction) {
        if let Some(controller) = self.holder() {
            controller.remove_cascade(txn);
        }
    }

    /// Runs the required-dependency check over the incoming edges.
    pub(crate) fn validate_required(&self, report: &crate::txn::ProblemReport) {
        let (present, edges) = {
            let inner = self.lock();
            (inner.holder.upgrade().is_some(), inner.incoming.clone())
        };
        for edge in edges {
            edge.validate(present, report);
        }
    }

    /// Registers this registration with the transaction's validation set;
    /// the set runs as a post-prepare listener and re-arms itself if later
    /// mutations touch more registrations.
    fn touch_validation(self: &Arc<Self>, txn: &UpdateTransaction) {
        let (check, _created) = txn
            .inner
            .attachment_or_init::<RequiredDepsCheck, _>(false, RequiredDepsCheck::default);
        check.add(self.clone());
        if !check.armed.swap(true, Ordering::SeqCst) {
            let check = check.clone();
            txn.inner
                .add_post_prepare_internal(Box::new(move |txn| check.run(txn)));
        }
    }

    fn maybe_gc(self: &Arc<Self>) {
        let gone = {
            let inner = self.lock();
            inner.holder.upgrade().is_none() && inner.incoming.is_empty() && inner.demand == 0
        };
        if gone {
            if let Some(registry) = self.registry() {
                registry.forget_registration(self);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistrationInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-transaction set of registrations whose required dependencies must be
/// re-checked at PREPARE.
#[derive(Default)]
struct RequiredDepsCheck {
    regs: Mutex<Vec<Arc<Registration>>>,
    armed: AtomicBool,
}

impl RequiredDepsCheck {
    fn add(&self, registration: Arc<Registration>) {
        let mut regs = self.regs.lock().unwrap_or_else(PoisonError::into_inner);
        if !regs.iter().any(|r| Arc::ptr_eq(r, &registration)) {
            regs.push(registration);
        }
    }

    fn run(&self, txn: &UpdateTransaction) {
        self.armed.store(false, Ordering::SeqCst);
        let regs: Vec<Arc<Registration>> = {
            let mut regs = self.regs.lock().unwrap_or_else(PoisonError::into_inner);
            regs.drain(..).collect()
        };
        for registration in regs {
            registration.validate_required(txn.report());
        }
    }
}
