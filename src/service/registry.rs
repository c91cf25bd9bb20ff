//! # Registries and the service container.
//!
//! A [`ServiceRegistry`] maps names to registrations and carries an enable
//! flag that fans out to every holder controller. The registry also owns
//! the strong references keeping installed controllers alive (registrations
//! themselves only point at their holder weakly).
//!
//! A [`ServiceContainer`] groups the registries created from one
//! transaction controller and can shut the whole tree down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;

use crate::error::{ServiceError, TxnError};
use crate::events::Bus;
use crate::name::ServiceName;
use crate::service::controller::ServiceController;
use crate::service::registration::Registration;
use crate::txn::UpdateTransaction;

/// Named collection of registrations with an enable flag.
pub struct ServiceRegistry {
    controller_id: u64,
    bus: Bus,
    enabled: AtomicBool,
    registrations: DashMap<ServiceName, Arc<Registration>>,
    keepalive: DashMap<ServiceName, Arc<ServiceController>>,
}

impl ServiceRegistry {
    pub(crate) fn new(controller_id: u64, bus: Bus) -> Arc<Self> {
        Arc::new(Self {
            controller_id,
            bus,
            enabled: AtomicBool::new(true),
            registrations: DashMap::new(),
            keepalive: DashMap::new(),
        })
    }

    pub(crate) fn controller_id(&self) -> u64 {
        self.controller_id
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Whether services of this registry may run.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Sets REGISTRY_ENABLED on every holder controller and re-runs their
    /// state machines.
    pub fn enable(&self, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        self.validate(txn)?;
        if self.enabled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for entry in self.registrations.iter() {
            entry.value().enable_registry(txn);
        }
        Ok(())
    }

    /// Clears REGISTRY_ENABLED on every holder controller; running services
    /// stop (and their dependents with them).
    pub fn disable(&self, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        self.validate(txn)?;
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        for entry in self.registrations.iter() {
            entry.value().disable_registry(txn);
        }
        Ok(())
    }

    /// Looks up the controller installed under `name`.
    pub fn get_service(&self, name: impl Into<ServiceName>) -> Option<Arc<ServiceController>> {
        let name = name.into();
        self.registrations.get(&name).and_then(|reg| reg.holder())
    }

    /// Like [`get_service`](Self::get_service) but a missing service is an
    /// error.
    pub fn get_required_service(
        &self,
        name: impl Into<ServiceName>,
    ) -> Result<Arc<ServiceController>, ServiceError> {
        let name = name.into();
        self.registrations
            .get(&name)
            .and_then(|reg| reg.holder())
            .ok_or(ServiceError::ServiceNotFound { name })
    }

    /// Removes every installed service of this registry.
    pub fn remove_all(&self, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        self.validate(txn)?;
        let regs: Vec<Arc<Registration>> = self
            .registrations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for reg in regs {
            reg.remove_service(txn);
        }
        Ok(())
    }

    pub(crate) fn get_or_create_registration(
        self: &Arc<Self>,
        name: &ServiceName,
    ) -> Arc<Registration> {
        self.registrations
            .entry(name.clone())
            .or_insert_with(|| Registration::new(name.clone(), self))
            .clone()
    }

    /// Drops a registration once holder, incoming edges and demand are gone.
    pub(crate) fn forget_registration(&self, reg: &Arc<Registration>) {
        self.registrations
            .remove_if(reg.name(), |_, current| Arc::ptr_eq(current, reg));
    }

    /// The registry owns installed controllers strongly, under every name
    /// they answer to.
    pub(crate) fn keep_alive(&self, controller: &Arc<ServiceController>) {
        for name in controller.registration_names() {
            self.keepalive.insert(name, controller.clone());
        }
    }

    pub(crate) fn release_controller(&self, controller: &Arc<ServiceController>) {
        for name in controller.registration_names() {
            self.keepalive
                .remove_if(&name, |_, current| Arc::ptr_eq(current, controller));
        }
    }

    fn validate(&self, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        if !txn.inner.matches_controller(self.controller_id) {
            return Err(TxnError::ForeignTransaction.into());
        }
        txn.inner.ensure_accepts_tasks("mutate registry")?;
        txn.inner.set_modified();
        Ok(())
    }
}

/// Groups the registries rooted at one transaction controller.
pub struct ServiceContainer {
    controller_id: u64,
    bus: Bus,
    registries: Mutex<Vec<Arc<ServiceRegistry>>>,
}

impl ServiceContainer {
    pub(crate) fn new(controller_id: u64, bus: Bus) -> Arc<Self> {
        Arc::new(Self {
            controller_id,
            bus,
            registries: Mutex::new(Vec::new()),
        })
    }

    /// Creates a registry owned by this container.
    pub fn new_registry(&self) -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::new(self.controller_id, self.bus.clone());
        self.lock().push(registry.clone());
        registry
    }

    /// Removes every service in every registry of this container.
    pub fn shutdown(&self, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        let registries = self.lock().clone();
        for registry in registries {
            registry.remove_all(txn)?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ServiceRegistry>>> {
        self.registries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
