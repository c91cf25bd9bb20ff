//! # The per-service state machine.
//!
//! A [`ServiceController`] converges to a stable state from four orthogonal
//! inputs: the mode, the unsatisfied-dependency counter, the demanded-by
//! counter, and the enable bits. Every entry point updates its input under
//! the controller's lock, computes at most one transition decision, and
//! stages the matching lifecycle task *after* the lock is released — no
//! lock is ever held while calling into registrations, other controllers,
//! or user code.
//!
//! Completion listeners are retained under the lock and drained outside it,
//! in FIFO order, each at most once, on the matching terminal transition.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::error::{ServiceError, TxnError};
use crate::events::{Bus, Event, EventKind};
use crate::name::ServiceName;
use crate::service::dependency::Dependency;
use crate::service::lifecycle;
use crate::service::mode::ServiceMode;
use crate::service::registration::Registration;
use crate::service::service::{ServiceRef, ServiceValue};
use crate::txn::{TaskHandle, UpdateTransaction};

/// Externally observable lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not running; may start when the predicates allow.
    Down,
    /// Start task issued, awaiting its completion.
    Starting,
    /// Running.
    Up,
    /// Start failed; retryable.
    Failed,
    /// Stop task issued, awaiting its completion.
    Stopping,
    /// Remove task issued, awaiting its completion.
    Removing,
    /// Terminal.
    Removed,
}

type CompletionFn = Box<dyn FnOnce(&Arc<ServiceController>) + Send>;

/// Transition computed under the lock, staged after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    None,
    Start,
    Stop,
    StopFailed,
    Remove,
}

/// Controls one installed service: its state machine, dependency counters,
/// notification queues, and the lifecycle tasks it issues.
pub struct ServiceController {
    ctl_id: u64,
    primary: Arc<Registration>,
    aliases: Box<[Arc<Registration>]>,
    dependencies: Box<[Arc<Dependency>]>,
    bus: Bus,
    inner: Mutex<ControllerInner>,
}

impl std::fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceController")
            .field("ctl_id", &self.ctl_id)
            .field("name", self.primary.name())
            .finish_non_exhaustive()
    }
}

struct ControllerInner {
    service: ServiceRef,
    replacement: Option<ServiceRef>,
    value: Option<ServiceValue>,
    state: State,
    mode: ServiceMode,
    service_enabled: bool,
    registry_enabled: bool,
    service_removed: bool,
    unsatisfied: usize,
    demanded_by: usize,
    lifecycle_at: Option<Instant>,
    on_enable: Vec<CompletionFn>,
    on_disable: Vec<CompletionFn>,
    on_remove: Vec<CompletionFn>,
    on_replace: Vec<CompletionFn>,
}

impl ServiceController {
    pub(crate) fn new(
        ctl_id: u64,
        primary: Arc<Registration>,
        aliases: Vec<Arc<Registration>>,
        dependencies: Vec<Arc<Dependency>>,
        service: ServiceRef,
        mode: ServiceMode,
        bus: Bus,
    ) -> Self {
        let unsatisfied = dependencies.len();
        Self {
            ctl_id,
            primary,
            aliases: aliases.into_boxed_slice(),
            dependencies: dependencies.into_boxed_slice(),
            bus,
            inner: Mutex::new(ControllerInner {
                service,
                replacement: None,
                value: None,
                state: State::Down,
                mode,
                service_enabled: true,
                registry_enabled: true,
                service_removed: false,
                unsatisfied,
                demanded_by: 0,
                lifecycle_at: None,
                on_enable: Vec::new(),
                on_disable: Vec::new(),
                on_remove: Vec::new(),
                on_replace: Vec::new(),
            }),
        }
    }

    // ---------------------------
    // Introspection
    // ---------------------------

    /// The service's primary name.
    pub fn name(&self) -> &ServiceName {
        self.primary.name()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// The controller's mode.
    pub fn mode(&self) -> ServiceMode {
        self.lock().mode
    }

    /// The current service object (the replacement once applied).
    pub fn service(&self) -> ServiceRef {
        self.lock().service.clone()
    }

    /// Value produced by the last successful start, while UP.
    pub fn value(&self) -> Option<ServiceValue> {
        self.lock().value.clone()
    }

    /// Instant of the last lifecycle change, if any happened yet.
    pub fn lifecycle_changed_at(&self) -> Option<Instant> {
        self.lock().lifecycle_at
    }

    #[doc(hidden)]
    pub fn unsatisfied_count(&self) -> usize {
        self.lock().unsatisfied
    }

    #[doc(hidden)]
    pub fn demanded_by_count(&self) -> usize {
        self.lock().demanded_by
    }

    pub(crate) fn dependency_edges(&self) -> &[Arc<Dependency>] {
        &self.dependencies
    }

    pub(crate) fn primary_registration(&self) -> &Arc<Registration> {
        &self.primary
    }

    pub(crate) fn registration_names(&self) -> Vec<ServiceName> {
        std::iter::once(&self.primary)
            .chain(self.aliases.iter())
            .map(|r| r.name().clone())
            .collect()
    }

    // ---------------------------
    // Public operations
    // ---------------------------

    /// Sets SERVICE_ENABLED and re-runs the state machine.
    pub fn enable(self: &Arc<Self>, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        self.enable_impl(txn, None)
    }

    /// [`enable`](Self::enable) with a completion listener fired once the
    /// service settles UP or FAILED.
    pub fn enable_with<F>(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        listener: F,
    ) -> Result<(), ServiceError>
    where
        F: FnOnce(&Arc<ServiceController>) + Send + 'static,
    {
        self.enable_impl(txn, Some(Box::new(listener)))
    }

    /// Clears SERVICE_ENABLED and re-runs the state machine.
    pub fn disable(self: &Arc<Self>, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        self.disable_impl(txn, None)
    }

    /// [`disable`](Self::disable) with a completion listener fired once the
    /// service settles DOWN.
    pub fn disable_with<F>(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        listener: F,
    ) -> Result<(), ServiceError>
    where
        F: FnOnce(&Arc<ServiceController>) + Send + 'static,
    {
        self.disable_impl(txn, Some(Box::new(listener)))
    }

    /// Marks the service removed; dependents stop, then the controller is
    /// detached from every registration. Idempotent.
    pub fn remove(self: &Arc<Self>, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        self.validate_op(txn)?;
        self.remove_internal(txn, None);
        Ok(())
    }

    /// [`remove`](Self::remove) with a completion listener fired once the
    /// controller reaches REMOVED.
    pub fn remove_with<F>(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        listener: F,
    ) -> Result<(), ServiceError>
    where
        F: FnOnce(&Arc<ServiceController>) + Send + 'static,
    {
        self.validate_op(txn)?;
        self.remove_internal(txn, Some(Box::new(listener)));
        Ok(())
    }

    /// Forces a stop-and-start cycle on a FAILED service.
    pub fn retry(self: &Arc<Self>, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        self.retry_impl(txn, None)
    }

    /// [`retry`](Self::retry) with a completion listener fired once the
    /// service settles UP or FAILED again.
    pub fn retry_with<F>(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        listener: F,
    ) -> Result<(), ServiceError>
    where
        F: FnOnce(&Arc<ServiceController>) + Send + 'static,
    {
        self.retry_impl(txn, Some(Box::new(listener)))
    }

    /// Forces a stop-and-start cycle on an UP service.
    pub fn restart(self: &Arc<Self>, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        self.restart_impl(txn, None)
    }

    /// [`restart`](Self::restart) with a completion listener fired once the
    /// service settles UP or FAILED again.
    pub fn restart_with<F>(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        listener: F,
    ) -> Result<(), ServiceError>
    where
        F: FnOnce(&Arc<ServiceController>) + Send + 'static,
    {
        self.restart_impl(txn, Some(Box::new(listener)))
    }

    /// Swaps the service object. A DOWN service swaps in place; a running
    /// one stops first and restarts with the replacement.
    pub fn replace(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        new_service: ServiceRef,
    ) -> Result<(), ServiceError> {
        self.replace_impl(txn, new_service, None)
    }

    /// [`replace`](Self::replace) with a completion listener fired once the
    /// replacement is in place.
    pub fn replace_with<F>(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        new_service: ServiceRef,
        listener: F,
    ) -> Result<(), ServiceError>
    where
        F: FnOnce(&Arc<ServiceController>) + Send + 'static,
    {
        self.replace_impl(txn, new_service, Some(Box::new(listener)))
    }

    // ---------------------------
    // Operation bodies
    // ---------------------------

    fn enable_impl(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        listener: Option<CompletionFn>,
    ) -> Result<(), ServiceError> {
        self.validate_op(txn)?;
        let (decision, fire) = {
            let mut g = self.lock();
            self.ensure_not_removed(&g)?;
            let mut decision = Decision::None;
            if !g.service_enabled {
                g.service_enabled = true;
                if g.registry_enabled {
                    decision = Self::transition_locked(&mut g);
                }
            }
            let fire = match listener {
                None => None,
                Some(l) if g.state != State::Up && g.state != State::Failed => {
                    g.on_enable.push(l);
                    None
                }
                Some(l) => Some(l),
            };
            (decision, fire)
        };
        self.stage(decision, txn);
        if let Some(listener) = fire {
            self.safe_call(listener);
        }
        Ok(())
    }

    fn disable_impl(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        listener: Option<CompletionFn>,
    ) -> Result<(), ServiceError> {
        self.validate_op(txn)?;
        let (decision, fire) = {
            let mut g = self.lock();
            self.ensure_not_removed(&g)?;
            let mut decision = Decision::None;
            if g.service_enabled {
                g.service_enabled = false;
                if g.registry_enabled {
                    decision = Self::transition_locked(&mut g);
                }
            }
            let fire = match listener {
                None => None,
                Some(l) if g.state != State::Down => {
                    g.on_disable.push(l);
                    None
                }
                Some(l) => Some(l),
            };
            (decision, fire)
        };
        self.stage(decision, txn);
        if let Some(listener) = fire {
            self.safe_call(listener);
        }
        Ok(())
    }

    fn retry_impl(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        listener: Option<CompletionFn>,
    ) -> Result<(), ServiceError> {
        self.validate_op(txn)?;
        let decision = {
            let mut g = self.lock();
            self.ensure_not_removed(&g)?;
            if g.state != State::Failed {
                return Err(ServiceError::NotInFailedState {
                    name: self.name().clone(),
                });
            }
            // the stop is staged with the enable bit clear, then the bit is
            // re-set so the service cycles back up once DOWN is reached
            g.service_enabled = false;
            let decision = Self::transition_locked(&mut g);
            g.service_enabled = true;
            if let Some(l) = listener {
                g.on_enable.push(l);
            }
            decision
        };
        self.stage(decision, txn);
        Ok(())
    }

    fn restart_impl(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        listener: Option<CompletionFn>,
    ) -> Result<(), ServiceError> {
        self.validate_op(txn)?;
        let decision = {
            let mut g = self.lock();
            self.ensure_not_removed(&g)?;
            if g.state != State::Up {
                return Err(ServiceError::NotInUpState {
                    name: self.name().clone(),
                });
            }
            g.service_enabled = false;
            let decision = Self::transition_locked(&mut g);
            g.service_enabled = true;
            if let Some(l) = listener {
                g.on_enable.push(l);
            }
            decision
        };
        self.stage(decision, txn);
        Ok(())
    }

    fn replace_impl(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        new_service: ServiceRef,
        listener: Option<CompletionFn>,
    ) -> Result<(), ServiceError> {
        self.validate_op(txn)?;
        let (decision, fire) = {
            let mut g = self.lock();
            self.ensure_not_removed(&g)?;
            if g.state == State::Down {
                g.service = new_service;
                (Decision::None, listener)
            } else {
                g.replacement = Some(new_service);
                if let Some(l) = listener {
                    g.on_replace.push(l);
                }
                (Self::transition_locked(&mut g), None)
            }
        };
        self.stage(decision, txn);
        if let Some(listener) = fire {
            self.safe_call(listener);
        }
        Ok(())
    }

    pub(crate) fn remove_cascade(self: &Arc<Self>, txn: &UpdateTransaction) -> Option<TaskHandle> {
        self.remove_internal(txn, None)
    }

    fn remove_internal(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
        listener: Option<CompletionFn>,
    ) -> Option<TaskHandle> {
        let (decision, fire) = {
            let mut g = self.lock();
            let mut decision = Decision::None;
            if !g.service_removed {
                g.service_removed = true;
                decision = Self::transition_locked(&mut g);
            }
            let fire = match listener {
                None => None,
                Some(l) if g.state != State::Removed => {
                    g.on_remove.push(l);
                    None
                }
                Some(l) => Some(l),
            };
            (decision, fire)
        };
        let handle = self.stage(decision, txn);
        if let Some(listener) = fire {
            self.safe_call(listener);
        }
        handle
    }

    // ---------------------------
    // Installation
    // ---------------------------

    /// Binds edges, applies the registry's enable bit, propagates ACTIVE
    /// demand, and runs the initial transition. Caller must not hold any
    /// controller lock.
    pub(crate) fn complete_install(self: &Arc<Self>, txn: &UpdateTransaction) {
        let registry_enabled = self
            .primary
            .registry()
            .map(|r| r.is_enabled())
            .unwrap_or(true);
        {
            let mut g = self.lock();
            g.registry_enabled = registry_enabled;
        }
        for dep in self.dependencies.iter() {
            dep.set_dependent(self, txn);
        }
        let demand = { self.lock().mode == ServiceMode::Active };
        if demand {
            self.demand_dependencies(txn);
        }
        let decision = {
            let mut g = self.lock();
            Self::transition_locked(&mut g)
        };
        self.stage(decision, txn);
    }

    /// Silent uninstall used when an aborting transaction reverts the
    /// installation. Counters are restored; no new lifecycle transitions
    /// are forced on pre-existing dependency targets.
    pub(crate) fn revert_install(self: &Arc<Self>) {
        let undemand = {
            let mut g = self.lock();
            g.service_removed = true;
            g.state = State::Removed;
            g.value = None;
            g.mode == ServiceMode::Active
        };
        self.primary.rollback_holder();
        for alias in self.aliases.iter() {
            alias.rollback_holder();
        }
        for dep in self.dependencies.iter() {
            if undemand {
                dep.undemand_silent();
            }
            dep.clear_dependent();
        }
        if let Some(registry) = self.primary.registry() {
            registry.release_controller(self);
        }
    }

    // ---------------------------
    // State machine inputs (narrow entry points)
    // ---------------------------

    pub(crate) fn demand(self: &Arc<Self>, txn: &UpdateTransaction) {
        let propagate = {
            let mut g = self.lock();
            g.demanded_by += 1;
            if g.demanded_by > 1 {
                return;
            }
            g.mode != ServiceMode::Active
        };
        if propagate {
            self.demand_dependencies(txn);
        }
        let decision = {
            let mut g = self.lock();
            Self::transition_locked(&mut g)
        };
        self.stage(decision, txn);
    }

    pub(crate) fn undemand(self: &Arc<Self>, txn: &UpdateTransaction) {
        let propagate = {
            let mut g = self.lock();
            g.demanded_by = g.demanded_by.saturating_sub(1);
            if g.demanded_by > 0 {
                return;
            }
            g.mode != ServiceMode::Active
        };
        if propagate {
            self.undemand_dependencies(txn);
        }
        let decision = {
            let mut g = self.lock();
            Self::transition_locked(&mut g)
        };
        self.stage(decision, txn);
    }

    pub(crate) fn undemand_silent(self: &Arc<Self>) {
        let propagate = {
            let mut g = self.lock();
            g.demanded_by = g.demanded_by.saturating_sub(1);
            if g.demanded_by > 0 {
                return;
            }
            g.mode != ServiceMode::Active
        };
        if propagate {
            for dep in self.dependencies.iter() {
                dep.undemand_silent();
            }
        }
    }

    pub(crate) fn dependency_satisfied(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
    ) -> Option<TaskHandle> {
        let decision = {
            let mut g = self.lock();
            g.unsatisfied = g.unsatisfied.saturating_sub(1);
            if g.unsatisfied > 0 {
                Decision::None
            } else {
                Self::transition_locked(&mut g)
            }
        };
        self.stage(decision, txn)
    }

    pub(crate) fn dependency_unsatisfied(
        self: &Arc<Self>,
        txn: &UpdateTransaction,
    ) -> Option<TaskHandle> {
        let decision = {
            let mut g = self.lock();
            g.unsatisfied += 1;
            if g.unsatisfied > 1 {
                Decision::None
            } else {
                Self::transition_locked(&mut g)
            }
        };
        self.stage(decision, txn)
    }

    pub(crate) fn enable_registry(self: &Arc<Self>, txn: &UpdateTransaction) {
        let decision = {
            let mut g = self.lock();
            if g.service_removed || g.registry_enabled {
                Decision::None
            } else {
                g.registry_enabled = true;
                if g.service_enabled {
                    Self::transition_locked(&mut g)
                } else {
                    Decision::None
                }
            }
        };
        self.stage(decision, txn);
    }

    pub(crate) fn disable_registry(self: &Arc<Self>, txn: &UpdateTransaction) {
        let decision = {
            let mut g = self.lock();
            if g.service_removed || !g.registry_enabled {
                Decision::None
            } else {
                g.registry_enabled = false;
                if g.service_enabled {
                    Self::transition_locked(&mut g)
                } else {
                    Decision::None
                }
            }
        };
        self.stage(decision, txn);
    }

    // ---------------------------
    // Task callbacks
    // ---------------------------

    pub(crate) fn set_service_up(
        self: &Arc<Self>,
        value: Option<ServiceValue>,
        txn: &UpdateTransaction,
    ) {
        let (decision, listeners) = {
            let mut g = self.lock();
            g.value = value;
            g.state = State::Up;
            g.lifecycle_at = Some(Instant::now());
            let decision = Self::transition_locked(&mut g);
            (decision, std::mem::take(&mut g.on_enable))
        };
        self.publish(EventKind::ServiceUp, txn);
        self.stage(decision, txn);
        self.fire(listeners);
    }

    pub(crate) fn set_service_failed(self: &Arc<Self>, txn: &UpdateTransaction) {
        let (decision, listeners) = {
            let mut g = self.lock();
            g.state = State::Failed;
            g.lifecycle_at = Some(Instant::now());
            let decision = Self::transition_locked(&mut g);
            (decision, std::mem::take(&mut g.on_enable))
        };
        self.publish(EventKind::ServiceFailed, txn);
        self.stage(decision, txn);
        self.fire(listeners);
    }

    pub(crate) fn set_service_down(self: &Arc<Self>, txn: &UpdateTransaction) {
        let (decision, replace_listeners, disable_listeners) = {
            let mut g = self.lock();
            g.value = None;
            g.state = State::Down;
            g.lifecycle_at = Some(Instant::now());
            let decision = Self::transition_locked(&mut g);
            let replace_listeners = match g.replacement.take() {
                Some(replacement) => {
                    g.service = replacement;
                    std::mem::take(&mut g.on_replace)
                }
                None => Vec::new(),
            };
            (decision, replace_listeners, std::mem::take(&mut g.on_disable))
        };
        self.publish(EventKind::ServiceDown, txn);
        self.stage(decision, txn);
        self.fire(replace_listeners);
        self.fire(disable_listeners);
    }

    /// Down without staging; used when a start is rolled back.
    pub(crate) fn set_service_down_silent(&self) {
        let mut g = self.lock();
        g.value = None;
        g.state = State::Down;
        g.lifecycle_at = Some(Instant::now());
    }

    pub(crate) fn set_service_removed(self: &Arc<Self>, txn: &UpdateTransaction) {
        let listeners = {
            let mut g = self.lock();
            g.state = State::Removed;
            g.lifecycle_at = Some(Instant::now());
            let mut listeners = std::mem::take(&mut g.on_disable);
            listeners.extend(std::mem::take(&mut g.on_enable));
            listeners.extend(std::mem::take(&mut g.on_remove));
            listeners
        };
        self.clear(txn);
        self.publish(EventKind::ServiceRemoved, txn);
        self.fire(listeners);
    }

    /// Detaches the controller from all registrations and edges.
    fn clear(self: &Arc<Self>, txn: &UpdateTransaction) {
        self.primary.clear_holder(txn);
        for alias in self.aliases.iter() {
            alias.clear_holder(txn);
        }
        let undemand = { self.lock().mode == ServiceMode::Active };
        for dep in self.dependencies.iter() {
            if undemand {
                dep.undemand(txn);
            }
            dep.clear_dependent();
        }
        if let Some(registry) = self.primary.registry() {
            registry.release_controller(self);
        }
    }

    // ---------------------------
    // Notifications to incoming edges
    // ---------------------------

    pub(crate) fn notify_service_up(&self, txn: &UpdateTransaction) {
        self.primary.service_up(txn);
        for alias in self.aliases.iter() {
            alias.service_up(txn);
        }
    }

    pub(crate) fn notify_service_down(&self, txn: &UpdateTransaction) -> Vec<TaskHandle> {
        let mut staged = self.primary.service_down(txn);
        for alias in self.aliases.iter() {
            staged.extend(alias.service_down(txn));
        }
        staged
    }

    // ---------------------------
    // Transition machinery
    // ---------------------------

    fn transition_locked(g: &mut ControllerInner) -> Decision {
        match g.state {
            State::Down => {
                if g.unsatisfied == 0 && Self::should_start(g) {
                    g.state = State::Starting;
                    g.lifecycle_at = Some(Instant::now());
                    Decision::Start
                } else if g.service_removed {
                    g.state = State::Removing;
                    g.lifecycle_at = Some(Instant::now());
                    Decision::Remove
                } else {
                    Decision::None
                }
            }
            State::Up => {
                if g.unsatisfied > 0 || Self::should_stop(g) {
                    g.state = State::Stopping;
                    g.lifecycle_at = Some(Instant::now());
                    Decision::Stop
                } else {
                    Decision::None
                }
            }
            State::Failed => {
                if g.unsatisfied > 0 || Self::should_stop(g) {
                    g.state = State::Stopping;
                    g.lifecycle_at = Some(Instant::now());
                    Decision::StopFailed
                } else {
                    Decision::None
                }
            }
            _ => Decision::None,
        }
    }

    fn should_start(g: &ControllerInner) -> bool {
        !g.service_removed
            && g.service_enabled
            && g.registry_enabled
            && (g.mode == ServiceMode::Active || g.demanded_by > 0)
    }

    fn should_stop(g: &ControllerInner) -> bool {
        g.service_removed
            || !g.service_enabled
            || !g.registry_enabled
            || (g.mode == ServiceMode::OnDemand && g.demanded_by == 0)
            || g.replacement.is_some()
    }

    pub(crate) fn stage(
        self: &Arc<Self>,
        decision: Decision,
        txn: &UpdateTransaction,
    ) -> Option<TaskHandle> {
        match decision {
            Decision::None => None,
            Decision::Start => Some(lifecycle::stage_start(self.clone(), txn)),
            Decision::Stop => Some(lifecycle::stage_stop(self.clone(), txn)),
            Decision::StopFailed => Some(lifecycle::stage_stop_failed(self.clone(), txn)),
            Decision::Remove => Some(lifecycle::stage_remove(self.clone(), txn)),
        }
    }

    // ---------------------------
    // Helpers
    // ---------------------------

    fn demand_dependencies(&self, txn: &UpdateTransaction) {
        for dep in self.dependencies.iter() {
            dep.demand(txn);
        }
    }

    fn undemand_dependencies(&self, txn: &UpdateTransaction) {
        for dep in self.dependencies.iter() {
            dep.undemand(txn);
        }
    }

    fn validate_op(&self, txn: &UpdateTransaction) -> Result<(), ServiceError> {
        if !txn.inner.matches_controller(self.ctl_id) {
            return Err(TxnError::ForeignTransaction.into());
        }
        txn.inner.ensure_accepts_tasks("mutate service")?;
        txn.inner.set_modified();
        Ok(())
    }

    fn ensure_not_removed(&self, g: &ControllerInner) -> Result<(), ServiceError> {
        if g.service_removed || matches!(g.state, State::Removing | State::Removed) {
            return Err(ServiceError::CannotOperateOnRemoved {
                name: self.name().clone(),
            });
        }
        Ok(())
    }

    fn fire(self: &Arc<Self>, listeners: Vec<CompletionFn>) {
        for listener in listeners {
            self.safe_call(listener);
        }
    }

    fn safe_call(self: &Arc<Self>, listener: CompletionFn) {
        if std::panic::catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
            self.bus.publish(
                Event::now(EventKind::ListenerPanicked).with_service(self.name().clone()),
            );
        }
    }

    fn publish(&self, kind: EventKind, txn: &UpdateTransaction) {
        self.bus.publish(
            Event::now(kind)
                .with_service(self.name().clone())
                .with_txn(txn.id()),
        );
    }

    pub(crate) fn publish_starting(&self, txn_id: u64) {
        self.bus.publish(
            Event::now(EventKind::ServiceStarting)
                .with_service(self.name().clone())
                .with_txn(txn_id),
        );
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
