//! Service controllers, registrations, dependency edges and registries.

mod builder;
mod controller;
mod dependency;
mod lifecycle;
mod mode;
mod registration;
mod registry;
mod service;

pub use builder::{ServiceBuilder, ServiceContext};
pub use controller::{ServiceController, State};
pub use dependency::DependencyFlags;
pub use mode::ServiceMode;
pub use registry::{ServiceContainer, ServiceRegistry};
pub use service::{
    Service, ServiceFn, ServiceRef, ServiceValue, StartContext, StartOutcome, StopContext,
};
