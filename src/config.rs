//! # Global runtime configuration.
//!
//! [`Config`] defines the behavior shared by every transaction issued from
//! one [`TransactionController`](crate::TransactionController): event bus
//! capacity and the concurrency cap applied to task execution.
//!
//! # Example
//! ```
//! use servisor::Config;
//!
//! let mut cfg = Config::default();
//! cfg.max_concurrent_tasks = 4;
//!
//! assert_eq!(cfg.max_concurrent_tasks, 4);
//! ```

/// Configuration for a transaction controller and everything it owns.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the event bus channel.
    pub bus_capacity: usize,
    /// Maximum number of task bodies to run concurrently (0 = unlimited).
    pub max_concurrent_tasks: usize,
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `bus_capacity = 1024`
    /// - `max_concurrent_tasks = 0` (unlimited)
    fn default() -> Self {
        Self {
            bus_capacity: 1024,
            max_concurrent_tasks: 0,
        }
    }
}
