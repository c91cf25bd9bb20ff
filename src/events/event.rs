//! # Runtime events emitted by transactions and service controllers.
//!
//! The [`EventKind`] enum classifies event types across two categories:
//! - **Service lifecycle events**: a controller moving through its states
//!   (starting, up, failed, down, removed)
//! - **Transaction events**: phase changes observed by the whole container
//!   (prepared, committed, aborted, restarted)
//!
//! The [`Event`] struct carries additional metadata such as timestamps, the
//! service name, the owning transaction, and a free-form reason.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically. This guarantees that events can be ordered correctly even
//! when delivered out-of-order through async channels.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::name::ServiceName;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Service lifecycle events ===
    /// A service start is being invoked.
    ServiceStarting,
    /// A service completed its start and is UP.
    ServiceUp,
    /// A service start failed; the controller is FAILED.
    ServiceFailed,
    /// A service stopped and is DOWN.
    ServiceDown,
    /// A service was removed; the controller is terminal.
    ServiceRemoved,

    // === Transaction events ===
    /// A transaction finished its prepare fixed point.
    TxnPrepared,
    /// A transaction committed.
    TxnCommitted,
    /// A transaction aborted; executed tasks were reverted.
    TxnAborted,
    /// A transaction restarted back into its active phase.
    TxnRestarted,

    // === Listener isolation ===
    /// A user-supplied listener panicked; the panic was swallowed.
    ListenerPanicked,
}

/// Runtime event with optional metadata.
///
/// ## Fields
///
/// - `seq`: Unique sequence number for ordering (monotonically increasing)
/// - `at`: Wall-clock timestamp (may go backwards due to NTP, use for logging only)
/// - `kind`: Event classification
/// - `service`, `txn`, `reason`: Optional metadata
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Name of the service, if applicable.
    pub service: Option<ServiceName>,
    /// Id of the transaction the event happened under, if applicable.
    pub txn: Option<u64>,
    /// Free-form reason or detail.
    pub reason: Option<String>,
}

impl Event {
    /// Creates a new event of the given kind with the current timestamp and
    /// next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            service: None,
            txn: None,
            reason: None,
        }
    }

    /// Attaches a service name.
    pub fn with_service(mut self, name: ServiceName) -> Self {
        self.service = Some(name);
        self
    }

    /// Attaches a transaction id.
    pub fn with_txn(mut self, txn: u64) -> Self {
        self.txn = Some(txn);
        self
    }

    /// Attaches a free-form reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
