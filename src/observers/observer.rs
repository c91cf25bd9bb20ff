//! # Event observer trait.
//!
//! [`Observer`] is the extension point for plugging custom event handlers
//! into the runtime. Observers are attached through
//! [`TransactionController::attach_observer`](crate::TransactionController::attach_observer),
//! which gives each one a dedicated forwarding task draining the event bus.
//!
//! ## Rules
//! - Observers run outside every container lock; they can never block the
//!   state machine.
//! - A slow observer only lags its own receiver (old events get dropped by
//!   the broadcast channel).
//! - Handle errors internally; do not panic.

use async_trait::async_trait;

use crate::events::Event;

/// Consumes runtime [`Event`]s on a dedicated worker task.
#[async_trait]
pub trait Observer: Send + Sync + 'static {
    /// Processes a single event.
    ///
    /// Events arrive in publication order per receiver; under bus overflow
    /// the oldest events are skipped.
    async fn on_event(&self, event: &Event);
}
