use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::observers::Observer;

/// Base observer that logs events to stdout.
///
/// Enabled via the `logging` feature. Useful for demos and debugging.
pub struct LogWriter;

#[async_trait]
impl Observer for LogWriter {
    async fn on_event(&self, e: &Event) {
        match e.kind {
            EventKind::ServiceStarting => {
                println!("[starting] service={:?} txn={:?}", e.service, e.txn);
            }
            EventKind::ServiceUp => {
                println!("[up] service={:?} txn={:?}", e.service, e.txn);
            }
            EventKind::ServiceFailed => {
                println!("[failed] service={:?} txn={:?}", e.service, e.txn);
            }
            EventKind::ServiceDown => {
                println!("[down] service={:?} txn={:?}", e.service, e.txn);
            }
            EventKind::ServiceRemoved => {
                println!("[removed] service={:?} txn={:?}", e.service, e.txn);
            }
            EventKind::TxnPrepared => {
                println!("[txn-prepared] txn={:?}", e.txn);
            }
            EventKind::TxnCommitted => {
                println!("[txn-committed] txn={:?}", e.txn);
            }
            EventKind::TxnAborted => {
                println!("[txn-aborted] txn={:?}", e.txn);
            }
            EventKind::TxnRestarted => {
                println!("[txn-restarted] txn={:?}", e.txn);
            }
            EventKind::ListenerPanicked => {
                println!(
                    "[listener-panicked] service={:?} reason={:?}",
                    e.service, e.reason
                );
            }
        }
    }
}
