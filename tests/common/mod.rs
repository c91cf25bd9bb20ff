//! Shared helpers for the integration suite.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use servisor::{ServiceFn, ServiceRef, StartOutcome};

/// Thread-safe call recorder shared between test services and assertions.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.calls.lock().unwrap().push(entry.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub fn index_of(&self, entry: &str) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|e| e == entry)
    }

    /// Asserts both entries were recorded, `earlier` before `later`.
    pub fn assert_order(&self, earlier: &str, later: &str) {
        let a = self
            .index_of(earlier)
            .unwrap_or_else(|| panic!("'{earlier}' was never recorded: {:?}", self.snapshot()));
        let b = self
            .index_of(later)
            .unwrap_or_else(|| panic!("'{later}' was never recorded: {:?}", self.snapshot()));
        assert!(
            a < b,
            "expected '{earlier}' before '{later}': {:?}",
            self.snapshot()
        );
    }
}

/// A service recording `start:<name>` / `stop:<name>` into the log.
pub fn recording_service(log: &CallLog, name: &str) -> ServiceRef {
    let start_log = log.clone();
    let start_entry = format!("start:{name}");
    let stop_log = log.clone();
    let stop_entry = format!("stop:{name}");
    ServiceFn::arc(
        move |_ctx| {
            let log = start_log.clone();
            let entry = start_entry.clone();
            async move {
                log.push(entry);
                StartOutcome::up()
            }
        },
        move |_ctx| {
            let log = stop_log.clone();
            let entry = stop_entry.clone();
            async move {
                log.push(entry);
            }
        },
    )
}

/// A service that fails its first `fail_times` starts, then succeeds.
pub fn flaky_service(log: &CallLog, name: &str, fail_times: usize) -> ServiceRef {
    let attempts = Arc::new(AtomicUsize::new(0));
    let start_log = log.clone();
    let start_entry = format!("start:{name}");
    let stop_log = log.clone();
    let stop_entry = format!("stop:{name}");
    ServiceFn::arc(
        move |_ctx| {
            let log = start_log.clone();
            let entry = start_entry.clone();
            let attempts = attempts.clone();
            async move {
                log.push(entry);
                if attempts.fetch_add(1, Ordering::SeqCst) < fail_times {
                    StartOutcome::failed()
                } else {
                    StartOutcome::up()
                }
            }
        },
        move |_ctx| {
            let log = stop_log.clone();
            let entry = stop_entry.clone();
            async move {
                log.push(entry);
            }
        },
    )
}
