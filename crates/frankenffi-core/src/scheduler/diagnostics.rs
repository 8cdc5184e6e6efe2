//! Unjoined-failure reporting.

use crossbeam_channel::{Receiver, Sender};
use frankenffi_membrane::FfiError;
use frankenffi_membrane::metrics::{FfiMetrics, global_metrics};
use parking_lot::Mutex;
use serde::Serialize;

use super::TaskId;

/// Records held for draining; later failures are only logged until drained.
pub(crate) const DIAGNOSTIC_CAPACITY: usize = 1024;
use crate::structured_log::{LogEmitter, LogLevel};

/// A failed task whose handle was dropped without being joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnjoinedFailure {
    pub task: TaskId,
    pub kind: &'static str,
    pub error: String,
}

pub(crate) struct Diagnostics {
    tx: Sender<UnjoinedFailure>,
    rx: Receiver<UnjoinedFailure>,
    log: Mutex<LogEmitter>,
}

impl Diagnostics {
    pub(crate) fn new(log: LogEmitter) -> Self {
        Self::with_capacity(log, DIAGNOSTIC_CAPACITY)
    }

    pub(crate) fn with_capacity(log: LogEmitter, capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            log: Mutex::new(log),
        }
    }

    pub(crate) fn report(&self, task: TaskId, error: &FfiError) {
        FfiMetrics::inc(&global_metrics().unjoined_failures);
        let record = UnjoinedFailure {
            task,
            kind: error.kind().as_str(),
            error: error.to_string(),
        };

        let mut log = self.log.lock();
        let entry = log
            .entry(LogLevel::Error, "task.unjoined_failure")
            .with_task(task.as_u64())
            .with_error_kind(error.kind())
            .with_message(&record.error);
        // Sink errors are dropped; the channel still gets the record.
        let _ = log.emit(&entry).and_then(|_| log.flush());
        drop(log);

        // Full channel: the log line above is the only trace.
        let _ = self.tx.try_send(record);
    }

    pub(crate) fn drain(&self) -> Vec<UnjoinedFailure> {
        self.rx.try_iter().collect()
    }

    pub(crate) fn receiver(&self) -> Receiver<UnjoinedFailure> {
        self.rx.clone()
    }

    pub(crate) fn with_log<R>(&self, body: impl FnOnce(&mut LogEmitter) -> R) -> R {
        body(&mut self.log.lock())
    }
}
