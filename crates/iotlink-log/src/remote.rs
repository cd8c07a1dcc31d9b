use std::collections::BTreeMap;
use std::error::Error;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::buffer::{LogBatch, LogBuffer};
use crate::level::Verbosity;

/// Device log sink shared by every producer.
///
/// Every call is written to `tracing`; it is also buffered for upload as
/// `"{tag}: {message}"` when the active verbosity admits its severity.
#[derive(Debug)]
pub struct RemoteLog {
    level: AtomicU8,
    buffer: LogBuffer,
    labels: RwLock<BTreeMap<String, String>>,
}

impl Default for RemoteLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteLog {
    /// Starts at [`Verbosity::NoLogs`] with an empty buffer and the `os` label set.
    pub fn new() -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("os".to_string(), std::env::consts::OS.to_string());
        Self {
            level: AtomicU8::new(Verbosity::NoLogs.as_u8()),
            buffer: LogBuffer::new(),
            labels: RwLock::new(labels),
        }
    }

    /// Seeds the buffer with `record` regardless of verbosity.
    pub fn with_record(self, record: impl Into<String>) -> Self {
        self.buffer.push(record);
        self
    }

    pub fn level(&self) -> Verbosity {
        Verbosity::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: Verbosity) {
        let previous = Verbosity::from_u8(self.level.swap(level.as_u8(), Ordering::Relaxed));
        if previous != level {
            info!(target: "iotlink::remote_log", %previous, %level, "remote log level changed");
        }
    }

    pub fn set_label(&self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.write().insert(key.into(), value.into());
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.labels.read().clone()
    }

    /// Buffered record count.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.buffer
    }

    pub fn debug(&self, tag: &str, message: &str) {
        debug!(target: "iotlink::remote_log", tag, "{message}");
        self.record(Verbosity::Debug, tag, message);
    }

    pub fn info(&self, tag: &str, message: &str) {
        info!(target: "iotlink::remote_log", tag, "{message}");
        self.record(Verbosity::Info, tag, message);
    }

    pub fn warn(&self, tag: &str, message: &str) {
        warn!(target: "iotlink::remote_log", tag, "{message}");
        self.record(Verbosity::Warn, tag, message);
    }

    pub fn warn_error(&self, tag: &str, err: &dyn Error) {
        warn!(target: "iotlink::remote_log", tag, error = %err, "error reported");
        self.record(Verbosity::Warn, tag, &err.to_string());
    }

    pub fn verbose(&self, tag: &str, message: &str) {
        trace!(target: "iotlink::remote_log", tag, "{message}");
        self.record(Verbosity::Verbose, tag, message);
    }

    /// Head batch under `budget` bytes together with a snapshot of the labels.
    pub fn select_batch(&self, budget: usize) -> LogBatch {
        LogBatch {
            records: self.buffer.select_batch(budget),
            labels: self.labels(),
        }
    }

    fn record(&self, severity: Verbosity, tag: &str, message: &str) {
        if self.level().permits(severity) {
            self.buffer.push(format!("{tag}: {message}"));
        }
    }
}
