//! Adaptive-interval log upload loop.
//!
//! Each cycle selects a head batch under the payload budget, publishes it as
//! telemetry and removes it on success. The next cycle is scheduled after the
//! previous one completes, so cycles never overlap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use iotlink_core::{ScheduledTask, Scheduler, TelemetryPublisher, MAX_PUB_SIZE_BYTES};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::remote::RemoteLog;

const LOG_TAG: &str = "LogUploader";

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Low-water mark: more records than this left over means a short interval.
    pub batch_size: usize,
    pub purge_threshold: usize,
    pub short_interval: Duration,
    pub long_interval: Duration,
    pub max_payload_bytes: usize,
    pub subtopic: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            purge_threshold: 1000,
            short_interval: Duration::from_secs(3),
            long_interval: Duration::from_secs(60),
            max_payload_bytes: MAX_PUB_SIZE_BYTES,
            subtopic: String::new(),
        }
    }
}

/// Result of one upload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub uploaded: usize,
    pub succeeded: bool,
    /// Records discarded because they could never fit or the buffer was purged.
    pub dropped: usize,
    pub remaining: usize,
    pub next_delay: Duration,
}

struct Run {
    generation: u64,
    token: CancellationToken,
    pending: Option<ScheduledTask>,
}

struct Inner {
    log: Arc<RemoteLog>,
    publisher: Arc<dyn TelemetryPublisher>,
    scheduler: Scheduler,
    config: UploaderConfig,
    run: Mutex<Option<Run>>,
    generations: AtomicU64,
    /// Serializes scheduled cycles with manual flushes.
    cycle: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.token.cancel();
        }
    }
}

pub struct LogUploader {
    inner: Arc<Inner>,
}

impl LogUploader {
    pub fn new(
        log: Arc<RemoteLog>,
        publisher: Arc<dyn TelemetryPublisher>,
        scheduler: Scheduler,
        config: UploaderConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                log,
                publisher,
                scheduler,
                config,
                run: Mutex::new(None),
                generations: AtomicU64::new(0),
                cycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.inner.config
    }

    /// Begins uploading; the first cycle runs immediately. Restarts a running loop.
    pub fn start(&self) {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.inner.run.lock().replace(Run {
            generation,
            token: CancellationToken::new(),
            pending: None,
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        debug!(
            long_interval_secs = self.inner.config.long_interval.as_secs(),
            "starting log upload"
        );
        schedule_cycle(&self.inner, generation, Duration::ZERO);
    }

    /// Cancels the pending cycle. Buffered records are kept.
    pub fn stop(&self) {
        if let Some(run) = self.inner.run.lock().take() {
            run.token.cancel();
            let pending = run.pending.is_some_and(|task| !task.is_finished());
            debug!(pending, "log upload stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .run
            .lock()
            .as_ref()
            .is_some_and(|run| !run.token.is_cancelled())
    }

    /// Runs a single cycle now, waiting for any in-flight one to finish first.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.inner.run_cycle().await
    }
}

impl Inner {
    async fn run_cycle(&self) -> CycleOutcome {
        let _cycle = self.cycle.lock().await;
        let config = &self.config;
        let buffered = self.log.len();
        let batch = self.log.select_batch(config.max_payload_bytes);

        let mut dropped = 0;
        let succeeded = if batch.is_empty() {
            if buffered > 0 {
                // The head record alone reaches the budget; it can never be sent.
                dropped = self.log.buffer().remove_front(1);
                self.log.warn(
                    LOG_TAG,
                    &format!(
                        "Dropped log record larger than {} bytes",
                        config.max_payload_bytes
                    ),
                );
            } else {
                trace!("no logs to post");
            }
            true
        } else {
            info!(
                records = batch.records.len(),
                bytes = batch.byte_len(),
                buffered,
                "posting logs"
            );
            match batch.to_json() {
                Ok(payload) => {
                    self.publisher
                        .publish_telemetry(Bytes::from(payload), &config.subtopic)
                        .await
                }
                Err(err) => {
                    warn!(error = %err, "log batch serialization failed");
                    false
                }
            }
        };

        let uploaded = if succeeded {
            let removed = self.log.buffer().remove_front(batch.records.len());
            if removed > 0 {
                info!(removed, remaining = self.log.len(), "logs posted");
            }
            removed
        } else {
            warn!(buffered = self.log.len(), "failed to post logs");
            if self.log.len() > config.purge_threshold {
                dropped = self.log.buffer().clear();
                self.log.warn(LOG_TAG, "Purge level reached");
            }
            0
        };

        let remaining = self.log.len();
        let next_delay = if remaining > config.batch_size {
            config.short_interval
        } else {
            config.long_interval
        };
        debug!(
            remaining,
            next_in_secs = next_delay.as_secs(),
            "log upload cycle finished"
        );
        CycleOutcome {
            uploaded,
            succeeded,
            dropped,
            remaining,
            next_delay,
        }
    }
}

fn schedule_cycle(inner: &Arc<Inner>, generation: u64, delay: Duration) {
    let mut slot = inner.run.lock();
    let Some(run) = slot
        .as_mut()
        .filter(|run| run.generation == generation && !run.token.is_cancelled())
    else {
        return;
    };
    let task = inner.scheduler.schedule_with(
        run.token.child_token(),
        delay,
        cycle(Arc::downgrade(inner), generation),
    );
    run.pending = Some(task);
}

fn cycle(inner: Weak<Inner>, generation: u64) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let outcome = inner.run_cycle().await;
        schedule_cycle(&inner, generation, outcome.next_delay);
    })
}
