use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use iotlink_core::mock::MockTransport;
use iotlink_core::{
    ConnectionConfig, ConnectionManager, DeviceCredentials, Scheduler, TelemetryPublisher,
};
use iotlink_log::{LogUploader, RemoteLog, UploaderConfig, Verbosity};
use parking_lot::Mutex;
use test_timeout::tokio_timeout_test;
use tokio::time::sleep;

/// Records every telemetry publish; optionally appends a record mid-publish.
#[derive(Default)]
struct RecordingPublisher {
    fail: AtomicBool,
    published: Mutex<Vec<(Bytes, String)>>,
    append_during_publish: Mutex<Option<Arc<RemoteLog>>>,
}

impl RecordingPublisher {
    fn failing() -> Self {
        let publisher = Self::default();
        publisher.fail.store(true, Ordering::SeqCst);
        publisher
    }

    fn count(&self) -> usize {
        self.published.lock().len()
    }

    fn payload(&self, index: usize) -> serde_json::Value {
        let published = self.published.lock();
        serde_json::from_slice(&published[index].0).expect("batch is json")
    }
}

#[async_trait]
impl TelemetryPublisher for RecordingPublisher {
    async fn publish_telemetry(&self, payload: Bytes, subtopic: &str) -> bool {
        if let Some(log) = self.append_during_publish.lock().as_ref() {
            log.buffer().push("T: late");
        }
        if self.fail.load(Ordering::SeqCst) {
            return false;
        }
        self.published.lock().push((payload, subtopic.to_string()));
        true
    }
}

/// Ten-byte lines with a budget that admits exactly ten of them per batch.
fn ten_per_batch() -> UploaderConfig {
    UploaderConfig {
        max_payload_bytes: 101,
        ..UploaderConfig::default()
    }
}

fn fill(log: &RemoteLog, count: usize) {
    for i in 0..count {
        log.buffer().push(format!("T: rec{i:04}"));
    }
}

fn uploader(
    log: &Arc<RemoteLog>,
    publisher: &Arc<RecordingPublisher>,
    config: UploaderConfig,
) -> LogUploader {
    LogUploader::new(log.clone(), publisher.clone(), Scheduler::current(), config)
}

#[tokio::test]
async fn empty_buffer_is_a_successful_noop() {
    let log = Arc::new(RemoteLog::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let uploader = uploader(&log, &publisher, UploaderConfig::default());

    let outcome = uploader.run_cycle().await;
    assert!(outcome.succeeded);
    assert_eq!(outcome.uploaded, 0);
    assert_eq!(outcome.next_delay, Duration::from_secs(60));
    assert_eq!(publisher.count(), 0);
}

#[tokio::test]
async fn success_removes_exactly_the_batch() {
    let log = Arc::new(RemoteLog::new());
    fill(&log, 3);
    let publisher = Arc::new(RecordingPublisher::default());
    *publisher.append_during_publish.lock() = Some(log.clone());
    let uploader = uploader(&log, &publisher, UploaderConfig::default());

    let outcome = uploader.run_cycle().await;
    assert!(outcome.succeeded);
    assert_eq!(outcome.uploaded, 3);
    assert_eq!(log.buffer().snapshot(), vec!["T: late".to_string()]);
    assert_eq!(publisher.payload(0)["data"].as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn batch_carries_records_in_order_and_labels() {
    let log = Arc::new(RemoteLog::new().with_record("agent 1.0 startup"));
    log.set_level(Verbosity::Info);
    log.info("Net", "up");
    let publisher = Arc::new(RecordingPublisher::default());
    let config = UploaderConfig {
        subtopic: "logs".into(),
        ..UploaderConfig::default()
    };
    let uploader = uploader(&log, &publisher, config);

    assert!(uploader.run_cycle().await.succeeded);
    assert_eq!(
        publisher.payload(0),
        serde_json::json!({
            "data": ["agent 1.0 startup", "Net: up"],
            "tags": [{"os": std::env::consts::OS}]
        })
    );
    assert_eq!(publisher.published.lock()[0].1, "logs");
}

#[tokio::test]
async fn failure_keeps_buffer_contents() {
    let log = Arc::new(RemoteLog::new());
    fill(&log, 5);
    let before = log.buffer().snapshot();
    let publisher = Arc::new(RecordingPublisher::failing());
    let uploader = uploader(&log, &publisher, UploaderConfig::default());

    let outcome = uploader.run_cycle().await;
    assert!(!outcome.succeeded);
    assert_eq!(outcome.uploaded, 0);
    assert_eq!(outcome.dropped, 0);
    assert_eq!(log.buffer().snapshot(), before);
}

#[tokio::test]
async fn failure_over_threshold_purges() {
    let log = Arc::new(RemoteLog::new());
    fill(&log, 1200);
    let publisher = Arc::new(RecordingPublisher::failing());
    let uploader = uploader(&log, &publisher, UploaderConfig::default());

    let outcome = uploader.run_cycle().await;
    assert!(!outcome.succeeded);
    assert_eq!(outcome.dropped, 1200);
    assert_eq!(outcome.remaining, 0);
    assert!(log.is_empty());
    assert_eq!(outcome.next_delay, Duration::from_secs(60));
}

#[tokio::test]
async fn purge_warning_is_buffered_when_warn_is_enabled() {
    let log = Arc::new(RemoteLog::new());
    log.set_level(Verbosity::Warn);
    fill(&log, 1001);
    let publisher = Arc::new(RecordingPublisher::failing());
    let uploader = uploader(&log, &publisher, UploaderConfig::default());

    uploader.run_cycle().await;
    assert_eq!(
        log.buffer().snapshot(),
        vec!["LogUploader: Purge level reached".to_string()]
    );
}

#[tokio::test]
async fn exactly_threshold_is_not_purged() {
    let log = Arc::new(RemoteLog::new());
    fill(&log, 1000);
    let publisher = Arc::new(RecordingPublisher::failing());
    let uploader = uploader(&log, &publisher, UploaderConfig::default());

    let outcome = uploader.run_cycle().await;
    assert_eq!(outcome.remaining, 1000);
    assert_eq!(outcome.next_delay, Duration::from_secs(3));
}

#[tokio::test]
async fn interval_follows_remaining_backlog() {
    let publisher = Arc::new(RecordingPublisher::default());

    let log = Arc::new(RemoteLog::new());
    fill(&log, 25);
    let outcome = uploader(&log, &publisher, ten_per_batch()).run_cycle().await;
    assert_eq!(outcome.uploaded, 10);
    assert_eq!(outcome.remaining, 15);
    assert_eq!(outcome.next_delay, Duration::from_secs(3));

    let log = Arc::new(RemoteLog::new());
    fill(&log, 15);
    let outcome = uploader(&log, &publisher, ten_per_batch()).run_cycle().await;
    assert_eq!(outcome.remaining, 5);
    assert_eq!(outcome.next_delay, Duration::from_secs(60));
}

#[tokio::test]
async fn oversized_head_record_is_dropped() {
    let log = Arc::new(RemoteLog::new());
    log.buffer().push("x".repeat(200));
    log.buffer().push("T: small");
    let publisher = Arc::new(RecordingPublisher::default());
    let config = UploaderConfig {
        max_payload_bytes: 100,
        ..UploaderConfig::default()
    };
    let uploader = uploader(&log, &publisher, config);

    let outcome = uploader.run_cycle().await;
    assert_eq!(outcome.dropped, 1);
    assert_eq!(publisher.count(), 0);
    assert_eq!(log.buffer().snapshot(), vec!["T: small".to_string()]);

    assert_eq!(uploader.run_cycle().await.uploaded, 1);
}

#[tokio::test]
async fn dropped_record_is_reported_in_the_uploaded_stream() {
    let log = Arc::new(RemoteLog::new());
    log.set_level(Verbosity::Warn);
    log.buffer().push("x".repeat(200));
    log.buffer().push("T: small");
    let publisher = Arc::new(RecordingPublisher::default());
    let config = UploaderConfig {
        max_payload_bytes: 100,
        ..UploaderConfig::default()
    };
    let uploader = uploader(&log, &publisher, config);

    assert_eq!(uploader.run_cycle().await.dropped, 1);
    assert_eq!(
        log.buffer().snapshot(),
        vec![
            "T: small".to_string(),
            "LogUploader: Dropped log record larger than 100 bytes".to_string()
        ]
    );

    assert_eq!(uploader.run_cycle().await.uploaded, 2);
    assert_eq!(
        publisher.payload(0)["data"][1],
        "LogUploader: Dropped log record larger than 100 bytes"
    );
}

#[tokio_timeout_test(10, paused)]
async fn running_loop_adapts_its_interval() {
    let log = Arc::new(RemoteLog::new());
    fill(&log, 25);
    let publisher = Arc::new(RecordingPublisher::default());
    let uploader = uploader(&log, &publisher, ten_per_batch());

    uploader.start();
    assert!(uploader.is_running());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(publisher.count(), 1);
    assert_eq!(log.len(), 15);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(publisher.count(), 2);
    assert_eq!(log.len(), 5);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(publisher.count(), 2);

    sleep(Duration::from_secs(31)).await;
    assert_eq!(publisher.count(), 3);
    assert!(log.is_empty());

    uploader.stop();
    assert!(!uploader.is_running());
    fill(&log, 3);
    sleep(Duration::from_secs(300)).await;
    assert_eq!(publisher.count(), 3);
    assert_eq!(log.len(), 3);
}

#[tokio_timeout_test(10, paused)]
async fn restart_does_not_double_the_loop() {
    let log = Arc::new(RemoteLog::new());
    fill(&log, 25);
    let publisher = Arc::new(RecordingPublisher::default());
    let uploader = uploader(&log, &publisher, ten_per_batch());

    uploader.start();
    uploader.start();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(publisher.count(), 1);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(publisher.count(), 2);
    uploader.stop();
}

#[tokio_timeout_test(10, paused)]
async fn stop_keeps_buffered_records() {
    let log = Arc::new(RemoteLog::new());
    fill(&log, 4);
    let publisher = Arc::new(RecordingPublisher::failing());
    let uploader = uploader(&log, &publisher, UploaderConfig::default());

    uploader.start();
    sleep(Duration::from_millis(100)).await;
    uploader.stop();
    sleep(Duration::from_secs(120)).await;

    assert_eq!(log.len(), 4);
    assert!(!uploader.is_running());
}

const RSA_KEY: &[u8] = include_bytes!("../../iotlink-core/tests/fixtures/rsa_private.pem");
const RSA_CERT: &str = include_str!("../../iotlink-core/tests/fixtures/rsa_cert.pem");

#[tokio_timeout_test(10, paused)]
async fn uploads_through_the_connection_manager() {
    let transport = Arc::new(MockTransport::new());
    let manager = ConnectionManager::new(
        "dev-1",
        DeviceCredentials::from_pem(RSA_KEY, RSA_CERT).expect("credentials"),
        transport.clone(),
        ConnectionConfig::default(),
        Scheduler::current(),
    );
    let log = Arc::new(RemoteLog::new().with_record("agent startup"));
    let uploader = LogUploader::new(
        log.clone(),
        Arc::new(manager.clone()),
        Scheduler::current(),
        UploaderConfig::default(),
    );

    // Not connected yet: the batch stays buffered.
    assert!(!uploader.run_cycle().await.succeeded);
    assert_eq!(log.len(), 1);

    assert!(manager.connect(manager.identity("acme", "fleet")).await);
    assert!(uploader.run_cycle().await.succeeded);
    assert!(log.is_empty());

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "/devices/dev-1/events");
    manager.disconnect().await;
}

#[tokio_timeout_test(10, paused)]
async fn batch_lost_before_acknowledgement_stays_buffered() {
    let transport = Arc::new(MockTransport::new());
    let manager = ConnectionManager::new(
        "dev-1",
        DeviceCredentials::from_pem(RSA_KEY, RSA_CERT).expect("credentials"),
        transport.clone(),
        ConnectionConfig::default(),
        Scheduler::current(),
    );
    let log = Arc::new(RemoteLog::new());
    fill(&log, 3);
    let uploader = LogUploader::new(
        log.clone(),
        Arc::new(manager.clone()),
        Scheduler::current(),
        UploaderConfig::default(),
    );
    assert!(manager.connect(manager.identity("acme", "fleet")).await);

    transport.lose_link_before_ack(true);
    let outcome = uploader.run_cycle().await;
    assert!(!outcome.succeeded);
    assert_eq!(outcome.remaining, 3);
    assert_eq!(transport.unacknowledged().len(), 1);
    assert_eq!(log.len(), 3);

    // The manager reconnects after its retry timeout; the same records go out again.
    sleep(Duration::from_secs(6)).await;
    assert!(uploader.run_cycle().await.succeeded);
    assert!(log.is_empty());
    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload, transport.unacknowledged()[0].payload);
    manager.disconnect().await;
}
