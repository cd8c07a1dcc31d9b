use async_trait::async_trait;
use bytes::Bytes;

/// Largest payload the broker accepts for a single telemetry publish.
pub const MAX_PUB_SIZE_BYTES: usize = 200_000;

/// Outbound telemetry seam between the log uploader and the broker session.
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    /// Publishes at least once to the telemetry topic, suffixed with `subtopic` when
    /// non-empty. Returns whether the transport accepted the message.
    async fn publish_telemetry(&self, payload: Bytes, subtopic: &str) -> bool;
}
