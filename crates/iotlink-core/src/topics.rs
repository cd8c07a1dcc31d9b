use bytes::Bytes;

use crate::events::IotEvent;

/// Topic set for one device, all rooted at `/devices/{device_id}/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub config: String,
    /// Subscription filter covering the command topic and every subfolder.
    pub commands: String,
    pub state: String,
    telemetry: String,
    command_root: String,
}

impl DeviceTopics {
    pub fn new(device_id: &str) -> Self {
        let root = format!("/devices/{device_id}");
        Self {
            config: format!("{root}/config"),
            commands: format!("{root}/commands/#"),
            state: format!("{root}/state"),
            telemetry: format!("{root}/events"),
            command_root: format!("{root}/commands"),
        }
    }

    /// Telemetry topic, optionally suffixed with a subfolder.
    pub fn telemetry(&self, subtopic: &str) -> String {
        if subtopic.is_empty() {
            self.telemetry.clone()
        } else {
            format!("{}/{subtopic}", self.telemetry)
        }
    }

    /// Matches a concrete topic against the command subscription. The `#` wildcard
    /// also covers its parent level, so the bare command topic matches too.
    pub fn is_command(&self, topic: &str) -> bool {
        match topic.strip_prefix(self.command_root.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Maps an inbound message to the event it represents, or `None` when the
    /// topic belongs to neither subscription.
    pub fn route(&self, topic: &str, payload: Bytes) -> Option<IotEvent> {
        if topic == self.config {
            Some(IotEvent::Config(payload))
        } else if self.is_command(topic) {
            Some(IotEvent::Command(payload))
        } else {
            None
        }
    }
}
