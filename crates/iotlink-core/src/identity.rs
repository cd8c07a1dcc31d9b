use serde::{Deserialize, Serialize};

/// Who the device is on the broker. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub registry_id: String,
    pub project_id: String,
}

impl DeviceIdentity {
    pub fn new(
        device_id: impl Into<String>,
        registry_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            registry_id: registry_id.into(),
            project_id: project_id.into(),
        }
    }
}
