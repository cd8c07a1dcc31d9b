use serde::{Deserialize, Serialize};

use crate::identity::DeviceIdentity;

/// Body posted to the registration service when the device has no cached identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub device_id: String,
    /// PEM-armored device certificate.
    pub rsa_certificate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResult {
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub num_id: String,
    pub registry_id: String,
    pub project_id: String,
}

impl RegistrationResult {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(
            self.device_id.clone(),
            self.registry_id.clone(),
            self.project_id.clone(),
        )
    }
}
