//! Device facts reported in state publishes, and the payloads the cloud sends back.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use iotlink_core::settings::SettingsStore;
use iotlink_core::SettingsError;

pub const SERIAL_KEY: &str = "serialNumber";

/// Device-id prefix derived from a hardware model name.
///
/// Spaces and non-alphanumerics are removed and the rest lowercased. An id must
/// start with a letter, so a leading digit gets a `Device-` prefix.
pub fn device_prefix(model: &str) -> String {
    let prefix: String = model
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    match prefix.chars().next() {
        None => "Device".to_string(),
        Some(first) if first.is_ascii_alphabetic() => prefix,
        Some(_) => format!("Device-{prefix}"),
    }
}

/// Serial persisted in settings; a software serial is minted on first use.
pub fn device_serial(store: &dyn SettingsStore) -> Result<String, SettingsError> {
    if let Some(serial) = store.get(SERIAL_KEY).filter(|s| !s.is_empty()) {
        return Ok(serial);
    }
    let mut num = Uuid::new_v4().simple().to_string();
    num.truncate(8);
    let serial = format!("SS{}", num.to_ascii_uppercase());
    store.set(SERIAL_KEY, &serial)?;
    Ok(serial)
}

pub fn derive_device_id(model: &str, store: &dyn SettingsStore) -> Result<String, SettingsError> {
    Ok(format!("{}-{}", device_prefix(model), device_serial(store)?))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub device_id: String,
    pub model: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub logging_level: u8,
    pub buffered_logs: usize,
}

impl DeviceState {
    pub fn new(device_id: &str, model: &str, logging_level: u8, buffered_logs: usize) -> Self {
        Self {
            device_id: device_id.to_string(),
            model: model.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            logging_level,
            buffered_logs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    pub logging_enabled: bool,
    pub logging_level: i64,
}

impl DeviceConfig {
    /// Effective remote log level: zero unless logging is enabled.
    pub fn effective_level(&self) -> i64 {
        if self.logging_enabled {
            self.logging_level
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceCommand {
    pub reset: bool,
}
