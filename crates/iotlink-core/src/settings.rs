//! Persistent key/value settings the device keeps across restarts.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::SettingsError;
use crate::identity::DeviceIdentity;

pub const PROJECT_ID_KEY: &str = "projectId";
pub const REGISTRY_ID_KEY: &str = "registryId";

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
}

/// Identity from a previous registration, if both ids are stored and non-empty.
pub fn cached_registration(store: &dyn SettingsStore, device_id: &str) -> Option<DeviceIdentity> {
    let project = store.get(PROJECT_ID_KEY).filter(|v| !v.is_empty())?;
    let registry = store.get(REGISTRY_ID_KEY).filter(|v| !v.is_empty())?;
    Some(DeviceIdentity::new(device_id, registry, project))
}

pub fn store_registration(
    store: &dyn SettingsStore,
    identity: &DeviceIdentity,
) -> Result<(), SettingsError> {
    store.set(PROJECT_ID_KEY, &identity.project_id)?;
    store.set(REGISTRY_ID_KEY, &identity.registry_id)
}

pub fn clear_registration(store: &dyn SettingsStore) -> Result<(), SettingsError> {
    store.set(PROJECT_ID_KEY, "")?;
    store.set(REGISTRY_ID_KEY, "")
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
