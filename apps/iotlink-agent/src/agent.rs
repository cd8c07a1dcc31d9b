//! Wires the connection manager, the remote log and the uploader into one device agent.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use iotlink_core::mqtt::MqttTransport;
use iotlink_core::settings::{cached_registration, clear_registration, store_registration};
use iotlink_core::{
    ConnectionManager, DeviceCredentials, IotEvent, Scheduler, SessionState, SettingsError,
    SettingsStore,
};
use iotlink_log::{LogUploader, RemoteLog, Verbosity};

use crate::config::AgentConfig;
use crate::device::{derive_device_id, DeviceCommand, DeviceConfig, DeviceState};
use crate::register::{NoRegistrar, Registrar, RegistrationClient, RegistrationError};
use crate::store::FileSettings;

const TAG: &str = "Agent";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),
    #[error("settings update failed: {0}")]
    Settings(#[from] SettingsError),
}

pub struct AgentParts {
    pub model: String,
    pub manager: ConnectionManager,
    pub log: Arc<RemoteLog>,
    pub uploader: LogUploader,
    pub settings: Arc<dyn SettingsStore>,
    pub registrar: Arc<dyn Registrar>,
    pub state_interval: Duration,
}

pub struct Agent {
    model: String,
    manager: ConnectionManager,
    log: Arc<RemoteLog>,
    uploader: LogUploader,
    settings: Arc<dyn SettingsStore>,
    registrar: Arc<dyn Registrar>,
    state_interval: Duration,
}

/// First buffered record of every run.
pub fn startup_record() -> String {
    format!(
        "{} {} startup",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
}

impl Agent {
    pub fn new(parts: AgentParts) -> Self {
        Self {
            model: parts.model,
            manager: parts.manager,
            log: parts.log,
            uploader: parts.uploader,
            settings: parts.settings,
            registrar: parts.registrar,
            state_interval: parts.state_interval,
        }
    }

    /// Builds the production agent: PEM credentials, file settings, MQTT over TLS.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let key = fs::read(&config.private_key).with_context(|| {
            format!("failed to read private key {}", config.private_key.display())
        })?;
        let certificate = fs::read_to_string(&config.certificate).with_context(|| {
            format!("failed to read certificate {}", config.certificate.display())
        })?;
        let credentials =
            DeviceCredentials::from_pem(&key, &certificate).context("invalid device credentials")?;

        let settings = Arc::new(
            FileSettings::open(&config.settings).context("failed to load settings")?,
        );
        let device_id = match config.device_id {
            Some(id) => id,
            None => derive_device_id(&config.model, settings.as_ref())
                .context("failed to derive device id")?,
        };

        let scheduler = Scheduler::current();
        let manager = ConnectionManager::new(
            device_id,
            credentials,
            Arc::new(MqttTransport::new()),
            config.connection,
            scheduler.clone(),
        );
        let log = Arc::new(RemoteLog::new().with_record(startup_record()));
        log.set_label("model", config.model.clone());
        let uploader = LogUploader::new(
            log.clone(),
            Arc::new(manager.clone()),
            scheduler,
            config.uploader,
        );
        let registrar: Arc<dyn Registrar> = match config.registration {
            Some(endpoint) => Arc::new(RegistrationClient::new(endpoint.base_url, endpoint.token)),
            None => Arc::new(NoRegistrar),
        };

        Ok(Self::new(AgentParts {
            model: config.model,
            manager,
            log,
            uploader,
            settings,
            registrar,
            state_interval: config.state_interval,
        }))
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn log(&self) -> &Arc<RemoteLog> {
        &self.log
    }

    pub fn uploader(&self) -> &LogUploader {
        &self.uploader
    }

    /// Connects with the cached registration, registering first when there is none.
    ///
    /// Returns whether the first connect attempt succeeded; a failed attempt keeps
    /// retrying in the background.
    pub async fn provision(&self) -> Result<bool, ProvisionError> {
        let device_id = self.manager.device_id();
        let identity = match cached_registration(self.settings.as_ref(), device_id) {
            Some(identity) => {
                debug!(project = %identity.project_id, registry = %identity.registry_id, "using cached registration");
                identity
            }
            None => {
                let request = self.manager.build_registration_request();
                let result = self.registrar.register(&request).await?;
                let identity = result.identity();
                store_registration(self.settings.as_ref(), &identity)?;
                self.log.info(
                    TAG,
                    &format!(
                        "registered as {} in {}/{}",
                        result.device_id, identity.project_id, identity.registry_id
                    ),
                );
                identity
            }
        };
        Ok(self.manager.connect(identity).await)
    }

    pub async fn handle_event(&self, event: IotEvent) {
        match event {
            IotEvent::Config(payload) => match serde_json::from_slice::<DeviceConfig>(&payload) {
                Ok(config) => self.apply_config(&config),
                Err(err) => self.log.warn_error(TAG, &err),
            },
            IotEvent::Command(payload) => match serde_json::from_slice::<DeviceCommand>(&payload) {
                Ok(command) if command.reset => {
                    if let Err(err) = self.reset().await {
                        self.log.warn_error(TAG, &err);
                    }
                }
                Ok(_) => debug!("command without actions"),
                Err(err) => self.log.warn_error(TAG, &err),
            },
            IotEvent::Reconnecting => self.log.info(TAG, "Reconnecting to broker"),
        }
    }

    pub fn apply_config(&self, config: &DeviceConfig) {
        let level = Verbosity::from_i64(config.effective_level());
        self.log
            .debug(TAG, &format!("setting logging level to {}", config.logging_level));
        self.log.set_level(level);
        if config.logging_enabled {
            self.uploader.start();
        } else {
            self.uploader.stop();
        }
    }

    /// Forgets the registration and drops the broker session.
    pub async fn reset(&self) -> Result<(), SettingsError> {
        warn!("reset requested; clearing registration");
        clear_registration(self.settings.as_ref())?;
        self.manager.disconnect().await;
        Ok(())
    }

    pub fn device_state(&self) -> DeviceState {
        DeviceState::new(
            self.manager.device_id(),
            &self.model,
            self.log.level().as_u8(),
            self.log.len(),
        )
    }

    pub async fn publish_state(&self) -> bool {
        match serde_json::to_vec(&self.device_state()) {
            Ok(payload) => self.manager.publish_state(payload).await,
            Err(err) => {
                warn!(error = %err, "device state serialization failed");
                false
            }
        }
    }

    /// Runs until `shutdown` fires, then stops uploading and disconnects.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut events = self.manager.subscribe();
        match self.provision().await {
            Ok(true) => info!(device_id = %self.manager.device_id(), "device online"),
            Ok(false) => warn!("initial connect failed; retrying in the background"),
            Err(err) => {
                self.shutdown().await;
                return Err(err).context("provisioning failed");
            }
        }

        let mut ticker = tokio::time::interval(self.state_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    if self.manager.state() == SessionState::Connected && !self.publish_state().await {
                        warn!("device state publish failed");
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!("shutting down");
        self.uploader.stop();
        self.manager.disconnect().await;
    }
}
