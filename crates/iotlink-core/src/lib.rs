//! Device-side broker session for iotlink.
//!
//! Responsibilities:
//! - minting short-lived JWT session credentials from an opaque signer
//! - keeping one MQTT session alive through the reconnect state machine
//! - routing inbound config/command traffic onto a typed [`IotEvent`] stream
//! - publishing device state and telemetry

pub mod connection;
pub mod credentials;
pub mod error;
pub mod events;
pub mod identity;
pub mod mock;
pub mod mqtt;
pub mod registration;
pub mod scheduler;
pub mod settings;
pub mod telemetry;
pub mod topics;
pub mod transport;

pub use connection::{BrokerConfig, ConnectionConfig, ConnectionManager, SessionState};
pub use credentials::{issue_token, DeviceCredentials, PemSigner, Signer};
pub use error::{ConnectError, SettingsError, SigningError, TransportError};
pub use event_bus::EventStream;
pub use events::IotEvent;
pub use identity::DeviceIdentity;
pub use registration::{RegistrationRequest, RegistrationResult};
pub use scheduler::{ScheduledTask, Scheduler};
pub use settings::{MemorySettings, SettingsStore};
pub use telemetry::{TelemetryPublisher, MAX_PUB_SIZE_BYTES};
pub use topics::DeviceTopics;
pub use transport::{Qos, SessionOptions, SessionTransport, TransportEvent};
