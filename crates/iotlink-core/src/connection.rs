//! Broker session ownership and the reconnect state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected -> Reconnecting -> Connecting -> Connected
//! any -> Disconnected        (disconnect)
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use event_bus::{EventBus, EventStream};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::credentials::{issue_token, DeviceCredentials, DEFAULT_TOKEN_TTL};
use crate::error::ConnectError;
use crate::events::IotEvent;
use crate::identity::DeviceIdentity;
use crate::registration::RegistrationRequest;
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::telemetry::{TelemetryPublisher, MAX_PUB_SIZE_BYTES};
use crate::topics::DeviceTopics;
use crate::transport::{Qos, SessionOptions, SessionTransport, TransportEvent};

pub const RECONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// The broker ignores the username but MQTT requires one to carry a password.
const SESSION_USERNAME: &str = "unused";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub region: String,
    pub keep_alive: Duration,
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "mqtt.googleapis.com".into(),
            port: 8883,
            region: "us-central1".into(),
            keep_alive: Duration::from_secs(60),
            max_packet_size: MAX_PUB_SIZE_BYTES + 64 * 1024,
        }
    }
}

impl BrokerConfig {
    pub fn client_id(&self, identity: &DeviceIdentity) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            identity.project_id, self.region, identity.registry_id, identity.device_id
        )
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub broker: BrokerConfig,
    pub reconnect_timeout: Duration,
    /// Zero retries forever.
    pub max_reconnect_retries: u32,
    pub token_ttl: Duration,
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            reconnect_timeout: RECONNECT_TIMEOUT,
            max_reconnect_retries: 0,
            token_ttl: DEFAULT_TOKEN_TTL,
            event_capacity: event_bus::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Default)]
struct Session {
    identity: Option<DeviceIdentity>,
    dispatcher: Option<JoinHandle<()>>,
    open: bool,
}

struct Inner {
    device_id: String,
    credentials: DeviceCredentials,
    transport: Arc<dyn SessionTransport>,
    config: ConnectionConfig,
    scheduler: Scheduler,
    events: EventBus<IotEvent>,
    state: watch::Sender<SessionState>,
    failed_connects: AtomicU32,
    retry: Mutex<Option<ScheduledTask>>,
    /// Publish targets; present only while connected.
    topics: RwLock<Option<DeviceTopics>>,
    /// Serializes connect, disconnect and link-loss handling.
    session: tokio::sync::Mutex<Session>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(retry) = self.retry.get_mut().take() {
            retry.cancel();
        }
        if let Some(dispatcher) = self.session.get_mut().dispatcher.take() {
            dispatcher.abort();
        }
    }
}

/// Owns the device's broker session. Cheap to clone; clones share one session.
///
/// Connect and publish failures never surface as errors: they become `false`
/// results and reconnect-state transitions. Call [`ConnectionManager::disconnect`]
/// before dropping the last handle so the transport is closed cleanly.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        device_id: impl Into<String>,
        credentials: DeviceCredentials,
        transport: Arc<dyn SessionTransport>,
        config: ConnectionConfig,
        scheduler: Scheduler,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let events = EventBus::with_capacity(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                device_id: device_id.into(),
                credentials,
                transport,
                config,
                scheduler,
                events,
                state,
                failed_connects: AtomicU32::new(0),
                retry: Mutex::new(None),
                topics: RwLock::new(None),
                session: tokio::sync::Mutex::new(Session::default()),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Identity of this device within the given registry.
    pub fn identity(&self, project_id: &str, registry_id: &str) -> DeviceIdentity {
        DeviceIdentity::new(self.inner.device_id.clone(), registry_id, project_id)
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Consecutive failed connect attempts since the last successful one.
    pub fn failed_connects(&self) -> u32 {
        self.inner.failed_connects.load(Ordering::SeqCst)
    }

    /// Subscribes to connectivity, config and command events from this point on.
    pub fn subscribe(&self) -> EventStream<IotEvent> {
        self.inner.events.subscribe()
    }

    /// Opens the broker session for `identity`.
    ///
    /// Returns true once connected and subscribed. On failure it schedules a retry
    /// after the reconnect timeout (unless retries are exhausted) and returns false.
    pub async fn connect(&self, identity: DeviceIdentity) -> bool {
        self.connect_attempt(identity, None).await
    }

    async fn connect_attempt(
        &self,
        identity: DeviceIdentity,
        attempt: Option<CancellationToken>,
    ) -> bool {
        let mut session = self.inner.session.lock().await;
        if attempt.as_ref().is_some_and(|token| token.is_cancelled()) {
            debug!("retry cancelled before it could connect");
            return false;
        }
        if self.state() == SessionState::Connected {
            debug!("connect requested while already connected");
            return true;
        }

        self.cancel_retry();
        self.set_state(SessionState::Connecting);
        debug!(device_id = %identity.device_id, "connecting to broker");

        match self.open_session(&mut session, &identity).await {
            Ok(()) => {
                self.inner.failed_connects.store(0, Ordering::SeqCst);
                *self.inner.topics.write() = Some(DeviceTopics::new(&identity.device_id));
                session.identity = Some(identity);
                self.set_state(SessionState::Connected);
                info!("connected to broker");
                true
            }
            Err(err) => {
                let failures = self.inner.failed_connects.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    error = %err,
                    failures,
                    retry_in_ms = self.inner.config.reconnect_timeout.as_millis() as u64,
                    "error connecting to broker"
                );
                self.teardown(&mut session).await;
                session.identity = Some(identity.clone());
                self.schedule_reconnect(identity);
                false
            }
        }
    }

    async fn open_session(
        &self,
        session: &mut Session,
        identity: &DeviceIdentity,
    ) -> Result<(), ConnectError> {
        let config = &self.inner.config;
        let token = issue_token(
            &identity.project_id,
            self.inner.credentials.signer.as_ref(),
            config.token_ttl,
        )?;
        let options = SessionOptions {
            client_id: config.broker.client_id(identity),
            username: SESSION_USERNAME.into(),
            password: token,
            host: config.broker.host.clone(),
            port: config.broker.port,
            keep_alive: config.broker.keep_alive,
            max_packet_size: config.broker.max_packet_size,
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.inner.transport.open(options, inbound_tx).await?;
        session.open = true;

        let topics = DeviceTopics::new(&identity.device_id);
        debug!("subscribing config and command topics");
        self.inner
            .transport
            .subscribe(&topics.config, Qos::AtLeastOnce)
            .await?;
        self.inner
            .transport
            .subscribe(&topics.commands, Qos::AtLeastOnce)
            .await?;

        session.dispatcher = Some(self.spawn_dispatcher(topics, inbound_rx));
        Ok(())
    }

    fn spawn_dispatcher(
        &self,
        topics: DeviceTopics,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.spawn(async move {
            while let Some(event) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match event {
                    TransportEvent::Message { topic, payload } => {
                        debug!(topic = %topic, bytes = payload.len(), "broker message");
                        match topics.route(&topic, payload) {
                            Some(event) => {
                                inner.events.emit(event);
                            }
                            None => warn!(topic = %topic, "message from unknown topic"),
                        }
                    }
                    TransportEvent::ConnectionLost { reason } => {
                        info!(reason = %reason, "broker connection lost");
                        let manager = ConnectionManager { inner };
                        manager
                            .inner
                            .scheduler
                            .spawn(connection_lost(manager.clone()));
                        break;
                    }
                }
            }
        })
    }

    async fn handle_connection_lost(&self) {
        let mut session = self.inner.session.lock().await;
        if self.state() != SessionState::Connected {
            return;
        }
        let Some(identity) = session.identity.clone() else {
            return;
        };
        self.teardown(&mut session).await;
        self.schedule_reconnect(identity);
    }

    /// Removes the inbound dispatcher and closes the transport if it is open.
    async fn teardown(&self, session: &mut Session) {
        *self.inner.topics.write() = None;
        if let Some(dispatcher) = session.dispatcher.take() {
            dispatcher.abort();
        }
        if session.open {
            session.open = false;
            info!("closing broker session");
            if let Err(err) = self.inner.transport.close().await {
                warn!(error = %err, "error closing broker session");
            }
        }
    }

    fn should_reconnect(&self) -> bool {
        let max = self.inner.config.max_reconnect_retries;
        max == 0 || self.failed_connects() < max
    }

    fn schedule_reconnect(&self, identity: DeviceIdentity) {
        self.set_state(SessionState::Reconnecting);
        if !self.should_reconnect() {
            error!(
                failures = self.failed_connects(),
                max_retries = self.inner.config.max_reconnect_retries,
                "reconnect retries exhausted; staying disconnected until reconnected manually"
            );
            return;
        }

        self.inner.events.emit(IotEvent::Reconnecting);
        let token = CancellationToken::new();
        let task = self.inner.scheduler.schedule_with(
            token.clone(),
            self.inner.config.reconnect_timeout,
            retry(Arc::downgrade(&self.inner), identity, token),
        );
        if let Some(previous) = self.inner.retry.lock().replace(task) {
            previous.cancel();
        }
    }

    fn cancel_retry(&self) {
        if let Some(pending) = self.inner.retry.lock().take() {
            pending.cancel();
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "session state changed");
        }
    }

    /// Cancels any pending retry and closes the session. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.cancel_retry();
        let mut session = self.inner.session.lock().await;
        self.cancel_retry();
        if session.open {
            info!("disconnecting from broker");
        }
        self.teardown(&mut session).await;
        session.identity = None;
        self.set_state(SessionState::Disconnected);
    }

    pub async fn publish_state(&self, payload: impl Into<Bytes>) -> bool {
        let topic = self.inner.topics.read().as_ref().map(|t| t.state.clone());
        match topic {
            Some(topic) => self.publish(&topic, payload.into()).await,
            None => {
                warn!("state publish skipped: not connected");
                false
            }
        }
    }

    pub async fn publish_telemetry(&self, payload: impl Into<Bytes>, subtopic: &str) -> bool {
        let topic = self
            .inner
            .topics
            .read()
            .as_ref()
            .map(|t| t.telemetry(subtopic));
        match topic {
            Some(topic) => self.publish(&topic, payload.into()).await,
            None => {
                warn!("telemetry publish skipped: not connected");
                false
            }
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> bool {
        debug!(topic, bytes = payload.len(), "publishing");
        match self
            .inner
            .transport
            .publish(topic, payload, Qos::AtLeastOnce)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(topic, error = %err, "publish failed");
                false
            }
        }
    }

    pub fn build_registration_request(&self) -> RegistrationRequest {
        RegistrationRequest {
            device_id: self.inner.device_id.clone(),
            rsa_certificate: self.inner.credentials.certificate_pem(),
        }
    }
}

#[async_trait]
impl TelemetryPublisher for ConnectionManager {
    async fn publish_telemetry(&self, payload: Bytes, subtopic: &str) -> bool {
        ConnectionManager::publish_telemetry(self, payload, subtopic).await
    }
}

// Boxed so the retry path can call back into `connect_attempt`.
fn retry(
    inner: Weak<Inner>,
    identity: DeviceIdentity,
    attempt: CancellationToken,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = ConnectionManager { inner };
        if manager.connect_attempt(identity, Some(attempt)).await {
            info!("delayed broker connection successful");
        } else {
            warn!(
                failures = manager.failed_connects(),
                "delayed broker connection failed"
            );
        }
    })
}

fn connection_lost(manager: ConnectionManager) -> BoxFuture<'static, ()> {
    Box::pin(async move { manager.handle_connection_lost().await })
}
