//! TLS MQTT 3.1.1 transport on `rumqttc`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{InboundSender, Qos, SessionOptions, SessionTransport, TransportEvent};

const REQUEST_CHANNEL_CAPACITY: usize = 16;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(20);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

impl From<Qos> for QoS {
    fn from(value: Qos) -> Self {
        match value {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// Matches publish requests to the broker's PUBACKs.
///
/// Requests are queued in the order they enter the client; the event loop writes
/// them in that same order, which is when the packet id becomes known.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<Option<oneshot::Sender<()>>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
    closed: bool,
}

type SharedAcks = Arc<Mutex<AckTracker>>;

impl AckTracker {
    /// Registers a publish about to be handed to the client. QoS 0 has nothing to
    /// wait for and yields `None`.
    fn expect_publish(&mut self, qos: Qos) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        match qos {
            Qos::AtMostOnce => {
                if !self.closed {
                    self.queued.push_back(None);
                }
                None
            }
            Qos::AtLeastOnce => {
                if !self.closed {
                    self.queued.push_back(Some(tx));
                }
                Some(rx)
            }
        }
    }

    /// Undoes the latest `expect_publish` when the client rejected the request.
    fn withdraw_last(&mut self) {
        self.queued.pop_back();
    }

    fn on_outgoing_publish(&mut self, pkid: u16) {
        if let Some(Some(tx)) = self.queued.pop_front() {
            self.inflight.insert(pkid, tx);
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if let Some(tx) = self.inflight.remove(&pkid) {
            let _ = tx.send(());
        }
    }

    /// Fails every pending waiter. Later registrations fail immediately.
    fn fail_all(&mut self) {
        self.closed = true;
        self.queued.clear();
        self.inflight.clear();
    }
}

struct ActiveSession {
    client: AsyncClient,
    link_up: Arc<AtomicBool>,
    acks: SharedAcks,
    poller: JoinHandle<()>,
}

pub struct MqttTransport {
    session: Mutex<Option<ActiveSession>>,
    // Keeps request order and `AckTracker` queue order identical.
    publish_gate: tokio::sync::Mutex<()>,
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            publish_gate: tokio::sync::Mutex::new(()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long an at-least-once publish waits for its PUBACK.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    fn client(&self) -> Result<(AsyncClient, SharedAcks), TransportError> {
        match self.session.lock().as_ref() {
            Some(session) if session.link_up.load(Ordering::Acquire) => {
                Ok((session.client.clone(), session.acks.clone()))
            }
            _ => Err(TransportError::NotConnected),
        }
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn mqtt_options(options: SessionOptions) -> MqttOptions {
    let mut mqtt = MqttOptions::new(options.client_id, options.host, options.port);
    mqtt.set_keep_alive(options.keep_alive)
        .set_credentials(options.username, options.password)
        .set_clean_session(true)
        .set_max_packet_size(options.max_packet_size, options.max_packet_size)
        .set_transport(Transport::tls_with_default_config());
    mqtt
}

/// Drives the event loop until the broker answers the CONNECT.
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Connect(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(_) => continue,
            Err(err) => return Err(TransportError::Connect(err.to_string())),
        }
    }
}

// rumqttc reconnects on the next poll after an error; the session password is a
// short-lived token, so the loop stops at the first error and reports the loss instead.
async fn forward_events(
    mut eventloop: EventLoop,
    inbound: InboundSender,
    link_up: Arc<AtomicBool>,
    acks: SharedAcks,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if inbound.send(event).is_err() {
                    debug!(target: "mqtt", "inbound receiver gone; stopping event loop");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                acks.lock().on_outgoing_publish(pkid);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.lock().on_puback(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(target: "mqtt", "disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                link_up.store(false, Ordering::Release);
                let _ = inbound.send(TransportEvent::ConnectionLost {
                    reason: err.to_string(),
                });
                break;
            }
        }
    }
    link_up.store(false, Ordering::Release);
    acks.lock().fail_all();
}

#[async_trait]
impl SessionTransport for MqttTransport {
    async fn open(
        &self,
        options: SessionOptions,
        inbound: InboundSender,
    ) -> Result<(), TransportError> {
        if let Err(err) = self.close().await {
            warn!(target: "mqtt", error = %err, "failed to close previous session");
        }

        info!(
            target: "mqtt",
            host = %options.host,
            port = options.port,
            client_id = %options.client_id,
            "opening broker session"
        );
        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(options), REQUEST_CHANNEL_CAPACITY);

        match tokio::time::timeout(self.connect_timeout, await_connack(&mut eventloop)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::Connect(format!(
                    "no CONNACK within {:?}",
                    self.connect_timeout
                )))
            }
        }

        let link_up = Arc::new(AtomicBool::new(true));
        let acks = SharedAcks::default();
        let poller = tokio::spawn(forward_events(
            eventloop,
            inbound,
            link_up.clone(),
            acks.clone(),
        ));
        *self.session.lock() = Some(ActiveSession {
            client,
            link_up,
            acks,
            poller,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        let (client, _) = self.client()?;
        client
            .subscribe(topic, qos.into())
            .await
            .map_err(|err| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    /// Returns once the broker acknowledged an at-least-once message, or once a
    /// fire-and-forget message was handed to the client.
    async fn publish(&self, topic: &str, payload: Bytes, qos: Qos) -> Result<(), TransportError> {
        let (client, acks) = self.client()?;
        let waiter = {
            let _gate = self.publish_gate.lock().await;
            let waiter = acks.lock().expect_publish(qos);
            if let Err(err) = client
                .publish(topic, qos.into(), false, payload.to_vec())
                .await
            {
                acks.lock().withdraw_last();
                return Err(TransportError::Publish(err.to_string()));
            }
            waiter
        };
        let Some(waiter) = waiter else {
            return Ok(());
        };
        match tokio::time::timeout(self.ack_timeout, waiter).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Publish(
                "link lost before PUBACK".to_string(),
            )),
            Err(_) => Err(TransportError::Publish(format!(
                "no PUBACK within {:?}",
                self.ack_timeout
            ))),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let active = self.session.lock().take();
        let Some(mut session) = active else {
            return Ok(());
        };
        let was_up = session.link_up.swap(false, Ordering::AcqRel);
        let result = if was_up {
            session
                .client
                .disconnect()
                .await
                .map_err(|err| TransportError::Close(err.to_string()))
        } else {
            Ok(())
        };
        if tokio::time::timeout(CLOSE_GRACE, &mut session.poller)
            .await
            .is_err()
        {
            session.poller.abort();
        }
        session.acks.lock().fail_all();
        result
    }

    fn is_open(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| session.link_up.load(Ordering::Acquire))
    }
}
