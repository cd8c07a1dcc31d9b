use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

/// Everything a transport needs to open one authenticated session.
#[derive(Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub max_packet_size: usize,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("keep_alive", &self.keep_alive)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

/// What a transport reports from its own I/O context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { topic: String, payload: Bytes },
    /// The link dropped underneath an open session. Sent at most once per session.
    ConnectionLost { reason: String },
}

pub type InboundSender = mpsc::UnboundedSender<TransportEvent>;

/// A single publish/subscribe session to the broker.
///
/// Implementations only decode and forward inbound traffic to the `inbound`
/// channel handed to [`SessionTransport::open`]; routing happens on the receiving side.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn open(&self, options: SessionOptions, inbound: InboundSender)
        -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError>;

    /// `AtLeastOnce` resolves only once the broker acknowledged the message.
    async fn publish(&self, topic: &str, payload: Bytes, qos: Qos) -> Result<(), TransportError>;

    /// Closes the session if one is open. Closing a closed transport is a no-op.
    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}
