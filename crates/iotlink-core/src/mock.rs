//! In-memory transport for tests and offline wiring.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::transport::{InboundSender, Qos, SessionOptions, SessionTransport, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
}

#[derive(Default)]
struct MockState {
    open: bool,
    failing_opens: u32,
    fail_every_open: bool,
    fail_publishes: bool,
    lose_link_before_ack: bool,
    inbound: Option<InboundSender>,
    opens: Vec<SessionOptions>,
    subscriptions: Vec<String>,
    published: Vec<PublishedMessage>,
    unacknowledged: Vec<PublishedMessage>,
    closes: usize,
}

/// Scriptable [`SessionTransport`]: records every call and lets tests inject inbound
/// traffic, open failures, publish failures and link loss.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` open attempts fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().failing_opens = count;
    }

    pub fn fail_every_open(&self, fail: bool) {
        self.state.lock().fail_every_open = fail;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    /// The next publish is written to the wire, then the link drops before the
    /// broker acknowledges it.
    pub fn lose_link_before_ack(&self, lose: bool) {
        self.state.lock().lose_link_before_ack = lose;
    }

    /// Delivers a message as if it arrived from the broker. Returns false when no
    /// session is open or nobody is listening.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let state = self.state.lock();
        match (&state.inbound, state.open) {
            (Some(inbound), true) => inbound
                .send(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.into(),
                })
                .is_ok(),
            _ => false,
        }
    }

    /// Simulates the broker link dropping under an open session.
    pub fn drop_link(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            return false;
        }
        state.open = false;
        match state.inbound.take() {
            Some(inbound) => inbound
                .send(TransportEvent::ConnectionLost {
                    reason: reason.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn open_attempts(&self) -> usize {
        self.state.lock().opens.len()
    }

    pub fn last_options(&self) -> Option<SessionOptions> {
        self.state.lock().opens.last().cloned()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Publishes that were sent but never acknowledged.
    pub fn unacknowledged(&self) -> Vec<PublishedMessage> {
        self.state.lock().unacknowledged.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }
}

#[async_trait]
impl SessionTransport for MockTransport {
    async fn open(
        &self,
        options: SessionOptions,
        inbound: InboundSender,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.opens.push(options);
        if state.fail_every_open {
            return Err(TransportError::Connect("broker unreachable".into()));
        }
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(TransportError::Connect("broker unreachable".into()));
        }
        state.open = true;
        state.inbound = Some(inbound);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: Qos) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        state.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: Qos) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        if state.fail_publishes {
            return Err(TransportError::Publish("puback timeout".into()));
        }
        let message = PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        };
        if state.lose_link_before_ack {
            state.lose_link_before_ack = false;
            state.unacknowledged.push(message);
            state.open = false;
            if let Some(inbound) = state.inbound.take() {
                let _ = inbound.send(TransportEvent::ConnectionLost {
                    reason: "connection reset".into(),
                });
            }
            return Err(TransportError::Publish("link lost before PUBACK".into()));
        }
        state.published.push(message);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state.inbound = None;
            state.closes += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}
