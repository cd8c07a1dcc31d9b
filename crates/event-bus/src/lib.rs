//! Hot multicast event channel.
//!
//! Every event emitted on an [`EventBus`] is handed to each [`EventStream`] that is
//! subscribed at emission time, in emission order. Nothing is replayed to streams that
//! subscribe later, and a stream only ends once its bus has been dropped.

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("subscriber lagged behind by {0} events")]
    Lagged(u64),
}

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug)]
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how far a subscriber may fall behind before it starts
    /// skipping events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventStream<E> {
        EventStream {
            rx: self.sender.subscribe(),
        }
    }

    /// Emits to all live subscribers and returns how many received the event.
    /// Emitting with no subscribers is not an error; the event is simply dropped.
    pub fn emit(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct EventStream<E> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone> EventStream<E> {
    /// Waits for the next event. Returns `None` once the bus is gone.
    ///
    /// A subscriber that fell further behind than the bus capacity loses the oldest
    /// events; the gap is logged and delivery resumes with the oldest retained one.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "event_bus", skipped, "subscriber lagged; skipping ahead");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> BusResult<Option<E>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
            Err(TryRecvError::Closed) => Err(BusError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_in_emission_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.emit("a"), 2);
        assert_eq!(bus.emit("b"), 2);

        assert_eq!(first.recv().await, Some("a"));
        assert_eq!(first.recv().await, Some("b"));
        assert_eq!(second.recv().await, Some("a"));
        assert_eq!(second.recv().await, Some("b"));
    }

    #[tokio::test]
    async fn late_subscribers_see_no_replay() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(1u32), 0);

        let mut late = bus.subscribe();
        assert_eq!(late.try_recv(), Ok(None));

        bus.emit(2);
        assert_eq!(late.recv().await, Some(2));
    }

    #[tokio::test]
    async fn stream_ends_when_bus_dropped() {
        let bus = EventBus::<u8>::new();
        let mut stream = bus.subscribe();
        bus.emit(7);
        drop(bus);

        assert_eq!(stream.recv().await, Some(7));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn lagging_subscriber_resumes_with_retained_events() {
        let bus = EventBus::with_capacity(2);
        let mut slow = bus.subscribe();
        for n in 0..4u32 {
            bus.emit(n);
        }

        assert_eq!(slow.recv().await, Some(2));
        assert_eq!(slow.recv().await, Some(3));
        assert_eq!(bus.subscriber_count(), 1);
    }
}
