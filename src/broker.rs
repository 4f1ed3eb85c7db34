//! Broadcast broker for live event notification.
//!
//! The `Broker` wraps a `tokio::broadcast` channel that carries `Arc<StoredEvent>`
//! messages. The writer task publishes newly committed events after they are durable,
//! and every subscription and projection worker receives them. Using `Arc` ensures that
//! events are shared across receivers without deep-cloning payloads.
//!
//! Each receiver is its own bounded queue: a slow consumer falls behind and observes a
//! lag instead of blocking the writer.

use std::sync::Arc;

use async_stream::stream;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::reader::ReadIndex;
use crate::types::StoredEvent;

/// One item of a catch-up-then-live feed.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// A committed event, in global position order.
    Event(Arc<StoredEvent>),
    /// All events committed before the feed started have been delivered.
    CaughtUp,
}

/// Broadcast broker for pushing newly committed events to live consumers.
#[derive(Clone, Debug)]
pub struct Broker {
    tx: broadcast::Sender<Arc<StoredEvent>>,
}

impl Broker {
    /// Create a new broker with the given per-receiver buffer capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events a receiver can fall behind before it
    ///   lags. Must be greater than zero.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish committed events to all active receivers.
    ///
    /// Publishing with no receivers is normal (nothing subscribed yet) and is only
    /// logged at trace level.
    pub fn publish(&self, events: &[Arc<StoredEvent>]) {
        for event in events {
            if self.tx.send(Arc::clone(event)).is_err() {
                tracing::trace!(position = event.position, "broker publish: no active receivers");
            }
        }
    }

    /// Create a new receiver for events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StoredEvent>> {
        self.tx.subscribe()
    }
}

/// Create a stream that replays committed events from `from_position` (catch-up),
/// emits a `CaughtUp` marker, then forwards live events from the broker.
///
/// The broadcast receiver is registered **before** any historical read begins, so events
/// committed between the end of catch-up and the start of live listening are not lost.
/// Live events already delivered during catch-up are skipped.
///
/// # Arguments
///
/// * `read_index` - Read handle on the in-memory log.
/// * `broker` - Broker to subscribe to for live events.
/// * `from_position` - 1-based global position of the first event to deliver.
/// * `batch_size` - Number of events read per catch-up window.
///
/// # Errors
///
/// Yields [`Error::Lagged`] and ends if the receiver falls behind the broadcast buffer.
/// The consumer should start a new feed from its last processed position.
pub fn subscribe_from(
    read_index: ReadIndex,
    broker: &Broker,
    from_position: u64,
    batch_size: usize,
) -> impl futures_core::Stream<Item = Result<FeedMessage, Error>> + Send + 'static {
    let mut rx = broker.subscribe();
    let batch_size = batch_size.max(1);

    stream! {
        let mut cursor = from_position.max(1);

        loop {
            let batch = read_index.read_all(cursor, batch_size);
            let batch_len = batch.len();
            for event in batch {
                cursor = event.position + 1;
                yield Ok(FeedMessage::Event(event));
            }
            if batch_len < batch_size {
                break;
            }
        }

        yield Ok(FeedMessage::CaughtUp);

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.position < cursor {
                        continue;
                    }
                    cursor = event.position + 1;
                    yield Ok(FeedMessage::Event(event));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    yield Err(Error::Lagged { missed });
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
