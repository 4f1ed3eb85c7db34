//! Status-change feed for subscriptions, projections and replay sessions.
//!
//! Failures on the asynchronous notification path are never returned to appenders.
//! They are recorded on the owning record and announced here, so operators can react
//! without polling.

use tokio::sync::broadcast;

use crate::error::EntityKind;
use crate::types::now_millis;

/// One status transition of a subscription, projection or replay session.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    /// Kind of the record that changed.
    pub kind: EntityKind,
    /// Name (or session id) of the record.
    pub id: String,
    /// Status before the transition.
    pub from: &'static str,
    /// Status after the transition.
    pub to: &'static str,
    /// Error that caused the transition, if any.
    pub reason: Option<String>,
    /// When the transition happened (Unix epoch millis).
    pub at: u64,
}

/// Broadcast sender for [`StatusChange`]s.
#[derive(Clone, Debug)]
pub struct StatusFeed {
    tx: broadcast::Sender<StatusChange>,
}

impl StatusFeed {
    /// Create a feed buffering up to `capacity` changes per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Announce a transition. A feed without receivers drops it silently.
    pub fn publish(
        &self,
        kind: EntityKind,
        id: impl Into<String>,
        from: &'static str,
        to: &'static str,
        reason: Option<String>,
    ) {
        let change = StatusChange {
            kind,
            id: id.into(),
            from,
            to,
            reason,
            at: now_millis(),
        };
        let _ = self.tx.send(change);
    }

    /// Receive every transition published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_change() {
        let feed = StatusFeed::new(8);
        let mut rx = feed.subscribe();
        feed.publish(
            EntityKind::Subscription,
            "alerts",
            "active",
            "errored",
            Some("timeout".to_string()),
        );

        let change = rx.recv().await.expect("change");
        assert_eq!(change.kind, EntityKind::Subscription);
        assert_eq!(change.id, "alerts");
        assert_eq!((change.from, change.to), ("active", "errored"));
        assert_eq!(change.reason.as_deref(), Some("timeout"));
    }

    #[test]
    fn publish_without_receivers_is_silent() {
        let feed = StatusFeed::new(1);
        feed.publish(EntityKind::Projection, "p", "stopped", "running", None);
    }
}
