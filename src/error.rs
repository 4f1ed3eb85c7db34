//! Error types for crisislog.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. Synchronous operations (append, query, CRUD)
//! return these errors to the caller directly. Failures on the asynchronous notification
//! path (dispatch, projection folding, replay delivery) are recorded on the owning
//! subscription, projection or replay session instead; the `SubscriptionDispatch` and
//! `ProjectionHandler` variants describe those recorded failures.

use std::fmt;

/// The kind of entity a [`Error::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// An event stream.
    Stream,
    /// A stream snapshot.
    Snapshot,
    /// A subscription.
    Subscription,
    /// A projection.
    Projection,
    /// A replay session.
    ReplaySession,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Stream => "stream",
            EntityKind::Snapshot => "snapshot",
            EntityKind::Subscription => "subscription",
            EntityKind::Projection => "projection",
            EntityKind::ReplaySession => "replay session",
        };
        f.write_str(name)
    }
}

/// Unified error type for all crisislog operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested stream, snapshot, subscription, projection or replay session
    /// does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of entity was looked up.
        kind: EntityKind,
        /// Identifier that was looked up.
        id: String,
    },

    /// A request argument is invalid (malformed stream id, unregistered category,
    /// inverted range, invalid state transition, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// Reserved for an expected-version append guard. Never raised by this crate.
    #[error("concurrency conflict on stream {stream_id}: expected {expected}, actual {actual}")]
    ConcurrencyConflict {
        /// Stream the append targeted.
        stream_id: String,
        /// Version the caller expected.
        expected: u64,
        /// Version the stream is actually at.
        actual: u64,
    },

    /// A stored event failed its integrity check on read.
    #[error("checksum mismatch at position {position}: stored {stored:#010X}, computed {computed:#010X}")]
    ChecksumMismatch {
        /// Global position of the offending event.
        position: u64,
        /// Checksum stored with the event.
        stored: u32,
        /// Checksum recomputed from the event identity.
        computed: u32,
    },

    /// Delivery to a subscriber failed after exhausting its retry policy.
    #[error("dispatch to subscription {subscription} failed after {attempts} attempts: {reason}")]
    SubscriptionDispatch {
        /// Name of the subscription.
        subscription: String,
        /// Number of delivery attempts made.
        attempts: u32,
        /// Last failure reported by the dispatcher.
        reason: String,
    },

    /// A projection handler failed while folding an event.
    #[error("projection {projection} handler for {event_type} failed: {reason}")]
    ProjectionHandler {
        /// Name of the projection.
        projection: String,
        /// Event type whose handler failed.
        event_type: String,
        /// Failure reported by the handler.
        reason: String,
    },

    /// The encoded event exceeds the maximum allowed size.
    #[error("event too large: {size} bytes exceeds {max} byte limit")]
    EventTooLarge {
        /// Actual encoded size of the event in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// An I/O error occurred in a storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record on disk is corrupt (e.g., CRC mismatch, truncated data).
    #[error("corrupt record at position {position}: {detail}")]
    CorruptRecord {
        /// Global position of the corrupt record (0 if unknown).
        position: u64,
        /// Human-readable description of the corruption.
        detail: String,
    },

    /// The file header is invalid or unrecognized.
    #[error("invalid file header: {0}")]
    InvalidHeader(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A live feed receiver fell behind the broadcast buffer and missed events.
    #[error("live feed lagged: {missed} events missed")]
    Lagged {
        /// Number of events the receiver skipped.
        missed: u64,
    },

    /// A background task the call depends on has shut down.
    #[error("{0} closed")]
    Closed(&'static str),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`] of the given kind.
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Failure reported by a [`Dispatcher`](crate::subscription::Dispatcher) for one
/// delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_names_kind_and_id() {
        let err = Error::not_found(EntityKind::Subscription, "alerts");
        let msg = err.to_string();
        assert!(msg.contains("subscription"), "expected kind in: {msg}");
        assert!(msg.contains("alerts"), "expected id in: {msg}");
    }

    #[test]
    fn replay_session_kind_display() {
        let err = Error::not_found(EntityKind::ReplaySession, "abc");
        assert_eq!(err.to_string(), "replay session not found: abc");
    }

    #[test]
    fn validation_display_includes_reason() {
        let err = Error::Validation("to_position < from_position".into());
        assert!(err.to_string().contains("to_position < from_position"));
    }

    #[test]
    fn checksum_mismatch_display_includes_position() {
        let err = Error::ChecksumMismatch {
            position: 42,
            stored: 1,
            computed: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("42"), "expected '42' in: {msg}");
        assert!(msg.contains("0x00000001"), "expected stored crc in: {msg}");
    }

    #[test]
    fn io_error_question_mark_coercion() {
        fn fallible() -> Result<(), Error> {
            let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
            Err(io_err)?
        }

        let result = fallible();
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn serde_json_error_converts() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err = Error::from(parse.expect_err("invalid json should fail"));
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn dispatch_failure_display() {
        let err = Error::SubscriptionDispatch {
            subscription: "alerts".into(),
            attempts: 4,
            reason: "connection refused".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempts"), "got: {msg}");
        assert!(msg.contains("connection refused"), "got: {msg}");
    }

    #[test]
    fn delivery_error_display() {
        let err = DeliveryError("timeout".into());
        assert_eq!(err.to_string(), "delivery failed: timeout");
    }
}
