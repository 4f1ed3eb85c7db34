//! Core domain types for crisislog.
//!
//! This module defines the foundational data types every other module depends on:
//! events proposed by callers, events stored with their assigned positions, the closed
//! set of event categories, stream metadata, snapshots, and the size limits enforced on
//! append.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Maximum size of a single encoded event in bytes (payload + metadata + fixed fields).
///
/// Events exceeding this limit are rejected on append. Domain events should be small,
/// structured data. Large artifacts belong in external storage; events carry references
/// to them.
pub const MAX_EVENT_SIZE: usize = 64 * 1024; // 64 KB

/// Maximum length of an event type tag in bytes.
pub const MAX_EVENT_TYPE_LEN: usize = 256;

/// Maximum length of a stream id in bytes.
pub const MAX_STREAM_ID_LEN: usize = 256;

/// Returns the current wall-clock time as Unix epoch milliseconds.
///
/// A clock set before the epoch yields 0 rather than an error.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The closed set of event categories.
///
/// `Unknown` exists so that categories written by a newer producer can still be parsed
/// and read back. Appending an event with an `Unknown` category is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventCategory {
    /// Business facts about an aggregate.
    Domain,
    /// Infrastructure lifecycle events.
    System,
    /// Audit trail entries.
    Audit,
    /// Events exchanged with external systems.
    Integration,
    /// User-facing notifications.
    Notification,
    /// Recorded commands.
    Command,
    /// Recorded queries.
    Query,
    /// A category this build does not know about.
    Unknown(String),
}

impl EventCategory {
    /// All registered (known) categories, in declaration order.
    pub const REGISTERED: [EventCategory; 7] = [
        EventCategory::Domain,
        EventCategory::System,
        EventCategory::Audit,
        EventCategory::Integration,
        EventCategory::Notification,
        EventCategory::Command,
        EventCategory::Query,
    ];

    /// The canonical lowercase name of the category.
    pub fn as_str(&self) -> &str {
        match self {
            EventCategory::Domain => "domain",
            EventCategory::System => "system",
            EventCategory::Audit => "audit",
            EventCategory::Integration => "integration",
            EventCategory::Notification => "notification",
            EventCategory::Command => "command",
            EventCategory::Query => "query",
            EventCategory::Unknown(name) => name,
        }
    }

    /// Returns `true` for every variant except `Unknown`.
    pub fn is_registered(&self) -> bool {
        !matches!(self, EventCategory::Unknown(_))
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "domain" => EventCategory::Domain,
            "system" => EventCategory::System,
            "audit" => EventCategory::Audit,
            "integration" => EventCategory::Integration,
            "notification" => EventCategory::Notification,
            "command" => EventCategory::Command,
            "query" => EventCategory::Query,
            other => EventCategory::Unknown(other.to_string()),
        })
    }
}

impl From<String> for EventCategory {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(category) => category,
            Err(never) => match never {},
        }
    }
}

impl From<EventCategory> for String {
    fn from(category: EventCategory) -> Self {
        category.as_str().to_string()
    }
}

/// Lifecycle status of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Accepted but not yet durable.
    Pending,
    /// Durable and assigned a position.
    Committed,
    /// Delivered to downstream consumers.
    Published,
    /// Rejected after acceptance.
    Failed,
    /// Moved out of the active log by a retention policy.
    Archived,
}

/// Infrastructure context attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Who caused the event (user id, service name).
    pub actor: Option<String>,
    /// Session the event was produced in.
    pub session_id: Option<String>,
    /// Originating system or component.
    pub source: Option<String>,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Arbitrary additional fields.
    #[serde(default)]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

/// An event a caller wants to append to a stream.
///
/// `event_id` is an optional idempotency key: when set, a retried append whose first
/// event carries a recently seen id returns the originally stored events instead of
/// writing duplicates. When unset, the writer generates a fresh id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Client-assigned id, used for idempotent retries.
    pub event_id: Option<Uuid>,
    /// Event type tag (UTF-8, 1..=256 bytes).
    pub event_type: String,
    /// Category; must be a registered one.
    pub category: EventCategory,
    /// Opaque structured payload.
    pub data: serde_json::Value,
    /// Actor/session/source/tags/custom context.
    pub metadata: EventMetadata,
    /// Tracing id shared by related events.
    pub correlation_id: Option<String>,
    /// Id of the event or command that caused this one.
    pub causation_id: Option<String>,
}

impl NewEvent {
    /// Create a new event with empty metadata and no tracing ids.
    pub fn new(
        event_type: impl Into<String>,
        category: EventCategory,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: None,
            event_type: event_type.into(),
            category,
            data,
            metadata: EventMetadata::default(),
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Set the client-assigned idempotency id.
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }

    /// Replace the metadata.
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the causation id.
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// A committed event with its assigned stream version and global position.
///
/// Stored events are immutable once written. `version` is the 1-based index of the event
/// within its stream; `position` is its 1-based rank in the global log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Globally unique event id.
    pub id: Uuid,
    /// Stream this event belongs to.
    pub stream_id: String,
    /// Type of the stream (the id prefix before the first `-`).
    pub stream_type: String,
    /// Event type tag.
    pub event_type: String,
    /// Event category.
    pub category: EventCategory,
    /// 1-based version within the stream.
    pub version: u64,
    /// Opaque structured payload.
    pub data: serde_json::Value,
    /// Actor/session/source/tags/custom context.
    pub metadata: EventMetadata,
    /// Unix epoch milliseconds, assigned at append time.
    pub timestamp: u64,
    /// Lifecycle status.
    pub status: EventStatus,
    /// Tracing id shared by related events.
    pub correlation_id: Option<String>,
    /// Id of the event or command that caused this one.
    pub causation_id: Option<String>,
    /// 1-based position in the global log.
    pub position: u64,
    /// CRC32 of the event identity, see [`identity_checksum`].
    pub checksum: u32,
}

/// CRC32 over the fields that identify an event: id, stream id, version, position and
/// event type.
pub fn identity_checksum(
    id: &Uuid,
    stream_id: &str,
    version: u64,
    position: u64,
    event_type: &str,
) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(stream_id.as_bytes());
    hasher.update(&version.to_le_bytes());
    hasher.update(&position.to_le_bytes());
    hasher.update(event_type.as_bytes());
    hasher.finalize()
}

impl StoredEvent {
    /// Recompute the identity checksum from the current field values.
    pub fn compute_checksum(&self) -> u32 {
        identity_checksum(
            &self.id,
            &self.stream_id,
            self.version,
            self.position,
            &self.event_type,
        )
    }

    /// Verify the stored checksum against the event identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] if the stored and recomputed values differ.
    pub fn verify_checksum(&self) -> Result<(), Error> {
        let computed = self.compute_checksum();
        if computed != self.checksum {
            return Err(Error::ChecksumMismatch {
                position: self.position,
                stored: self.checksum,
                computed,
            });
        }
        Ok(())
    }
}

/// How long events of a stream are kept in the active log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Never archive.
    #[default]
    KeepForever,
    /// Archive events older than the given number of days.
    MaxAgeDays(u32),
    /// Keep at most the given number of most recent events.
    MaxCount(u64),
}

/// Reference from a stream to its current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    /// Id of the snapshot.
    pub snapshot_id: Uuid,
    /// Stream version the snapshot represents.
    pub version: u64,
}

/// Metadata about a single stream.
///
/// Streams are created implicitly by the first append to an unknown id and are never
/// deleted. `version` always equals the number of events appended to the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStream {
    /// Stream id.
    pub id: String,
    /// Stream type (id prefix before the first `-`).
    pub stream_type: String,
    /// Aggregate id (id suffix after the first `-`, or the whole id).
    pub aggregate_id: String,
    /// Aggregate type (same as the stream type).
    pub aggregate_type: String,
    /// Current version, equal to the event count.
    pub version: u64,
    /// Id of the most recently appended event.
    pub last_event_id: Option<Uuid>,
    /// The stream's current snapshot, if any.
    pub snapshot: Option<SnapshotRef>,
    /// Retention policy applied by archival jobs.
    pub retention: RetentionPolicy,
    /// Whether payloads are encrypted at rest by the storage backend.
    pub encrypted: bool,
    /// Timestamp of the first append (Unix epoch millis).
    pub created_at: u64,
    /// Timestamp of the latest append (Unix epoch millis).
    pub updated_at: u64,
}

/// A point-in-time capture of derived state for a stream.
///
/// The state is an opaque blob. `version` is the stream version the state represents and
/// never exceeds the stream's current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    /// Snapshot id.
    pub id: Uuid,
    /// Stream the snapshot belongs to.
    pub stream_id: String,
    /// Stream version captured.
    pub version: u64,
    /// Opaque state blob.
    pub state: Bytes,
    /// Size of the state blob in bytes.
    pub size: usize,
    /// CRC32 of the state blob.
    pub checksum: u32,
    /// Creation time (Unix epoch millis).
    pub created_at: u64,
}

impl StreamSnapshot {
    /// Build a snapshot of `state` at `version`, computing size and checksum.
    pub fn new(stream_id: impl Into<String>, version: u64, state: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream_id: stream_id.into(),
            version,
            size: state.len(),
            checksum: crc32fast::hash(&state),
            state,
            created_at: now_millis(),
        }
    }

    /// Verify the state blob against the stored checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] (with `position` set to the snapshot version)
    /// if the blob does not hash to the stored checksum.
    pub fn verify_checksum(&self) -> Result<(), Error> {
        let computed = crc32fast::hash(&self.state);
        if computed != self.checksum {
            return Err(Error::ChecksumMismatch {
                position: self.version,
                stored: self.checksum,
                computed,
            });
        }
        Ok(())
    }
}

/// Validate a stream id.
///
/// A valid id is 1..=[`MAX_STREAM_ID_LEN`] bytes drawn from ASCII letters, digits and
/// `_ . : @ / $ -`. In particular `*` and whitespace are rejected, so stored ids never
/// look like subscription patterns.
///
/// # Errors
///
/// Returns [`Error::Validation`] describing the first problem found.
pub fn validate_stream_id(stream_id: &str) -> Result<(), Error> {
    if stream_id.is_empty() {
        return Err(Error::Validation("stream id must not be empty".to_string()));
    }
    if stream_id.len() > MAX_STREAM_ID_LEN {
        return Err(Error::Validation(format!(
            "stream id exceeds {MAX_STREAM_ID_LEN} byte limit: {} bytes",
            stream_id.len()
        )));
    }
    if let Some(bad) = stream_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || "_.:@/$-".contains(*c)))
    {
        return Err(Error::Validation(format!(
            "stream id {stream_id:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Validate an event type tag: non-empty and at most [`MAX_EVENT_TYPE_LEN`] bytes.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the tag is empty or too long.
pub fn validate_event_type(event_type: &str) -> Result<(), Error> {
    if event_type.is_empty() {
        return Err(Error::Validation(
            "event type must not be empty".to_string(),
        ));
    }
    if event_type.len() > MAX_EVENT_TYPE_LEN {
        return Err(Error::Validation(format!(
            "event type exceeds {} byte limit: {} bytes",
            MAX_EVENT_TYPE_LEN,
            event_type.len()
        )));
    }
    Ok(())
}

/// Split a stream id into `(stream_type, aggregate_id)` at the first `-`.
///
/// `"alert-42"` yields `("alert", "42")`. An id without a `-` is its own type and
/// aggregate id.
pub fn split_stream_id(stream_id: &str) -> (&str, &str) {
    match stream_id.split_once('-') {
        Some((kind, rest)) if !kind.is_empty() && !rest.is_empty() => (kind, rest),
        _ => (stream_id, stream_id),
    }
}
