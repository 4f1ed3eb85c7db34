//! In-memory event log and stream index.
//!
//! [`EventLog`] is an arena of committed events: the event at global position `p` lives
//! in slot `p - 1`. Streams refer to their events by position only, so there is a single
//! owner of every event and no aliasing between the global and per-stream views.
//!
//! The log is shared as `Arc<RwLock<EventLog>>`. Only the writer task takes the write
//! lock; readers go through [`ReadIndex`](crate::reader::ReadIndex).

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::Error;
use crate::storage::Storage;
use crate::types::{EventStream, RetentionPolicy, SnapshotRef, StoredEvent, split_stream_id};

/// Number of events read per storage call while rebuilding the index.
const REBUILD_WINDOW: usize = 1024;

/// Index entry for one stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Global positions of the stream's events. Slot `v - 1` holds version `v`.
    pub positions: Vec<u64>,
    /// Stream metadata.
    pub info: EventStream,
}

impl StreamEntry {
    /// A fresh, empty stream created by the first append at `timestamp`.
    fn new(stream_id: &str, timestamp: u64) -> Self {
        let (stream_type, aggregate_id) = split_stream_id(stream_id);
        Self {
            positions: Vec::new(),
            info: EventStream {
                id: stream_id.to_string(),
                stream_type: stream_type.to_string(),
                aggregate_id: aggregate_id.to_string(),
                aggregate_type: stream_type.to_string(),
                version: 0,
                last_event_id: None,
                snapshot: None,
                retention: RetentionPolicy::default(),
                encrypted: false,
                created_at: timestamp,
                updated_at: timestamp,
            },
        }
    }
}

/// Global event arena plus per-stream index.
#[derive(Debug, Default)]
pub struct EventLog {
    /// Committed events; position `p` is at index `p - 1`.
    pub events: Vec<Arc<StoredEvent>>,
    /// Stream id to index entry.
    pub streams: HashMap<String, StreamEntry>,
    /// Event id to global position. Ids are unique across the whole log.
    ids: HashMap<Uuid, u64>,
}

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the log by reading every event from `storage`.
    ///
    /// Reads in fixed-size windows and checks that positions are contiguous and that
    /// each stream's versions are gap-free.
    ///
    /// # Errors
    ///
    /// Propagates storage read errors. Returns [`Error::CorruptRecord`] if positions
    /// or versions are out of sequence.
    pub fn rebuild(storage: &dyn Storage) -> Result<Self, Error> {
        let mut log = EventLog::new();
        loop {
            let window = storage.read_range(log.head() + 1, REBUILD_WINDOW)?;
            let len = window.len();
            for event in window {
                if event.position != log.head() + 1 {
                    return Err(Error::CorruptRecord {
                        position: event.position,
                        detail: format!("expected position {}", log.head() + 1),
                    });
                }
                if let Some(first) = log.position_of(&event.id) {
                    return Err(Error::CorruptRecord {
                        position: event.position,
                        detail: format!("event id {} already stored at {first}", event.id),
                    });
                }
                let expected_version = log.next_version(&event.stream_id);
                if event.version != expected_version {
                    return Err(Error::CorruptRecord {
                        position: event.position,
                        detail: format!(
                            "stream {} expected version {expected_version}, found {}",
                            event.stream_id, event.version
                        ),
                    });
                }
                log.commit(event);
            }
            if len < REBUILD_WINDOW {
                break;
            }
        }
        Ok(log)
    }

    /// The position of the last committed event, or 0 for an empty log.
    pub fn head(&self) -> u64 {
        self.events.len() as u64
    }

    /// The version the next event appended to `stream_id` will receive.
    pub fn next_version(&self, stream_id: &str) -> u64 {
        self.streams
            .get(stream_id)
            .map(|entry| entry.info.version + 1)
            .unwrap_or(1)
    }

    /// Timestamp of the last committed event, or 0 for an empty log.
    pub fn last_timestamp(&self) -> u64 {
        self.events.last().map(|e| e.timestamp).unwrap_or(0)
    }

    /// Event at a 1-based global position.
    pub fn get(&self, position: u64) -> Option<&Arc<StoredEvent>> {
        if position == 0 {
            return None;
        }
        self.events.get(position as usize - 1)
    }

    /// Position of the event with id `id`, if it has been committed.
    pub fn position_of(&self, id: &Uuid) -> Option<u64> {
        self.ids.get(id).copied()
    }

    /// Append one committed event to the arena and its stream.
    ///
    /// Creates the stream on first use. The caller guarantees that `event.position`
    /// is `head + 1` and `event.version` is the stream's next version.
    pub fn commit(&mut self, event: StoredEvent) -> Arc<StoredEvent> {
        let event = Arc::new(event);
        let entry = self
            .streams
            .entry(event.stream_id.clone())
            .or_insert_with(|| StreamEntry::new(&event.stream_id, event.timestamp));
        entry.positions.push(event.position);
        entry.info.version = event.version;
        entry.info.last_event_id = Some(event.id);
        entry.info.updated_at = event.timestamp;
        self.ids.insert(event.id, event.position);
        self.events.push(Arc::clone(&event));
        event
    }

    /// Record `snapshot` as the current snapshot of `stream_id`.
    ///
    /// Returns `false` if the stream is unknown.
    pub fn set_snapshot(&mut self, stream_id: &str, snapshot: SnapshotRef) -> bool {
        match self.streams.get_mut(stream_id) {
            Some(entry) => {
                entry.info.snapshot = Some(snapshot);
                true
            }
            None => false,
        }
    }
}
