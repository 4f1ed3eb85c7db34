//! Persistence collaborator for the event store core.
//!
//! The core algorithms never touch bytes on disk directly. They go through the
//! [`Storage`] trait, which persists committed events keyed by global position (and thus
//! by `(stream_id, version)`), stream snapshots, and projection checkpoints. The writer
//! task owns the storage exclusively, so implementations need no internal locking of
//! their own beyond what sharing requires.
//!
//! [`MemoryStorage`] is the in-memory implementation used by tests and by embedders
//! that do not need durability. [`FileStorage`](crate::file_storage::FileStorage) is the
//! durable implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{StoredEvent, StreamSnapshot};

/// Persisted progress of a projection.
///
/// `position` is the global position of the last event folded into `state`; resuming
/// from a checkpoint continues at `position + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionCheckpoint {
    /// Projection name.
    pub name: String,
    /// Last folded global position.
    pub position: u64,
    /// Accumulated projection state at `position`.
    pub state: serde_json::Value,
    /// Number of events the projection had processed when the checkpoint was taken.
    pub events_processed: u64,
    /// When the checkpoint was written (Unix epoch millis).
    pub written_at: u64,
}

/// Durable backend for events, snapshots and projection checkpoints.
pub trait Storage: Send + 'static {
    /// Persist a batch of committed events atomically.
    ///
    /// Events arrive in ascending position order, and the first event's position is
    /// exactly one past the last persisted position.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be made durable; in that case none of
    /// the batch may be visible to later reads.
    fn append(&mut self, events: &[StoredEvent]) -> Result<(), Error>;

    /// Read up to `max_count` events starting at global position `from_position`
    /// (1-based; 0 is treated as 1). An empty result means the end of the log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] if a stored event fails verification.
    fn read_range(&self, from_position: u64, max_count: usize) -> Result<Vec<StoredEvent>, Error>;

    /// Persist a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot could not be made durable.
    fn write_snapshot(&mut self, snapshot: &StreamSnapshot) -> Result<(), Error>;

    /// Read every stored snapshot in creation order.
    ///
    /// Checksums are not verified here; callers decide what to do with a snapshot that
    /// fails [`StreamSnapshot::verify_checksum`].
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshots cannot be read or decoded.
    fn read_snapshots(&self) -> Result<Vec<StreamSnapshot>, Error>;

    /// Persist (replace) a projection checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint could not be made durable.
    fn write_checkpoint(&mut self, checkpoint: &ProjectionCheckpoint) -> Result<(), Error>;

    /// Read the checkpoint stored for a projection, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint exists but cannot be read.
    fn read_checkpoint(&self, name: &str) -> Result<Option<ProjectionCheckpoint>, Error>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    events: Vec<StoredEvent>,
    snapshots: Vec<StreamSnapshot>,
    checkpoints: HashMap<String, ProjectionCheckpoint>,
}

/// In-memory [`Storage`].
///
/// Clones share the same underlying data, so a test can hand one clone to an
/// [`EventStore`](crate::store::EventStore), drop the store, and reopen another store on
/// a second clone to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    /// Create an empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted events.
    pub fn event_count(&self) -> usize {
        self.inner
            .lock()
            .expect("MemoryStorage mutex poisoned")
            .events
            .len()
    }
}

impl Storage for MemoryStorage {
    fn append(&mut self, events: &[StoredEvent]) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("MemoryStorage mutex poisoned");
        let expected = inner.events.len() as u64 + 1;
        if let Some(first) = events.first()
            && first.position != expected
        {
            return Err(Error::CorruptRecord {
                position: first.position,
                detail: format!("non-contiguous append: expected position {expected}"),
            });
        }
        inner.events.extend_from_slice(events);
        Ok(())
    }

    fn read_range(&self, from_position: u64, max_count: usize) -> Result<Vec<StoredEvent>, Error> {
        let inner = self.inner.lock().expect("MemoryStorage mutex poisoned");
        let len = inner.events.len();
        let start = (from_position.max(1) - 1).min(len as u64) as usize;
        let end = start.saturating_add(max_count).min(len);
        let events = inner.events[start..end].to_vec();
        for event in &events {
            event.verify_checksum()?;
        }
        Ok(events)
    }

    fn write_snapshot(&mut self, snapshot: &StreamSnapshot) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("MemoryStorage mutex poisoned");
        inner.snapshots.push(snapshot.clone());
        Ok(())
    }

    fn read_snapshots(&self) -> Result<Vec<StreamSnapshot>, Error> {
        let inner = self.inner.lock().expect("MemoryStorage mutex poisoned");
        Ok(inner.snapshots.clone())
    }

    fn write_checkpoint(&mut self, checkpoint: &ProjectionCheckpoint) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("MemoryStorage mutex poisoned");
        inner
            .checkpoints
            .insert(checkpoint.name.clone(), checkpoint.clone());
        Ok(())
    }

    fn read_checkpoint(&self, name: &str) -> Result<Option<ProjectionCheckpoint>, Error> {
        let inner = self.inner.lock().expect("MemoryStorage mutex poisoned");
        Ok(inner.checkpoints.get(name).cloned())
    }
}
