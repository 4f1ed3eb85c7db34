//! In-memory index of stream snapshots.
//!
//! Snapshots are persisted through [`Storage`](crate::storage::Storage) by the writer
//! task; this index keeps every snapshot of every stream in creation order so that
//! lookups never touch storage. Historical snapshots are retained for audit.

use std::collections::HashMap;

use crate::types::StreamSnapshot;

/// Snapshots grouped by stream, each list in creation order.
#[derive(Debug, Default)]
pub struct SnapshotIndex {
    by_stream: HashMap<String, Vec<StreamSnapshot>>,
    count: usize,
}

impl SnapshotIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a snapshot as the most recent one of its stream.
    pub fn insert(&mut self, snapshot: StreamSnapshot) {
        self.by_stream
            .entry(snapshot.stream_id.clone())
            .or_default()
            .push(snapshot);
        self.count += 1;
    }

    /// Select a snapshot of `stream_id`.
    ///
    /// With no version, returns the most recently created snapshot. With a version `v`,
    /// returns the snapshot with the highest version `<= v`, preferring the most recently
    /// created among equal versions. Returns `None` if nothing qualifies.
    pub fn get(&self, stream_id: &str, version: Option<u64>) -> Option<&StreamSnapshot> {
        let snapshots = self.by_stream.get(stream_id)?;
        match version {
            None => snapshots.last(),
            Some(v) => snapshots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.version <= v)
                .max_by_key(|(i, s)| (s.version, *i))
                .map(|(_, s)| s),
        }
    }

    /// All snapshots of `stream_id` in creation order.
    pub fn list(&self, stream_id: &str) -> Vec<StreamSnapshot> {
        self.by_stream.get(stream_id).cloned().unwrap_or_default()
    }

    /// Total number of snapshots across all streams.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if no snapshots exist.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
