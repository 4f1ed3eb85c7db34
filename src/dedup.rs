//! Bounded LRU deduplication index for idempotent appends.
//!
//! Tracks recently written event ids so that retried appends can be detected and the
//! original stored events returned instead of writing duplicates. The index uses an LRU
//! cache keyed by event id, so the most recently written events remain dedup-eligible
//! while older entries are evicted.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use uuid::Uuid;

use crate::types::{NewEvent, StoredEvent};

/// Bounded LRU index mapping event ids to their stored batch.
///
/// Each entry maps one event id to the full batch of `StoredEvent`s that were written
/// together. Multiple ids from the same batch share a single `Arc<Vec<StoredEvent>>`.
///
/// A proposed batch is a retry only when it targets the same stream and carries
/// exactly the ids of a recorded batch, in order. Anything else that reuses a known id
/// is not a retry; the writer rejects it through the log's id index. A first event
/// without a client-assigned id is never a duplicate.
pub struct DedupIndex {
    cache: LruCache<Uuid, Arc<Vec<StoredEvent>>>,
}

impl DedupIndex {
    /// Create a new dedup index tracking at most `capacity` event ids.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Check whether a proposed batch is a retry of a previously stored batch.
    ///
    /// # Returns
    ///
    /// `Some(stored_batch)` if the batch repeats a recorded batch for `stream_id` id for
    /// id, `None` otherwise (including for an empty slice).
    pub fn check(
        &mut self,
        stream_id: &str,
        proposed: &[NewEvent],
    ) -> Option<Arc<Vec<StoredEvent>>> {
        let first = proposed.first()?.event_id?;
        // get() promotes the entry in LRU order, keeping retried batches warm.
        let stored = self.cache.get(&first)?;
        let same_batch = stored.len() == proposed.len()
            && stored.iter().zip(proposed).all(|(stored, new)| {
                stored.stream_id == stream_id && new.event_id == Some(stored.id)
            });
        same_batch.then(|| Arc::clone(stored))
    }

    /// Record a successfully written batch.
    ///
    /// Inserts one cache entry per event id, all pointing to the same `Arc`, so looking
    /// up any id from the batch returns the full batch.
    pub fn record(&mut self, stored: Vec<StoredEvent>) {
        let shared = Arc::new(stored);
        for event in shared.iter() {
            self.cache.put(event.id, Arc::clone(&shared));
        }
    }

    /// Seed the index from recovered events during startup.
    ///
    /// Each event becomes its own single-event batch. Events are inserted oldest first
    /// so the highest positions end up most recently used; with more events than
    /// capacity the oldest are evicted.
    pub fn seed_from_log(&mut self, events: &[Arc<StoredEvent>]) {
        for event in events {
            self.cache
                .put(event.id, Arc::new(vec![StoredEvent::clone(event)]));
        }
    }

    /// Number of tracked event ids.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns `true` if no ids are tracked.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
