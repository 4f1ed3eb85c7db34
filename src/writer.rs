//! Single-writer task for crisislog.
//!
//! Every mutation of the log or of storage goes through one task fed by a bounded
//! `tokio::mpsc` channel: event appends, snapshot creation and projection checkpoint
//! persistence. The task assigns global positions and stream versions, persists through
//! the [`Storage`] collaborator, updates the shared in-memory indexes, publishes to the
//! broker, and only then replies on the request's oneshot channel.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use uuid::Uuid;

use crate::broker::Broker;
use crate::codec;
use crate::dedup::DedupIndex;
use crate::error::{EntityKind, Error};
use crate::index::EventLog;
use crate::snapshot::SnapshotIndex;
use crate::storage::{ProjectionCheckpoint, Storage};
use crate::types::{
    EventStatus, MAX_EVENT_SIZE, NewEvent, SnapshotRef, StoredEvent, StreamSnapshot,
    identity_checksum, now_millis, split_stream_id, validate_event_type, validate_stream_id,
};

type Reply<T> = tokio::sync::oneshot::Sender<Result<T, Error>>;

/// A request processed by the writer task.
pub enum WriterRequest {
    /// Append a batch of events to one stream.
    Append {
        /// Target stream id.
        stream_id: String,
        /// Events to append, in order.
        events: Vec<NewEvent>,
        /// Reply channel for the stored events.
        response_tx: Reply<Vec<StoredEvent>>,
    },
    /// Capture a snapshot of a stream at its current version.
    Snapshot {
        /// Stream to snapshot.
        stream_id: String,
        /// Opaque state blob.
        state: Bytes,
        /// Reply channel for the created snapshot.
        response_tx: Reply<StreamSnapshot>,
    },
    /// Persist a projection checkpoint.
    WriteCheckpoint {
        /// Checkpoint to persist.
        checkpoint: ProjectionCheckpoint,
        /// Reply channel.
        response_tx: Reply<()>,
    },
    /// Load a projection checkpoint.
    ReadCheckpoint {
        /// Projection name.
        name: String,
        /// Reply channel for the checkpoint, if one exists.
        response_tx: Reply<Option<ProjectionCheckpoint>>,
    },
    /// Stop the writer after all earlier requests have been processed.
    Shutdown {
        /// Acknowledged once the writer has stopped accepting requests.
        response_tx: tokio::sync::oneshot::Sender<()>,
    },
}

/// Cloneable handle for submitting requests to the writer task.
///
/// Cloning a `WriterHandle` produces a second sender into the same channel.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: tokio::sync::mpsc::Sender<WriterRequest>,
}

impl WriterHandle {
    /// Create a new `WriterHandle` from the sender half of an mpsc channel.
    pub fn new(tx: tokio::sync::mpsc::Sender<WriterRequest>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> WriterRequest,
    ) -> Result<T, Error> {
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::Closed("writer task"))?;
        response_rx.await.map_err(|_| Error::Closed("writer task"))?
    }

    /// Append events to a stream and await their stored form.
    ///
    /// # Errors
    ///
    /// Returns the writer's validation or storage error, or [`Error::Closed`] if the
    /// writer task has shut down.
    pub async fn append(
        &self,
        stream_id: impl Into<String>,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, Error> {
        let stream_id = stream_id.into();
        self.request(|response_tx| WriterRequest::Append {
            stream_id,
            events,
            response_tx,
        })
        .await
    }

    /// Snapshot a stream at its current version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown stream, a storage error, or
    /// [`Error::Closed`].
    pub async fn create_snapshot(
        &self,
        stream_id: impl Into<String>,
        state: Bytes,
    ) -> Result<StreamSnapshot, Error> {
        let stream_id = stream_id.into();
        self.request(|response_tx| WriterRequest::Snapshot {
            stream_id,
            state,
            response_tx,
        })
        .await
    }

    /// Persist a projection checkpoint.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::Closed`].
    pub async fn write_checkpoint(&self, checkpoint: ProjectionCheckpoint) -> Result<(), Error> {
        self.request(|response_tx| WriterRequest::WriteCheckpoint {
            checkpoint,
            response_tx,
        })
        .await
    }

    /// Load a projection checkpoint.
    ///
    /// # Errors
    ///
    /// Returns a storage error or [`Error::Closed`].
    pub async fn read_checkpoint(
        &self,
        name: impl Into<String>,
    ) -> Result<Option<ProjectionCheckpoint>, Error> {
        let name = name.into();
        self.request(|response_tx| WriterRequest::ReadCheckpoint { name, response_tx })
            .await
    }

    /// Ask the writer to stop once earlier requests are done.
    ///
    /// Returns immediately if the writer has already stopped.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        if self
            .tx
            .send(WriterRequest::Shutdown { response_tx })
            .await
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }
}

/// State owned by the writer task.
pub(crate) struct Writer<S: Storage> {
    storage: S,
    log: Arc<RwLock<EventLog>>,
    snapshots: Arc<RwLock<SnapshotIndex>>,
    dedup: DedupIndex,
    broker: Broker,
}

impl<S: Storage> Writer<S> {
    pub(crate) fn new(
        storage: S,
        log: Arc<RwLock<EventLog>>,
        snapshots: Arc<RwLock<SnapshotIndex>>,
        dedup: DedupIndex,
        broker: Broker,
    ) -> Self {
        Self {
            storage,
            log,
            snapshots,
            dedup,
            broker,
        }
    }

    /// Validate, persist, index and publish one batch.
    ///
    /// The batch is all-or-nothing: any invalid event rejects the whole batch before
    /// anything is written.
    fn append(&mut self, stream_id: &str, events: Vec<NewEvent>) -> Result<Vec<StoredEvent>, Error> {
        validate_stream_id(stream_id)?;
        if events.is_empty() {
            return Err(Error::Validation(
                "append requires at least one event".to_string(),
            ));
        }

        if let Some(original) = self.dedup.check(stream_id, &events) {
            tracing::debug!(stream_id, "duplicate append, returning original events");
            counter!("crisislog_appends_deduplicated_total").increment(1);
            return Ok(original.as_ref().clone());
        }

        let (mut position, mut version, timestamp) = {
            let log = self.log.read().expect("EventLog RwLock poisoned");
            if let Some(original) = stored_retry(&log, stream_id, &events) {
                tracing::debug!(stream_id, "duplicate append found in log, returning originals");
                counter!("crisislog_appends_deduplicated_total").increment(1);
                return Ok(original);
            }
            let mut seen = HashSet::with_capacity(events.len());
            for id in events.iter().filter_map(|e| e.event_id) {
                if !seen.insert(id) {
                    return Err(Error::Validation(format!(
                        "event id {id} appears more than once in the batch"
                    )));
                }
                if let Some(existing) = log.position_of(&id) {
                    return Err(Error::Validation(format!(
                        "event id {id} is already stored at position {existing}"
                    )));
                }
            }
            (
                log.head() + 1,
                log.next_version(stream_id),
                // Timestamps never go backwards along the log.
                now_millis().max(log.last_timestamp()),
            )
        };
        let stream_type = split_stream_id(stream_id).0.to_string();

        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            validate_event_type(&event.event_type)?;
            if !event.category.is_registered() {
                return Err(Error::Validation(format!(
                    "unregistered event category: {}",
                    event.category
                )));
            }
            let id = event.event_id.unwrap_or_else(Uuid::new_v4);
            let record = StoredEvent {
                id,
                stream_id: stream_id.to_string(),
                stream_type: stream_type.clone(),
                checksum: identity_checksum(&id, stream_id, version, position, &event.event_type),
                event_type: event.event_type,
                category: event.category,
                version,
                data: event.data,
                metadata: event.metadata,
                timestamp,
                status: EventStatus::Committed,
                correlation_id: event.correlation_id,
                causation_id: event.causation_id,
                position,
            };
            let size = codec::encode_record(&record)?.len();
            if size > MAX_EVENT_SIZE {
                return Err(Error::EventTooLarge {
                    size,
                    max: MAX_EVENT_SIZE,
                });
            }
            stored.push(record);
            position += 1;
            version += 1;
        }

        self.storage.append(&stored)?;

        let (committed, head, streams) = {
            let mut log = self.log.write().expect("EventLog RwLock poisoned");
            let committed: Vec<Arc<StoredEvent>> =
                stored.iter().cloned().map(|e| log.commit(e)).collect();
            (committed, log.head(), log.streams.len())
        };

        self.dedup.record(stored.clone());
        self.broker.publish(&committed);

        counter!("crisislog_appends_total").increment(1);
        counter!("crisislog_events_appended_total").increment(stored.len() as u64);
        gauge!("crisislog_head_position").set(head as f64);
        gauge!("crisislog_streams").set(streams as f64);
        tracing::debug!(stream_id, count = stored.len(), head, "appended");

        Ok(stored)
    }

    fn snapshot(&mut self, stream_id: &str, state: Bytes) -> Result<StreamSnapshot, Error> {
        let version = self
            .log
            .read()
            .expect("EventLog RwLock poisoned")
            .streams
            .get(stream_id)
            .map(|entry| entry.info.version)
            .ok_or_else(|| Error::not_found(EntityKind::Stream, stream_id))?;

        let snapshot = StreamSnapshot::new(stream_id, version, state);
        self.storage.write_snapshot(&snapshot)?;

        self.log
            .write()
            .expect("EventLog RwLock poisoned")
            .set_snapshot(
                stream_id,
                SnapshotRef {
                    snapshot_id: snapshot.id,
                    version,
                },
            );
        self.snapshots
            .write()
            .expect("SnapshotIndex RwLock poisoned")
            .insert(snapshot.clone());

        counter!("crisislog_snapshots_created_total").increment(1);
        tracing::info!(stream_id, version, size = snapshot.size, "snapshot created");
        Ok(snapshot)
    }
}

/// Find a batch already in the log that `events` repeats id for id.
///
/// Covers retries whose dedup entry was evicted or lost in a restart. The stored
/// events must sit at consecutive positions in `stream_id`.
fn stored_retry(log: &EventLog, stream_id: &str, events: &[NewEvent]) -> Option<Vec<StoredEvent>> {
    let first = log.position_of(&events.first()?.event_id?)?;
    events
        .iter()
        .zip(first..)
        .map(|(new, position)| {
            let stored = log.get(position)?;
            (stored.stream_id == stream_id && new.event_id == Some(stored.id))
                .then(|| StoredEvent::clone(stored))
        })
        .collect()
}

/// Run the writer task loop.
///
/// Requests are received with a blocking `recv()`; additional pending requests are
/// drained with `try_recv()` and processed in arrival order. The loop exits when a
/// `Shutdown` request arrives or all senders are dropped.
///
/// If a response receiver has been dropped before the result is sent, a warning is
/// logged and the result is discarded.
pub(crate) async fn run_writer<S: Storage>(
    mut writer: Writer<S>,
    mut rx: tokio::sync::mpsc::Receiver<WriterRequest>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(req) = rx.try_recv() {
            batch.push(req);
        }

        for req in batch {
            match req {
                WriterRequest::Append {
                    stream_id,
                    events,
                    response_tx,
                } => {
                    let started = Instant::now();
                    let result = writer.append(&stream_id, events);
                    histogram!("crisislog_append_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    if let Err(e) = &result {
                        tracing::debug!(stream_id, error = %e, "append rejected");
                    }
                    if response_tx.send(result).is_err() {
                        tracing::warn!(stream_id, "writer: response receiver dropped");
                    }
                }
                WriterRequest::Snapshot {
                    stream_id,
                    state,
                    response_tx,
                } => {
                    let result = writer.snapshot(&stream_id, state);
                    if response_tx.send(result).is_err() {
                        tracing::warn!(stream_id, "writer: snapshot receiver dropped");
                    }
                }
                WriterRequest::WriteCheckpoint {
                    checkpoint,
                    response_tx,
                } => {
                    let result = writer.storage.write_checkpoint(&checkpoint);
                    if result.is_ok() {
                        counter!("crisislog_checkpoints_written_total").increment(1);
                    }
                    let _ = response_tx.send(result);
                }
                WriterRequest::ReadCheckpoint { name, response_tx } => {
                    let _ = response_tx.send(writer.storage.read_checkpoint(&name));
                }
                WriterRequest::Shutdown { response_tx } => {
                    rx.close();
                    let _ = response_tx.send(());
                    tracing::info!("writer task stopped");
                    return;
                }
            }
        }
    }
}

/// Spawn the writer task on the tokio runtime.
///
/// # Arguments
///
/// * `writer` - Writer state, owning the storage.
/// * `channel_capacity` - Bound on the mpsc channel. Controls backpressure.
///
/// # Returns
///
/// The `WriterHandle` for submitting requests and the task's `JoinHandle`.
pub(crate) fn spawn_writer<S: Storage>(
    writer: Writer<S>,
    channel_capacity: usize,
) -> (WriterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = tokio::sync::mpsc::channel(channel_capacity.max(1));
    let join_handle = tokio::spawn(run_writer(writer, rx));
    (WriterHandle::new(tx), join_handle)
}
