//! The event store facade.
//!
//! [`EventStore`] is constructed once with [`EventStore::open`] and passed by reference
//! to every caller. Opening rebuilds the in-memory log, stream index and snapshot index
//! from [`Storage`], seeds the dedup index, and spawns the writer task. Every store
//! operation is a method on this object.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use metrics::{counter, gauge};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broker::{Broker, FeedMessage, subscribe_from};
use crate::dedup::DedupIndex;
use crate::error::{EntityKind, Error};
use crate::index::EventLog;
use crate::projection::{
    EmittedEvent, Projection, ProjectionDefinition, ProjectionEngine, ProjectionStateView,
};
use crate::reader::{EventQuery, QueryResult, ReadIndex, StreamFilter};
use crate::replay::{ReplayController, ReplayRequest, ReplaySession, ReplaySettings};
use crate::snapshot::SnapshotIndex;
use crate::stats::{self, EventStoreStats, StatsPeriod, StatsSources};
use crate::status::{StatusChange, StatusFeed};
use crate::storage::Storage;
use crate::subscription::{
    Dispatcher, EventSubscription, NewSubscription, SubscriptionManager, SubscriptionUpdate,
};
use crate::types::{EventStream, NewEvent, SnapshotRef, StoredEvent, StreamSnapshot, now_millis};
use crate::writer::{Writer, WriterHandle, spawn_writer};

/// Default bound on the writer request channel.
pub const DEFAULT_WRITER_CAPACITY: usize = 64;

/// Default per-receiver broadcast buffer.
pub const DEFAULT_BROKER_CAPACITY: usize = 4096;

/// Default number of client event ids remembered for idempotent retries.
pub const DEFAULT_DEDUP_CAPACITY: usize = 65536;

/// Tunables of an [`EventStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Bound on the writer request channel.
    pub writer_capacity: usize,
    /// Events a subscription or projection worker may fall behind before it lags.
    pub broker_capacity: usize,
    /// Client event ids remembered for idempotent retries.
    pub dedup_capacity: NonZeroUsize,
    /// Pacing of replay sessions.
    pub replay: ReplaySettings,
    /// Status changes buffered per status-feed receiver.
    pub status_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            writer_capacity: DEFAULT_WRITER_CAPACITY,
            broker_capacity: DEFAULT_BROKER_CAPACITY,
            dedup_capacity: NonZeroUsize::new(DEFAULT_DEDUP_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            replay: ReplaySettings::default(),
            status_capacity: 256,
        }
    }
}

/// Append-only event store with subscriptions, projections and replay.
pub struct EventStore {
    writer: WriterHandle,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    read_index: ReadIndex,
    snapshots: Arc<RwLock<SnapshotIndex>>,
    broker: Broker,
    status: StatusFeed,
    subscriptions: Arc<SubscriptionManager>,
    projections: Arc<ProjectionEngine>,
    replays: ReplayController,
}

/// Load persisted snapshots into an index, dropping any that do not fit the log.
fn rebuild_snapshots(storage: &dyn Storage, log: &mut EventLog) -> Result<SnapshotIndex, Error> {
    let mut index = SnapshotIndex::new();
    for snapshot in storage.read_snapshots()? {
        if let Err(e) = snapshot.verify_checksum() {
            tracing::warn!(stream_id = %snapshot.stream_id, error = %e, "dropping corrupt snapshot");
            continue;
        }
        let stream_version = log
            .streams
            .get(&snapshot.stream_id)
            .map(|entry| entry.info.version)
            .unwrap_or(0);
        if snapshot.version > stream_version {
            tracing::warn!(
                stream_id = %snapshot.stream_id,
                snapshot_version = snapshot.version,
                stream_version,
                "dropping snapshot ahead of its stream"
            );
            continue;
        }
        log.set_snapshot(
            &snapshot.stream_id,
            SnapshotRef {
                snapshot_id: snapshot.id,
                version: snapshot.version,
            },
        );
        index.insert(snapshot);
    }
    Ok(index)
}

impl EventStore {
    /// Open a store over `storage`, recovering everything it holds.
    ///
    /// Must be called from within a tokio runtime; the writer task is spawned here.
    ///
    /// # Arguments
    ///
    /// * `storage` - Durable backend. Owned by the writer task from now on.
    /// * `config` - Channel capacities and replay pacing.
    /// * `dispatcher` - Delivery collaborator for subscriptions.
    ///
    /// # Errors
    ///
    /// Propagates storage read errors and [`Error::CorruptRecord`] if the stored
    /// positions or versions are out of sequence.
    pub fn open<S: Storage>(
        storage: S,
        config: StoreConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, Error> {
        let mut log = EventLog::rebuild(&storage)?;
        let snapshot_index = rebuild_snapshots(&storage, &mut log)?;

        let mut dedup = DedupIndex::new(config.dedup_capacity);
        dedup.seed_from_log(&log.events);

        let head = log.head();
        let streams = log.streams.len();
        tracing::info!(
            events = head,
            streams,
            snapshots = snapshot_index.len(),
            "event store recovered"
        );
        gauge!("crisislog_head_position").set(head as f64);
        gauge!("crisislog_streams").set(streams as f64);

        let log = Arc::new(RwLock::new(log));
        let snapshots = Arc::new(RwLock::new(snapshot_index));
        let broker = Broker::new(config.broker_capacity.max(1));
        let status = StatusFeed::new(config.status_capacity.max(1));

        let writer = Writer::new(
            storage,
            Arc::clone(&log),
            Arc::clone(&snapshots),
            dedup,
            broker.clone(),
        );
        let (writer, writer_task) = spawn_writer(writer, config.writer_capacity);

        let read_index = ReadIndex::new(log);
        let subscriptions = Arc::new(SubscriptionManager::new(
            read_index.clone(),
            broker.clone(),
            dispatcher,
            status.clone(),
        ));
        let projections = Arc::new(ProjectionEngine::new(
            read_index.clone(),
            broker.clone(),
            writer.clone(),
            status.clone(),
        ));
        let replays = ReplayController::new(
            read_index.clone(),
            Arc::clone(&subscriptions),
            Arc::clone(&projections),
            status.clone(),
            config.replay,
        );

        Ok(Self {
            writer,
            writer_task: Mutex::new(Some(writer_task)),
            read_index,
            snapshots,
            broker,
            status,
            subscriptions,
            projections,
            replays,
        })
    }

    // Event log

    /// Append one event to a stream.
    ///
    /// Returns once the event is persisted, indexed and published.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed stream id or event type or an
    /// unregistered category, [`Error::EventTooLarge`], a storage error, or
    /// [`Error::Closed`] after shutdown.
    pub async fn append(
        &self,
        stream_id: impl Into<String>,
        event: NewEvent,
    ) -> Result<StoredEvent, Error> {
        let mut stored = self.writer.append(stream_id, vec![event]).await?;
        stored
            .pop()
            .ok_or_else(|| Error::Validation("append produced no event".to_string()))
    }

    /// Append a batch of events to one stream atomically.
    ///
    /// Positions and versions are consecutive. A batch whose first event carries a
    /// client id seen recently returns the originally stored batch.
    ///
    /// # Errors
    ///
    /// As [`EventStore::append`]; an empty batch is a [`Error::Validation`].
    pub async fn append_batch(
        &self,
        stream_id: impl Into<String>,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, Error> {
        self.writer.append(stream_id, events).await
    }

    /// Filtered, paginated read over the global log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for invalid ranges, limits or patterns.
    pub fn query(&self, query: &EventQuery) -> Result<QueryResult, Error> {
        counter!("crisislog_reads_total", "op" => "query").increment(1);
        self.read_index.query(query)
    }

    /// Position of the last committed event, 0 for an empty log.
    pub fn head_position(&self) -> u64 {
        self.read_index.head_position()
    }

    /// Catch-up-then-live feed of every event from `from_position` on.
    pub fn feed(
        &self,
        from_position: u64,
        batch_size: usize,
    ) -> impl futures_core::Stream<Item = Result<FeedMessage, Error>> + Send + 'static {
        subscribe_from(self.read_index.clone(), &self.broker, from_position, batch_size)
    }

    // Stream index

    /// Metadata of one stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown stream.
    pub fn get_stream(&self, stream_id: &str) -> Result<EventStream, Error> {
        self.read_index.get_stream(stream_id)
    }

    /// Streams passing `filter`, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed pattern.
    pub fn list_streams(&self, filter: &StreamFilter) -> Result<Vec<EventStream>, Error> {
        self.read_index.list_streams(filter)
    }

    /// Events of a stream with versions in `from_version..=to_version`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown stream and [`Error::Validation`] for
    /// an inverted range.
    pub fn get_stream_events(
        &self,
        stream_id: &str,
        from_version: Option<u64>,
        to_version: Option<u64>,
    ) -> Result<Vec<StoredEvent>, Error> {
        counter!("crisislog_reads_total", "op" => "stream_events").increment(1);
        self.read_index
            .stream_events(stream_id, from_version, to_version)
    }

    // Snapshot store

    /// Snapshot a stream at its current version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown stream or a storage error.
    pub async fn create_snapshot(
        &self,
        stream_id: impl Into<String>,
        state: Bytes,
    ) -> Result<StreamSnapshot, Error> {
        self.writer.create_snapshot(stream_id, state).await
    }

    /// The latest snapshot, or the highest at or below `version`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown stream.
    pub fn get_snapshot(
        &self,
        stream_id: &str,
        version: Option<u64>,
    ) -> Result<Option<StreamSnapshot>, Error> {
        if self.read_index.stream_version(stream_id).is_none() {
            return Err(Error::not_found(EntityKind::Stream, stream_id));
        }
        Ok(self
            .snapshots
            .read()
            .expect("SnapshotIndex RwLock poisoned")
            .get(stream_id, version)
            .cloned())
    }

    /// Every snapshot of a stream in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown stream.
    pub fn list_snapshots(&self, stream_id: &str) -> Result<Vec<StreamSnapshot>, Error> {
        if self.read_index.stream_version(stream_id).is_none() {
            return Err(Error::not_found(EntityKind::Stream, stream_id));
        }
        Ok(self
            .snapshots
            .read()
            .expect("SnapshotIndex RwLock poisoned")
            .list(stream_id))
    }

    // Subscriptions

    /// See [`SubscriptionManager::create`].
    pub fn create_subscription(&self, request: NewSubscription) -> Result<EventSubscription, Error> {
        self.subscriptions.create(request)
    }

    /// See [`SubscriptionManager::update`].
    pub fn update_subscription(
        &self,
        name: &str,
        update: SubscriptionUpdate,
    ) -> Result<EventSubscription, Error> {
        self.subscriptions.update(name, update)
    }

    /// See [`SubscriptionManager::delete`].
    pub fn delete_subscription(&self, name: &str) -> Result<(), Error> {
        self.subscriptions.delete(name)
    }

    /// See [`SubscriptionManager::get`].
    pub fn get_subscription(&self, name: &str) -> Result<EventSubscription, Error> {
        self.subscriptions.get(name)
    }

    /// See [`SubscriptionManager::list`].
    pub fn list_subscriptions(&self) -> Vec<EventSubscription> {
        self.subscriptions.list()
    }

    /// See [`SubscriptionManager::pause`].
    pub fn pause_subscription(&self, name: &str) -> Result<EventSubscription, Error> {
        self.subscriptions.pause(name)
    }

    /// See [`SubscriptionManager::resume`].
    pub fn resume_subscription(&self, name: &str) -> Result<EventSubscription, Error> {
        self.subscriptions.resume(name)
    }

    /// See [`SubscriptionManager::stop`].
    pub fn stop_subscription(&self, name: &str) -> Result<EventSubscription, Error> {
        self.subscriptions.stop(name)
    }

    /// See [`SubscriptionManager::reset`].
    pub fn reset_subscription(&self, name: &str) -> Result<EventSubscription, Error> {
        self.subscriptions.reset(name)
    }

    // Projections

    /// See [`ProjectionEngine::create`].
    pub async fn create_projection(
        &self,
        definition: ProjectionDefinition,
    ) -> Result<Projection, Error> {
        self.projections.create(definition).await
    }

    /// See [`ProjectionEngine::start`].
    pub fn start_projection(&self, name: &str) -> Result<Projection, Error> {
        self.projections.start(name)
    }

    /// See [`ProjectionEngine::stop`].
    pub async fn stop_projection(&self, name: &str) -> Result<Projection, Error> {
        self.projections.stop(name).await
    }

    /// See [`ProjectionEngine::delete`].
    pub fn delete_projection(&self, name: &str) -> Result<(), Error> {
        self.projections.delete(name)
    }

    /// See [`ProjectionEngine::get`].
    pub fn get_projection(&self, name: &str) -> Result<Projection, Error> {
        self.projections.get(name)
    }

    /// See [`ProjectionEngine::list`].
    pub fn list_projections(&self) -> Vec<Projection> {
        self.projections.list()
    }

    /// See [`ProjectionEngine::get_state`].
    pub fn get_projection_state(&self, name: &str) -> Result<ProjectionStateView, Error> {
        self.projections.get_state(name)
    }

    /// See [`ProjectionEngine::flush`].
    pub async fn flush_projection(&self, name: &str) -> Result<Projection, Error> {
        self.projections.flush(name).await
    }

    /// See [`ProjectionEngine::take_emitted`].
    pub fn take_emitted(&self, name: &str) -> Result<Vec<EmittedEvent>, Error> {
        self.projections.take_emitted(name)
    }

    // Replay

    /// See [`ReplayController::start`].
    pub fn start_replay(&self, request: ReplayRequest) -> Result<ReplaySession, Error> {
        self.replays.start(request)
    }

    /// See [`ReplayController::cancel`].
    pub fn cancel_replay(&self, id: Uuid) -> Result<ReplaySession, Error> {
        self.replays.cancel(id)
    }

    /// See [`ReplayController::pause`].
    pub fn pause_replay(&self, id: Uuid) -> Result<ReplaySession, Error> {
        self.replays.pause(id)
    }

    /// See [`ReplayController::resume`].
    pub fn resume_replay(&self, id: Uuid) -> Result<ReplaySession, Error> {
        self.replays.resume(id)
    }

    /// See [`ReplayController::get`].
    pub fn get_replay_session(&self, id: Uuid) -> Result<ReplaySession, Error> {
        self.replays.get(id)
    }

    /// See [`ReplayController::list`].
    pub fn list_replay_sessions(&self) -> Vec<ReplaySession> {
        self.replays.list()
    }

    // Stats and status

    /// Totals, histograms for `period`, subscription lag and projection summaries.
    pub fn get_stats(&self, period: StatsPeriod) -> EventStoreStats {
        let snapshots = self
            .snapshots
            .read()
            .expect("SnapshotIndex RwLock poisoned")
            .len();
        stats::gather(
            &self.read_index,
            period,
            now_millis(),
            StatsSources {
                snapshots,
                subscriptions: self.subscriptions.list(),
                projections: self.projections.list(),
                active_replays: self.replays.active_count(),
            },
        )
    }

    /// Receive every subscription, projection and replay status change from now on.
    pub fn status_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.status.subscribe()
    }

    /// Stop all workers, flush projection checkpoints, then stop the writer.
    ///
    /// Appends after shutdown fail with [`Error::Closed`].
    pub async fn shutdown(&self) {
        self.replays.shutdown();
        self.subscriptions.shutdown();
        self.projections.shutdown().await;
        self.writer.shutdown().await;
        let task = self
            .writer_task
            .lock()
            .expect("writer task Mutex poisoned")
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "writer task panicked");
        }
        tracing::info!("event store shut down");
    }
}
