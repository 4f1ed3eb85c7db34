//! Projection engine: event-sourced read models folded from the log.
//!
//! A projection is a named fold over the events its [`SourceSelector`] admits. Handlers
//! are bound to event types when the [`ProjectionDefinition`] is built; event types
//! without a handler are skipped. Each started projection runs a worker task that reads
//! a catch-up-then-live feed from the broker.
//!
//! Checkpoints carry the folded state together with its position and are persisted
//! through the writer task, so a projection re-created under the same name resumes
//! where it left off. Transient projections keep their state in memory only.
//!
//! ```text
//! stopped -> catching_up -> running
//! running | catching_up -> stopped
//! running | catching_up -> errored   (recoverable handler error)
//! running | catching_up -> faulted   (fatal error, or max_errors reached)
//! errored | faulted -> catching_up   (explicit start)
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::broker::{Broker, FeedMessage, subscribe_from};
use crate::error::{EntityKind, Error};
use crate::reader::ReadIndex;
use crate::status::StatusFeed;
use crate::storage::ProjectionCheckpoint;
use crate::subscription::validate_name;
use crate::types::{EventCategory, NewEvent, StoredEvent, now_millis, validate_event_type};
use crate::writer::WriterHandle;

/// Events read per catch-up window by projection workers.
const CATCH_UP_WINDOW: usize = 256;

/// How a projection runs and whether it persists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMode {
    /// Follows the log indefinitely, checkpointing as it goes.
    #[default]
    Continuous,
    /// Folds up to the head observed at start, then stops.
    OneTime,
    /// Follows the log with in-memory state only.
    Transient,
}

/// Lifecycle status of a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    /// Caught up and folding live events.
    Running,
    /// Not folding.
    Stopped,
    /// Folding historical events behind the head.
    CatchingUp,
    /// Halted by a recoverable handler error.
    Errored,
    /// Halted by a fatal error or too many errors.
    Faulted,
}

impl ProjectionStatus {
    /// Snake-case status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionStatus::Running => "running",
            ProjectionStatus::Stopped => "stopped",
            ProjectionStatus::CatchingUp => "catching_up",
            ProjectionStatus::Errored => "errored",
            ProjectionStatus::Faulted => "faulted",
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, ProjectionStatus::Running | ProjectionStatus::CatchingUp)
    }
}

/// Which events a projection sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSelector {
    /// Every event.
    All,
    /// Events of these streams.
    Streams(Vec<String>),
    /// Events of one category.
    Category(EventCategory),
    /// Events of one type.
    EventType(String),
}

impl SourceSelector {
    /// Returns `true` if `event` is part of this source.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        match self {
            SourceSelector::All => true,
            SourceSelector::Streams(ids) => ids.iter().any(|id| *id == event.stream_id),
            SourceSelector::Category(category) => event.category == *category,
            SourceSelector::EventType(event_type) => event.event_type == *event_type,
        }
    }
}

/// Failure reported by a [`ProjectionHandler`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The projection moves to `errored` and can be restarted.
    #[error("{0}")]
    Recoverable(String),
    /// The projection moves to `faulted`.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// A derived event a handler asks to emit to an output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
    /// Output stream id.
    pub stream_id: String,
    /// Event to append there.
    pub event: NewEvent,
    /// Position of the source event that produced it.
    pub source_position: u64,
}

/// Result of folding one event.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    /// Replacement state.
    pub state: Value,
    /// Derived events, as `(output stream id, event)`.
    pub emitted: Vec<(String, NewEvent)>,
}

impl HandlerOutcome {
    /// An outcome that only replaces the state.
    pub fn state(state: Value) -> Self {
        Self {
            state,
            emitted: Vec::new(),
        }
    }

    /// Also emit `event` to `stream_id`.
    pub fn emit(mut self, stream_id: impl Into<String>, event: NewEvent) -> Self {
        self.emitted.push((stream_id.into(), event));
        self
    }
}

/// Folds one event into a projection's state.
pub trait ProjectionHandler: Send + Sync + 'static {
    /// Return the state after applying `event` to `state`.
    fn handle(&self, state: &Value, event: &StoredEvent) -> Result<HandlerOutcome, HandlerError>;
}

impl<F> ProjectionHandler for F
where
    F: Fn(&Value, &StoredEvent) -> Result<HandlerOutcome, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, state: &Value, event: &StoredEvent) -> Result<HandlerOutcome, HandlerError> {
        self(state, event)
    }
}

/// Everything needed to create a projection.
pub struct ProjectionDefinition {
    name: String,
    mode: ProjectionMode,
    source: SourceSelector,
    initial_state: Value,
    handlers: HashMap<String, Arc<dyn ProjectionHandler>>,
    checkpoint_interval: u64,
    max_errors: u32,
    emit_buffer: usize,
}

impl fmt::Debug for ProjectionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handled: Vec<&String> = self.handlers.keys().collect();
        handled.sort();
        f.debug_struct("ProjectionDefinition")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("source", &self.source)
            .field("handlers", &handled)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .field("max_errors", &self.max_errors)
            .finish()
    }
}

impl ProjectionDefinition {
    /// A definition with `null` initial state and no handlers.
    pub fn new(name: impl Into<String>, mode: ProjectionMode, source: SourceSelector) -> Self {
        Self {
            name: name.into(),
            mode,
            source,
            initial_state: Value::Null,
            handlers: HashMap::new(),
            checkpoint_interval: 100,
            max_errors: 5,
            emit_buffer: 1024,
        }
    }

    /// State the fold starts from.
    pub fn initial_state(mut self, state: Value) -> Self {
        self.initial_state = state;
        self
    }

    /// Bind `handler` to `event_type`, replacing any earlier binding.
    pub fn on(mut self, event_type: impl Into<String>, handler: impl ProjectionHandler) -> Self {
        self.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    /// Handled events between checkpoints.
    pub fn checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Handler errors after which the projection is faulted.
    pub fn max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// Capacity of the emitted-event buffer.
    pub fn emit_buffer(mut self, capacity: usize) -> Self {
        self.emit_buffer = capacity;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        validate_name(&self.name)?;
        for event_type in self.handlers.keys() {
            validate_event_type(event_type)?;
        }
        if self.checkpoint_interval == 0 {
            return Err(Error::Validation(
                "checkpoint_interval must be at least 1".to_string(),
            ));
        }
        if self.max_errors == 0 {
            return Err(Error::Validation("max_errors must be at least 1".to_string()));
        }
        if self.emit_buffer == 0 {
            return Err(Error::Validation("emit buffer must hold at least 1 event".to_string()));
        }
        if let SourceSelector::Streams(ids) = &self.source
            && ids.is_empty()
        {
            return Err(Error::Validation(
                "stream source needs at least one stream id".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters of a projection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionStats {
    /// Events folded by a handler.
    pub events_processed: u64,
    /// Derived events emitted by handlers.
    pub events_emitted: u64,
    /// Successful state replacements.
    pub state_updates: u64,
    /// Checkpoints persisted.
    pub checkpoint_writes: u64,
    /// Handler errors.
    pub errors: u64,
}

/// A registered projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    /// Unique name.
    pub name: String,
    /// Run mode.
    pub mode: ProjectionMode,
    /// Lifecycle status.
    pub status: ProjectionStatus,
    /// Event source.
    pub source: SourceSelector,
    /// Event types with a bound handler, sorted.
    pub handled_event_types: Vec<String>,
    /// Current folded state.
    pub state: Value,
    /// Last global position folded into `state`.
    pub position: u64,
    /// Last position persisted in a checkpoint.
    pub checkpoint: u64,
    /// When the last checkpoint was written (Unix epoch millis).
    pub last_checkpoint: Option<u64>,
    /// Handled events between checkpoints.
    pub checkpoint_interval: u64,
    /// Handler errors after which the projection is faulted.
    pub max_errors: u32,
    /// Counters.
    pub stats: ProjectionStats,
    /// Error that halted the projection.
    pub last_error: Option<String>,
    /// Creation time (Unix epoch millis).
    pub created_at: u64,
    /// Last modification time (Unix epoch millis).
    pub updated_at: u64,
}

/// Read-only view of a projection's fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionStateView {
    /// Projection name.
    pub name: String,
    /// Lifecycle status.
    pub status: ProjectionStatus,
    /// Current folded state.
    pub state: Value,
    /// Last folded position.
    pub position: u64,
    /// Last checkpointed position.
    pub checkpoint: u64,
}

struct ProjectionState {
    record: Projection,
    /// Handled events since the last checkpoint.
    uncheckpointed: u64,
    /// Handler errors since the last start.
    strikes: u32,
    emitted: VecDeque<EmittedEvent>,
}

struct Entry {
    definition: ProjectionDefinition,
    state: Mutex<ProjectionState>,
    control: watch::Sender<ProjectionStatus>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Outcome of folding one event into an entry.
enum Folded {
    /// Nothing changed (already applied or not part of the source).
    Skipped,
    /// Applied; `true` if a checkpoint is due.
    Applied(bool),
    /// The projection left the live states before the event was applied.
    Halted,
}

/// A handler failure and whether it faults the projection.
struct Fault {
    error: Error,
    fatal: bool,
}

impl Entry {
    fn lock(&self) -> std::sync::MutexGuard<'_, ProjectionState> {
        self.state.lock().expect("projection Mutex poisoned")
    }

    fn name(&self) -> &str {
        &self.definition.name
    }

    fn run_handler(
        &self,
        state: &Value,
        event: &StoredEvent,
    ) -> Option<Result<HandlerOutcome, HandlerError>> {
        if !self.definition.source.matches(event) {
            return None;
        }
        let handler = self.definition.handlers.get(&event.event_type)?;
        Some(handler.handle(state, event))
    }

    fn buffer_emitted(
        &self,
        state: &mut ProjectionState,
        emitted: Vec<(String, NewEvent)>,
        position: u64,
    ) {
        for (stream_id, event) in emitted {
            if state.emitted.len() >= self.definition.emit_buffer {
                state.emitted.pop_front();
                counter!("crisislog_projection_emitted_dropped_total").increment(1);
                tracing::warn!(projection = %self.name(), "emitted-event buffer full, dropping oldest");
            }
            state.emitted.push_back(EmittedEvent {
                stream_id,
                event,
                source_position: position,
            });
            state.record.stats.events_emitted += 1;
        }
    }

    /// Fold an event. Events at or below the current position are skipped.
    ///
    /// With `live_only`, nothing is applied unless the projection is running or
    /// catching up.
    fn fold(&self, event: &StoredEvent, live_only: bool) -> Result<Folded, Fault> {
        let mut state = self.lock();
        if live_only && !state.record.status.is_live() {
            return Ok(Folded::Halted);
        }
        if event.position <= state.record.position {
            return Ok(Folded::Skipped);
        }
        let Some(result) = self.run_handler(&state.record.state, event) else {
            state.record.position = event.position;
            return Ok(Folded::Skipped);
        };

        match result {
            Ok(outcome) => {
                state.record.state = outcome.state;
                state.record.position = event.position;
                state.record.stats.events_processed += 1;
                state.record.stats.state_updates += 1;
                state.record.updated_at = now_millis();
                self.buffer_emitted(&mut state, outcome.emitted, event.position);
                state.uncheckpointed += 1;
                counter!("crisislog_projection_events_total").increment(1);
                Ok(Folded::Applied(
                    state.uncheckpointed >= self.definition.checkpoint_interval,
                ))
            }
            Err(err) => {
                state.record.stats.errors += 1;
                state.strikes += 1;
                counter!("crisislog_projection_errors_total").increment(1);
                let fatal = matches!(err, HandlerError::Fatal(_))
                    || state.strikes >= self.definition.max_errors;
                Err(Fault {
                    error: Error::ProjectionHandler {
                        projection: self.definition.name.clone(),
                        event_type: event.event_type.clone(),
                        reason: err.to_string(),
                    },
                    fatal,
                })
            }
        }
    }

    fn view(&self) -> Projection {
        self.lock().record.clone()
    }
}

#[derive(Clone)]
struct Shared {
    read_index: ReadIndex,
    broker: Broker,
    writer: WriterHandle,
    status: StatusFeed,
}

impl Shared {
    fn transition(
        &self,
        entry: &Entry,
        allowed: &[ProjectionStatus],
        to: ProjectionStatus,
        reason: Option<String>,
    ) -> Result<ProjectionStatus, Error> {
        let from = {
            let mut state = entry.lock();
            let from = state.record.status;
            if !allowed.contains(&from) {
                return Err(Error::Validation(format!(
                    "projection {} cannot go from {} to {}",
                    entry.name(),
                    from.as_str(),
                    to.as_str()
                )));
            }
            state.record.status = to;
            state.record.updated_at = now_millis();
            match to {
                ProjectionStatus::Errored | ProjectionStatus::Faulted => {
                    state.record.last_error = reason.clone()
                }
                ProjectionStatus::CatchingUp => state.record.last_error = None,
                _ => {}
            }
            from
        };

        entry.control.send_replace(to);
        match (from.is_live(), to.is_live()) {
            (false, true) => gauge!("crisislog_projections_running").increment(1.0),
            (true, false) => gauge!("crisislog_projections_running").decrement(1.0),
            _ => {}
        }
        match &reason {
            Some(reason) => tracing::error!(
                projection = %entry.name(),
                to = to.as_str(),
                error = %reason,
                "projection halted"
            ),
            None => tracing::info!(
                projection = %entry.name(),
                from = from.as_str(),
                to = to.as_str(),
                "projection status changed"
            ),
        }
        self.status.publish(
            EntityKind::Projection,
            entry.name(),
            from.as_str(),
            to.as_str(),
            reason,
        );
        Ok(from)
    }

    /// Persist the entry's state if it moved past the last checkpoint.
    async fn write_checkpoint(&self, entry: &Entry) -> Result<(), Error> {
        if entry.definition.mode == ProjectionMode::Transient {
            return Ok(());
        }
        let checkpoint = {
            let state = entry.lock();
            if state.record.position == state.record.checkpoint {
                return Ok(());
            }
            ProjectionCheckpoint {
                name: entry.definition.name.clone(),
                position: state.record.position,
                state: state.record.state.clone(),
                events_processed: state.record.stats.events_processed,
                written_at: now_millis(),
            }
        };

        self.writer.write_checkpoint(checkpoint.clone()).await?;

        let mut state = entry.lock();
        if checkpoint.position > state.record.checkpoint {
            state.record.checkpoint = checkpoint.position;
        }
        state.record.last_checkpoint = Some(checkpoint.written_at);
        state.record.stats.checkpoint_writes += 1;
        state.uncheckpointed = 0;
        tracing::debug!(
            projection = %entry.name(),
            position = checkpoint.position,
            "projection checkpoint written"
        );
        Ok(())
    }

    /// Apply a transition the worker requests, logging it if the status moved on
    /// in the meantime.
    fn worker_transition(
        &self,
        entry: &Entry,
        allowed: &[ProjectionStatus],
        to: ProjectionStatus,
        reason: Option<String>,
    ) {
        if let Err(e) = self.transition(entry, allowed, to, reason) {
            tracing::debug!(projection = %entry.name(), error = %e, "transition skipped");
        }
    }

    fn halt(&self, entry: &Entry, to: ProjectionStatus, reason: String) {
        self.worker_transition(
            entry,
            &[ProjectionStatus::Running, ProjectionStatus::CatchingUp],
            to,
            Some(reason),
        );
    }

    /// Checkpoint and stop a one-time projection that reached its target.
    async fn finish_one_time(&self, entry: &Entry) {
        if let Err(e) = self.write_checkpoint(entry).await {
            self.halt(entry, ProjectionStatus::Errored, e.to_string());
            return;
        }
        self.worker_transition(
            entry,
            &[ProjectionStatus::Running, ProjectionStatus::CatchingUp],
            ProjectionStatus::Stopped,
            None,
        );
    }

    async fn run_worker(self, entry: Arc<Entry>) {
        let mut control = entry.control.subscribe();

        let target = match entry.definition.mode {
            ProjectionMode::OneTime => Some(self.read_index.head_position()),
            _ => None,
        };
        if let Some(target) = target
            && entry.lock().record.position >= target
        {
            self.finish_one_time(&entry).await;
            return;
        }

        loop {
            let from = entry.lock().record.position + 1;
            let feed = subscribe_from(self.read_index.clone(), &self.broker, from, CATCH_UP_WINDOW);
            tokio::pin!(feed);

            loop {
                tokio::select! {
                    biased;
                    changed = control.changed() => {
                        if changed.is_err() || !control.borrow().is_live() {
                            return;
                        }
                    }
                    item = feed.next() => match item {
                        Some(Ok(FeedMessage::Event(event))) => {
                            match entry.fold(&event, true) {
                                Ok(Folded::Applied(true)) => {
                                    if let Err(e) = self.write_checkpoint(&entry).await {
                                        self.halt(&entry, ProjectionStatus::Errored, e.to_string());
                                        return;
                                    }
                                }
                                Ok(Folded::Halted) => return,
                                Ok(_) => {}
                                Err(fault) => {
                                    let to = if fault.fatal {
                                        ProjectionStatus::Faulted
                                    } else {
                                        ProjectionStatus::Errored
                                    };
                                    self.halt(&entry, to, fault.error.to_string());
                                    return;
                                }
                            }
                            if let Some(target) = target
                                && event.position >= target
                            {
                                self.finish_one_time(&entry).await;
                                return;
                            }
                        }
                        Some(Ok(FeedMessage::CaughtUp)) => {
                            if let Err(e) = self.write_checkpoint(&entry).await {
                                self.halt(&entry, ProjectionStatus::Errored, e.to_string());
                                return;
                            }
                            self.worker_transition(
                                &entry,
                                &[ProjectionStatus::CatchingUp],
                                ProjectionStatus::Running,
                                None,
                            );
                        }
                        Some(Err(Error::Lagged { missed })) => {
                            tracing::warn!(
                                projection = %entry.name(),
                                missed,
                                "projection feed lagged, catching up from log"
                            );
                            if entry.lock().record.status == ProjectionStatus::Running {
                                self.worker_transition(
                                    &entry,
                                    &[ProjectionStatus::Running],
                                    ProjectionStatus::CatchingUp,
                                    None,
                                );
                            }
                            break;
                        }
                        Some(Err(e)) => {
                            self.halt(&entry, ProjectionStatus::Errored, e.to_string());
                            return;
                        }
                        None => return,
                    },
                }
            }
        }
    }
}

/// Registry of projections and their workers.
pub struct ProjectionEngine {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    shared: Shared,
}

impl ProjectionEngine {
    /// Create an empty engine.
    pub fn new(read_index: ReadIndex, broker: Broker, writer: WriterHandle, status: StatusFeed) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            shared: Shared {
                read_index,
                broker,
                writer,
                status,
            },
        }
    }

    fn entry(&self, name: &str) -> Result<Arc<Entry>, Error> {
        self.entries
            .read()
            .expect("projection registry RwLock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(EntityKind::Projection, name))
    }

    fn all_entries(&self) -> Vec<Arc<Entry>> {
        self.entries
            .read()
            .expect("projection registry RwLock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Register a projection in the `stopped` state.
    ///
    /// A non-transient projection whose name has a stored checkpoint starts from the
    /// checkpointed state and position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a duplicate or malformed name or invalid
    /// settings, or the writer's error if the checkpoint could not be read.
    pub async fn create(&self, definition: ProjectionDefinition) -> Result<Projection, Error> {
        definition.validate()?;
        if self
            .entries
            .read()
            .expect("projection registry RwLock poisoned")
            .contains_key(&definition.name)
        {
            return Err(Error::Validation(format!(
                "projection {} already exists",
                definition.name
            )));
        }

        let stored = match definition.mode {
            ProjectionMode::Transient => None,
            _ => self.shared.writer.read_checkpoint(definition.name.clone()).await?,
        };

        let now = now_millis();
        let mut handled_event_types: Vec<String> = definition.handlers.keys().cloned().collect();
        handled_event_types.sort();
        let mut record = Projection {
            name: definition.name.clone(),
            mode: definition.mode,
            status: ProjectionStatus::Stopped,
            source: definition.source.clone(),
            handled_event_types,
            state: definition.initial_state.clone(),
            position: 0,
            checkpoint: 0,
            last_checkpoint: None,
            checkpoint_interval: definition.checkpoint_interval,
            max_errors: definition.max_errors,
            stats: ProjectionStats::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        if let Some(checkpoint) = stored {
            tracing::info!(
                projection = %definition.name,
                position = checkpoint.position,
                "resuming projection from checkpoint"
            );
            record.state = checkpoint.state;
            record.position = checkpoint.position;
            record.checkpoint = checkpoint.position;
            record.last_checkpoint = Some(checkpoint.written_at);
            record.stats.events_processed = checkpoint.events_processed;
        }

        let (control, _) = watch::channel(ProjectionStatus::Stopped);
        let name = definition.name.clone();
        let entry = Arc::new(Entry {
            definition,
            state: Mutex::new(ProjectionState {
                record,
                uncheckpointed: 0,
                strikes: 0,
                emitted: VecDeque::new(),
            }),
            control,
            worker: Mutex::new(None),
        });

        {
            let mut entries = self
                .entries
                .write()
                .expect("projection registry RwLock poisoned");
            if entries.contains_key(&name) {
                return Err(Error::Validation(format!("projection {name} already exists")));
            }
            entries.insert(name.clone(), Arc::clone(&entry));
        }
        tracing::info!(projection = %name, "projection created");
        Ok(entry.view())
    }

    /// Start (or restart) folding from the last applied position.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or, if already running or catching up,
    /// [`Error::Validation`].
    pub fn start(&self, name: &str) -> Result<Projection, Error> {
        let entry = self.entry(name)?;
        self.shared.transition(
            &entry,
            &[
                ProjectionStatus::Stopped,
                ProjectionStatus::Errored,
                ProjectionStatus::Faulted,
            ],
            ProjectionStatus::CatchingUp,
            None,
        )?;
        entry.lock().strikes = 0;

        let worker = tokio::spawn(self.shared.clone().run_worker(Arc::clone(&entry)));
        if let Some(previous) = entry
            .worker
            .lock()
            .expect("worker Mutex poisoned")
            .replace(worker)
        {
            previous.abort();
        }
        Ok(entry.view())
    }

    /// Stop folding and flush a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`], [`Error::Validation`] if already stopped, or the
    /// writer's error if the final checkpoint could not be written.
    pub async fn stop(&self, name: &str) -> Result<Projection, Error> {
        let entry = self.entry(name)?;
        self.shared.transition(
            &entry,
            &[
                ProjectionStatus::Running,
                ProjectionStatus::CatchingUp,
                ProjectionStatus::Errored,
                ProjectionStatus::Faulted,
            ],
            ProjectionStatus::Stopped,
            None,
        )?;
        let worker = entry.worker.lock().expect("worker Mutex poisoned").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.shared.write_checkpoint(&entry).await?;
        Ok(entry.view())
    }

    /// Remove a projection and stop its worker. Stored checkpoints are kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name.
    pub fn delete(&self, name: &str) -> Result<(), Error> {
        let entry = self
            .entries
            .write()
            .expect("projection registry RwLock poisoned")
            .remove(name)
            .ok_or_else(|| Error::not_found(EntityKind::Projection, name))?;
        if entry.lock().record.status.is_live() {
            gauge!("crisislog_projections_running").decrement(1.0);
        }
        entry.control.send_replace(ProjectionStatus::Stopped);
        if let Some(worker) = entry.worker.lock().expect("worker Mutex poisoned").take() {
            worker.abort();
        }
        tracing::info!(projection = name, "projection deleted");
        Ok(())
    }

    /// One projection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name.
    pub fn get(&self, name: &str) -> Result<Projection, Error> {
        Ok(self.entry(name)?.view())
    }

    /// All projections sorted by name.
    pub fn list(&self) -> Vec<Projection> {
        let mut records: Vec<Projection> = self.all_entries().iter().map(|e| e.view()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Current state, position, checkpoint and status. Has no side effects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name.
    pub fn get_state(&self, name: &str) -> Result<ProjectionStateView, Error> {
        let entry = self.entry(name)?;
        let state = entry.lock();
        Ok(ProjectionStateView {
            name: state.record.name.clone(),
            status: state.record.status,
            state: state.record.state.clone(),
            position: state.record.position,
            checkpoint: state.record.checkpoint,
        })
    }

    /// Persist a checkpoint now. A no-op for transient projections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or the writer's error.
    pub async fn flush(&self, name: &str) -> Result<Projection, Error> {
        let entry = self.entry(name)?;
        self.shared.write_checkpoint(&entry).await?;
        Ok(entry.view())
    }

    /// Drain the buffered emitted events in emission order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name.
    pub fn take_emitted(&self, name: &str) -> Result<Vec<EmittedEvent>, Error> {
        let entry = self.entry(name)?;
        let mut state = entry.lock();
        Ok(state.emitted.drain(..).collect())
    }

    /// Fold a historical event into a projection for replay.
    ///
    /// Uses the same fold as the worker: events at or below the projection's position
    /// are already part of its state and are skipped, and a folded event advances the
    /// position with the state. Checkpoints and status are not touched.
    ///
    /// # Returns
    ///
    /// `true` if a handler folded the event, `false` if it was skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::ProjectionHandler`] if the handler fails.
    pub fn apply_replayed(&self, name: &str, event: &StoredEvent) -> Result<bool, Error> {
        let entry = self.entry(name)?;
        match entry.fold(event, false) {
            Ok(Folded::Applied(_)) => Ok(true),
            Ok(_) => Ok(false),
            Err(fault) => Err(fault.error),
        }
    }

    /// Returns `true` if a projection with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("projection registry RwLock poisoned")
            .contains_key(name)
    }

    /// Stop every worker and flush checkpoints. Statuses are left as they are.
    pub async fn shutdown(&self) {
        for entry in self.all_entries() {
            let worker = entry.worker.lock().expect("worker Mutex poisoned").take();
            if let Some(worker) = worker {
                worker.abort();
                let _ = worker.await;
            }
            if let Err(e) = self.shared.write_checkpoint(&entry).await {
                tracing::warn!(projection = %entry.name(), error = %e, "final checkpoint failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupIndex;
    use crate::index::EventLog;
    use crate::snapshot::SnapshotIndex;
    use crate::storage::{MemoryStorage, Storage};
    use crate::writer::{Writer, spawn_writer};
    use serde_json::json;
    use std::num::NonZeroUsize;
    use std::time::Duration;

    struct Harness {
        writer: WriterHandle,
        engine: ProjectionEngine,
        storage: MemoryStorage,
        log: Arc<RwLock<EventLog>>,
    }

    fn harness_with(storage: MemoryStorage) -> Harness {
        let log = Arc::new(RwLock::new(
            EventLog::rebuild(&storage).expect("rebuild"),
        ));
        let broker = Broker::new(64);
        let writer = Writer::new(
            storage.clone(),
            Arc::clone(&log),
            Arc::new(RwLock::new(SnapshotIndex::new())),
            DedupIndex::new(NonZeroUsize::new(64).expect("non-zero")),
            broker.clone(),
        );
        let (writer, _join) = spawn_writer(writer, 16);
        let engine = ProjectionEngine::new(
            ReadIndex::new(Arc::clone(&log)),
            broker.clone(),
            writer.clone(),
            StatusFeed::new(64),
        );
        Harness {
            writer,
            engine,
            storage,
            log,
        }
    }

    fn harness() -> Harness {
        harness_with(MemoryStorage::new())
    }

    impl Harness {
        async fn append(&self, stream_id: &str, event_type: &str) -> u64 {
            let stored = self
                .writer
                .append(
                    stream_id,
                    vec![NewEvent::new(event_type, EventCategory::Domain, json!({}))],
                )
                .await
                .expect("append");
            stored[0].position
        }
    }

    fn count(state: &Value, key: &str) -> Value {
        let mut next = state.clone();
        let n = next[key].as_u64().unwrap_or(0);
        next[key] = json!(n + 1);
        next
    }

    fn open_alerts(name: &str, mode: ProjectionMode) -> ProjectionDefinition {
        ProjectionDefinition::new(name, mode, SourceSelector::All)
            .initial_state(json!({"open": 0}))
            .on("AlertCreated", |state: &Value, _: &StoredEvent| {
                let mut next = state.clone();
                next["open"] = json!(state["open"].as_i64().unwrap_or(0) + 1);
                Ok(HandlerOutcome::state(next))
            })
            .on("AlertResolved", |state: &Value, _: &StoredEvent| {
                let mut next = state.clone();
                next["open"] = json!(state["open"].as_i64().unwrap_or(0) - 1);
                Ok(HandlerOutcome::state(next))
            })
            .checkpoint_interval(2)
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    #[tokio::test]
    async fn folds_history_then_live_events() {
        let h = harness();
        h.append("alert-1", "AlertCreated").await;
        h.append("alert-2", "AlertCreated").await;
        h.append("alert-1", "AlertResolved").await;
        h.append("triage-1", "PatientTriaged").await;

        let created = h
            .engine
            .create(open_alerts("open-alerts", ProjectionMode::Continuous))
            .await
            .expect("create");
        assert_eq!(created.status, ProjectionStatus::Stopped);
        h.engine.start("open-alerts").expect("start");

        eventually("running", || {
            h.engine.get("open-alerts").expect("get").status == ProjectionStatus::Running
        })
        .await;
        let view = h.engine.get_state("open-alerts").expect("state");
        assert_eq!(view.state, json!({"open": 1}));
        assert_eq!(view.position, 4);
        assert_eq!(view.checkpoint, 4);

        h.append("alert-3", "AlertCreated").await;
        eventually("live fold", || {
            h.engine.get_state("open-alerts").expect("state").state == json!({"open": 2})
        })
        .await;
        let stats = h.engine.get("open-alerts").expect("get").stats;
        assert_eq!(stats.events_processed, 4);
        assert_eq!(stats.state_updates, 4);
    }

    #[tokio::test]
    async fn get_state_is_idempotent() {
        let h = harness();
        h.append("alert-1", "AlertCreated").await;
        h.engine
            .create(open_alerts("idem", ProjectionMode::Continuous))
            .await
            .expect("create");
        h.engine.start("idem").expect("start");
        eventually("folded", || h.engine.get_state("idem").expect("state").position == 1).await;

        let first = h.engine.get_state("idem").expect("state");
        let second = h.engine.get_state("idem").expect("state");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stop_flushes_and_recreate_resumes_from_checkpoint() {
        let storage = MemoryStorage::new();
        {
            let h = harness_with(storage.clone());
            h.append("alert-1", "AlertCreated").await;
            h.engine
                .create(open_alerts("resumable", ProjectionMode::Continuous).checkpoint_interval(100))
                .await
                .expect("create");
            h.engine.start("resumable").expect("start");
            eventually("folded", || {
                h.engine.get_state("resumable").expect("state").position == 1
            })
            .await;
            let stopped = h.engine.stop("resumable").await.expect("stop");
            assert_eq!(stopped.status, ProjectionStatus::Stopped);
            assert_eq!(stopped.checkpoint, 1);
            h.writer.shutdown().await;
        }

        let stored = storage.read_checkpoint("resumable").expect("read");
        assert_eq!(stored.as_ref().map(|c| c.position), Some(1));

        let h = harness_with(storage);
        let resumed = h
            .engine
            .create(open_alerts("resumable", ProjectionMode::Continuous))
            .await
            .expect("create");
        assert_eq!(resumed.position, 1);
        assert_eq!(resumed.state, json!({"open": 1}));
        assert_eq!(resumed.stats.events_processed, 1);
    }

    #[tokio::test]
    async fn transient_projection_never_checkpoints() {
        let h = harness();
        h.append("alert-1", "AlertCreated").await;
        h.engine
            .create(open_alerts("scratch", ProjectionMode::Transient))
            .await
            .expect("create");
        h.engine.start("scratch").expect("start");
        eventually("running", || {
            h.engine.get("scratch").expect("get").status == ProjectionStatus::Running
        })
        .await;
        h.engine.flush("scratch").await.expect("flush");
        h.engine.stop("scratch").await.expect("stop");

        let record = h.engine.get("scratch").expect("get");
        assert_eq!(record.position, 1);
        assert_eq!(record.checkpoint, 0);
        assert_eq!(record.stats.checkpoint_writes, 0);
        assert!(h.storage.read_checkpoint("scratch").expect("read").is_none());
    }

    #[tokio::test]
    async fn one_time_projection_stops_at_head_observed_at_start() {
        let h = harness();
        h.append("alert-1", "AlertCreated").await;
        h.append("alert-2", "AlertCreated").await;
        h.engine
            .create(open_alerts("census", ProjectionMode::OneTime))
            .await
            .expect("create");
        let mut changes = h.engine.shared.status.subscribe();
        h.engine.start("census").expect("start");

        eventually("stopped", || {
            h.engine.get("census").expect("get").status == ProjectionStatus::Stopped
        })
        .await;
        h.append("alert-3", "AlertCreated").await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let view = h.engine.get_state("census").expect("state");
        assert_eq!(view.state, json!({"open": 2}));
        assert_eq!(view.checkpoint, 2);
        let first = changes.recv().await.expect("change");
        assert_eq!(first.to, "catching_up");
    }

    #[tokio::test]
    async fn recoverable_error_then_restart_retries_the_event() {
        let h = harness();
        let flaky = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let gate = Arc::clone(&flaky);
        h.engine
            .create(
                ProjectionDefinition::new("flaky", ProjectionMode::Continuous, SourceSelector::All)
                    .initial_state(json!({}))
                    .on("Ping", move |state: &Value, _: &StoredEvent| {
                        if gate.swap(false, std::sync::atomic::Ordering::SeqCst) {
                            return Err(HandlerError::Recoverable("store busy".to_string()));
                        }
                        Ok(HandlerOutcome::state(count(state, "pings")))
                    }),
            )
            .await
            .expect("create");
        h.engine.start("flaky").expect("start");
        h.append("probe-1", "Ping").await;

        eventually("errored", || {
            h.engine.get("flaky").expect("get").status == ProjectionStatus::Errored
        })
        .await;
        let record = h.engine.get("flaky").expect("get");
        assert_eq!(record.position, 0);
        assert!(record.last_error.as_deref().is_some_and(|e| e.contains("store busy")));

        h.engine.start("flaky").expect("restart");
        eventually("folded after restart", || {
            h.engine.get_state("flaky").expect("state").state == json!({"pings": 1})
        })
        .await;
        assert!(!flaky.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fatal_error_faults() {
        let h = harness();
        h.engine
            .create(
                ProjectionDefinition::new("doomed", ProjectionMode::Continuous, SourceSelector::All)
                    .on("Ping", |_: &Value, _: &StoredEvent| {
                        Err(HandlerError::Fatal("schema mismatch".to_string()))
                    }),
            )
            .await
            .expect("create");
        h.engine.start("doomed").expect("start");
        h.append("probe-1", "Ping").await;
        eventually("faulted", || {
            h.engine.get("doomed").expect("get").status == ProjectionStatus::Faulted
        })
        .await;
        assert_eq!(h.engine.get("doomed").expect("get").stats.errors, 1);
    }

    #[tokio::test]
    async fn max_errors_escalates_recoverable_to_faulted() {
        let h = harness();
        h.engine
            .create(
                ProjectionDefinition::new("strict", ProjectionMode::Continuous, SourceSelector::All)
                    .on("Ping", |_: &Value, _: &StoredEvent| {
                        Err(HandlerError::Recoverable("nope".to_string()))
                    })
                    .max_errors(1),
            )
            .await
            .expect("create");
        h.engine.start("strict").expect("start");
        h.append("probe-1", "Ping").await;
        eventually("faulted", || {
            h.engine.get("strict").expect("get").status == ProjectionStatus::Faulted
        })
        .await;
    }

    #[tokio::test]
    async fn source_selector_and_emitted_events() {
        let h = harness();
        h.engine
            .create(
                ProjectionDefinition::new(
                    "escalations",
                    ProjectionMode::Continuous,
                    SourceSelector::Streams(vec!["alert-1".to_string()]),
                )
                .initial_state(json!({}))
                .on("AlertEscalated", |state: &Value, event: &StoredEvent| {
                    Ok(HandlerOutcome::state(count(state, "escalated")).emit(
                        "notification-oncall",
                        NewEvent::new(
                            "PageOnCall",
                            EventCategory::Notification,
                            json!({"alert": event.stream_id}),
                        ),
                    ))
                })
                .emit_buffer(1),
            )
            .await
            .expect("create");
        h.engine.start("escalations").expect("start");
        h.append("alert-1", "AlertEscalated").await;
        h.append("alert-2", "AlertEscalated").await;
        let last = h.append("alert-1", "AlertEscalated").await;

        eventually("position", || {
            h.engine.get_state("escalations").expect("state").position == last
        })
        .await;
        let record = h.engine.get("escalations").expect("get");
        assert_eq!(record.state, json!({"escalated": 2}));
        assert_eq!(record.stats.events_emitted, 2);

        let emitted = h.engine.take_emitted("escalations").expect("take");
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].stream_id, "notification-oncall");
        assert_eq!(emitted[0].source_position, last);
        assert!(h.engine.take_emitted("escalations").expect("take").is_empty());
    }

    #[tokio::test]
    async fn lifecycle_validation() {
        let h = harness();
        h.engine
            .create(open_alerts("p", ProjectionMode::Continuous))
            .await
            .expect("create");
        assert!(matches!(
            h.engine.create(open_alerts("p", ProjectionMode::Continuous)).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(h.engine.stop("p").await, Err(Error::Validation(_))));
        h.engine.start("p").expect("start");
        assert!(matches!(h.engine.start("p"), Err(Error::Validation(_))));
        assert!(matches!(h.engine.get("q"), Err(Error::NotFound { .. })));
        h.engine.delete("p").expect("delete");
        assert!(h.engine.list().is_empty());
        assert!(matches!(
            h.engine
                .create(open_alerts("bad", ProjectionMode::Continuous).checkpoint_interval(0))
                .await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn replayed_fold_advances_position_but_not_checkpoint() {
        let h = harness();
        h.append("alert-1", "AlertCreated").await;
        h.engine
            .create(open_alerts("rebuild", ProjectionMode::Continuous))
            .await
            .expect("create");
        let event = h.log.read().expect("lock").get(1).cloned().expect("event");

        assert!(h.engine.apply_replayed("rebuild", &event).expect("apply"));
        let view = h.engine.get_state("rebuild").expect("state");
        assert_eq!(view.state, json!({"open": 1}));
        assert_eq!(view.position, 1);
        assert_eq!(view.checkpoint, 0);
    }

    #[tokio::test]
    async fn replay_over_folded_events_keeps_state_consistent() {
        let h = harness();
        h.append("alert-1", "AlertCreated").await;
        h.engine
            .create(open_alerts("folded", ProjectionMode::Continuous))
            .await
            .expect("create");
        h.engine.start("folded").expect("start");
        eventually("folded", || {
            h.engine.get_state("folded").expect("state").position == 1
        })
        .await;
        h.engine.stop("folded").await.expect("stop");

        let event = h.log.read().expect("lock").get(1).cloned().expect("event");
        assert!(!h.engine.apply_replayed("folded", &event).expect("apply"));
        let flushed = h.engine.flush("folded").await.expect("flush");
        assert_eq!(flushed.state, json!({"open": 1}));
        assert_eq!(flushed.position, 1);
        let stored = h.storage.read_checkpoint("folded").expect("read").expect("checkpoint");
        assert_eq!(stored.state, json!({"open": 1}));
    }

    #[tokio::test]
    async fn stopped_projection_folds_nothing_more() {
        let h = harness();
        h.engine
            .create(open_alerts("halting", ProjectionMode::Continuous))
            .await
            .expect("create");
        h.engine.start("halting").expect("start");
        eventually("running", || {
            h.engine.get_state("halting").expect("state").status == ProjectionStatus::Running
        })
        .await;
        for _ in 0..20 {
            h.append("alert-1", "AlertCreated").await;
        }
        let stopped = h.engine.stop("halting").await.expect("stop");
        for _ in 0..5 {
            h.append("alert-1", "AlertCreated").await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let view = h.engine.get_state("halting").expect("state");
        assert_eq!(view.position, stopped.position);
        assert_eq!(view.state, stopped.state);
        assert_eq!(view.state["open"].as_u64(), Some(stopped.position));
    }

    #[tokio::test]
    async fn lagged_feed_reports_catching_up_then_running() {
        let storage = MemoryStorage::new();
        let log = Arc::new(RwLock::new(EventLog::new()));
        let broker = Broker::new(2);
        let writer = Writer::new(
            storage,
            Arc::clone(&log),
            Arc::new(RwLock::new(SnapshotIndex::new())),
            DedupIndex::new(NonZeroUsize::new(64).expect("non-zero")),
            broker.clone(),
        );
        let (writer, _join) = spawn_writer(writer, 16);
        let status = StatusFeed::new(64);
        let engine = ProjectionEngine::new(
            ReadIndex::new(Arc::clone(&log)),
            broker,
            writer.clone(),
            status.clone(),
        );
        engine
            .create(open_alerts("bursty", ProjectionMode::Transient))
            .await
            .expect("create");
        engine.start("bursty").expect("start");
        let mut changes = status.subscribe();
        loop {
            if engine.get_state("bursty").expect("state").status == ProjectionStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The worker cannot run while this task appends, so the burst overflows the
        // two-slot broker.
        let burst = (0..10)
            .map(|_| NewEvent::new("AlertCreated", EventCategory::Domain, json!({})))
            .collect();
        writer.append("alert-1", burst).await.expect("append");

        let mut seen: Vec<&str> = Vec::new();
        while seen.len() < 2 || seen.last() != Some(&"running") {
            let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
                .await
                .expect("status change in time")
                .expect("status feed open");
            if change.id == "bursty" {
                seen.push(change.to);
            }
        }
        assert!(seen.contains(&"catching_up"), "saw {seen:?}");
        eventually("all folded", || {
            engine.get_state("bursty").expect("state").state == json!({"open": 10})
        })
        .await;
    }
}
