//! Replay controller: throttled, cancellable re-delivery of historical events.
//!
//! A replay session reads a position range of the log in windows of at most
//! `read_budget` positions, hands the events that pass its filter to one subscription
//! (dispatch with retry) or one projection (fold), and sleeps `tick / speed` between
//! windows. The session checks its status before every window, so pause and cancel
//! take effect at the next window boundary. Replays never write to the log and never
//! move checkpoints.
//!
//! ```text
//! running <-> paused
//! running | paused -> cancelled
//! running -> completed | errored
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{EntityKind, Error};
use crate::projection::ProjectionEngine;
use crate::reader::ReadIndex;
use crate::status::StatusFeed;
use crate::subscription::SubscriptionManager;
use crate::types::{StoredEvent, now_millis, validate_event_type};

/// Where replayed events are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayTarget {
    /// Through the named subscription's dispatch path.
    Subscription(String),
    /// Into the named projection's fold.
    Projection(String),
}

/// What to replay and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRequest {
    /// First position (1-based, inclusive). Defaults to 1.
    #[serde(default)]
    pub from_position: Option<u64>,
    /// Last position (inclusive). Defaults to the head at start.
    #[serde(default)]
    pub to_position: Option<u64>,
    /// Earliest event timestamp (inclusive).
    #[serde(default)]
    pub from_timestamp: Option<u64>,
    /// Latest event timestamp (inclusive).
    #[serde(default)]
    pub to_timestamp: Option<u64>,
    /// Event types to replay; empty replays all.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Delivery target.
    pub target: ReplayTarget,
    /// Throttle factor; 2.0 replays twice as fast as real-time pacing.
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_speed() -> f64 {
    1.0
}

impl ReplayRequest {
    /// Replay the whole log to `target` at normal speed.
    pub fn new(target: ReplayTarget) -> Self {
        Self {
            from_position: None,
            to_position: None,
            from_timestamp: None,
            to_timestamp: None,
            event_types: Vec::new(),
            target,
            speed: default_speed(),
        }
    }

    /// Restrict to a position range.
    pub fn positions(mut self, from: u64, to: u64) -> Self {
        self.from_position = Some(from);
        self.to_position = Some(to);
        self
    }

    /// Restrict to a timestamp range.
    pub fn timestamps(mut self, from: u64, to: u64) -> Self {
        self.from_timestamp = Some(from);
        self.to_timestamp = Some(to);
        self
    }

    /// Restrict to these event types.
    pub fn event_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the throttle factor.
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    fn admits(&self, event: &StoredEvent) -> bool {
        self.from_timestamp.is_none_or(|t| event.timestamp >= t)
            && self.to_timestamp.is_none_or(|t| event.timestamp <= t)
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
    }
}

/// Lifecycle status of a replay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayStatus {
    /// Delivering windows.
    Running,
    /// Waiting for resume.
    Paused,
    /// Every event in range was delivered.
    Completed,
    /// Cancelled by an operator.
    Cancelled,
    /// A delivery failed.
    Errored,
}

impl ReplayStatus {
    /// Lowercase status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayStatus::Running => "running",
            ReplayStatus::Paused => "paused",
            ReplayStatus::Completed => "completed",
            ReplayStatus::Cancelled => "cancelled",
            ReplayStatus::Errored => "errored",
        }
    }

    /// Returns `true` for `completed`, `cancelled` and `errored`.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ReplayStatus::Completed | ReplayStatus::Cancelled | ReplayStatus::Errored
        )
    }
}

/// Progress through the filtered range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayProgress {
    /// Events handled so far.
    pub current: u64,
    /// Events in range that pass the filter, counted at start.
    pub total: u64,
    /// `current / total` in percent; 100 for an empty range.
    pub percentage: f64,
}

impl ReplayProgress {
    fn new(total: u64) -> Self {
        let mut progress = Self {
            current: 0,
            total,
            percentage: 0.0,
        };
        progress.advance(0);
        progress
    }

    fn advance(&mut self, by: u64) {
        self.current = (self.current + by).min(self.total);
        self.percentage = if self.total == 0 {
            100.0
        } else {
            self.current as f64 * 100.0 / self.total as f64
        };
    }
}

/// A replay session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySession {
    /// Session id.
    pub id: Uuid,
    /// The request, with position defaults resolved.
    pub request: ReplayRequest,
    /// Lifecycle status.
    pub status: ReplayStatus,
    /// Progress.
    pub progress: ReplayProgress,
    /// Events the target accepted.
    pub events_replayed: u64,
    /// Error that moved the session to `errored`.
    pub error: Option<String>,
    /// Start time (Unix epoch millis).
    pub started_at: u64,
    /// When the session finished (Unix epoch millis).
    pub finished_at: Option<u64>,
}

/// Pacing of replay workers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplaySettings {
    /// Log positions read per window.
    pub read_budget: usize,
    /// Pause between windows at speed 1.0.
    pub tick: Duration,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            read_budget: 500,
            tick: Duration::from_millis(10),
        }
    }
}

struct Run {
    session: Mutex<ReplaySession>,
    control: watch::Sender<ReplayStatus>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Run {
    fn lock(&self) -> std::sync::MutexGuard<'_, ReplaySession> {
        self.session.lock().expect("replay session Mutex poisoned")
    }
}

#[derive(Clone)]
struct Shared {
    read_index: ReadIndex,
    subscriptions: Arc<SubscriptionManager>,
    projections: Arc<ProjectionEngine>,
    status: StatusFeed,
    settings: ReplaySettings,
}

impl Shared {
    fn transition(
        &self,
        run: &Run,
        allowed: &[ReplayStatus],
        to: ReplayStatus,
        error: Option<String>,
    ) -> Result<ReplayStatus, Error> {
        let (id, from) = {
            let mut session = run.lock();
            let from = session.status;
            if !allowed.contains(&from) {
                return Err(Error::Validation(format!(
                    "replay session {} cannot go from {} to {}",
                    session.id,
                    from.as_str(),
                    to.as_str()
                )));
            }
            session.status = to;
            if to.is_finished() {
                session.finished_at = Some(now_millis());
            }
            if to == ReplayStatus::Completed {
                let remaining = session.progress.total - session.progress.current;
                session.progress.advance(remaining);
            }
            if to == ReplayStatus::Errored {
                session.error = error.clone();
            }
            (session.id.to_string(), from)
        };

        run.control.send_replace(to);
        if to.is_finished() {
            gauge!("crisislog_replays_active").decrement(1.0);
        }
        match &error {
            Some(error) => tracing::error!(session = %id, error = %error, "replay errored"),
            None => tracing::info!(
                session = %id,
                from = from.as_str(),
                to = to.as_str(),
                "replay status changed"
            ),
        }
        self.status.publish(
            EntityKind::ReplaySession,
            id,
            from.as_str(),
            to.as_str(),
            error,
        );
        Ok(from)
    }

    async fn deliver(&self, target: &ReplayTarget, event: &StoredEvent) -> Result<bool, Error> {
        match target {
            ReplayTarget::Subscription(name) => self.subscriptions.deliver_replayed(name, event).await,
            ReplayTarget::Projection(name) => self.projections.apply_replayed(name, event),
        }
    }

    /// Number of events in `from..=to` that `request` admits.
    ///
    /// Counts one read budget at a time so the writer is never held off for a whole
    /// range.
    fn count_admitted(&self, request: &ReplayRequest, from: u64, to: u64) -> u64 {
        if to < from {
            return 0;
        }
        let unfiltered = request.from_timestamp.is_none()
            && request.to_timestamp.is_none()
            && request.event_types.is_empty();
        if unfiltered {
            return to - from + 1;
        }
        let mut total = 0;
        let mut cursor = from;
        while cursor <= to {
            let budget = self.settings.read_budget.min((to - cursor + 1) as usize);
            let window = self.read_index.read_all(cursor, budget);
            let Some(last) = window.last() else {
                break;
            };
            cursor = last.position + 1;
            total += window.iter().filter(|e| request.admits(e)).count() as u64;
        }
        total
    }

    async fn run_worker(self, run: Arc<Run>) {
        let mut control = run.control.subscribe();
        let request = run.lock().request.clone();
        // Both resolved by `start`.
        let mut cursor = request.from_position.unwrap_or(1);
        let to = request.to_position.unwrap_or(0);
        let pause = self.settings.tick.div_f64(request.speed);

        loop {
            let status = *control.borrow_and_update();
            match status {
                ReplayStatus::Running => {}
                ReplayStatus::Paused => {
                    if control.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                _ => return,
            }

            let window: Vec<Arc<StoredEvent>> = if cursor > to {
                Vec::new()
            } else {
                let budget = self.settings.read_budget.min((to - cursor + 1) as usize);
                self.read_index.read_all(cursor, budget)
            };
            if window.is_empty() {
                // Fails only if paused or cancelled meanwhile; the loop head handles both.
                if self
                    .transition(&run, &[ReplayStatus::Running], ReplayStatus::Completed, None)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            for event in window {
                cursor = event.position + 1;
                if !request.admits(&event) {
                    continue;
                }
                match self.deliver(&request.target, &event).await {
                    Ok(delivered) => {
                        let mut session = run.lock();
                        session.progress.advance(1);
                        if delivered {
                            session.events_replayed += 1;
                            counter!("crisislog_replay_events_total").increment(1);
                        }
                    }
                    Err(e) => {
                        if let Err(rejected) = self.transition(
                            &run,
                            &[ReplayStatus::Running, ReplayStatus::Paused],
                            ReplayStatus::Errored,
                            Some(e.to_string()),
                        ) {
                            tracing::debug!(error = %rejected, "replay error not recorded");
                        }
                        return;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = control.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Registry of replay sessions. Finished sessions remain queryable.
pub struct ReplayController {
    sessions: RwLock<HashMap<Uuid, Arc<Run>>>,
    shared: Shared,
}

impl ReplayController {
    /// Create a controller delivering to `subscriptions` and `projections`.
    pub fn new(
        read_index: ReadIndex,
        subscriptions: Arc<SubscriptionManager>,
        projections: Arc<ProjectionEngine>,
        status: StatusFeed,
        settings: ReplaySettings,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            shared: Shared {
                read_index,
                subscriptions,
                projections,
                status,
                settings: ReplaySettings {
                    read_budget: settings.read_budget.max(1),
                    tick: settings.tick,
                },
            },
        }
    }

    fn run(&self, id: Uuid) -> Result<Arc<Run>, Error> {
        self.sessions
            .read()
            .expect("replay registry RwLock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(EntityKind::ReplaySession, id.to_string()))
    }

    /// Validate `request`, count its events and start a background session.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a non-positive or non-finite speed, position 0,
    /// or an inverted position or timestamp range, and [`Error::NotFound`] if the target
    /// does not exist.
    pub fn start(&self, mut request: ReplayRequest) -> Result<ReplaySession, Error> {
        if !(request.speed.is_finite() && request.speed > 0.0) {
            return Err(Error::Validation(format!(
                "replay speed must be a positive number, got {}",
                request.speed
            )));
        }
        for event_type in &request.event_types {
            validate_event_type(event_type)?;
        }
        if let (Some(from), Some(to)) = (request.from_timestamp, request.to_timestamp)
            && to < from
        {
            return Err(Error::Validation(format!(
                "to_timestamp {to} < from_timestamp {from}"
            )));
        }
        let from = request.from_position.unwrap_or(1);
        if from == 0 {
            return Err(Error::Validation("positions start at 1".to_string()));
        }
        if let Some(to) = request.to_position
            && to < from
        {
            return Err(Error::Validation(format!(
                "to_position {to} < from_position {from}"
            )));
        }
        // An empty range (empty log, or `from` past the head) completes at once.
        let head = self.shared.read_index.head_position();
        let to = request.to_position.unwrap_or(head).min(head);
        match &request.target {
            ReplayTarget::Subscription(name) if !self.shared.subscriptions.contains(name) => {
                return Err(Error::not_found(EntityKind::Subscription, name.clone()));
            }
            ReplayTarget::Projection(name) if !self.shared.projections.contains(name) => {
                return Err(Error::not_found(EntityKind::Projection, name.clone()));
            }
            _ => {}
        }
        request.from_position = Some(from);
        request.to_position = Some(to);

        let total = self.shared.count_admitted(&request, from, to);

        let session = ReplaySession {
            id: Uuid::new_v4(),
            request,
            status: ReplayStatus::Running,
            progress: ReplayProgress::new(total),
            events_replayed: 0,
            error: None,
            started_at: now_millis(),
            finished_at: None,
        };
        let id = session.id;
        let (control, _) = watch::channel(ReplayStatus::Running);
        let run = Arc::new(Run {
            session: Mutex::new(session),
            control,
            worker: Mutex::new(None),
        });
        self.sessions
            .write()
            .expect("replay registry RwLock poisoned")
            .insert(id, Arc::clone(&run));

        gauge!("crisislog_replays_active").increment(1.0);
        tracing::info!(session = %id, from, to, total, "replay started");
        let worker = tokio::spawn(self.shared.clone().run_worker(Arc::clone(&run)));
        *run.worker.lock().expect("worker Mutex poisoned") = Some(worker);

        let snapshot = run.lock().clone();
        Ok(snapshot)
    }

    /// Cancel a running or paused session. Delivery halts before the next window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or, if the session already finished,
    /// [`Error::Validation`].
    pub fn cancel(&self, id: Uuid) -> Result<ReplaySession, Error> {
        let run = self.run(id)?;
        self.shared.transition(
            &run,
            &[ReplayStatus::Running, ReplayStatus::Paused],
            ReplayStatus::Cancelled,
            None,
        )?;
        let snapshot = run.lock().clone();
        Ok(snapshot)
    }

    /// `running -> paused`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or, if not running, [`Error::Validation`].
    pub fn pause(&self, id: Uuid) -> Result<ReplaySession, Error> {
        let run = self.run(id)?;
        self.shared
            .transition(&run, &[ReplayStatus::Running], ReplayStatus::Paused, None)?;
        let snapshot = run.lock().clone();
        Ok(snapshot)
    }

    /// `paused -> running`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or, if not paused, [`Error::Validation`].
    pub fn resume(&self, id: Uuid) -> Result<ReplaySession, Error> {
        let run = self.run(id)?;
        self.shared
            .transition(&run, &[ReplayStatus::Paused], ReplayStatus::Running, None)?;
        let snapshot = run.lock().clone();
        Ok(snapshot)
    }

    /// One session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn get(&self, id: Uuid) -> Result<ReplaySession, Error> {
        let run = self.run(id)?;
        let snapshot = run.lock().clone();
        Ok(snapshot)
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<ReplaySession> {
        let mut sessions: Vec<ReplaySession> = self
            .sessions
            .read()
            .expect("replay registry RwLock poisoned")
            .values()
            .map(|run| run.lock().clone())
            .collect();
        sessions.sort_by_key(|s| (s.started_at, s.id));
        sessions
    }

    /// Sessions that are running or paused.
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .expect("replay registry RwLock poisoned")
            .values()
            .filter(|run| !run.lock().status.is_finished())
            .count()
    }

    /// Abort every worker. Unfinished sessions keep their last status.
    pub fn shutdown(&self) {
        let sessions = self
            .sessions
            .read()
            .expect("replay registry RwLock poisoned");
        for run in sessions.values() {
            if let Some(worker) = run.worker.lock().expect("worker Mutex poisoned").take() {
                worker.abort();
            }
        }
    }
}
