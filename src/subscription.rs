//! Subscription manager: pattern-filtered fan-out of committed events.
//!
//! Every subscription owns a worker task. The worker reads a catch-up-then-live feed
//! from the broker starting after the subscription's last processed position, filters
//! events by stream pattern and event-type allowlist, and hands matches to the
//! [`Dispatcher`] collaborator with the subscription's retry policy.
//!
//! The worker's broadcast receiver is the subscription's bounded queue. A worker that
//! falls behind observes a lag and applies its [`OverflowPolicy`]; appenders are never
//! blocked.
//!
//! State machine:
//!
//! ```text
//! active <-> paused
//! active | paused | errored -> stopped   (terminal)
//! active -> errored                      (dispatch retries exhausted)
//! errored -> active                      (explicit reset only)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::broker::{Broker, FeedMessage, subscribe_from};
use crate::error::{DeliveryError, EntityKind, Error};
use crate::pattern::StreamPattern;
use crate::reader::ReadIndex;
use crate::status::StatusFeed;
use crate::types::{StoredEvent, now_millis, validate_event_type};

/// Maximum length of a subscription or projection name in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Receiving and dispatching events.
    Active,
    /// Temporarily not dispatching; resumes where it left off.
    Paused,
    /// Terminated by an operator.
    Stopped,
    /// Dispatch failed after exhausting retries; needs a reset.
    Errored,
}

impl SubscriptionStatus {
    /// Lowercase status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Stopped => "stopped",
            SubscriptionStatus::Errored => "errored",
        }
    }
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// From the first event in the log.
    Beginning,
    /// Only events committed after creation.
    #[default]
    End,
    /// From the given 1-based global position.
    Position(u64),
}

/// Bounded retry with exponential backoff for dispatch failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// What a subscription does when its queue overflows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Re-read the missed range from the log and continue.
    #[default]
    CatchUp,
    /// Mark the subscription errored.
    Fail,
}

/// Tunables of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Events read per catch-up window.
    pub batch_size: usize,
    /// Dispatch retry policy.
    pub retry: RetryPolicy,
    /// Processed events between checkpoint advances.
    pub checkpoint_interval: u64,
    /// Queue overflow behaviour.
    pub overflow: OverflowPolicy,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry: RetryPolicy::default(),
            checkpoint_interval: 10,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl SubscriptionSettings {
    fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::Validation("batch_size must be at least 1".to_string()));
        }
        if self.checkpoint_interval == 0 {
            return Err(Error::Validation(
                "checkpoint_interval must be at least 1".to_string(),
            ));
        }
        let retry = &self.retry;
        if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
            return Err(Error::Validation(
                "retry multiplier must be a finite number >= 1".to_string(),
            ));
        }
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            return Err(Error::Validation(
                "max_backoff_ms must not be below initial_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Opaque description of where a subscription's events go.
///
/// The core never interprets it; the [`Dispatcher`] does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    /// Transport kind, e.g. `"webhook"` or `"queue"`.
    pub kind: String,
    /// Transport-specific target, e.g. a URL or queue name.
    pub target: String,
    /// Extra transport configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl HandlerDescriptor {
    /// A descriptor with empty configuration.
    pub fn new(kind: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
            config: serde_json::Value::Null,
        }
    }
}

/// Live counters of a subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    /// Events dispatched successfully.
    pub events_processed: u64,
    /// Failed dispatch attempts.
    pub events_failed: u64,
    /// Id of the last successfully dispatched event.
    pub last_processed_event: Option<Uuid>,
    /// When the last event was dispatched (Unix epoch millis).
    pub last_processed_at: Option<u64>,
    /// Position of the last successfully dispatched event.
    pub current_position: u64,
    /// Log head when the record was read.
    pub head_position: u64,
    /// `head_position - current_position`.
    pub lag: u64,
}

/// A registered subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Unique name.
    pub name: String,
    /// Lifecycle status.
    pub status: SubscriptionStatus,
    /// Stream-id pattern.
    pub pattern: StreamPattern,
    /// Event types to deliver; empty delivers all.
    pub event_types: Vec<String>,
    /// Start policy the subscription was created with.
    pub start_position: StartPosition,
    /// Last durably processed position.
    pub checkpoint: u64,
    /// Delivery target.
    pub handler: HandlerDescriptor,
    /// Tunables.
    pub settings: SubscriptionSettings,
    /// Live counters.
    pub stats: SubscriptionStats,
    /// Error that moved the subscription to `errored`.
    pub last_error: Option<String>,
    /// Creation time (Unix epoch millis).
    pub created_at: u64,
    /// Last modification time (Unix epoch millis).
    pub updated_at: u64,
}

impl EventSubscription {
    /// Returns `true` if `event` passes the pattern and the event-type allowlist.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.pattern.matches(&event.stream_id)
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
    }
}

/// Arguments for creating a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubscription {
    /// Unique name.
    pub name: String,
    /// Stream-id pattern (`*`, `prefix*` or an exact id).
    pub pattern: String,
    /// Event types to deliver; empty delivers all.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Where to start reading.
    #[serde(default)]
    pub start_position: StartPosition,
    /// Delivery target.
    pub handler: HandlerDescriptor,
    /// Tunables.
    #[serde(default)]
    pub settings: SubscriptionSettings,
}

impl NewSubscription {
    /// A subscription request with default settings, starting at the log end.
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        handler: HandlerDescriptor,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            event_types: Vec::new(),
            start_position: StartPosition::default(),
            handler,
            settings: SubscriptionSettings::default(),
        }
    }

    /// Restrict delivery to these event types.
    pub fn event_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the start policy.
    pub fn start_at(mut self, start: StartPosition) -> Self {
        self.start_position = start;
        self
    }

    /// Replace the settings.
    pub fn settings(mut self, settings: SubscriptionSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Partial update of a subscription. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionUpdate {
    /// New stream-id pattern.
    pub pattern: Option<String>,
    /// New event-type allowlist.
    pub event_types: Option<Vec<String>>,
    /// New delivery target.
    pub handler: Option<HandlerDescriptor>,
    /// New tunables.
    pub settings: Option<SubscriptionSettings>,
}

/// Delivery collaborator that transports one event to a subscriber.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Deliver `event` to `handler`. An error counts as one failed attempt.
    async fn dispatch(
        &self,
        handler: &HandlerDescriptor,
        event: &StoredEvent,
    ) -> Result<(), DeliveryError>;
}

/// Dispatcher that only logs each delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn dispatch(
        &self,
        handler: &HandlerDescriptor,
        event: &StoredEvent,
    ) -> Result<(), DeliveryError> {
        tracing::info!(
            kind = %handler.kind,
            target = %handler.target,
            stream_id = %event.stream_id,
            event_type = %event.event_type,
            position = event.position,
            "dispatch"
        );
        Ok(())
    }
}

/// Dispatcher that accepts every event and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDispatcher;

#[async_trait]
impl Dispatcher for NoopDispatcher {
    async fn dispatch(&self, _: &HandlerDescriptor, _: &StoredEvent) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Validate a subscription or projection name.
pub(crate) fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "name must be 1..={MAX_NAME_LEN} bytes, got {}",
            name.len()
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || "_-.".contains(*c)))
    {
        return Err(Error::Validation(format!(
            "name {name:?} contains invalid character {bad:?}"
        )));
    }
    if name.starts_with('.') {
        return Err(Error::Validation(format!("name {name:?} must not start with '.'")));
    }
    Ok(())
}

/// Deliver one event, retrying per `retry`.
///
/// `on_failure` runs after every failed attempt.
///
/// # Returns
///
/// The number of attempts made.
///
/// # Errors
///
/// Returns [`Error::SubscriptionDispatch`] once all attempts have failed.
pub(crate) async fn dispatch_with_retry(
    dispatcher: &dyn Dispatcher,
    subscription: &str,
    handler: &HandlerDescriptor,
    retry: &RetryPolicy,
    event: &StoredEvent,
    mut on_failure: impl FnMut(&DeliveryError),
) -> Result<u32, Error> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match dispatcher.dispatch(handler, event).await {
            Ok(()) => return Ok(attempts),
            Err(e) => {
                on_failure(&e);
                counter!("crisislog_dispatch_failures_total").increment(1);
                if attempts > retry.max_retries {
                    return Err(Error::SubscriptionDispatch {
                        subscription: subscription.to_string(),
                        attempts,
                        reason: e.0,
                    });
                }
                let delay = retry.backoff(attempts);
                tracing::debug!(
                    subscription,
                    position = event.position,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "dispatch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

struct SlotState {
    record: EventSubscription,
    /// Processed events since the checkpoint last advanced.
    uncheckpointed: u64,
}

struct Slot {
    state: Mutex<SlotState>,
    control: watch::Sender<SubscriptionStatus>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Slot {
    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().expect("subscription Mutex poisoned")
    }

    /// Move the checkpoint up to the last processed position.
    fn checkpoint_now(&self) {
        let mut state = self.lock();
        state.record.checkpoint = state.record.stats.current_position;
        state.uncheckpointed = 0;
    }
}

/// Shared context handed to subscription workers.
#[derive(Clone)]
struct Shared {
    read_index: ReadIndex,
    broker: Broker,
    dispatcher: Arc<dyn Dispatcher>,
    status: StatusFeed,
}

impl Shared {
    /// Apply a status transition if the current status is one of `allowed`.
    ///
    /// Returns the previous status.
    fn transition(
        &self,
        slot: &Slot,
        allowed: &[SubscriptionStatus],
        to: SubscriptionStatus,
        reason: Option<String>,
    ) -> Result<SubscriptionStatus, Error> {
        let (name, from) = {
            let mut state = slot.lock();
            let from = state.record.status;
            if !allowed.contains(&from) {
                return Err(Error::Validation(format!(
                    "subscription {} cannot go from {} to {}",
                    state.record.name,
                    from.as_str(),
                    to.as_str()
                )));
            }
            state.record.status = to;
            state.record.updated_at = now_millis();
            match to {
                SubscriptionStatus::Errored => state.record.last_error = reason.clone(),
                SubscriptionStatus::Active => state.record.last_error = None,
                _ => {}
            }
            (state.record.name.clone(), from)
        };

        slot.control.send_replace(to);
        if from == SubscriptionStatus::Active {
            gauge!("crisislog_subscriptions_active").decrement(1.0);
        }
        if to == SubscriptionStatus::Active {
            gauge!("crisislog_subscriptions_active").increment(1.0);
        }
        match &reason {
            Some(reason) if to == SubscriptionStatus::Errored => {
                tracing::error!(subscription = %name, error = %reason, "subscription errored")
            }
            _ => tracing::info!(
                subscription = %name,
                from = from.as_str(),
                to = to.as_str(),
                "subscription status changed"
            ),
        }
        self.status
            .publish(EntityKind::Subscription, name, from.as_str(), to.as_str(), reason);
        Ok(from)
    }

    fn mark_errored(&self, slot: &Slot, reason: String) {
        slot.checkpoint_now();
        if let Err(e) = self.transition(
            slot,
            &[SubscriptionStatus::Active],
            SubscriptionStatus::Errored,
            Some(reason),
        ) {
            tracing::debug!(error = %e, "subscription error not recorded");
        }
    }

    /// Dispatch `event` if it matches, updating counters and the checkpoint.
    ///
    /// Returns `false` without touching the event if the subscription is no longer
    /// active; the worker resumes from that event later.
    async fn handle_event(&self, slot: &Slot, event: &StoredEvent) -> Result<bool, Error> {
        let (name, handler, retry) = {
            let state = slot.lock();
            if state.record.status != SubscriptionStatus::Active {
                return Ok(false);
            }
            if !state.record.matches(event) {
                return Ok(true);
            }
            (
                state.record.name.clone(),
                state.record.handler.clone(),
                state.record.settings.retry.clone(),
            )
        };

        dispatch_with_retry(
            self.dispatcher.as_ref(),
            &name,
            &handler,
            &retry,
            event,
            |_| slot.lock().record.stats.events_failed += 1,
        )
        .await?;

        let mut state = slot.lock();
        let stats = &mut state.record.stats;
        stats.events_processed += 1;
        stats.last_processed_event = Some(event.id);
        stats.last_processed_at = Some(now_millis());
        stats.current_position = event.position;
        state.uncheckpointed += 1;
        if state.uncheckpointed >= state.record.settings.checkpoint_interval {
            state.record.checkpoint = event.position;
            state.uncheckpointed = 0;
        }
        counter!("crisislog_events_dispatched_total").increment(1);
        Ok(true)
    }

    /// Worker loop of one subscription.
    async fn run_worker(self, slot: Arc<Slot>) {
        let mut control = slot.control.subscribe();
        // Last position fully handled (dispatched or filtered out).
        let mut cursor = slot.lock().record.stats.current_position;

        loop {
            let status = *control.borrow_and_update();
            match status {
                SubscriptionStatus::Stopped => {
                    slot.checkpoint_now();
                    return;
                }
                SubscriptionStatus::Paused | SubscriptionStatus::Errored => {
                    if control.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                SubscriptionStatus::Active => {}
            }

            let (batch_size, overflow) = {
                let state = slot.lock();
                (state.record.settings.batch_size, state.record.settings.overflow)
            };
            let feed = subscribe_from(self.read_index.clone(), &self.broker, cursor + 1, batch_size);
            tokio::pin!(feed);

            loop {
                tokio::select! {
                    biased;
                    changed = control.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *control.borrow() != SubscriptionStatus::Active {
                            slot.checkpoint_now();
                            break;
                        }
                    }
                    item = feed.next() => match item {
                        Some(Ok(FeedMessage::Event(event))) => {
                            match self.handle_event(&slot, &event).await {
                                Ok(true) => cursor = event.position,
                                Ok(false) => {
                                    slot.checkpoint_now();
                                    break;
                                }
                                Err(e) => {
                                    self.mark_errored(&slot, e.to_string());
                                    break;
                                }
                            }
                        }
                        Some(Ok(FeedMessage::CaughtUp)) => slot.checkpoint_now(),
                        Some(Err(Error::Lagged { missed })) => {
                            counter!("crisislog_subscription_overflows_total").increment(1);
                            match overflow {
                                OverflowPolicy::CatchUp => {
                                    tracing::warn!(
                                        subscription = %slot.lock().record.name,
                                        missed,
                                        resume_from = cursor + 1,
                                        "subscription queue overflowed, catching up from log"
                                    );
                                    break;
                                }
                                OverflowPolicy::Fail => {
                                    self.mark_errored(
                                        &slot,
                                        format!("subscription queue overflowed: {missed} events missed"),
                                    );
                                    break;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            self.mark_errored(&slot, e.to_string());
                            break;
                        }
                        None => return,
                    },
                }
            }
        }
    }
}

/// Registry of subscriptions and their workers.
pub struct SubscriptionManager {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    shared: Shared,
}

impl SubscriptionManager {
    /// Create an empty manager.
    pub fn new(
        read_index: ReadIndex,
        broker: Broker,
        dispatcher: Arc<dyn Dispatcher>,
        status: StatusFeed,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            shared: Shared {
                read_index,
                broker,
                dispatcher,
                status,
            },
        }
    }

    fn slot(&self, name: &str) -> Result<Arc<Slot>, Error> {
        self.slots
            .read()
            .expect("subscription registry RwLock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(EntityKind::Subscription, name))
    }

    /// Copy of a record with head position and lag filled in.
    fn view(&self, slot: &Slot) -> EventSubscription {
        let head = self.shared.read_index.head_position();
        let mut record = slot.lock().record.clone();
        record.stats.head_position = head;
        record.stats.lag = head.saturating_sub(record.stats.current_position);
        record
    }

    /// Register a subscription and start its worker.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a duplicate or malformed name, a bad pattern,
    /// an invalid event type, invalid settings, or `Position(0)`.
    pub fn create(&self, request: NewSubscription) -> Result<EventSubscription, Error> {
        validate_name(&request.name)?;
        let pattern = StreamPattern::compile(&request.pattern)?;
        for event_type in &request.event_types {
            validate_event_type(event_type)?;
        }
        request.settings.validate()?;

        let checkpoint = match request.start_position {
            StartPosition::Beginning => 0,
            StartPosition::End => self.shared.read_index.head_position(),
            StartPosition::Position(0) => {
                return Err(Error::Validation(
                    "start position must be at least 1".to_string(),
                ));
            }
            StartPosition::Position(p) => p - 1,
        };

        let now = now_millis();
        let record = EventSubscription {
            name: request.name.clone(),
            status: SubscriptionStatus::Active,
            pattern,
            event_types: request.event_types,
            start_position: request.start_position,
            checkpoint,
            handler: request.handler,
            settings: request.settings,
            stats: SubscriptionStats {
                current_position: checkpoint,
                ..SubscriptionStats::default()
            },
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let slot = {
            let mut slots = self
                .slots
                .write()
                .expect("subscription registry RwLock poisoned");
            if slots.contains_key(&request.name) {
                return Err(Error::Validation(format!(
                    "subscription {} already exists",
                    request.name
                )));
            }
            let (control, _) = watch::channel(SubscriptionStatus::Active);
            let slot = Arc::new(Slot {
                state: Mutex::new(SlotState {
                    record,
                    uncheckpointed: 0,
                }),
                control,
                worker: Mutex::new(None),
            });
            slots.insert(request.name.clone(), Arc::clone(&slot));
            slot
        };

        let worker = tokio::spawn(self.shared.clone().run_worker(Arc::clone(&slot)));
        *slot.worker.lock().expect("worker Mutex poisoned") = Some(worker);

        gauge!("crisislog_subscriptions_active").increment(1.0);
        tracing::info!(subscription = %request.name, checkpoint, "subscription created");
        Ok(self.view(&slot))
    }

    /// Change pattern, event types, handler or settings.
    ///
    /// Changes apply to events the worker reads from now on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name and [`Error::Validation`] for a
    /// bad pattern, event type or settings.
    pub fn update(&self, name: &str, update: SubscriptionUpdate) -> Result<EventSubscription, Error> {
        let slot = self.slot(name)?;
        let pattern = update
            .pattern
            .as_deref()
            .map(StreamPattern::compile)
            .transpose()?;
        if let Some(types) = &update.event_types {
            for event_type in types {
                validate_event_type(event_type)?;
            }
        }
        if let Some(settings) = &update.settings {
            settings.validate()?;
        }

        {
            let mut state = slot.lock();
            let record = &mut state.record;
            if let Some(pattern) = pattern {
                record.pattern = pattern;
            }
            if let Some(types) = update.event_types {
                record.event_types = types;
            }
            if let Some(handler) = update.handler {
                record.handler = handler;
            }
            if let Some(settings) = update.settings {
                record.settings = settings;
            }
            record.updated_at = now_millis();
        }
        tracing::info!(subscription = name, "subscription updated");
        Ok(self.view(&slot))
    }

    /// Remove a subscription and stop its worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name.
    pub fn delete(&self, name: &str) -> Result<(), Error> {
        let slot = self
            .slots
            .write()
            .expect("subscription registry RwLock poisoned")
            .remove(name)
            .ok_or_else(|| Error::not_found(EntityKind::Subscription, name))?;
        if slot.lock().record.status == SubscriptionStatus::Active {
            gauge!("crisislog_subscriptions_active").decrement(1.0);
        }
        slot.control.send_replace(SubscriptionStatus::Stopped);
        if let Some(worker) = slot.worker.lock().expect("worker Mutex poisoned").take() {
            worker.abort();
        }
        tracing::info!(subscription = name, "subscription deleted");
        Ok(())
    }

    /// One subscription, with current lag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown name.
    pub fn get(&self, name: &str) -> Result<EventSubscription, Error> {
        let slot = self.slot(name)?;
        Ok(self.view(&slot))
    }

    /// All subscriptions sorted by name, with current lag.
    pub fn list(&self) -> Vec<EventSubscription> {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .read()
            .expect("subscription registry RwLock poisoned")
            .values()
            .cloned()
            .collect();
        let mut records: Vec<EventSubscription> = slots.iter().map(|s| self.view(s)).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// `active -> paused`. The checkpoint advances to the last processed event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or, if not active, [`Error::Validation`].
    pub fn pause(&self, name: &str) -> Result<EventSubscription, Error> {
        let slot = self.slot(name)?;
        self.shared.transition(
            &slot,
            &[SubscriptionStatus::Active],
            SubscriptionStatus::Paused,
            None,
        )?;
        slot.checkpoint_now();
        Ok(self.view(&slot))
    }

    /// `paused -> active`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or, if not paused, [`Error::Validation`].
    pub fn resume(&self, name: &str) -> Result<EventSubscription, Error> {
        let slot = self.slot(name)?;
        self.shared.transition(
            &slot,
            &[SubscriptionStatus::Paused],
            SubscriptionStatus::Active,
            None,
        )?;
        Ok(self.view(&slot))
    }

    /// Terminate a subscription. The record remains until deleted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or, if already stopped, [`Error::Validation`].
    pub fn stop(&self, name: &str) -> Result<EventSubscription, Error> {
        let slot = self.slot(name)?;
        self.shared.transition(
            &slot,
            &[
                SubscriptionStatus::Active,
                SubscriptionStatus::Paused,
                SubscriptionStatus::Errored,
            ],
            SubscriptionStatus::Stopped,
            None,
        )?;
        slot.checkpoint_now();
        Ok(self.view(&slot))
    }

    /// `errored -> active`. Delivery resumes with the event that failed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or, if not errored, [`Error::Validation`].
    pub fn reset(&self, name: &str) -> Result<EventSubscription, Error> {
        let slot = self.slot(name)?;
        self.shared.transition(
            &slot,
            &[SubscriptionStatus::Errored],
            SubscriptionStatus::Active,
            None,
        )?;
        Ok(self.view(&slot))
    }

    /// Deliver a historical event through a subscription's dispatch path.
    ///
    /// Used by replay. Checkpoints and positions are not touched; failed attempts
    /// still count in `events_failed`.
    ///
    /// # Returns
    ///
    /// `true` if the event matched and was delivered, `false` if it was filtered out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown subscription and
    /// [`Error::SubscriptionDispatch`] if all attempts failed.
    pub async fn deliver_replayed(&self, name: &str, event: &StoredEvent) -> Result<bool, Error> {
        let slot = self.slot(name)?;
        let (handler, retry) = {
            let state = slot.lock();
            if !state.record.matches(event) {
                return Ok(false);
            }
            (state.record.handler.clone(), state.record.settings.retry.clone())
        };
        dispatch_with_retry(
            self.shared.dispatcher.as_ref(),
            name,
            &handler,
            &retry,
            event,
            |_| slot.lock().record.stats.events_failed += 1,
        )
        .await?;
        Ok(true)
    }

    /// Returns `true` if a subscription with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.slots
            .read()
            .expect("subscription registry RwLock poisoned")
            .contains_key(name)
    }

    /// Stop every worker. Records stay readable.
    pub fn shutdown(&self) {
        let slots = self
            .slots
            .read()
            .expect("subscription registry RwLock poisoned");
        for slot in slots.values() {
            slot.checkpoint_now();
            if let Some(worker) = slot.worker.lock().expect("worker Mutex poisoned").take() {
                worker.abort();
            }
        }
    }
}
