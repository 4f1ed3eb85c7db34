//! `GetStats` aggregation.
//!
//! Totals come from the in-memory indexes. Per-period histograms scan the log backwards
//! from the head and stop at the first event older than the period cutoff; append
//! timestamps never decrease along the log, so nothing older can follow.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::projection::{Projection, ProjectionMode, ProjectionStatus};
use crate::reader::ReadIndex;
use crate::subscription::{EventSubscription, SubscriptionStatus};

/// Time window of the histograms in [`EventStoreStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsPeriod {
    /// The last 60 minutes.
    LastHour,
    /// The last 24 hours.
    #[default]
    LastDay,
    /// The last 7 days.
    LastWeek,
    /// The whole log.
    All,
}

impl StatsPeriod {
    /// Length of the window, or `None` for [`StatsPeriod::All`].
    pub fn window(&self) -> Option<Duration> {
        match self {
            StatsPeriod::LastHour => Some(Duration::from_secs(60 * 60)),
            StatsPeriod::LastDay => Some(Duration::from_secs(24 * 60 * 60)),
            StatsPeriod::LastWeek => Some(Duration::from_secs(7 * 24 * 60 * 60)),
            StatsPeriod::All => None,
        }
    }

    /// Earliest timestamp (Unix epoch millis) inside the window ending at `now`.
    pub fn cutoff(&self, now: u64) -> u64 {
        self.window()
            .map(|w| now.saturating_sub(w.as_millis() as u64))
            .unwrap_or(0)
    }
}

/// Lag report line for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionLag {
    /// Subscription name.
    pub name: String,
    /// Lifecycle status.
    pub status: SubscriptionStatus,
    /// Last processed position.
    pub current_position: u64,
    /// Log head.
    pub head_position: u64,
    /// `head_position - current_position`.
    pub lag: u64,
    /// Events dispatched successfully.
    pub events_processed: u64,
    /// Failed dispatch attempts.
    pub events_failed: u64,
    /// Error that moved it to `errored`.
    pub last_error: Option<String>,
}

/// Summary line for one projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionSummary {
    /// Projection name.
    pub name: String,
    /// Run mode.
    pub mode: ProjectionMode,
    /// Lifecycle status.
    pub status: ProjectionStatus,
    /// Last folded position.
    pub position: u64,
    /// Last checkpointed position.
    pub checkpoint: u64,
    /// `head_position - position`.
    pub lag: u64,
    /// Events folded.
    pub events_processed: u64,
    /// Handler errors.
    pub errors: u64,
}

/// Store-wide statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStoreStats {
    /// Window the histograms cover.
    pub period: StatsPeriod,
    /// When the stats were gathered (Unix epoch millis).
    pub generated_at: u64,
    /// Log head position.
    pub head_position: u64,
    /// Events in the log.
    pub total_events: u64,
    /// Known streams.
    pub total_streams: u64,
    /// Snapshots across all streams.
    pub total_snapshots: u64,
    /// Registered subscriptions.
    pub total_subscriptions: u64,
    /// Subscriptions in the `active` state.
    pub active_subscriptions: u64,
    /// Registered projections.
    pub total_projections: u64,
    /// Projections running or catching up.
    pub running_projections: u64,
    /// Replay sessions running or paused.
    pub active_replays: u64,
    /// Events appended within the period.
    pub events_in_period: u64,
    /// Period events per category.
    pub events_by_category: BTreeMap<String, u64>,
    /// Period events per event type.
    pub events_by_type: BTreeMap<String, u64>,
    /// Period events per stream type.
    pub events_by_stream_type: BTreeMap<String, u64>,
    /// One line per subscription, sorted by name.
    pub subscription_lag: Vec<SubscriptionLag>,
    /// One line per projection, sorted by name.
    pub projections: Vec<ProjectionSummary>,
}

/// Inputs gathered from the other components.
pub(crate) struct StatsSources {
    pub snapshots: usize,
    pub subscriptions: Vec<EventSubscription>,
    pub projections: Vec<Projection>,
    pub active_replays: usize,
}

pub(crate) fn gather(
    read_index: &ReadIndex,
    period: StatsPeriod,
    now: u64,
    sources: StatsSources,
) -> EventStoreStats {
    let cutoff = period.cutoff(now);

    let mut stats = read_index.with_log(|log| {
        let mut stats = EventStoreStats {
            period,
            generated_at: now,
            head_position: log.head(),
            total_events: log.events.len() as u64,
            total_streams: log.streams.len() as u64,
            total_snapshots: sources.snapshots as u64,
            total_subscriptions: sources.subscriptions.len() as u64,
            active_subscriptions: 0,
            total_projections: sources.projections.len() as u64,
            running_projections: 0,
            active_replays: sources.active_replays as u64,
            events_in_period: 0,
            events_by_category: BTreeMap::new(),
            events_by_type: BTreeMap::new(),
            events_by_stream_type: BTreeMap::new(),
            subscription_lag: Vec::new(),
            projections: Vec::new(),
        };
        for event in log.events.iter().rev() {
            if event.timestamp < cutoff {
                break;
            }
            stats.events_in_period += 1;
            *stats
                .events_by_category
                .entry(event.category.as_str().to_string())
                .or_default() += 1;
            *stats
                .events_by_type
                .entry(event.event_type.clone())
                .or_default() += 1;
            *stats
                .events_by_stream_type
                .entry(event.stream_type.clone())
                .or_default() += 1;
        }
        stats
    });

    let head = stats.head_position;
    stats.active_subscriptions = sources
        .subscriptions
        .iter()
        .filter(|s| s.status == SubscriptionStatus::Active)
        .count() as u64;
    stats.subscription_lag = sources
        .subscriptions
        .into_iter()
        .map(|s| SubscriptionLag {
            lag: head.saturating_sub(s.stats.current_position),
            name: s.name,
            status: s.status,
            current_position: s.stats.current_position,
            head_position: head,
            events_processed: s.stats.events_processed,
            events_failed: s.stats.events_failed,
            last_error: s.last_error,
        })
        .collect();

    stats.running_projections = sources
        .projections
        .iter()
        .filter(|p| matches!(p.status, ProjectionStatus::Running | ProjectionStatus::CatchingUp))
        .count() as u64;
    stats.projections = sources
        .projections
        .into_iter()
        .map(|p| ProjectionSummary {
            lag: head.saturating_sub(p.position),
            name: p.name,
            mode: p.mode,
            status: p.status,
            position: p.position,
            checkpoint: p.checkpoint,
            events_processed: p.stats.events_processed,
            errors: p.stats.errors,
        })
        .collect();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::EventLog;
    use crate::types::{EventCategory, EventMetadata, EventStatus, StoredEvent, identity_checksum};
    use serde_json::json;
    use std::sync::{Arc, RwLock};
    use uuid::Uuid;

    const HOUR: u64 = 60 * 60 * 1000;
    const NOW: u64 = 30 * 24 * HOUR;

    fn log_with(events: &[(&str, &str, EventCategory, u64)]) -> ReadIndex {
        let mut log = EventLog::new();
        for (stream_id, event_type, category, timestamp) in events {
            let id = Uuid::new_v4();
            let position = log.head() + 1;
            let version = log.next_version(stream_id);
            log.commit(StoredEvent {
                id,
                stream_id: stream_id.to_string(),
                stream_type: stream_id.split('-').next().unwrap_or_default().to_string(),
                event_type: event_type.to_string(),
                category: category.clone(),
                version,
                data: json!({}),
                metadata: EventMetadata::default(),
                timestamp: *timestamp,
                status: EventStatus::Committed,
                correlation_id: None,
                causation_id: None,
                position,
                checksum: identity_checksum(&id, stream_id, version, position, event_type),
            });
        }
        ReadIndex::new(Arc::new(RwLock::new(log)))
    }

    fn empty_sources() -> StatsSources {
        StatsSources {
            snapshots: 0,
            subscriptions: Vec::new(),
            projections: Vec::new(),
            active_replays: 0,
        }
    }

    #[test]
    fn histograms_cover_only_the_period() {
        let index = log_with(&[
            ("alert-1", "AlertCreated", EventCategory::Domain, NOW - 3 * 24 * HOUR),
            ("alert-1", "AlertEscalated", EventCategory::Domain, NOW - 5 * HOUR),
            ("triage-7", "PatientTriaged", EventCategory::Domain, NOW - 30 * 60 * 1000),
            ("cert-2", "CertExpired", EventCategory::Audit, NOW - 10 * 60 * 1000),
        ]);

        let hour = gather(&index, StatsPeriod::LastHour, NOW, empty_sources());
        assert_eq!(hour.total_events, 4);
        assert_eq!(hour.total_streams, 3);
        assert_eq!(hour.events_in_period, 2);
        assert_eq!(hour.events_by_category.get("domain"), Some(&1));
        assert_eq!(hour.events_by_category.get("audit"), Some(&1));
        assert_eq!(hour.events_by_stream_type.get("triage"), Some(&1));
        assert!(!hour.events_by_type.contains_key("AlertEscalated"));

        assert_eq!(gather(&index, StatsPeriod::LastDay, NOW, empty_sources()).events_in_period, 3);
        let all = gather(&index, StatsPeriod::All, NOW, empty_sources());
        assert_eq!(all.events_in_period, 4);
        assert_eq!(all.events_by_stream_type.get("alert"), Some(&2));
    }

    #[test]
    fn empty_log() {
        let index = log_with(&[]);
        let stats = gather(&index, StatsPeriod::All, NOW, empty_sources());
        assert_eq!(stats.head_position, 0);
        assert_eq!(stats.events_in_period, 0);
        assert!(stats.events_by_category.is_empty());
    }

    #[test]
    fn cutoff_saturates() {
        assert_eq!(StatsPeriod::LastWeek.cutoff(1_000), 0);
        assert_eq!(StatsPeriod::LastHour.cutoff(2 * HOUR), HOUR);
        assert_eq!(StatsPeriod::All.cutoff(NOW), 0);
    }
}
