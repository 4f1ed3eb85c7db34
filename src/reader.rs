//! Read-only handle to the in-memory event log.
//!
//! `ReadIndex` provides concurrent, read-only access to the in-memory event log
//! without going through the writer task. It wraps an `Arc<RwLock<EventLog>>` and
//! exposes read methods that acquire a read lock for the duration of the operation.
//! Filtered queries, stream reads and stream listing all live here.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{EntityKind, Error};
use crate::index::EventLog;
use crate::pattern::StreamPattern;
use crate::types::{EventCategory, EventStream, StoredEvent};

/// Default number of events returned by a query.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Largest accepted query limit.
pub const MAX_QUERY_LIMIT: usize = 10_000;

/// Order in which query results are returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Ascending global position.
    #[default]
    Forward,
    /// Descending global position.
    Backward,
}

/// Filter over the global log.
///
/// Every set filter must match. Position and timestamp bounds are inclusive. An empty
/// `stream_ids`, `event_types` or `categories` list does not filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQuery {
    /// Only events from these streams.
    pub stream_ids: Vec<String>,
    /// Only events whose stream id matches this pattern.
    pub stream_pattern: Option<String>,
    /// Only events with one of these types.
    pub event_types: Vec<String>,
    /// Only events in one of these categories.
    pub categories: Vec<EventCategory>,
    /// Lowest position to return.
    pub from_position: Option<u64>,
    /// Highest position to return.
    pub to_position: Option<u64>,
    /// Earliest timestamp to return (Unix epoch millis).
    pub from_timestamp: Option<u64>,
    /// Latest timestamp to return (Unix epoch millis).
    pub to_timestamp: Option<u64>,
    /// Only events carrying this correlation id.
    pub correlation_id: Option<String>,
    /// Result order.
    pub direction: Direction,
    /// Maximum number of events to return, 1..=[`MAX_QUERY_LIMIT`].
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            stream_ids: Vec::new(),
            stream_pattern: None,
            event_types: Vec::new(),
            categories: Vec::new(),
            from_position: None,
            to_position: None,
            from_timestamp: None,
            to_timestamp: None,
            correlation_id: None,
            direction: Direction::Forward,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matching events in the requested direction.
    pub events: Vec<StoredEvent>,
    /// Whether more matching events exist beyond this page.
    pub has_more: bool,
    /// Position to resume from (as `from_position` going forward, or `to_position`
    /// going backward) when `has_more` is set.
    pub next_position: Option<u64>,
}

/// Filter for [`ReadIndex::list_streams`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamFilter {
    /// Only streams of this type.
    pub stream_type: Option<String>,
    /// Only streams whose id matches this pattern.
    pub pattern: Option<String>,
}

/// A query whose arguments have been validated and whose pattern is compiled.
struct CompiledQuery<'a> {
    query: &'a EventQuery,
    pattern: Option<StreamPattern>,
}

impl CompiledQuery<'_> {
    fn matches(&self, event: &StoredEvent) -> bool {
        let q = self.query;
        if let Some(pattern) = &self.pattern
            && !pattern.matches(&event.stream_id)
        {
            return false;
        }
        if !q.event_types.is_empty() && !q.event_types.contains(&event.event_type) {
            return false;
        }
        if !q.categories.is_empty() && !q.categories.contains(&event.category) {
            return false;
        }
        if q.from_timestamp.is_some_and(|t| event.timestamp < t)
            || q.to_timestamp.is_some_and(|t| event.timestamp > t)
        {
            return false;
        }
        if let Some(correlation_id) = &q.correlation_id
            && event.correlation_id.as_ref() != Some(correlation_id)
        {
            return false;
        }
        true
    }
}

fn validate_query(query: &EventQuery) -> Result<CompiledQuery<'_>, Error> {
    if query.limit == 0 || query.limit > MAX_QUERY_LIMIT {
        return Err(Error::Validation(format!(
            "query limit must be between 1 and {MAX_QUERY_LIMIT}, got {}",
            query.limit
        )));
    }
    if let (Some(from), Some(to)) = (query.from_position, query.to_position)
        && to < from
    {
        return Err(Error::Validation(format!(
            "to_position {to} is before from_position {from}"
        )));
    }
    if let (Some(from), Some(to)) = (query.from_timestamp, query.to_timestamp)
        && to < from
    {
        return Err(Error::Validation(format!(
            "to_timestamp {to} is before from_timestamp {from}"
        )));
    }
    let pattern = query
        .stream_pattern
        .as_deref()
        .map(StreamPattern::compile)
        .transpose()?;
    Ok(CompiledQuery { query, pattern })
}

/// Shared, read-only handle to the in-memory event log.
///
/// Multiple `ReadIndex` clones share the same underlying data -- cloning produces a new
/// handle, not a copy of the data.
#[derive(Clone, Debug)]
pub struct ReadIndex {
    /// Shared reference to the in-memory event log.
    log: Arc<RwLock<EventLog>>,
}

impl ReadIndex {
    /// Create a new `ReadIndex` backed by the given shared event log.
    pub fn new(log: Arc<RwLock<EventLog>>) -> ReadIndex {
        ReadIndex { log }
    }

    /// Run `f` with a read lock on the log held.
    pub(crate) fn with_log<R>(&self, f: impl FnOnce(&EventLog) -> R) -> R {
        let log = self.log.read().expect("EventLog RwLock poisoned");
        f(&log)
    }

    /// Position of the most recently committed event, or 0 for an empty log.
    pub fn head_position(&self) -> u64 {
        self.with_log(|log| log.head())
    }

    /// Current version of a stream, or `None` if the stream does not exist.
    pub fn stream_version(&self, stream_id: &str) -> Option<u64> {
        self.with_log(|log| log.streams.get(stream_id).map(|e| e.info.version))
    }

    /// Read events from the global log starting at a given position.
    ///
    /// Returns up to `max_count` events from `from_position` (1-based; 0 is treated as
    /// 1). An empty result means the caller is at the head of the log.
    pub fn read_all(&self, from_position: u64, max_count: usize) -> Vec<Arc<StoredEvent>> {
        self.with_log(|log| {
            let len = log.events.len();
            let start = (from_position.max(1) - 1).min(len as u64) as usize;
            let end = start.saturating_add(max_count).min(len);
            log.events[start..end].to_vec()
        })
    }

    /// Metadata for a single stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the stream does not exist.
    pub fn get_stream(&self, stream_id: &str) -> Result<EventStream, Error> {
        self.with_log(|log| {
            log.streams
                .get(stream_id)
                .map(|entry| entry.info.clone())
                .ok_or_else(|| Error::not_found(EntityKind::Stream, stream_id))
        })
    }

    /// Metadata for all streams passing `filter`, sorted by stream id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the filter pattern is malformed.
    pub fn list_streams(&self, filter: &StreamFilter) -> Result<Vec<EventStream>, Error> {
        let pattern = filter
            .pattern
            .as_deref()
            .map(StreamPattern::compile)
            .transpose()?;
        let mut streams: Vec<EventStream> = self.with_log(|log| {
            log.streams
                .values()
                .filter(|entry| {
                    filter
                        .stream_type
                        .as_ref()
                        .is_none_or(|t| &entry.info.stream_type == t)
                        && pattern.as_ref().is_none_or(|p| p.matches(&entry.info.id))
                })
                .map(|entry| entry.info.clone())
                .collect()
        });
        streams.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(streams)
    }

    /// Events of one stream with versions in `from_version..=to_version`.
    ///
    /// Missing bounds default to the first and last version of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown stream and [`Error::Validation`] if
    /// `to_version < from_version`.
    pub fn stream_events(
        &self,
        stream_id: &str,
        from_version: Option<u64>,
        to_version: Option<u64>,
    ) -> Result<Vec<StoredEvent>, Error> {
        if let (Some(from), Some(to)) = (from_version, to_version)
            && to < from
        {
            return Err(Error::Validation(format!(
                "to_version {to} is before from_version {from}"
            )));
        }
        self.with_log(|log| {
            let entry = log
                .streams
                .get(stream_id)
                .ok_or_else(|| Error::not_found(EntityKind::Stream, stream_id))?;
            let len = entry.positions.len() as u64;
            let start = from_version.unwrap_or(1).max(1) - 1;
            let end = to_version.unwrap_or(len).min(len);
            if start >= end {
                return Ok(Vec::new());
            }
            Ok(entry.positions[start as usize..end as usize]
                .iter()
                .filter_map(|&position| log.get(position))
                .map(|event| StoredEvent::clone(event))
                .collect())
        })
    }

    /// Run a filtered, paginated query over the global log.
    ///
    /// When `stream_ids` is set the per-stream position lists are merged instead of
    /// scanning the whole log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an out-of-range limit, inverted position or
    /// timestamp range, or a malformed pattern.
    pub fn query(&self, query: &EventQuery) -> Result<QueryResult, Error> {
        let compiled = validate_query(query)?;

        self.with_log(|log| {
            let head = log.head();
            let low = query.from_position.unwrap_or(1).max(1);
            let high = query.to_position.unwrap_or(head).min(head);

            let candidates: Box<dyn Iterator<Item = u64>> = if query.stream_ids.is_empty() {
                if low > high {
                    Box::new(std::iter::empty())
                } else {
                    match query.direction {
                        Direction::Forward => Box::new(low..=high),
                        Direction::Backward => Box::new((low..=high).rev()),
                    }
                }
            } else {
                let positions: BTreeSet<u64> = query
                    .stream_ids
                    .iter()
                    .filter_map(|id| log.streams.get(id))
                    .flat_map(|entry| entry.positions.iter().copied())
                    .filter(|p| (low..=high).contains(p))
                    .collect();
                match query.direction {
                    Direction::Forward => Box::new(positions.into_iter()),
                    Direction::Backward => Box::new(positions.into_iter().rev()),
                }
            };

            let mut events = Vec::with_capacity(query.limit.min(64));
            let mut has_more = false;
            for position in candidates {
                let Some(event) = log.get(position) else {
                    continue;
                };
                if !compiled.matches(event) {
                    continue;
                }
                if events.len() == query.limit {
                    has_more = true;
                    break;
                }
                events.push(StoredEvent::clone(event));
            }

            let next_position = if has_more {
                events.last().map(|last: &StoredEvent| match query.direction {
                    Direction::Forward => last.position + 1,
                    Direction::Backward => last.position - 1,
                })
            } else {
                None
            };

            Ok(QueryResult {
                events,
                has_more,
                next_position,
            })
        })
    }
}
