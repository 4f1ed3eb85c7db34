//! crisislog: the append-only event store behind a disaster-response dashboard.
//!
//! Every alert, triage decision and certificate change is recorded as an immutable event
//! in a stream. [`EventStore`] is the single entry point: appends and queries over the
//! global log, stream metadata, snapshots, push subscriptions, projections, replay, and
//! statistics.

pub mod broker;
pub mod codec;
pub mod dedup;
pub mod error;
pub mod file_storage;
pub mod index;
pub mod metrics;
pub mod pattern;
pub mod projection;
pub mod reader;
pub mod replay;
pub mod snapshot;
pub mod stats;
pub mod status;
pub mod storage;
pub mod store;
pub mod subscription;
pub mod types;
pub mod writer;

pub use broker::FeedMessage;
pub use error::{DeliveryError, EntityKind, Error};
pub use file_storage::FileStorage;
pub use pattern::StreamPattern;
pub use projection::{
    EmittedEvent, HandlerError, HandlerOutcome, Projection, ProjectionDefinition,
    ProjectionHandler, ProjectionMode, ProjectionStateView, ProjectionStatus, SourceSelector,
};
pub use reader::{Direction, EventQuery, QueryResult, StreamFilter};
pub use replay::{
    ReplayProgress, ReplayRequest, ReplaySession, ReplaySettings, ReplayStatus, ReplayTarget,
};
pub use stats::{EventStoreStats, StatsPeriod};
pub use status::StatusChange;
pub use storage::{MemoryStorage, ProjectionCheckpoint, Storage};
pub use store::{DEFAULT_BROKER_CAPACITY, DEFAULT_DEDUP_CAPACITY, EventStore, StoreConfig};
pub use subscription::{
    Dispatcher, EventSubscription, HandlerDescriptor, LogDispatcher, NewSubscription,
    NoopDispatcher, OverflowPolicy, RetryPolicy, StartPosition, SubscriptionSettings,
    SubscriptionStatus, SubscriptionUpdate,
};
pub use types::{
    EventCategory, EventMetadata, EventStatus, EventStream, MAX_EVENT_SIZE, MAX_EVENT_TYPE_LEN,
    MAX_STREAM_ID_LEN, NewEvent, StoredEvent, StreamSnapshot,
};
