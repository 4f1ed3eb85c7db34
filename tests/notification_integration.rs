//! End-to-end tests of subscriptions, projections, replay and the live feed through the
//! `EventStore` facade.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crisislog::{
    DeliveryError, Dispatcher, EventCategory, EventStore, FeedMessage, FileStorage,
    HandlerDescriptor, HandlerError, HandlerOutcome, MemoryStorage, NewEvent, NewSubscription,
    ProjectionDefinition, ProjectionMode, ProjectionStatus, ReplayRequest, ReplaySettings,
    ReplayStatus, ReplayTarget, SourceSelector, StartPosition, StatsPeriod, StoreConfig,
    StoredEvent, SubscriptionStatus,
};
use futures::StreamExt;
use serde_json::{Value, json};

#[derive(Default)]
struct Recorder {
    delivered: Mutex<Vec<(String, u64)>>,
}

impl Recorder {
    fn positions(&self) -> Vec<u64> {
        self.delivered
            .lock()
            .expect("lock")
            .iter()
            .map(|(_, p)| *p)
            .collect()
    }
}

#[async_trait]
impl Dispatcher for Recorder {
    async fn dispatch(
        &self,
        handler: &HandlerDescriptor,
        event: &StoredEvent,
    ) -> Result<(), DeliveryError> {
        self.delivered
            .lock()
            .expect("lock")
            .push((handler.target.clone(), event.position));
        Ok(())
    }
}

fn event(event_type: &str) -> NewEvent {
    NewEvent::new(event_type, EventCategory::Domain, json!({"region": "north"}))
}

fn store_with(recorder: &Arc<Recorder>) -> EventStore {
    let config = StoreConfig {
        replay: ReplaySettings {
            read_budget: 2,
            tick: Duration::from_millis(5),
        },
        ..StoreConfig::default()
    };
    EventStore::open(
        MemoryStorage::new(),
        config,
        Arc::clone(recorder) as Arc<dyn Dispatcher>,
    )
    .expect("open should succeed")
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn count_alerts(state: &Value, _event: &StoredEvent) -> Result<HandlerOutcome, HandlerError> {
    let count = state.get("alerts").and_then(Value::as_u64).unwrap_or(0);
    Ok(HandlerOutcome::state(json!({ "alerts": count + 1 })))
}

#[tokio::test]
async fn alert_subscription_from_beginning_processes_the_lifecycle() {
    let recorder = Arc::new(Recorder::default());
    let store = store_with(&recorder);

    store.append("alert-1", event("AlertCreated")).await.expect("append");
    store.append("alerts-1", event("Digest")).await.expect("append");
    store.append("alert-1", event("AlertEscalated")).await.expect("append");
    let resolved = store.append("alert-1", event("AlertResolved")).await.expect("append");

    store
        .create_subscription(
            NewSubscription::new(
                "ops-alerts",
                "alert-*",
                HandlerDescriptor::new("webhook", "https://ops.example/alerts"),
            )
            .start_at(StartPosition::Beginning),
        )
        .expect("create");

    eventually("subscription checkpoint reaches AlertResolved", || {
        let sub = store.get_subscription("ops-alerts").expect("get");
        sub.stats.events_processed == 3 && sub.checkpoint == resolved.position
    })
    .await;

    let sub = store.get_subscription("ops-alerts").expect("get");
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.stats.current_position, resolved.position);
    assert_eq!(recorder.positions(), vec![1, 3, 4]);

    let stats = store.get_stats(StatsPeriod::All);
    assert_eq!(stats.active_subscriptions, 1);
    assert_eq!(stats.subscription_lag[0].lag, 0);

    store.shutdown().await;
}

#[tokio::test]
async fn live_subscription_sees_only_new_matching_events() {
    let recorder = Arc::new(Recorder::default());
    let store = store_with(&recorder);
    store.append("triage-1", event("PatientTriaged")).await.expect("append");

    let mut status = store.status_changes();
    store
        .create_subscription(
            NewSubscription::new("triage", "triage-*", HandlerDescriptor::new("log", "triage"))
                .event_types(["PatientMoved"]),
        )
        .expect("create");

    store.append("triage-1", event("PatientMoved")).await.expect("append");
    store.append("triage-1", event("PatientTreated")).await.expect("append");
    store.append("triage-2", event("PatientMoved")).await.expect("append");

    eventually("two moves delivered", || recorder.positions() == vec![2, 4]).await;

    store.pause_subscription("triage").expect("pause");
    let change = tokio::time::timeout(Duration::from_secs(5), status.recv())
        .await
        .expect("status change in time")
        .expect("feed open");
    assert_eq!(change.id, "triage");
    assert_eq!(change.to, "paused");

    store.delete_subscription("triage").expect("delete");
    assert!(store.get_subscription("triage").is_err());
    store.shutdown().await;
}

#[tokio::test]
async fn projection_state_reads_are_idempotent() {
    let recorder = Arc::new(Recorder::default());
    let store = store_with(&recorder);

    store
        .create_projection(
            ProjectionDefinition::new(
                "open-alerts",
                ProjectionMode::Continuous,
                SourceSelector::Category(EventCategory::Domain),
            )
            .initial_state(json!({ "alerts": 0 }))
            .on("AlertCreated", count_alerts),
        )
        .await
        .expect("create");
    store.start_projection("open-alerts").expect("start");

    store.append("alert-1", event("AlertCreated")).await.expect("append");
    store.append("alert-2", event("AlertCreated")).await.expect("append");
    store.append("alert-2", event("AlertEscalated")).await.expect("append");

    eventually("projection folds up to the head", || {
        let view = store.get_projection_state("open-alerts").expect("state");
        view.position == 3 && view.status == ProjectionStatus::Running
    })
    .await;

    let first = store.get_projection_state("open-alerts").expect("state");
    let second = store.get_projection_state("open-alerts").expect("state");
    assert_eq!(first, second);
    assert_eq!(first.state, json!({ "alerts": 2 }));
    assert_eq!(first.status, ProjectionStatus::Running);

    let stopped = store.stop_projection("open-alerts").await.expect("stop");
    assert_eq!(stopped.status, ProjectionStatus::Stopped);
    assert_eq!(stopped.checkpoint, 3);
    store.shutdown().await;
}

#[tokio::test]
async fn projection_resumes_from_checkpoint_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = Arc::new(Recorder::default());
    let definition = || {
        ProjectionDefinition::new(
            "alert-count",
            ProjectionMode::Continuous,
            SourceSelector::EventType("AlertCreated".into()),
        )
        .on("AlertCreated", count_alerts)
    };

    {
        let storage = FileStorage::open(dir.path()).expect("open storage");
        let store = EventStore::open(
            storage,
            StoreConfig::default(),
            Arc::clone(&recorder) as Arc<dyn Dispatcher>,
        )
        .expect("open store");
        store.append("alert-1", event("AlertCreated")).await.expect("append");
        store.append("alert-2", event("AlertCreated")).await.expect("append");
        store.create_projection(definition()).await.expect("create");
        store.start_projection("alert-count").expect("start");
        eventually("both alerts folded", || {
            store.get_projection_state("alert-count").expect("state").position == 2
        })
        .await;
        store.shutdown().await;
    }

    let storage = FileStorage::open(dir.path()).expect("reopen storage");
    let store = EventStore::open(
        storage,
        StoreConfig::default(),
        Arc::clone(&recorder) as Arc<dyn Dispatcher>,
    )
    .expect("reopen store");
    let restored = store.create_projection(definition()).await.expect("recreate");
    assert_eq!(restored.position, 2);
    assert_eq!(restored.state, json!({ "alerts": 2 }));

    store.append("alert-3", event("AlertCreated")).await.expect("append");
    store.start_projection("alert-count").expect("start");
    eventually("third alert folded once", || {
        store.get_projection_state("alert-count").expect("state").state == json!({ "alerts": 3 })
    })
    .await;
    store.shutdown().await;
}

#[tokio::test]
async fn replay_to_subscription_completes_with_monotonic_progress() {
    let recorder = Arc::new(Recorder::default());
    let store = store_with(&recorder);
    for i in 0..6 {
        let event_type = if i % 3 == 0 { "AlertCreated" } else { "AlertUpdated" };
        store.append("alert-1", event(event_type)).await.expect("append");
    }

    store
        .create_subscription(NewSubscription::new(
            "replayer",
            "alert-*",
            HandlerDescriptor::new("webhook", "https://audit.example"),
        ))
        .expect("create");

    let session = store
        .start_replay(
            ReplayRequest::new(ReplayTarget::Subscription("replayer".into()))
                .positions(1, 6)
                .event_types(["AlertUpdated"])
                .speed(4.0),
        )
        .expect("start replay");
    assert_eq!(session.progress.total, 4);

    let mut last = -1.0;
    eventually("replay completes", || {
        let session = store.get_replay_session(session.id).expect("get");
        assert!(session.progress.percentage >= last, "progress went backwards");
        last = session.progress.percentage;
        session.status == ReplayStatus::Completed
    })
    .await;

    let done = store.get_replay_session(session.id).expect("get");
    assert_eq!(done.progress.percentage, 100.0);
    assert_eq!(done.events_replayed, 4);
    assert_eq!(recorder.positions(), vec![2, 3, 5, 6]);

    let sub = store.get_subscription("replayer").expect("get");
    assert_eq!(sub.checkpoint, 6, "replay must not move the checkpoint");
    assert_eq!(store.list_replay_sessions().len(), 1);
    store.shutdown().await;
}

#[tokio::test]
async fn cancelled_replay_stops_short() {
    let recorder = Arc::new(Recorder::default());
    let store = store_with(&recorder);
    for _ in 0..50 {
        store.append("cert-1", event("CertChecked")).await.expect("append");
    }
    store
        .create_projection(
            ProjectionDefinition::new("certs", ProjectionMode::Transient, SourceSelector::All)
                .on("CertChecked", count_alerts),
        )
        .await
        .expect("create");

    let session = store
        .start_replay(ReplayRequest::new(ReplayTarget::Projection("certs".into())).speed(0.1))
        .expect("start replay");
    let cancelled = store.cancel_replay(session.id).expect("cancel");
    assert_eq!(cancelled.status, ReplayStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = store.get_replay_session(session.id).expect("get");
    assert_eq!(after.status, ReplayStatus::Cancelled);
    assert!(after.progress.current < 50);
    assert!(store.cancel_replay(session.id).is_err());
    store.shutdown().await;
}

#[tokio::test]
async fn feed_catches_up_then_goes_live() {
    let recorder = Arc::new(Recorder::default());
    let store = store_with(&recorder);
    store.append("alert-1", event("AlertCreated")).await.expect("append");
    store.append("alert-1", event("AlertEscalated")).await.expect("append");

    let mut feed = Box::pin(store.feed(1, 1));
    let mut positions = Vec::new();
    loop {
        match feed.next().await.expect("feed item").expect("no error") {
            FeedMessage::Event(event) => positions.push(event.position),
            FeedMessage::CaughtUp => break,
        }
    }
    assert_eq!(positions, vec![1, 2]);

    store.append("cert-1", event("CertIssued")).await.expect("append");
    let live = tokio::time::timeout(Duration::from_secs(5), feed.next())
        .await
        .expect("live event in time")
        .expect("feed item")
        .expect("no error");
    match live {
        FeedMessage::Event(event) => assert_eq!(event.stream_id, "cert-1"),
        FeedMessage::CaughtUp => panic!("unexpected second CaughtUp"),
    }
    store.shutdown().await;
}
