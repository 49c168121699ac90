use super::*;
use crate::domain::value_objects::Document;
use async_trait::async_trait;
use mockall::{Sequence, mock};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

mock! {
    pub Mutator {}

    #[async_trait]
    impl RemoteMutator for Mutator {
        async fn create(
            &self,
            collection: &CollectionName,
            payload: RecordPayload,
        ) -> Result<Document, AppError>;
        async fn update(
            &self,
            collection: &CollectionName,
            id: &EntityId,
            payload: RecordPayload,
        ) -> Result<(), AppError>;
        async fn delete(&self, collection: &CollectionName, id: &EntityId) -> Result<(), AppError>;
    }
}

/// Mutator that replays scripted results and can hold calls open until the
/// test releases them.
#[derive(Default)]
struct ScriptedMutator {
    responses: Mutex<VecDeque<Result<(), AppError>>>,
    calls: Mutex<Vec<(MutationAction, EntityId, RecordPayload)>>,
    permits: Option<Arc<Semaphore>>,
    started: Notify,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedMutator {
    fn failing(times: usize) -> Self {
        let responses = (0..times)
            .map(|n| Err(AppError::Network(format!("offline #{n}"))))
            .collect();
        Self {
            responses: Mutex::new(responses),
            ..Self::default()
        }
    }

    fn blocking(permits: Arc<Semaphore>) -> Self {
        Self {
            permits: Some(permits),
            ..Self::default()
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn payloads(&self) -> Vec<RecordPayload> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }

    async fn run(
        &self,
        action: MutationAction,
        id: EntityId,
        payload: RecordPayload,
    ) -> Result<(), AppError> {
        self.calls.lock().unwrap().push((action, id, payload));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(permits) = &self.permits {
            permits.acquire().await.unwrap().forget();
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl RemoteMutator for ScriptedMutator {
    async fn create(
        &self,
        _collection: &CollectionName,
        payload: RecordPayload,
    ) -> Result<Document, AppError> {
        let server_id = EntityId::new(format!("server-{}", self.call_count() + 1)).unwrap();
        self.run(MutationAction::Create, server_id.clone(), payload)
            .await?;
        Ok(Document::new(server_id, RecordPayload::empty()))
    }

    async fn update(
        &self,
        _collection: &CollectionName,
        id: &EntityId,
        payload: RecordPayload,
    ) -> Result<(), AppError> {
        self.run(MutationAction::Update, id.clone(), payload).await
    }

    async fn delete(&self, _collection: &CollectionName, id: &EntityId) -> Result<(), AppError> {
        self.run(MutationAction::Delete, id.clone(), RecordPayload::empty())
            .await
    }
}

fn payments() -> CollectionName {
    CollectionName::new("payments".into()).unwrap()
}

fn id(value: &str) -> EntityId {
    EntityId::new(value.into()).unwrap()
}

fn payload(value: Value) -> RecordPayload {
    RecordPayload::new(value).unwrap()
}

fn key(value: &str) -> PendingKey {
    PendingKey::new(payments(), id(value))
}

fn manager_with(mutator: Arc<dyn RemoteMutator>) -> Arc<OptimisticUpdateManager> {
    OptimisticUpdateManager::new(
        mutator,
        MutationSettings::default(),
        ConflictPolicy::ServerWins,
    )
}

async fn next_event(rx: &mut broadcast::Receiver<MutationEvent>) -> MutationEvent {
    tokio::time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("timed out waiting for a mutation event")
        .expect("event channel closed")
}

async fn next_settled(rx: &mut broadcast::Receiver<MutationEvent>) -> (PendingKey, MutationOutcome) {
    loop {
        if let MutationEvent::Settled { key, outcome, .. } = next_event(rx).await {
            return (key, outcome);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn pending_entry_is_visible_before_any_remote_work() {
    let permits = Arc::new(Semaphore::new(0));
    let mutator = Arc::new(ScriptedMutator::blocking(Arc::clone(&permits)));
    let manager = manager_with(mutator.clone());

    manager.apply_update(
        &payments(),
        id("p1"),
        MutationAction::Update,
        payload(json!({"status": "paid"})),
        Some(payload(json!({"status": "pending"}))),
    );

    assert!(manager.is_pending(&key("p1")));
    let pending = manager.pending_updates();
    let entry = pending.get(&key("p1")).expect("pending entry");
    assert_eq!(entry.action, MutationAction::Update);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.payload, payload(json!({"status": "paid"})));
    assert_eq!(
        entry.original_snapshot,
        Some(payload(json!({"status": "pending"})))
    );
    assert_eq!(manager.pending_for(&payments()).len(), 1);

    permits.add_permits(1);
}

#[tokio::test(start_paused = true)]
async fn immediate_success_reports_payload_and_clears_pending() {
    let mut mutator = MockMutator::new();
    mutator
        .expect_update()
        .times(1)
        .returning(|_, _, _| Ok(()));
    let manager = manager_with(Arc::new(mutator));
    let mut events = manager.subscribe();

    manager.apply_update(
        &payments(),
        id("p1"),
        MutationAction::Update,
        payload(json!({"status": "paid"})),
        None,
    );

    let (settled_key, outcome) = next_settled(&mut events).await;
    assert_eq!(settled_key, key("p1"));
    assert_eq!(
        outcome,
        MutationOutcome::Succeeded {
            result: payload(json!({"status": "paid"})),
            server_id: None,
        }
    );
    assert!(!manager.is_pending(&key("p1")));
    assert_eq!(manager.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn update_recovers_after_two_failures() {
    let mut seq = Sequence::new();
    let mut mutator = MockMutator::new();
    mutator
        .expect_update()
        .times(2)
        .in_sequence(&mut seq)
        .returning(|_, _, _| Err(AppError::Network("unavailable".into())));
    mutator
        .expect_update()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _, _| Ok(()));
    let manager = manager_with(Arc::new(mutator));
    let mut events = manager.subscribe();
    let started = Instant::now();

    manager.apply_update(
        &payments(),
        id("p1"),
        MutationAction::Update,
        payload(json!({"status": "paid"})),
        None,
    );

    let mut delays = Vec::new();
    let outcome = loop {
        match next_event(&mut events).await {
            MutationEvent::RetryScheduled {
                retry_count, delay, ..
            } => delays.push((retry_count, delay)),
            MutationEvent::Settled { outcome, .. } => break outcome,
            MutationEvent::Applied { .. } => {}
        }
    };

    assert_eq!(
        delays,
        vec![
            (1, Duration::from_millis(1_000)),
            (2, Duration::from_millis(2_000)),
        ]
    );
    assert!(matches!(outcome, MutationOutcome::Succeeded { .. }));
    assert!(started.elapsed() >= Duration::from_millis(3_000));
    assert!(!manager.is_pending(&key("p1")));
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_makes_exactly_max_retries_plus_one_attempts() {
    let mutator = Arc::new(ScriptedMutator::failing(16));
    let manager = manager_with(mutator.clone());
    let mut events = manager.subscribe();
    let started = Instant::now();

    manager.apply_update(
        &payments(),
        id("p1"),
        MutationAction::Update,
        payload(json!({"status": "paid"})),
        None,
    );

    let mut retries = Vec::new();
    let mut failures = 0;
    loop {
        match next_event(&mut events).await {
            MutationEvent::RetryScheduled { retry_count, .. } => retries.push(retry_count),
            MutationEvent::Settled {
                outcome: MutationOutcome::Failed { attempts, error },
                ..
            } => {
                failures += 1;
                assert_eq!(attempts, 4);
                assert!(error.contains("offline"));
                break;
            }
            MutationEvent::Settled { outcome, .. } => panic!("unexpected outcome {outcome:?}"),
            MutationEvent::Applied { .. } => {}
        }
    }

    // Give any stray retry a chance to run.
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(retries, vec![1, 2, 3]);
    assert_eq!(failures, 1);
    assert_eq!(mutator.call_count(), 4);
    assert!(started.elapsed() >= Duration::from_millis(7_000));
    assert!(!manager.is_pending(&key("p1")));
    assert!(events.try_recv().is_err());

    let metrics = manager.metrics();
    assert_eq!(metrics.total_attempts, 4);
    assert_eq!(metrics.total_retries, 3);
    assert_eq!(metrics.total_abandoned, 1);
}

#[tokio::test(start_paused = true)]
async fn create_reports_server_assigned_id() {
    let mut seq = Sequence::new();
    let mut mutator = MockMutator::new();
    mutator
        .expect_create()
        .times(2)
        .in_sequence(&mut seq)
        .returning(|_, _| Err(AppError::Network("unavailable".into())));
    mutator
        .expect_create()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|collection, payload| {
            collection.as_str() == "payments" && payload.get("amount") == Some(&json!(100))
        })
        .returning(|_, _| Ok(Document::new(id("new-1"), RecordPayload::empty())));
    let manager = manager_with(Arc::new(mutator));
    let mut events = manager.subscribe();

    manager.apply_update(
        &payments(),
        id("p2"),
        MutationAction::Create,
        payload(json!({"amount": 100})),
        None,
    );

    let (settled_key, outcome) = next_settled(&mut events).await;
    assert_eq!(settled_key, key("p2"));
    assert_eq!(
        outcome,
        MutationOutcome::Succeeded {
            result: payload(json!({"id": "new-1", "amount": 100})),
            server_id: Some(id("new-1")),
        }
    );
    assert!(!manager.is_pending(&key("p2")));
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_backoff_stops_retries() {
    let mutator = Arc::new(ScriptedMutator::failing(10));
    let manager = manager_with(mutator.clone());
    let mut events = manager.subscribe();

    manager.apply_update(
        &payments(),
        id("p1"),
        MutationAction::Update,
        payload(json!({"status": "paid"})),
        None,
    );

    loop {
        if let MutationEvent::RetryScheduled { retry_count, .. } = next_event(&mut events).await {
            assert_eq!(retry_count, 1);
            break;
        }
    }

    assert!(manager.cancel_update(&key("p1")));
    assert!(!manager.is_pending(&key("p1")));
    assert!(!manager.cancel_update(&key("p1")));

    let (_, outcome) = next_settled(&mut events).await;
    assert_eq!(outcome, MutationOutcome::Cancelled);
    assert!(!outcome.is_reportable());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(mutator.call_count(), 1);
    assert!(events.try_recv().is_err());
    assert_eq!(manager.metrics().total_cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn result_of_cancelled_in_flight_call_is_discarded() {
    let permits = Arc::new(Semaphore::new(0));
    let mutator = Arc::new(ScriptedMutator::blocking(Arc::clone(&permits)));
    let manager = manager_with(mutator.clone());
    let mut events = manager.subscribe();

    manager.apply_update(
        &payments(),
        id("p1"),
        MutationAction::Update,
        payload(json!({"status": "paid"})),
        None,
    );
    mutator.started.notified().await;

    assert!(manager.cancel_update(&key("p1")));
    permits.add_permits(1);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut outcomes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let MutationEvent::Settled { outcome, .. } = event {
            outcomes.push(outcome);
        }
    }
    assert_eq!(outcomes, vec![MutationOutcome::Cancelled]);
    assert!(!manager.is_pending(&key("p1")));
    assert_eq!(manager.metrics().total_confirmed, 0);
}

#[tokio::test(start_paused = true)]
async fn newer_intent_supersedes_and_waits_for_the_call_in_flight() {
    let permits = Arc::new(Semaphore::new(0));
    let mutator = Arc::new(ScriptedMutator::blocking(Arc::clone(&permits)));
    let manager = manager_with(mutator.clone());
    let mut events = manager.subscribe();

    manager.apply_update(
        &payments(),
        id("p1"),
        MutationAction::Update,
        payload(json!({"status": "paid"})),
        None,
    );
    mutator.started.notified().await;

    manager.apply_update(
        &payments(),
        id("p1"),
        MutationAction::Update,
        payload(json!({"status": "overdue"})),
        None,
    );
    assert_eq!(
        manager
            .pending_updates()
            .get(&key("p1"))
            .map(|entry| entry.payload.clone()),
        Some(payload(json!({"status": "overdue"})))
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(mutator.call_count(), 1);

    permits.add_permits(2);
    let mut settled = Vec::new();
    while settled.len() < 2 {
        settled.push(next_settled(&mut events).await.1);
    }

    assert_eq!(settled[0], MutationOutcome::Superseded);
    assert_eq!(
        settled[1],
        MutationOutcome::Succeeded {
            result: payload(json!({"status": "overdue"})),
            server_id: None,
        }
    );
    assert_eq!(
        mutator.payloads(),
        vec![
            payload(json!({"status": "paid"})),
            payload(json!({"status": "overdue"})),
        ]
    );
    assert_eq!(mutator.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(!manager.is_pending(&key("p1")));
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_counts_as_failure() {
    let permits = Arc::new(Semaphore::new(0));
    let mutator = Arc::new(ScriptedMutator::blocking(Arc::clone(&permits)));
    let manager = OptimisticUpdateManager::new(
        mutator.clone(),
        MutationSettings {
            max_retries: 0,
            retry_delay: Duration::from_millis(10),
            attempt_timeout: Some(Duration::from_secs(5)),
        },
        ConflictPolicy::ServerWins,
    );
    let mut events = manager.subscribe();

    manager.apply_update(
        &payments(),
        id("p9"),
        MutationAction::Delete,
        RecordPayload::empty(),
        None,
    );

    let (_, outcome) = next_settled(&mut events).await;
    match outcome {
        MutationOutcome::Failed { error, attempts } => {
            assert_eq!(attempts, 1);
            assert!(error.contains("exceeded 5000ms"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    permits.add_permits(1);
}

#[tokio::test(start_paused = true)]
async fn clear_collection_only_touches_that_collection() {
    let permits = Arc::new(Semaphore::new(0));
    let mutator = Arc::new(ScriptedMutator::blocking(Arc::clone(&permits)));
    let manager = manager_with(mutator);
    let meetings = CollectionName::new("meetings".into()).unwrap();

    manager.apply_update(
        &payments(),
        id("p1"),
        MutationAction::Update,
        payload(json!({"status": "paid"})),
        None,
    );
    manager.apply_update(
        &meetings,
        id("m1"),
        MutationAction::Delete,
        RecordPayload::empty(),
        None,
    );

    assert_eq!(manager.clear_collection(&payments()), 1);
    assert!(!manager.is_pending(&key("p1")));
    assert!(manager.is_pending(&PendingKey::new(meetings.clone(), id("m1"))));

    assert_eq!(manager.clear_all(), 1);
    assert_eq!(manager.pending_count(), 0);
    permits.add_permits(2);
}

#[test]
fn conflict_policy_can_be_overridden_per_collection() {
    let manager = manager_with(Arc::new(MockMutator::new()));
    let server = payload(json!({"id": "1", "name": "Server"}));
    let client = payload(json!({"name": "Client"}));

    assert_eq!(
        manager.resolve_conflict(&payments(), &id("1"), &server, &client),
        server
    );

    manager.set_collection_policy(payments(), ConflictPolicy::ClientWins);
    assert_eq!(
        manager
            .resolve_conflict(&payments(), &id("1"), &server, &client)
            .into_value(),
        json!({"id": "1", "name": "Client"})
    );

    let meetings = CollectionName::new("meetings".into()).unwrap();
    assert_eq!(
        manager.resolve_conflict(&meetings, &id("1"), &server, &client),
        server
    );
}

#[tokio::test(start_paused = true)]
async fn outcome_subscribers_see_every_settlement_of_a_burst() {
    let mut mutator = MockMutator::new();
    mutator
        .expect_update()
        .returning(|_, _, _| Err(AppError::Network("offline".into())));
    let settings = MutationSettings {
        max_retries: 0,
        ..MutationSettings::default()
    };
    let manager = OptimisticUpdateManager::new(Arc::new(mutator), settings, ConflictPolicy::ServerWins);
    let mut lossy = manager.subscribe();
    let mut outcomes = manager.subscribe_outcomes();
    drop(manager.subscribe_outcomes());

    for n in 0..400 {
        manager.apply_update(
            &payments(),
            id(&format!("p{n}")),
            MutationAction::Update,
            payload(json!({"status": "paid"})),
            None,
        );
    }
    while manager.pending_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut failed = std::collections::HashSet::new();
    while let Ok(event) = outcomes.try_recv() {
        match event {
            MutationEvent::Settled {
                key,
                outcome: MutationOutcome::Failed { attempts, .. },
                ..
            } => {
                assert_eq!(attempts, 1);
                failed.insert(key);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(failed.len(), 400);
    // The lifecycle feed is bounded and has fallen behind.
    assert!(matches!(
        lossy.try_recv(),
        Err(broadcast::error::TryRecvError::Lagged(_))
    ));
}
