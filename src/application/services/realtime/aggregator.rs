use super::board::ConnectionBoard;
use super::health::{HealthCheckSettings, check_connection};
use crate::application::ports::{
    ConnectivityProbe, DocumentSubscription, SnapshotEvent, SnapshotSource,
};
use crate::application::services::optimistic_update::OptimisticUpdateManager;
use crate::application::services::reconciliation::reconcile;
use crate::domain::entities::{ConnectionState, Entity, MutationAction, MutationEvent, PendingKey};
use crate::domain::value_objects::{
    CollectionName, Document, DocumentSnapshot, EntityId, QueryFilters, RecordPayload,
};
use crate::shared::AppError;
use crate::shared::config::RealtimeConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub retry_on_error: bool,
    pub resubscribe_delay: Duration,
    pub health: HealthCheckSettings,
    pub stale_threshold: chrono::Duration,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

impl From<&RealtimeConfig> for RealtimeSettings {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            retry_on_error: config.retry_on_error,
            resubscribe_delay: config.resubscribe_delay(),
            health: HealthCheckSettings {
                interval: config.health_check_interval(),
                retry_base: config.health_retry_base(),
                max_attempts: config.health_max_attempts,
            },
            stale_threshold: config.stale_threshold(),
        }
    }
}

/// What the UI renders for one entity kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeView<T> {
    pub data: Vec<T>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl<T> Default for RealtimeView<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            loading: true,
            error: None,
            last_updated: None,
        }
    }
}

struct FeedState {
    snapshot: Vec<Document>,
    loading: bool,
    error: Option<String>,
    last_updated: Option<DateTime<Utc>>,
    // A subscription is open and has delivered at least one snapshot.
    live: bool,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            snapshot: Vec::new(),
            loading: true,
            error: None,
            last_updated: None,
            live: false,
        }
    }
}

/// Live, reconciled view of one entity kind: the latest authoritative
/// snapshot with the session's pending mutations overlaid, plus connection
/// health and staleness.
pub struct RealtimeAggregator<T: Entity> {
    collection: CollectionName,
    filters: QueryFilters,
    source: Arc<dyn SnapshotSource>,
    probe: Arc<dyn ConnectivityProbe>,
    manager: Arc<OptimisticUpdateManager>,
    settings: RealtimeSettings,
    board: Option<Arc<ConnectionBoard>>,
    feed: Mutex<FeedState>,
    view_tx: watch::Sender<RealtimeView<T>>,
    connection_tx: watch::Sender<ConnectionState>,
    running: Mutex<Option<CancellationToken>>,
}

impl<T: Entity> RealtimeAggregator<T> {
    pub fn new(
        manager: Arc<OptimisticUpdateManager>,
        source: Arc<dyn SnapshotSource>,
        probe: Arc<dyn ConnectivityProbe>,
        settings: RealtimeSettings,
    ) -> Self {
        let (view_tx, _) = watch::channel(RealtimeView::default());
        let (connection_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            collection: T::KIND.collection(),
            filters: QueryFilters::default(),
            source,
            probe,
            manager,
            settings,
            board: None,
            feed: Mutex::new(FeedState::default()),
            view_tx,
            connection_tx,
            running: Mutex::new(None),
        }
    }

    pub fn with_filters(mut self, filters: QueryFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_board(mut self, board: Arc<ConnectionBoard>) -> Self {
        board.register(self.collection.clone());
        self.board = Some(board);
        self
    }

    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Spawns the feed, mutation listener and health loops. They stop when
    /// `parent` is cancelled or `stop` is called. Calling `start` on a running
    /// aggregator does nothing.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let token = {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.as_ref().is_some_and(|token| !token.is_cancelled()) {
                return;
            }
            let token = parent.child_token();
            *running = Some(token.clone());
            token
        };

        info!(
            target: "realtime::aggregator",
            collection = %self.collection,
            "starting realtime feed"
        );

        // Subscribe before spawning so no event between now and the first
        // poll is lost.
        let events = self.manager.subscribe();

        let aggregator = Arc::clone(self);
        let feed_token = token.clone();
        tokio::spawn(async move { aggregator.run_feed(feed_token).await });

        let aggregator = Arc::clone(self);
        let listener_token = token.clone();
        tokio::spawn(async move {
            aggregator
                .run_mutation_listener(events, listener_token)
                .await
        });

        let aggregator = Arc::clone(self);
        tokio::spawn(async move { aggregator.run_health(token).await });
    }

    pub fn stop(&self) {
        let token = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
            info!(
                target: "realtime::aggregator",
                collection = %self.collection,
                "realtime feed stopped"
            );
        }
        self.lock_feed().live = false;
        self.set_connection(ConnectionState::Disconnected);
    }

    /// Recomputed on every call from the latest snapshot and pending set.
    pub fn view(&self) -> RealtimeView<T> {
        let (snapshot, loading, error, last_updated) = {
            let feed = self.lock_feed();
            (
                feed.snapshot.clone(),
                feed.loading,
                feed.error.clone(),
                feed.last_updated,
            )
        };
        let pending = self.manager.pending_for(&self.collection);
        let data = reconcile(&snapshot, &pending)
            .iter()
            .filter_map(|document| self.decode(document))
            .collect();

        RealtimeView {
            data,
            loading,
            error,
            last_updated,
        }
    }

    pub fn subscribe_view(&self) -> watch::Receiver<RealtimeView<T>> {
        self.view_tx.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_tx.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_tx.subscribe()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.lock_feed().last_updated
    }

    pub fn is_data_stale(&self) -> bool {
        self.is_data_stale_at(Utc::now())
    }

    pub fn is_data_stale_at(&self, now: DateTime<Utc>) -> bool {
        match self.last_updated() {
            Some(last_updated) => now - last_updated > self.settings.stale_threshold,
            None => true,
        }
    }

    /// Registers a local mutation and refreshes the view before returning.
    pub fn apply_optimistic_update(
        &self,
        id: EntityId,
        action: MutationAction,
        payload: RecordPayload,
        original: Option<&T>,
    ) -> Result<(), AppError> {
        let original_snapshot = original
            .map(RecordPayload::from_serializable)
            .transpose()
            .map_err(AppError::SerializationError)?;
        self.manager
            .apply_update(&self.collection, id, action, payload, original_snapshot);
        self.publish_view();
        Ok(())
    }

    /// Creates a record under a temporary id, which is returned. The record
    /// shows up in the view until the store confirms it.
    pub fn create(&self, payload: RecordPayload) -> EntityId {
        let id = EntityId::temporary();
        self.manager.apply_update(
            &self.collection,
            id.clone(),
            MutationAction::Create,
            payload,
            None,
        );
        self.publish_view();
        id
    }

    pub fn cancel_update(&self, id: &EntityId) -> bool {
        let cancelled = self.manager.cancel_update(&self.key(id));
        if cancelled {
            self.publish_view();
        }
        cancelled
    }

    pub fn is_pending(&self, id: &EntityId) -> bool {
        self.manager.is_pending(&self.key(id))
    }

    pub fn resolve_conflict(
        &self,
        id: &EntityId,
        server: &T,
        client: &RecordPayload,
    ) -> Result<T, AppError> {
        let server =
            RecordPayload::from_serializable(server).map_err(AppError::SerializationError)?;
        self.manager
            .resolve_conflict(&self.collection, id, &server, client)
            .decode()
            .map_err(AppError::DeserializationError)
    }

    /// Live feed of a single document of this kind.
    pub async fn watch_document(&self, id: &EntityId) -> Result<DocumentSubscription, AppError> {
        self.source.subscribe_document(&self.collection, id).await
    }

    /// Applies the pending mutation for the snapshot's id, if any, and
    /// decodes the result. `None` when the document does not exist (or is
    /// pending deletion) and no create is pending for it.
    pub fn reconcile_document(&self, snapshot: &DocumentSnapshot) -> Option<T> {
        let authoritative: Vec<Document> = snapshot
            .data
            .clone()
            .map(|data| Document::new(snapshot.id.clone(), data))
            .into_iter()
            .collect();
        let pending: HashMap<EntityId, _> = self
            .manager
            .pending_updates()
            .remove(&self.key(&snapshot.id))
            .map(|mutation| (snapshot.id.clone(), mutation))
            .into_iter()
            .collect();

        reconcile(&authoritative, &pending)
            .first()
            .and_then(|document| self.decode(document))
    }

    async fn run_feed(self: Arc<Self>, token: CancellationToken) {
        loop {
            let subscribed = tokio::select! {
                _ = token.cancelled() => return,
                result = self.source.subscribe(&self.collection, &self.filters) => result,
            };

            match subscribed {
                Ok(mut subscription) => {
                    debug!(
                        target: "realtime::aggregator",
                        collection = %self.collection,
                        "subscription established"
                    );
                    let failure = loop {
                        let event = tokio::select! {
                            // dropping the subscription unsubscribes
                            _ = token.cancelled() => return,
                            event = subscription.next() => event,
                        };
                        match event {
                            Some(SnapshotEvent::Snapshot(documents)) => {
                                self.accept_snapshot(documents)
                            }
                            Some(SnapshotEvent::Error(message)) => break message,
                            None => break "subscription closed by the store".to_string(),
                        }
                    };
                    subscription.unsubscribe();
                    self.record_feed_error(failure);
                }
                Err(err) => self.record_feed_error(err.to_string()),
            }

            if !self.settings.retry_on_error {
                return;
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.settings.resubscribe_delay) => {}
            }
        }
    }

    async fn run_mutation_listener(
        self: Arc<Self>,
        mut events: broadcast::Receiver<MutationEvent>,
        token: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => return,
                received = events.recv() => received,
            };
            match received {
                Ok(event) if event.key().collection == self.collection => self.publish_view(),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(
                        target: "realtime::aggregator",
                        collection = %self.collection,
                        skipped,
                        "mutation events lagged, refreshing view"
                    );
                    self.publish_view();
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn run_health(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.health.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the feed reports the initial state.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = check_connection(
                    self.probe.as_ref(),
                    &self.settings.health,
                    |state| self.report_health(state),
                ) => {}
            }
        }
    }

    fn accept_snapshot(&self, documents: Vec<Document>) {
        {
            let mut feed = self.lock_feed();
            feed.snapshot = documents;
            feed.loading = false;
            feed.error = None;
            feed.last_updated = Some(Utc::now());
            feed.live = true;
        }
        self.set_connection(ConnectionState::Connected);
        self.publish_view();
    }

    fn record_feed_error(&self, message: String) {
        warn!(
            target: "realtime::aggregator",
            collection = %self.collection,
            error = %message,
            retry = self.settings.retry_on_error,
            "realtime subscription failed"
        );
        {
            let mut feed = self.lock_feed();
            feed.error = Some(message);
            feed.live = false;
        }
        self.set_connection(if self.settings.retry_on_error {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Error
        });
        self.publish_view();
    }

    /// Health checks can degrade the state, but only a live feed may be
    /// reported as connected again.
    fn report_health(&self, state: ConnectionState) {
        if state == ConnectionState::Connected && !self.lock_feed().live {
            debug!(
                target: "realtime::aggregator",
                collection = %self.collection,
                "store reachable, waiting for the feed to resubscribe"
            );
            return;
        }
        self.set_connection(state);
    }

    fn set_connection(&self, state: ConnectionState) {
        let changed = self.connection_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if !changed {
            return;
        }
        debug!(
            target: "realtime::aggregator",
            collection = %self.collection,
            state = %state,
            "connection state changed"
        );
        if let Some(board) = &self.board {
            board.update(self.collection.clone(), state);
        }
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(self.view());
    }

    fn decode(&self, document: &Document) -> Option<T> {
        match document.decode::<T>() {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(
                    target: "realtime::aggregator",
                    collection = %self.collection,
                    id = %document.id,
                    error = %err,
                    "skipping record that does not decode"
                );
                None
            }
        }
    }

    fn key(&self, id: &EntityId) -> PendingKey {
        PendingKey::new(self.collection.clone(), id.clone())
    }

    fn lock_feed(&self) -> MutexGuard<'_, FeedState> {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
