use crate::application::ports::{ConnectivityProbe, RemoteMutator, SnapshotSource};
use crate::application::services::{
    ConnectionBoard, NotificationService, OptimisticUpdateManager, RealtimeAggregator,
    RealtimeSettings,
};
use crate::domain::entities::{ConnectionState, Meeting, Payment, Reservation};
use crate::infrastructure::store::{MemoryDocumentStore, SqliteDocumentStore};
use crate::shared::AppConfig;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The signal the UI shows next to every list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub connection_status: ConnectionState,
    pub is_data_stale: bool,
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<CancellationToken>,
    listeners: Vec<JoinHandle<()>>,
}

/// Composition root of a session: one mutation manager shared by the three
/// realtime feeds, the notification feed and the combined connection status.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub mutations: Arc<OptimisticUpdateManager>,
    pub payments: Arc<RealtimeAggregator<Payment>>,
    pub reservations: Arc<RealtimeAggregator<Reservation>>,
    pub meetings: Arc<RealtimeAggregator<Meeting>>,
    pub notifications: Arc<NotificationService>,
    pub connection: Arc<ConnectionBoard>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        mutator: Arc<dyn RemoteMutator>,
        source: Arc<dyn SnapshotSource>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let mutations = OptimisticUpdateManager::from_config(mutator, &config.mutations);
        let connection = Arc::new(ConnectionBoard::new());
        let settings = RealtimeSettings::from(&config.realtime);

        let payments = Arc::new(
            RealtimeAggregator::new(
                Arc::clone(&mutations),
                Arc::clone(&source),
                Arc::clone(&probe),
                settings.clone(),
            )
            .with_board(Arc::clone(&connection)),
        );
        let reservations = Arc::new(
            RealtimeAggregator::new(
                Arc::clone(&mutations),
                Arc::clone(&source),
                Arc::clone(&probe),
                settings.clone(),
            )
            .with_board(Arc::clone(&connection)),
        );
        let meetings = Arc::new(
            RealtimeAggregator::new(Arc::clone(&mutations), source, probe, settings)
                .with_board(Arc::clone(&connection)),
        );
        let notifications = Arc::new(NotificationService::from_config(&config.notifications));

        Self {
            config: Arc::new(config),
            mutations,
            payments,
            reservations,
            meetings,
            notifications,
            connection,
            lifecycle: Arc::new(Mutex::new(Lifecycle::default())),
        }
    }

    /// Session over a store that implements every port.
    pub fn with_store<S>(config: AppConfig, store: Arc<S>) -> Self
    where
        S: RemoteMutator + SnapshotSource + ConnectivityProbe + 'static,
    {
        Self::new(config, store.clone(), store.clone(), store)
    }

    pub fn in_memory(config: AppConfig) -> (Self, Arc<MemoryDocumentStore>) {
        let store = Arc::new(MemoryDocumentStore::new());
        (Self::with_store(config, Arc::clone(&store)), store)
    }

    pub async fn with_sqlite(config: AppConfig) -> anyhow::Result<Self> {
        let store = SqliteDocumentStore::connect(&config.database)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open document store: {}", e))?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Starts the realtime feeds and the notification listeners. Must be
    /// called from within a Tokio runtime; a second call is a no-op.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if lifecycle.shutdown.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();

        // Listeners subscribe first so they see the feeds' first transitions.
        lifecycle.listeners.push(
            self.notifications
                .spawn_mutation_listener(self.mutations.subscribe_outcomes(), shutdown.clone()),
        );
        lifecycle.listeners.push(
            self.notifications
                .spawn_connection_listener(self.connection.subscribe(), shutdown.clone()),
        );

        self.payments.start(&shutdown);
        self.reservations.start(&shutdown);
        self.meetings.start(&shutdown);

        lifecycle.shutdown = Some(shutdown);
        info!("session started");
    }

    /// Stops every feed, drops pending mutations and waits for the listeners.
    pub async fn shutdown(&self) {
        let (shutdown, listeners) = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            (
                lifecycle.shutdown.take(),
                std::mem::take(&mut lifecycle.listeners),
            )
        };
        let Some(shutdown) = shutdown else {
            return;
        };

        shutdown.cancel();
        self.payments.stop();
        self.reservations.stop();
        self.meetings.stop();
        let dropped = self.mutations.clear_all();

        for listener in listeners {
            if let Err(err) = listener.await {
                warn!(error = %err, "notification listener ended abnormally");
            }
        }
        info!(dropped_mutations = dropped, "session stopped");
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.connection.status()
    }

    /// True when any feed has not delivered a snapshot within the threshold.
    pub fn is_data_stale(&self) -> bool {
        self.payments.is_data_stale()
            || self.reservations.is_data_stale()
            || self.meetings.is_data_stale()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            connection_status: self.connection_status(),
            is_data_stale: self.is_data_stale(),
        }
    }
}
