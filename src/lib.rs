pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod shared;
pub mod state;

pub use application::services::{
    ConflictPolicy, NotificationService, OptimisticUpdateManager, RealtimeAggregator, RealtimeView,
};
pub use infrastructure::store::{MemoryDocumentStore, SqliteDocumentStore};
pub use shared::{AppConfig, AppError, Result};
pub use state::{AppState, SessionStatus};

use tracing::info;

/// Initializes logging, opens the SQLite document store named by the config
/// and starts a session over it.
pub async fn run(config: AppConfig) -> anyhow::Result<AppState> {
    shared::logging::init(&config.logging);

    info!(database = %config.database.url, "condo realtime session starting...");

    let state = AppState::with_sqlite(config).await?;
    state.start();
    Ok(state)
}
