use crate::shared::AppError;
use async_trait::async_trait;

/// Lightweight no-op read used by the periodic health check.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<(), AppError>;
}
