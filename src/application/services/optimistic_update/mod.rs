pub mod backoff;
pub mod conflict;
pub mod manager;
pub mod metrics;

pub use conflict::{ConflictPolicies, ConflictPolicy, ConflictResolver};
pub use manager::{MutationSettings, OptimisticUpdateManager};
pub use metrics::{AttemptOutcomeStatus, LastAttempt, MutationMetricsSnapshot};
