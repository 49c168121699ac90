pub mod notification_service;
pub mod optimistic_update;
pub mod realtime;
pub mod reconciliation;

pub use notification_service::NotificationService;
pub use optimistic_update::{
    ConflictPolicies, ConflictPolicy, ConflictResolver, MutationSettings, OptimisticUpdateManager,
};
pub use realtime::{ConnectionBoard, RealtimeAggregator, RealtimeSettings, RealtimeView};
pub use reconciliation::reconcile;
