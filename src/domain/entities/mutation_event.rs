use super::pending_mutation::{MutationAction, PendingKey};
use crate::domain::value_objects::{EntityId, RecordPayload};
use serde::Serialize;
use std::time::Duration;

/// How a mutation left the pending set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationOutcome {
    /// The remote store accepted the mutation. For creates, `server_id` is
    /// the id assigned by the store and `result` includes it.
    Succeeded {
        result: RecordPayload,
        server_id: Option<EntityId>,
    },
    /// Every attempt failed; the optimistic value is no longer overlaid.
    Failed { error: String, attempts: u32 },
    /// Removed by `cancel_update`/`clear_all`; nothing was reported upstream.
    Cancelled,
    /// A newer intent for the same id replaced this one; its result is dropped.
    Superseded,
}

impl MutationOutcome {
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            MutationOutcome::Succeeded { .. } | MutationOutcome::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationEvent {
    Applied {
        key: PendingKey,
        action: MutationAction,
    },
    RetryScheduled {
        key: PendingKey,
        action: MutationAction,
        retry_count: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
        error: String,
    },
    Settled {
        key: PendingKey,
        action: MutationAction,
        outcome: MutationOutcome,
    },
}

impl MutationEvent {
    pub fn key(&self) -> &PendingKey {
        match self {
            MutationEvent::Applied { key, .. }
            | MutationEvent::RetryScheduled { key, .. }
            | MutationEvent::Settled { key, .. } => key,
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
