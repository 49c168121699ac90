use crate::domain::value_objects::{CollectionName, EntityId, RecordPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a pending mutation in the session-wide arena.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingKey {
    pub collection: CollectionName,
    pub id: EntityId,
}

impl PendingKey {
    pub fn new(collection: CollectionName, id: EntityId) -> Self {
        Self { collection, id }
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Where a live mutation currently sits in its lifecycle. Terminal states are
/// reported through `MutationOutcome` and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationPhase {
    InFlight,
    AwaitingRetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: EntityId,
    pub collection: CollectionName,
    pub action: MutationAction,
    pub payload: RecordPayload,
    pub queued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub original_snapshot: Option<RecordPayload>,
    pub phase: MutationPhase,
}

impl PendingMutation {
    pub fn new(
        key: PendingKey,
        action: MutationAction,
        payload: RecordPayload,
        original_snapshot: Option<RecordPayload>,
    ) -> Self {
        Self {
            id: key.id,
            collection: key.collection,
            action,
            payload,
            queued_at: Utc::now(),
            retry_count: 0,
            original_snapshot,
            phase: MutationPhase::InFlight,
        }
    }

    /// Total remote attempts started so far, including the first one.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }
}
