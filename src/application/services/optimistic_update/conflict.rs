use crate::domain::value_objects::{CollectionName, EntityId, RecordPayload};
use crate::shared::ConflictStrategy;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const TIMESTAMP_FIELDS: [&str; 2] = ["updatedAt", "updated_at"];

/// Caller-supplied resolution rule.
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        id: &EntityId,
        server: &RecordPayload,
        client: &RecordPayload,
    ) -> RecordPayload;
}

impl<F> ConflictResolver for F
where
    F: Fn(&EntityId, &RecordPayload, &RecordPayload) -> RecordPayload + Send + Sync,
{
    fn resolve(
        &self,
        id: &EntityId,
        server: &RecordPayload,
        client: &RecordPayload,
    ) -> RecordPayload {
        self(id, server, client)
    }
}

#[derive(Clone, Default)]
pub enum ConflictPolicy {
    #[default]
    ServerWins,
    ClientWins,
    Merge,
    Custom(Arc<dyn ConflictResolver>),
}

impl fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::ServerWins => f.write_str("ServerWins"),
            ConflictPolicy::ClientWins => f.write_str("ClientWins"),
            ConflictPolicy::Merge => f.write_str("Merge"),
            ConflictPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<ConflictStrategy> for ConflictPolicy {
    fn from(strategy: ConflictStrategy) -> Self {
        match strategy {
            ConflictStrategy::ServerWins => ConflictPolicy::ServerWins,
            ConflictStrategy::ClientWins => ConflictPolicy::ClientWins,
            ConflictStrategy::Merge => ConflictPolicy::Merge,
        }
    }
}

impl ConflictPolicy {
    pub fn custom<R: ConflictResolver + 'static>(resolver: R) -> Self {
        ConflictPolicy::Custom(Arc::new(resolver))
    }

    pub fn resolve(
        &self,
        id: &EntityId,
        server: &RecordPayload,
        client: &RecordPayload,
    ) -> RecordPayload {
        match self {
            ConflictPolicy::ServerWins => server.clone(),
            ConflictPolicy::ClientWins => server.overlay(client),
            ConflictPolicy::Merge => merge_by_timestamp(server, client),
            ConflictPolicy::Custom(resolver) => resolver.resolve(id, server, client),
        }
    }
}

/// Default policy plus per-collection overrides.
#[derive(Debug, Clone, Default)]
pub struct ConflictPolicies {
    default: ConflictPolicy,
    overrides: HashMap<CollectionName, ConflictPolicy>,
}

impl ConflictPolicies {
    pub fn new(default: ConflictPolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn set_default(&mut self, policy: ConflictPolicy) {
        self.default = policy;
    }

    pub fn set_override(&mut self, collection: CollectionName, policy: ConflictPolicy) {
        self.overrides.insert(collection, policy);
    }

    pub fn policy_for(&self, collection: &CollectionName) -> &ConflictPolicy {
        self.overrides.get(collection).unwrap_or(&self.default)
    }
}

/// Client fields win unless both sides carry a comparable `updatedAt` and the
/// server's is strictly newer; then fields present on the server keep the
/// server value. Client-only fields are always applied.
fn merge_by_timestamp(server: &RecordPayload, client: &RecordPayload) -> RecordPayload {
    let server_newer = match (record_timestamp(server), record_timestamp(client)) {
        (Some(server_ts), Some(client_ts)) => server_ts > client_ts,
        _ => false,
    };

    let mut merged = server.clone();
    for (field, value) in client.iter() {
        if server_newer && server.contains_key(field) {
            continue;
        }
        merged.insert(field.clone(), value.clone());
    }
    merged
}

fn record_timestamp(record: &RecordPayload) -> Option<DateTime<Utc>> {
    TIMESTAMP_FIELDS
        .iter()
        .find_map(|field| record.get(field).and_then(parse_timestamp))
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        // epoch milliseconds
        Value::Number(number) => number
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
