mod fanout;
pub mod memory_store;
pub mod sqlite_store;

pub use memory_store::MemoryDocumentStore;
pub use sqlite_store::SqliteDocumentStore;

use crate::domain::value_objects::RecordPayload;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

pub(crate) const CREATED_AT_FIELD: &str = "createdAt";
pub(crate) const UPDATED_AT_FIELD: &str = "updatedAt";

pub(crate) fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Body of a newly created document: the client payload without any `id`
/// field, stamped with server timestamps.
pub(crate) fn stamp_created(payload: RecordPayload, at: DateTime<Utc>) -> RecordPayload {
    let mut data = payload;
    data.remove("id");
    data.insert(CREATED_AT_FIELD, timestamp_value(at));
    data.insert(UPDATED_AT_FIELD, timestamp_value(at));
    data
}

/// Shallow-merges `patch` into `current`; `id` and `createdAt` are store-owned.
pub(crate) fn stamp_updated(
    current: &RecordPayload,
    patch: &RecordPayload,
    at: DateTime<Utc>,
) -> RecordPayload {
    let mut patch = patch.clone();
    patch.remove("id");
    patch.remove(CREATED_AT_FIELD);
    let mut data = current.overlay(&patch);
    data.insert(UPDATED_AT_FIELD, timestamp_value(at));
    data
}
