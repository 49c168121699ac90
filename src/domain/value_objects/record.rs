use super::entity_id::EntityId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object carried through the layer untouched. Used both for full
/// records and for partial patches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordPayload(Map<String, Value>);

impl RecordPayload {
    pub fn new(value: Value) -> Result<Self, String> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Err("Record payload cannot be null".to_string()),
            other => Err(format!(
                "Record payload must be a JSON object, got {}",
                json_type_name(&other)
            )),
        }
    }

    pub fn empty() -> Self {
        Self(Map::new())
    }

    pub fn from_json_str(json: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| format!("Invalid JSON payload: {e}"))?;
        Self::new(value)
    }

    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, String> {
        let value = serde_json::to_value(value).map_err(|e| e.to_string())?;
        Self::new(value)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains_key(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shallow merge: every field of `patch` overwrites the field in `self`.
    pub fn overlay(&self, patch: &RecordPayload) -> RecordPayload {
        let mut merged = self.0.clone();
        for (field, value) in &patch.0 {
            merged.insert(field.clone(), value.clone());
        }
        RecordPayload(merged)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|e| e.to_string())
    }
}

impl From<Map<String, Value>> for RecordPayload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<RecordPayload> for Value {
    fn from(payload: RecordPayload) -> Self {
        payload.into_value()
    }
}

/// A record as delivered by the authoritative store: `{id, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: EntityId,
    pub data: RecordPayload,
}

impl Document {
    pub fn new(id: EntityId, data: RecordPayload) -> Self {
        Self { id, data }
    }

    /// The flattened record with `id` written into the field set.
    pub fn to_record(&self) -> RecordPayload {
        let mut record = self.data.clone();
        record.insert("id", Value::String(self.id.to_string()));
        record
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, String> {
        self.to_record().decode()
    }
}

/// Single-document snapshot; `data` is `None` when the document does not exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: EntityId,
    pub data: Option<RecordPayload>,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
