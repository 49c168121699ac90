use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionName(String);

impl CollectionName {
    pub fn new(value: String) -> Result<Self, String> {
        Self::validate(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(value: &str) -> Result<(), String> {
        if value.trim().is_empty() {
            return Err("collection name must not be blank".to_string());
        }
        if value.contains('/') {
            return Err(format!("Collection name must not contain '/': {value}"));
        }
        Ok(())
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<CollectionName> for String {
    fn from(value: CollectionName) -> Self {
        value.0
    }
}

impl TryFrom<String> for CollectionName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// The entity kinds that get their own realtime feed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Payment,
    Reservation,
    Meeting,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Payment,
        EntityKind::Reservation,
        EntityKind::Meeting,
    ];

    pub fn collection_str(&self) -> &'static str {
        match self {
            EntityKind::Payment => "payments",
            EntityKind::Reservation => "reservations",
            EntityKind::Meeting => "meetings",
        }
    }

    pub fn collection(&self) -> CollectionName {
        CollectionName(self.collection_str().to_string())
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Payment => "Payment",
            EntityKind::Reservation => "Reservation",
            EntityKind::Meeting => "Meeting",
        }
    }

    pub fn from_collection(collection: &CollectionName) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.collection_str() == collection.as_str())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
