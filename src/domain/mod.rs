pub mod entities;
pub mod value_objects;

pub use entities::{
    ConnectionState, Entity, Meeting, MutationAction, MutationEvent, MutationOutcome,
    NotificationRecord, Payment, PendingKey, PendingMutation, Reservation,
};
pub use value_objects::{
    CollectionName, Document, DocumentSnapshot, EntityId, EntityKind, QueryFilters, RecordPayload,
};
