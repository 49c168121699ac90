pub mod collection;
pub mod entity_id;
pub mod query;
pub mod record;

pub use collection::{CollectionName, EntityKind};
pub use entity_id::EntityId;
pub use query::{FieldFilter, OrderBy, QueryFilters, SortDirection};
pub use record::{Document, DocumentSnapshot, RecordPayload};
