pub mod connection;
pub mod mutation_event;
pub mod notification;
pub mod pending_mutation;
pub mod records;

pub use connection::ConnectionState;
pub use mutation_event::{MutationEvent, MutationOutcome};
pub use notification::{NotificationCategory, NotificationLevel, NotificationRecord};
pub use pending_mutation::{MutationAction, MutationPhase, PendingKey, PendingMutation};
pub use records::{
    Entity, Meeting, MeetingStatus, Payment, PaymentStatus, Reservation, ReservationStatus,
};
