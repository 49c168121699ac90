pub mod connectivity_probe;
pub mod remote_mutator;
pub mod snapshot_source;

pub use connectivity_probe::ConnectivityProbe;
pub use remote_mutator::RemoteMutator;
pub use snapshot_source::{
    CollectionEvent, CollectionSubscription, DocumentEvent, DocumentSubscription, SnapshotEvent,
    SnapshotSource, Subscription, SubscriptionSender,
};
