use crate::application::ports::{
    CollectionEvent, CollectionSubscription, DocumentEvent, DocumentSubscription, SnapshotEvent,
    Subscription, SubscriptionSender,
};
use crate::domain::value_objects::{
    CollectionName, Document, DocumentSnapshot, EntityId, QueryFilters,
};
use std::sync::{Mutex, MutexGuard, PoisonError};

struct CollectionSubscriber {
    collection: CollectionName,
    filters: QueryFilters,
    sender: SubscriptionSender<CollectionEvent>,
}

struct DocumentSubscriber {
    collection: CollectionName,
    id: EntityId,
    sender: SubscriptionSender<DocumentEvent>,
}

/// Live subscribers of a store. Closed subscriptions are pruned on the next
/// publish.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    collections: Mutex<Vec<CollectionSubscriber>>,
    documents: Mutex<Vec<DocumentSubscriber>>,
}

impl SubscriberRegistry {
    /// Opens a collection feed whose first event is `current`.
    pub fn open_collection(
        &self,
        collection: &CollectionName,
        filters: &QueryFilters,
        current: Vec<Document>,
    ) -> CollectionSubscription {
        let (sender, subscription) = Subscription::channel();
        sender.send(SnapshotEvent::Snapshot(filters.apply(current)));
        lock(&self.collections).push(CollectionSubscriber {
            collection: collection.clone(),
            filters: filters.clone(),
            sender,
        });
        subscription
    }

    pub fn open_document(
        &self,
        collection: &CollectionName,
        current: DocumentSnapshot,
    ) -> DocumentSubscription {
        let (sender, subscription) = Subscription::channel();
        let id = current.id.clone();
        sender.send(SnapshotEvent::Snapshot(current));
        lock(&self.documents).push(DocumentSubscriber {
            collection: collection.clone(),
            id,
            sender,
        });
        subscription
    }

    pub fn publish_collection(&self, collection: &CollectionName, documents: &[Document]) {
        lock(&self.collections).retain(|subscriber| {
            if subscriber.sender.is_closed() {
                return false;
            }
            if &subscriber.collection != collection {
                return true;
            }
            subscriber.sender.send(SnapshotEvent::Snapshot(
                subscriber.filters.apply(documents.to_vec()),
            ))
        });
    }

    pub fn publish_document(&self, collection: &CollectionName, snapshot: &DocumentSnapshot) {
        lock(&self.documents).retain(|subscriber| {
            if subscriber.sender.is_closed() {
                return false;
            }
            if &subscriber.collection != collection || subscriber.id != snapshot.id {
                return true;
            }
            subscriber
                .sender
                .send(SnapshotEvent::Snapshot(snapshot.clone()))
        });
    }

    /// Delivers `message` as an error to every subscriber and ends their feeds.
    pub fn fail_all(&self, message: &str) -> usize {
        let collections: Vec<CollectionSubscriber> = lock(&self.collections).drain(..).collect();
        let documents: Vec<DocumentSubscriber> = lock(&self.documents).drain(..).collect();
        let count = collections.len() + documents.len();

        for subscriber in collections {
            subscriber
                .sender
                .send(SnapshotEvent::Error(message.to_string()));
        }
        for subscriber in documents {
            subscriber
                .sender
                .send(SnapshotEvent::Error(message.to_string()));
        }
        count
    }

    pub fn subscriber_count(&self) -> usize {
        let collections = lock(&self.collections)
            .iter()
            .filter(|subscriber| !subscriber.sender.is_closed())
            .count();
        let documents = lock(&self.documents)
            .iter()
            .filter(|subscriber| !subscriber.sender.is_closed())
            .count();
        collections + documents
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
