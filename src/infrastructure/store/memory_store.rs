use super::fanout::SubscriberRegistry;
use super::{stamp_created, stamp_updated};
use crate::application::ports::{
    CollectionSubscription, ConnectivityProbe, DocumentSubscription, RemoteMutator, SnapshotSource,
};
use crate::domain::value_objects::{
    CollectionName, Document, DocumentSnapshot, EntityId, QueryFilters, RecordPayload,
};
use crate::shared::AppError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

struct StoredDocument {
    seq: u64,
    data: RecordPayload,
}

#[derive(Default)]
struct Collections {
    by_name: HashMap<CollectionName, HashMap<EntityId, StoredDocument>>,
}

impl Collections {
    /// Documents of a collection in insertion order.
    fn documents(&self, collection: &CollectionName) -> Vec<Document> {
        let Some(documents) = self.by_name.get(collection) else {
            return Vec::new();
        };
        let mut ordered: Vec<(&EntityId, &StoredDocument)> = documents.iter().collect();
        ordered.sort_by_key(|(_, stored)| stored.seq);
        ordered
            .into_iter()
            .map(|(id, stored)| Document::new(id.clone(), stored.data.clone()))
            .collect()
    }

    fn snapshot(&self, collection: &CollectionName, id: &EntityId) -> DocumentSnapshot {
        DocumentSnapshot {
            id: id.clone(),
            data: self
                .by_name
                .get(collection)
                .and_then(|documents| documents.get(id))
                .map(|stored| stored.data.clone()),
        }
    }
}

/// Authoritative store held in memory. Implements every port so a session can
/// run without a backend; `set_online(false)` and `fail_subscriptions` let
/// tests and demos drive the failure paths.
pub struct MemoryDocumentStore {
    collections: RwLock<Collections>,
    subscribers: SubscriberRegistry,
    online: AtomicBool,
    next_seq: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(Collections::default()),
            subscribers: SubscriberRegistry::default(),
            online: AtomicBool::new(true),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            info!(target: "store::memory", online, "store availability changed");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Errors every live subscription, as a dropped connection would.
    pub fn fail_subscriptions(&self, message: &str) -> usize {
        let failed = self.subscribers.fail_all(message);
        debug!(target: "store::memory", failed, message, "subscriptions failed");
        failed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.subscriber_count()
    }

    /// Writes a document directly, bypassing the availability switch, as
    /// another client would. Fields are replaced wholesale.
    pub fn put(&self, collection: &CollectionName, id: EntityId, data: RecordPayload) {
        let now = Utc::now();
        let mut collections = self.write();
        let documents = collections.by_name.entry(collection.clone()).or_default();
        let seq = match documents.get(&id) {
            Some(existing) => existing.seq,
            None => self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        let data = stamp_created(data, now);
        documents.insert(id.clone(), StoredDocument { seq, data });
        self.publish(&collections, collection, &id);
    }

    pub fn document(&self, collection: &CollectionName, id: &EntityId) -> Option<Document> {
        self.read()
            .snapshot(collection, id)
            .data
            .map(|data| Document::new(id.clone(), data))
    }

    pub fn documents(&self, collection: &CollectionName) -> Vec<Document> {
        self.read().documents(collection)
    }

    fn ensure_online(&self) -> Result<(), AppError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(AppError::Network("document store is unreachable".to_string()))
        }
    }

    // Called with the write lock held so subscribers see writes in order.
    fn publish(&self, collections: &Collections, collection: &CollectionName, id: &EntityId) {
        self.subscribers
            .publish_collection(collection, &collections.documents(collection));
        self.subscribers
            .publish_document(collection, &collections.snapshot(collection, id));
    }

    fn read(&self) -> RwLockReadGuard<'_, Collections> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Collections> {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteMutator for MemoryDocumentStore {
    async fn create(
        &self,
        collection: &CollectionName,
        payload: RecordPayload,
    ) -> Result<Document, AppError> {
        self.ensure_online()?;
        let id = EntityId::generate();
        let data = stamp_created(payload, Utc::now());

        let mut collections = self.write();
        collections
            .by_name
            .entry(collection.clone())
            .or_default()
            .insert(
                id.clone(),
                StoredDocument {
                    seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                    data: data.clone(),
                },
            );
        self.publish(&collections, collection, &id);
        debug!(target: "store::memory", collection = %collection, id = %id, "document created");

        Ok(Document::new(id, data))
    }

    async fn update(
        &self,
        collection: &CollectionName,
        id: &EntityId,
        payload: RecordPayload,
    ) -> Result<(), AppError> {
        self.ensure_online()?;
        let mut collections = self.write();
        let stored = collections
            .by_name
            .get_mut(collection)
            .and_then(|documents| documents.get_mut(id))
            .ok_or_else(|| AppError::NotFound(format!("{collection}/{id}")))?;
        stored.data = stamp_updated(&stored.data, &payload, Utc::now());
        self.publish(&collections, collection, id);
        debug!(target: "store::memory", collection = %collection, id = %id, "document updated");
        Ok(())
    }

    async fn delete(&self, collection: &CollectionName, id: &EntityId) -> Result<(), AppError> {
        self.ensure_online()?;
        let mut collections = self.write();
        let removed = collections
            .by_name
            .get_mut(collection)
            .and_then(|documents| documents.remove(id))
            .is_some();
        if removed {
            self.publish(&collections, collection, id);
            debug!(target: "store::memory", collection = %collection, id = %id, "document deleted");
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for MemoryDocumentStore {
    async fn subscribe(
        &self,
        collection: &CollectionName,
        filters: &QueryFilters,
    ) -> Result<CollectionSubscription, AppError> {
        self.ensure_online()?;
        // Hold the lock so no write slips between the first snapshot and registration.
        let collections = self.read();
        Ok(self
            .subscribers
            .open_collection(collection, filters, collections.documents(collection)))
    }

    async fn subscribe_document(
        &self,
        collection: &CollectionName,
        id: &EntityId,
    ) -> Result<DocumentSubscription, AppError> {
        self.ensure_online()?;
        let collections = self.read();
        Ok(self
            .subscribers
            .open_document(collection, collections.snapshot(collection, id)))
    }
}

#[async_trait]
impl ConnectivityProbe for MemoryDocumentStore {
    async fn probe(&self) -> Result<(), AppError> {
        self.ensure_online()
    }
}
