use crate::domain::value_objects::{
    CollectionName, Document, DocumentSnapshot, EntityId, QueryFilters,
};
use crate::shared::AppError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEvent<S> {
    Snapshot(S),
    Error(String),
}

pub type CollectionEvent = SnapshotEvent<Vec<Document>>;
pub type DocumentEvent = SnapshotEvent<DocumentSnapshot>;

/// Receiving end of a live feed. Dropping it unsubscribes.
pub struct Subscription<E> {
    events: mpsc::UnboundedReceiver<E>,
    token: CancellationToken,
}

/// Producer half handed to the store that feeds a subscription.
pub struct SubscriptionSender<E> {
    tx: mpsc::UnboundedSender<E>,
    token: CancellationToken,
}

impl<E> Clone for SubscriptionSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            token: self.token.clone(),
        }
    }
}

pub type CollectionSubscription = Subscription<CollectionEvent>;
pub type DocumentSubscription = Subscription<DocumentEvent>;

impl<E> Subscription<E> {
    pub fn channel() -> (SubscriptionSender<E>, Subscription<E>) {
        let (tx, events) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        (
            SubscriptionSender {
                tx,
                token: token.clone(),
            },
            Subscription { events, token },
        )
    }

    /// Next event, or `None` once unsubscribed or the producer went away.
    pub async fn next(&mut self) -> Option<E> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Idempotent.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl<E> SubscriptionSender<E> {
    /// Returns `false` when the subscriber is gone and the sender can be pruned.
    pub fn send(&self, event: E) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }

    /// Ends the feed from the producer side.
    pub fn close(&self) {
        self.token.cancel();
    }
}

/// Live snapshot feed of the authoritative store. Each subscription yields the
/// full current result set first and again after every change.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn subscribe(
        &self,
        collection: &CollectionName,
        filters: &QueryFilters,
    ) -> Result<CollectionSubscription, AppError>;

    async fn subscribe_document(
        &self,
        collection: &CollectionName,
        id: &EntityId,
    ) -> Result<DocumentSubscription, AppError>;
}
