use crate::domain::entities::ConnectionState;
use crate::domain::value_objects::CollectionName;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// Session-wide connection status folded from every feed; the worst state wins.
pub struct ConnectionBoard {
    feeds: Mutex<HashMap<CollectionName, ConnectionState>>,
    combined: watch::Sender<ConnectionState>,
}

impl ConnectionBoard {
    pub fn new() -> Self {
        let (combined, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            feeds: Mutex::new(HashMap::new()),
            combined,
        }
    }

    pub fn register(&self, collection: CollectionName) {
        self.update(collection, ConnectionState::Disconnected);
    }

    pub fn update(&self, collection: CollectionName, state: ConnectionState) {
        let combined = {
            let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
            feeds.insert(collection, state);
            fold(feeds.values().copied())
        };
        self.combined.send_if_modified(|current| {
            if *current == combined {
                false
            } else {
                *current = combined;
                true
            }
        });
    }

    pub fn status(&self) -> ConnectionState {
        *self.combined.borrow()
    }

    pub fn feed_status(&self, collection: &CollectionName) -> Option<ConnectionState> {
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .copied()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.combined.subscribe()
    }
}

impl Default for ConnectionBoard {
    fn default() -> Self {
        Self::new()
    }
}

fn fold(states: impl Iterator<Item = ConnectionState>) -> ConnectionState {
    states
        .max_by_key(ConnectionState::severity)
        .unwrap_or(ConnectionState::Disconnected)
}
