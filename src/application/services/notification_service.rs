use crate::domain::entities::{
    ConnectionState, MutationAction, MutationEvent, MutationOutcome, NotificationCategory,
    NotificationLevel, NotificationRecord,
};
use crate::domain::value_objects::EntityKind;
use crate::shared::config::NotificationConfig;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const FEED_CHANNEL_CAPACITY: usize = 64;

/// Bounded, newest-first feed of user-facing notifications projected from
/// mutation outcomes and connection changes. Nothing is persisted.
pub struct NotificationService {
    capacity: usize,
    records: Mutex<VecDeque<NotificationRecord>>,
    feed: broadcast::Sender<NotificationRecord>,
}

impl NotificationService {
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_CHANNEL_CAPACITY);
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
            feed,
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(config.capacity)
    }

    /// Newly added records, for UIs that toast them.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationRecord> {
        self.feed.subscribe()
    }

    pub fn push(&self, record: NotificationRecord) {
        {
            let mut records = self.lock_records();
            records.push_front(record.clone());
            records.truncate(self.capacity);
        }
        debug!(
            target: "notifications",
            category = ?record.category,
            level = ?record.level,
            title = %record.title,
            "notification recorded"
        );
        let _ = self.feed.send(record);
    }

    /// Records succeeded and failed mutations; every other event is ignored.
    pub fn record_mutation(&self, event: &MutationEvent) -> Option<NotificationRecord> {
        let MutationEvent::Settled {
            key,
            action,
            outcome,
        } = event
        else {
            return None;
        };

        let kind = EntityKind::from_collection(&key.collection);
        let category = kind
            .map(NotificationCategory::from)
            .unwrap_or(NotificationCategory::System);
        let label = kind.map(|kind| kind.label()).unwrap_or("Record");

        let record = match outcome {
            MutationOutcome::Succeeded { server_id, .. } => {
                let id = server_id.as_ref().unwrap_or(&key.id);
                NotificationRecord::new(
                    category,
                    NotificationLevel::Success,
                    format!("{label} {}", past_tense(*action)),
                    format!("{label} {id} was {} successfully.", past_tense(*action)),
                )
            }
            MutationOutcome::Failed { error, attempts } => NotificationRecord::new(
                category,
                NotificationLevel::Error,
                format!("{label} sync failed"),
                format!(
                    "Could not {action} {} {} after {attempts} attempts: {error}",
                    label.to_lowercase(),
                    key.id
                ),
            ),
            MutationOutcome::Cancelled | MutationOutcome::Superseded => return None,
        };

        self.push(record.clone());
        Some(record)
    }

    /// The first connect after a stop is not announced, and neither is a stop.
    pub fn record_connection_change(
        &self,
        previous: ConnectionState,
        current: ConnectionState,
    ) -> Option<NotificationRecord> {
        let (level, title, message) = match (previous, current) {
            (from, to) if from == to => return None,
            (ConnectionState::Disconnected, ConnectionState::Connected) => return None,
            (_, ConnectionState::Disconnected) => return None,
            (_, ConnectionState::Connected) => (
                NotificationLevel::Success,
                "Connection restored",
                "Live updates are flowing again.",
            ),
            (_, ConnectionState::Reconnecting) => (
                NotificationLevel::Warning,
                "Connection lost",
                "Trying to reconnect. Changes you make are kept and will sync.",
            ),
            (_, ConnectionState::Error) => (
                NotificationLevel::Error,
                "Connection error",
                "Could not reach the server. Data shown may be out of date.",
            ),
        };

        let record = NotificationRecord::new(NotificationCategory::System, level, title, message);
        self.push(record.clone());
        Some(record)
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.lock_records().iter().cloned().collect()
    }

    pub fn unread_count(&self) -> usize {
        self.lock_records().iter().filter(|record| !record.read).count()
    }

    pub fn mark_read(&self, id: &str) -> bool {
        match self
            .lock_records()
            .iter_mut()
            .find(|record| record.id == id)
        {
            Some(record) => {
                record.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&self) -> usize {
        let mut marked = 0;
        for record in self.lock_records().iter_mut().filter(|record| !record.read) {
            record.read = true;
            marked += 1;
        }
        marked
    }

    pub fn clear(&self) {
        self.lock_records().clear();
    }

    pub fn spawn_mutation_listener(
        self: &Arc<Self>,
        mut outcomes: mpsc::UnboundedReceiver<MutationEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = outcomes.recv() => event,
                };
                let Some(event) = event else {
                    debug!(target: "notifications", "mutation outcome channel closed");
                    break;
                };
                service.record_mutation(&event);
            }
        })
    }

    pub fn spawn_connection_listener(
        self: &Arc<Self>,
        mut status: watch::Receiver<ConnectionState>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut previous = *status.borrow_and_update();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let current = *status.borrow_and_update();
                service.record_connection_change(previous, current);
                previous = current;
            }
        })
    }

    fn lock_records(&self) -> MutexGuard<'_, VecDeque<NotificationRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn past_tense(action: MutationAction) -> &'static str {
    match action {
        MutationAction::Create => "created",
        MutationAction::Update => "updated",
        MutationAction::Delete => "deleted",
    }
}
