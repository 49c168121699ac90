#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use condo_realtime::domain::entities::{ConnectionState, NotificationRecord};
use condo_realtime::domain::value_objects::{CollectionName, EntityId, RecordPayload};
use condo_realtime::{AppConfig, AppState, MemoryDocumentStore};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

pub const WAIT: Duration = Duration::from_secs(600);

pub struct SessionContext {
    pub state: AppState,
    pub store: Arc<MemoryDocumentStore>,
}

pub fn setup_session() -> SessionContext {
    setup_session_with(AppConfig::default())
}

pub fn setup_session_with(config: AppConfig) -> SessionContext {
    let (state, store) = AppState::in_memory(config);
    SessionContext { state, store }
}

pub fn id(value: &str) -> EntityId {
    EntityId::new(value.into()).expect("entity id")
}

pub fn collection(name: &str) -> CollectionName {
    CollectionName::new(name.into()).expect("collection name")
}

pub fn payload(value: Value) -> RecordPayload {
    RecordPayload::new(value).expect("object payload")
}

pub async fn wait_for_status(
    status: &mut watch::Receiver<ConnectionState>,
    expected: ConnectionState,
) {
    tokio::time::timeout(WAIT, status.wait_for(|current| *current == expected))
        .await
        .expect("timed out waiting for connection status")
        .expect("connection board dropped");
}

pub async fn next_notification(
    feed: &mut broadcast::Receiver<NotificationRecord>,
) -> NotificationRecord {
    tokio::time::timeout(WAIT, feed.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification feed closed")
}
