mod common;

use common::{WAIT, collection, next_notification, payload, wait_for_status};
use condo_realtime::domain::entities::{ConnectionState, MutationEvent, MutationOutcome};
use condo_realtime::shared::config::DatabaseConfig;
use condo_realtime::{AppConfig, SqliteDocumentStore};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn created_meeting_survives_a_restart() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("state").join("condo.db");
    let mut config = AppConfig::default();
    config.database = DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", db_path.display()),
        max_connections: 1,
    };

    let state = condo_realtime::run(config.clone()).await.expect("session");
    let mut status = state.connection.subscribe();
    wait_for_status(&mut status, ConnectionState::Connected).await;

    let mut events = state.mutations.subscribe();
    let mut feed = state.notifications.subscribe();
    let temp_id = state
        .meetings
        .create(payload(json!({"title": "Budget review", "agenda": ["fees"]})));
    assert!(state.meetings.is_pending(&temp_id));
    assert_eq!(state.meetings.view().data[0].title, "Budget review");

    let server_id = loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("mutation settles")
            .expect("event channel open");
        if let MutationEvent::Settled { outcome, .. } = event {
            match outcome {
                MutationOutcome::Succeeded { server_id, .. } => {
                    break server_id.expect("server assigned id");
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    };

    let mut views = state.meetings.subscribe_view();
    tokio::time::timeout(
        WAIT,
        views.wait_for(|view| {
            view.data.len() == 1 && view.data[0].id == server_id.as_str()
        }),
    )
    .await
    .expect("server record reaches the feed")
    .expect("view channel open");
    assert_eq!(next_notification(&mut feed).await.title, "Meeting created");

    state.shutdown().await;
    assert!(db_path.exists());

    let reopened = SqliteDocumentStore::connect(&config.database)
        .await
        .expect("reopen store");
    let documents = reopened.documents(&collection("meetings")).await.expect("documents");
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].id, server_id);
    assert_eq!(documents[0].data.get("agenda"), Some(&json!(["fees"])));
    reopened.close().await;
}
