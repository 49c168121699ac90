use super::fanout::SubscriberRegistry;
use super::{stamp_created, stamp_updated};
use crate::application::ports::{
    CollectionSubscription, ConnectivityProbe, DocumentSubscription, RemoteMutator, SnapshotSource,
};
use crate::domain::value_objects::{
    CollectionName, Document, DocumentSnapshot, EntityId, QueryFilters, RecordPayload,
};
use crate::shared::AppError;
use crate::shared::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, SqlitePool};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const INSERT_DOCUMENT: &str = r#"
    INSERT INTO documents (collection, id, data, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5)
"#;

const UPDATE_DOCUMENT: &str = r#"
    UPDATE documents
    SET data = ?3, updated_at = ?4
    WHERE collection = ?1 AND id = ?2
"#;

const DELETE_DOCUMENT: &str = r#"
    DELETE FROM documents
    WHERE collection = ?1 AND id = ?2
"#;

const SELECT_DOCUMENT: &str = r#"
    SELECT id, data
    FROM documents
    WHERE collection = ?1 AND id = ?2
"#;

const SELECT_COLLECTION: &str = r#"
    SELECT id, data
    FROM documents
    WHERE collection = ?1
    ORDER BY created_at ASC, rowid ASC
"#;

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: String,
    data: String,
}

impl DocumentRow {
    fn into_domain(self) -> Result<Document, AppError> {
        let id = EntityId::new(self.id)
            .map_err(|err| AppError::DeserializationError(format!("Invalid document id: {err}")))?;
        let data = RecordPayload::from_json_str(&self.data)
            .map_err(AppError::DeserializationError)?;
        Ok(Document::new(id, data))
    }
}

/// Authoritative store backed by SQLite. Writes are serialized so every
/// subscriber observes snapshots in commit order.
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    subscribers: SubscriberRegistry,
    write_gate: Mutex<()>,
}

impl SqliteDocumentStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        if let Some(path) = database_file_path(&config.url)
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| {
                AppError::Storage(format!("Failed to create {}: {err}", parent.display()))
            })?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.url)
            .await?;
        info!(target: "store::sqlite", url = %config.url, "database connected");

        Self::from_pool(pool).await
    }

    /// Runs pending migrations on `pool` and wraps it.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, AppError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!(target: "store::sqlite", "database migrations completed");

        Ok(Self {
            pool,
            subscribers: SubscriberRegistry::default(),
            write_gate: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.subscribers.fail_all("document store closed");
        self.pool.close().await;
    }

    /// Decodable documents of `collection`, oldest first. Rows that fail to
    /// decode are skipped so one bad record cannot blank the whole feed.
    pub async fn documents(&self, collection: &CollectionName) -> Result<Vec<Document>, AppError> {
        let rows = sqlx::query_as::<_, DocumentRow>(SELECT_COLLECTION)
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.into_domain() {
                Ok(document) => documents.push(document),
                Err(err) => warn!(
                    target: "store::sqlite",
                    collection = %collection,
                    id = %id,
                    error = %err,
                    "skipping undecodable document"
                ),
            }
        }
        Ok(documents)
    }

    pub async fn document(
        &self,
        collection: &CollectionName,
        id: &EntityId,
    ) -> Result<Option<Document>, AppError> {
        let row = sqlx::query_as::<_, DocumentRow>(SELECT_DOCUMENT)
            .bind(collection.as_str())
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(DocumentRow::into_domain).transpose()
    }

    async fn snapshot(
        &self,
        collection: &CollectionName,
        id: &EntityId,
    ) -> Result<DocumentSnapshot, AppError> {
        Ok(DocumentSnapshot {
            id: id.clone(),
            data: self.document(collection, id).await?.map(|doc| doc.data),
        })
    }

    // Caller holds the write gate.
    async fn publish(&self, collection: &CollectionName, id: &EntityId) -> Result<(), AppError> {
        let documents = self.documents(collection).await?;
        self.subscribers.publish_collection(collection, &documents);
        let snapshot = self.snapshot(collection, id).await?;
        self.subscribers.publish_document(collection, &snapshot);
        Ok(())
    }

    /// Fans out after a committed write. The write already happened, so a
    /// failure here is logged rather than returned to the mutator.
    async fn publish_committed(&self, collection: &CollectionName, id: &EntityId) {
        if let Err(err) = self.publish(collection, id).await {
            warn!(
                target: "store::sqlite",
                collection = %collection,
                id = %id,
                error = %err,
                "failed to publish committed write"
            );
        }
    }
}

#[async_trait]
impl RemoteMutator for SqliteDocumentStore {
    async fn create(
        &self,
        collection: &CollectionName,
        payload: RecordPayload,
    ) -> Result<Document, AppError> {
        let now = Utc::now();
        let id = EntityId::generate();
        let data = stamp_created(payload, now);
        let encoded = serde_json::to_string(&data)?;

        let _gate = self.write_gate.lock().await;
        sqlx::query(INSERT_DOCUMENT)
            .bind(collection.as_str())
            .bind(id.as_str())
            .bind(encoded)
            .bind(now.timestamp_millis())
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        debug!(target: "store::sqlite", collection = %collection, id = %id, "document created");
        self.publish_committed(collection, &id).await;

        Ok(Document::new(id, data))
    }

    async fn update(
        &self,
        collection: &CollectionName,
        id: &EntityId,
        payload: RecordPayload,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let _gate = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DocumentRow>(SELECT_DOCUMENT)
            .bind(collection.as_str())
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(current) = row else {
            return Err(AppError::NotFound(format!("{collection}/{id}")));
        };
        let current = current.into_domain()?;
        let data = stamp_updated(&current.data, &payload, now);

        sqlx::query(UPDATE_DOCUMENT)
            .bind(collection.as_str())
            .bind(id.as_str())
            .bind(serde_json::to_string(&data)?)
            .bind(now.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(target: "store::sqlite", collection = %collection, id = %id, "document updated");

        self.publish_committed(collection, id).await;
        Ok(())
    }

    async fn delete(&self, collection: &CollectionName, id: &EntityId) -> Result<(), AppError> {
        let _gate = self.write_gate.lock().await;
        let result = sqlx::query(DELETE_DOCUMENT)
            .bind(collection.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            debug!(target: "store::sqlite", collection = %collection, id = %id, "document deleted");
            self.publish_committed(collection, id).await;
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for SqliteDocumentStore {
    async fn subscribe(
        &self,
        collection: &CollectionName,
        filters: &QueryFilters,
    ) -> Result<CollectionSubscription, AppError> {
        let _gate = self.write_gate.lock().await;
        let current = self.documents(collection).await?;
        Ok(self
            .subscribers
            .open_collection(collection, filters, current))
    }

    async fn subscribe_document(
        &self,
        collection: &CollectionName,
        id: &EntityId,
    ) -> Result<DocumentSubscription, AppError> {
        let _gate = self.write_gate.lock().await;
        let current = self.snapshot(collection, id).await?;
        Ok(self.subscribers.open_document(collection, current))
    }
}

#[async_trait]
impl ConnectivityProbe for SqliteDocumentStore {
    async fn probe(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// File behind a `sqlite:` URL, or `None` for in-memory databases.
fn database_file_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::SnapshotEvent;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup_store() -> SqliteDocumentStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteDocumentStore::from_pool(pool).await.unwrap()
    }

    fn meetings() -> CollectionName {
        CollectionName::new("meetings".into()).unwrap()
    }

    fn payload(value: serde_json::Value) -> RecordPayload {
        RecordPayload::new(value).unwrap()
    }

    #[tokio::test]
    async fn create_update_delete_round_trip() {
        let store = setup_store().await;
        let created = store
            .create(&meetings(), payload(json!({"title": "Budget", "location": "Hall"})))
            .await
            .unwrap();

        store
            .update(&meetings(), &created.id, payload(json!({"title": "Budget 2026"})))
            .await
            .unwrap();
        let stored = store
            .document(&meetings(), &created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.data.get("title"), Some(&json!("Budget 2026")));
        assert_eq!(stored.data.get("location"), Some(&json!("Hall")));
        assert_eq!(stored.data.get("createdAt"), created.data.get("createdAt"));

        store.delete(&meetings(), &created.id).await.unwrap();
        store.delete(&meetings(), &created.id).await.unwrap();
        assert!(
            store
                .document(&meetings(), &created.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn updating_a_missing_document_is_not_found() {
        let store = setup_store().await;
        let err = store
            .update(
                &meetings(),
                &EntityId::new("m404".into()).unwrap(),
                payload(json!({"title": "x"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn subscription_follows_writes_in_order() {
        let store = setup_store().await;
        let mut feed = store
            .subscribe(&meetings(), &QueryFilters::default())
            .await
            .unwrap();
        assert_eq!(feed.next().await, Some(SnapshotEvent::Snapshot(Vec::new())));

        let first = store
            .create(&meetings(), payload(json!({"title": "A"})))
            .await
            .unwrap();
        let second = store
            .create(&meetings(), payload(json!({"title": "B"})))
            .await
            .unwrap();

        match feed.next().await {
            Some(SnapshotEvent::Snapshot(documents)) => assert_eq!(documents.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
        match feed.next().await {
            Some(SnapshotEvent::Snapshot(documents)) => {
                let ids: Vec<_> = documents.iter().map(|doc| doc.id.clone()).collect();
                assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(store.probe().await.is_ok());
    }

    #[tokio::test]
    async fn documents_survive_reopening_the_database() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("condo.db");
        let config = DatabaseConfig {
            url: format!("sqlite://{}?mode=rwc", db_path.display()),
            max_connections: 1,
        };

        let store = SqliteDocumentStore::connect(&config).await.unwrap();
        let created = store
            .create(&meetings(), payload(json!({"title": "Assembly"})))
            .await
            .unwrap();
        store.close().await;

        let reopened = SqliteDocumentStore::connect(&config).await.unwrap();
        let stored = reopened
            .document(&meetings(), &created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.data.get("title"), Some(&json!("Assembly")));
        reopened.close().await;
    }

    async fn insert_raw(store: &SqliteDocumentStore, id: &str, data: &str) {
        sqlx::query(INSERT_DOCUMENT)
            .bind("meetings")
            .bind(id)
            .bind(data)
            .bind(0_i64)
            .bind(0_i64)
            .execute(store.pool())
            .await
            .unwrap();
    }

    async fn stored_rows(store: &SqliteDocumentStore) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?1")
            .bind("meetings")
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn undecodable_rows_are_left_out_of_snapshots() {
        let store = setup_store().await;
        insert_raw(&store, "broken", "[1]").await;
        insert_raw(&store, "m1", r#"{"title": "Assembly"}"#).await;

        let mut feed = store
            .subscribe(&meetings(), &QueryFilters::default())
            .await
            .unwrap();
        match feed.next().await {
            Some(SnapshotEvent::Snapshot(documents)) => {
                assert_eq!(documents.len(), 1);
                assert_eq!(documents[0].id.as_str(), "m1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_next_to_a_broken_row_commits_once() {
        let store = setup_store().await;
        insert_raw(&store, "broken", "[1]").await;
        let mut feed = store
            .subscribe(&meetings(), &QueryFilters::default())
            .await
            .unwrap();
        assert_eq!(feed.next().await, Some(SnapshotEvent::Snapshot(Vec::new())));

        let created = store
            .create(&meetings(), payload(json!({"title": "Budget"})))
            .await
            .unwrap();
        assert_eq!(stored_rows(&store).await, 2);
        match feed.next().await {
            Some(SnapshotEvent::Snapshot(documents)) => {
                let ids: Vec<_> = documents.iter().map(|doc| doc.id.clone()).collect();
                assert_eq!(ids, vec![created.id]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn memory_urls_have_no_file() {
        assert_eq!(database_file_path("sqlite::memory:"), None);
        assert_eq!(
            database_file_path("sqlite:data/condo.db?mode=rwc"),
            Some(PathBuf::from("data/condo.db"))
        );
        assert_eq!(
            database_file_path("sqlite:///tmp/condo.db"),
            Some(PathBuf::from("/tmp/condo.db"))
        );
    }
}
