//! SQLite-backed document store for local/offline sessions.
//!
//! Documents live in one `documents` table keyed by path, with the JSON
//! body in a text column. `watch` is wired through the same in-process
//! hub as [`MemoryStore`](crate::MemoryStore), so it only observes writes
//! made by this process; a local file DB has no cross-process change feed.

use crate::{apply_field, deep_merge, DocumentStore, FieldValue, SetMode, StoreError, WatchHub};
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tokio::sync::watch;
use tracing::info;

/// Default SQLite URL used for local saves.
pub fn default_sqlite_url() -> &'static str {
    "sqlite://./saves/career-city.db"
}

/// Open (creating if missing) the database at `url` and apply the schema.
pub async fn init_db(url: &str) -> Result<SqlitePool, StoreError> {
    let opts = SqliteConnectOptions::from_str(url)
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .connect_with(opts)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS documents (
            path TEXT PRIMARY KEY,
            body TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(&pool)
    .await
    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    info!(url, "document store schema ready");
    Ok(pool)
}

/// File-backed document store.
pub struct SqliteStore {
    pool: SqlitePool,
    hub: WatchHub,
}

impl SqliteStore {
    /// Wrap an initialized pool (see [`init_db`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            hub: WatchHub::default(),
        }
    }

    /// Open the store at `url`, initializing the schema.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(init_db(url).await?))
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT body FROM documents WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let body: String = row.get(0);
                serde_json::from_str(&body)
                    .map(Some)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            }
        }
    }

    async fn write(&self, path: &str, doc: &Value) -> Result<(), StoreError> {
        let body =
            serde_json::to_string(doc).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO documents (path, body, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
        )
        .bind(path)
        .bind(body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.hub.publish(path, Some(doc.clone()));
        Ok(())
    }
}

impl DocumentStore for SqliteStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.read(path).await
    }

    async fn set(&self, path: &str, doc: Value, mode: SetMode) -> Result<(), StoreError> {
        let merged = match mode {
            SetMode::Replace => doc,
            SetMode::Merge => {
                let mut base = self
                    .read(path)
                    .await?
                    .unwrap_or_else(|| Value::Object(Map::new()));
                deep_merge(&mut base, &doc);
                base
            }
        };
        self.write(path, &merged).await
    }

    async fn update(
        &self,
        path: &str,
        fields: Vec<(String, FieldValue)>,
    ) -> Result<(), StoreError> {
        let mut doc = self
            .read(path)
            .await?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        for (field_path, value) in fields {
            apply_field(&mut doc, &field_path, value);
        }
        self.write(path, &doc).await
    }

    async fn watch(&self, path: &str) -> watch::Receiver<Option<Value>> {
        // Seed from disk so a subscriber created before the first
        // in-process write still observes the current value. Writes by
        // other processes remain invisible; a local file DB has no
        // cross-process change feed.
        let current = self.read(path).await.ok().flatten();
        self.hub.subscribe(path, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn temp_store(name: &str) -> SqliteStore {
        let dir = std::env::temp_dir().join("career-city-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let url = format!("sqlite://{}", path.display());
        SqliteStore::open(&url).await.unwrap()
    }

    #[tokio::test]
    async fn set_merge_roundtrip() {
        let store = temp_store("merge").await;
        store
            .set("users/u1", json!({"a": 1}), SetMode::Merge)
            .await
            .unwrap();
        store
            .set("users/u1", json!({"b": 2}), SetMode::Merge)
            .await
            .unwrap();
        let doc = store.get("users/u1").await.unwrap().unwrap();
        assert_eq!(doc, json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = temp_store("missing").await;
        let err = store
            .update("nope", vec![("x".into(), FieldValue::Value(json!(1)))])
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("nope".to_string()));
    }

    #[tokio::test]
    async fn watch_seeds_from_existing_document() {
        let dir = std::env::temp_dir().join("career-city-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("watch-seed-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let url = format!("sqlite://{}", path.display());

        let writer = SqliteStore::open(&url).await.unwrap();
        writer
            .set("users/u1", json!({"v": 1}), SetMode::Merge)
            .await
            .unwrap();

        // A fresh store over the same file knows nothing in-process yet;
        // the subscription must still start from the stored value.
        let reader = SqliteStore::open(&url).await.unwrap();
        let rx = reader.watch("users/u1").await;
        assert_eq!(rx.borrow().clone().unwrap()["v"], 1);
    }

    #[tokio::test]
    async fn dotted_update_and_watch() {
        let store = temp_store("watch").await;
        store
            .set("users/u1", json!({"cityProgress": {}}), SetMode::Merge)
            .await
            .unwrap();
        let mut rx = store.watch("users/u1").await;
        store
            .update(
                "users/u1",
                vec![(
                    "cityProgress.buildingPositions.bank".into(),
                    FieldValue::Value(json!({"x": 160, "y": 240})),
                )],
            )
            .await
            .unwrap();
        rx.changed().await.unwrap();
        let doc = rx.borrow().clone().unwrap();
        assert_eq!(doc["cityProgress"]["buildingPositions"]["bank"]["x"], 160);
    }
}
