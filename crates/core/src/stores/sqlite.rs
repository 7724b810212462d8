//! SQLite-backed metadata store: the durable source of truth for documents
//! and for "have we seen this paper".

use crate::error::StoreError;
use crate::models::{Document, UpsertOutcome};
use crate::traits::MetadataStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

const MIGRATIONS: &[&str] = &["
    CREATE TABLE documents (
        external_id   TEXT PRIMARY KEY,
        title         TEXT NOT NULL,
        abstract      TEXT NOT NULL,
        authors       TEXT NOT NULL,
        categories    TEXT NOT NULL,
        published_at  TEXT NOT NULL,
        source_url    TEXT NOT NULL,
        full_text     TEXT,
        content_hash  TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    );
    CREATE INDEX idx_documents_published_at ON documents(published_at);
"];

const DOCUMENT_COLUMNS: &str = "external_id, title, abstract, authors, categories, \
     published_at, source_url, full_text, content_hash";

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    pub fn new(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|error| {
                    StoreError::Unavailable(format!(
                        "cannot create database directory {}: {error}",
                        parent.display()
                    ))
                })?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;

        {
            let conn = pool
                .get()
                .map_err(|error| StoreError::Unavailable(error.to_string()))?;
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
        }

        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        self.pool
            .get()
            .map_err(|error| StoreError::Unavailable(error.to_string()))
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        for (offset, migration) in MIGRATIONS.iter().enumerate() {
            let version = offset as i64 + 1;
            if version > current_version {
                tracing::info!(version, "applying metadata store migration");
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    fn fetch_document(
        conn: &Connection,
        external_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let query = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE external_id = ?1");
        let row = conn
            .query_row(&query, params![external_id], |row| {
                Ok(RowParts {
                    external_id: row.get(0)?,
                    title: row.get(1)?,
                    abstract_text: row.get(2)?,
                    authors: row.get(3)?,
                    categories: row.get(4)?,
                    published_at: row.get(5)?,
                    source_url: row.get(6)?,
                    full_text: row.get(7)?,
                    content_hash: row.get(8)?,
                })
            })
            .optional()?;

        row.map(RowParts::into_document).transpose()
    }
}

struct RowParts {
    external_id: String,
    title: String,
    abstract_text: String,
    authors: String,
    categories: String,
    published_at: String,
    source_url: String,
    full_text: Option<String>,
    content_hash: String,
}

impl RowParts {
    fn into_document(self) -> Result<Document, StoreError> {
        let published_at = DateTime::parse_from_rfc3339(&self.published_at)
            .map_err(|error| StoreError::Corrupt {
                external_id: self.external_id.clone(),
                details: format!("published_at: {error}"),
            })?
            .with_timezone(&Utc);

        Ok(Document {
            authors: serde_json::from_str(&self.authors)?,
            categories: serde_json::from_str(&self.categories)?,
            external_id: self.external_id,
            title: self.title,
            abstract_text: self.abstract_text,
            published_at,
            source_url: self.source_url,
            full_text: self.full_text,
            content_hash: self.content_hash,
        })
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn upsert(&self, document: &Document) -> Result<UpsertOutcome, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing_hash: Option<String> = tx
            .query_row(
                "SELECT content_hash FROM documents WHERE external_id = ?1",
                params![&document.external_id],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing_hash {
            Some(hash) if hash == document.content_hash => UpsertOutcome::Unchanged,
            Some(_) => {
                tx.execute(
                    "UPDATE documents
                     SET title = ?2, abstract = ?3, authors = ?4, categories = ?5,
                         published_at = ?6, source_url = ?7, full_text = ?8,
                         content_hash = ?9, updated_at = ?10
                     WHERE external_id = ?1",
                    params![
                        &document.external_id,
                        &document.title,
                        &document.abstract_text,
                        serde_json::to_string(&document.authors)?,
                        serde_json::to_string(&document.categories)?,
                        document.published_at.to_rfc3339(),
                        &document.source_url,
                        &document.full_text,
                        &document.content_hash,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                UpsertOutcome::Updated
            }
            None => {
                tx.execute(
                    "INSERT INTO documents
                     (external_id, title, abstract, authors, categories, published_at,
                      source_url, full_text, content_hash, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        &document.external_id,
                        &document.title,
                        &document.abstract_text,
                        serde_json::to_string(&document.authors)?,
                        serde_json::to_string(&document.categories)?,
                        document.published_at.to_rfc3339(),
                        &document.source_url,
                        &document.full_text,
                        &document.content_hash,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                UpsertOutcome::Inserted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let conn = self.conn()?;
        Self::fetch_document(&conn, external_id)
    }

    async fn get_many(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, Document>, StoreError> {
        let conn = self.conn()?;
        let mut documents = HashMap::with_capacity(external_ids.len());

        for external_id in external_ids {
            if let Some(document) = Self::fetch_document(&conn, external_id)? {
                documents.insert(external_id.clone(), document);
            }
        }

        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn sample_document(external_id: &str, content_hash: &str) -> Document {
        Document {
            external_id: external_id.to_string(),
            title: "A Title".to_string(),
            abstract_text: "An abstract.".to_string(),
            authors: vec!["Jane Doe".to_string()],
            categories: vec!["cs.AI".to_string()],
            published_at: Utc.with_ymd_and_hms(2024, 1, 8, 5, 0, 0).unwrap(),
            source_url: format!("https://arxiv.org/abs/{external_id}"),
            full_text: None,
            content_hash: content_hash.to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_distinguishes_insert_update_and_noop() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = SqliteStore::new(&dir.path().join("arxiv.db"))?;

        let document = sample_document("2401.01234", "hash-a");
        assert_eq!(store.upsert(&document).await?, UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&document).await?, UpsertOutcome::Unchanged);

        let mut changed = document.clone();
        changed.abstract_text = "A revised abstract.".to_string();
        changed.content_hash = "hash-b".to_string();
        assert_eq!(store.upsert(&changed).await?, UpsertOutcome::Updated);

        let stored = store
            .get_by_external_id("2401.01234")
            .await?
            .expect("document should exist");
        assert_eq!(stored.abstract_text, "A revised abstract.");
        assert_eq!(stored.content_hash, "hash-b");
        Ok(())
    }

    #[tokio::test]
    async fn round_trips_all_fields() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = SqliteStore::new(&dir.path().join("arxiv.db"))?;

        let mut document = sample_document("2401.05678", "hash-c");
        document.full_text = Some("extracted body text".to_string());
        store.upsert(&document).await?;

        let stored = store
            .get_by_external_id("2401.05678")
            .await?
            .expect("document should exist");
        assert_eq!(stored, document);
        Ok(())
    }

    #[tokio::test]
    async fn get_many_omits_missing_ids() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = SqliteStore::new(&dir.path().join("arxiv.db"))?;

        store.upsert(&sample_document("a", "h1")).await?;
        store.upsert(&sample_document("b", "h2")).await?;

        let documents = store
            .get_many(&["a".to_string(), "missing".to_string(), "b".to_string()])
            .await?;

        assert_eq!(documents.len(), 2);
        assert!(documents.contains_key("a"));
        assert!(documents.contains_key("b"));
        assert!(!documents.contains_key("missing"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_document_is_none_not_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = SqliteStore::new(&dir.path().join("arxiv.db"))?;
        assert!(store.get_by_external_id("nope").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn reopening_the_database_preserves_rows() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("arxiv.db");

        {
            let store = SqliteStore::new(&path)?;
            store.upsert(&sample_document("persist", "h")).await?;
        }

        let reopened = SqliteStore::new(&path)?;
        assert!(reopened.get_by_external_id("persist").await?.is_some());
        Ok(())
    }
}
