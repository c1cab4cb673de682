//! Durable generation records: the request, its status, the accepted output,
//! run metrics and per-stage metadata.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::cache::now_epoch;
use crate::pipeline::{GenerationRequest, Metrics, StageSummary};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Draft,
    Generating,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "draft" => Self::Draft,
            "generating" => Self::Generating,
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub genre: Option<String>,
    pub target_audience: Option<String>,
    pub style: Option<String>,
    pub tone: Option<String>,
    pub length: Option<String>,
    pub status: RecordStatus,
    pub content: Option<String>,
    pub metrics: Option<Metrics>,
    #[serde(default)]
    pub stage_metadata: Vec<StageSummary>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields changed by [`RecordStore::update`]. `None` leaves the column as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub status: Option<RecordStatus>,
    pub content: Option<String>,
    pub metrics: Option<Metrics>,
    pub stage_metadata: Option<Vec<StageSummary>>,
    pub error: Option<String>,
}

impl RecordUpdate {
    pub fn status(status: RecordStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn completed(content: String, metrics: Metrics, stages: Vec<StageSummary>) -> Self {
        Self {
            status: Some(RecordStatus::Completed),
            content: Some(content),
            metrics: Some(metrics),
            stage_metadata: Some(stages),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(RecordStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store closed")]
    Closed,
    #[error("task join error: {0}")]
    Join(String),
    #[error("not found: {0}")]
    NotFound(String),
}

// =============================================================================
// Trait
// =============================================================================

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record for `request` and return its id.
    async fn create(&self, request: &GenerationRequest, status: RecordStatus)
        -> Result<i64, StoreError>;

    async fn read(&self, id: i64) -> Result<GenerationRecord, StoreError>;

    async fn update(&self, id: i64, update: RecordUpdate) -> Result<(), StoreError>;
}

fn apply_update(record: &mut GenerationRecord, update: RecordUpdate, now: i64) {
    if let Some(status) = update.status {
        record.status = status;
    }
    if update.content.is_some() {
        record.content = update.content;
    }
    if update.metrics.is_some() {
        record.metrics = update.metrics;
    }
    if let Some(stages) = update.stage_metadata {
        record.stage_metadata = stages;
    }
    if update.error.is_some() {
        record.error = update.error;
    }
    record.updated_at = now;
}

fn new_record(id: i64, request: &GenerationRequest, status: RecordStatus, now: i64) -> GenerationRecord {
    GenerationRecord {
        id,
        title: request.display_title().to_string(),
        description: request.description.clone(),
        genre: request.genre.clone(),
        target_audience: request.target_audience.clone(),
        style: request.style.clone(),
        tone: request.tone.clone(),
        length: request.length.clone(),
        status,
        content: None,
        metrics: None,
        stage_metadata: Vec::new(),
        error: None,
        created_at: now,
        updated_at: now,
    }
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<i64, GenerationRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(
        &self,
        request: &GenerationRequest,
        status: RecordStatus,
    ) -> Result<i64, StoreError> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = records.keys().next_back().copied().unwrap_or(0) + 1;
        records.insert(id, new_record(id, request, status, now_epoch()));
        Ok(id)
    }

    async fn read(&self, id: i64) -> Result<GenerationRecord, StoreError> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("record {id}")))
    }

    async fn update(&self, id: i64, update: RecordUpdate) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = records
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("record {id}")))?;
        apply_update(record, update, now_epoch());
        Ok(())
    }
}

// =============================================================================
// SQLite store
// =============================================================================

#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
    /// One blocking thread waits on the connection at a time.
    sem: Arc<Semaphore>,
}

impl SqliteRecordStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=NORMAL; \
             PRAGMA busy_timeout=5000;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS generations ( \
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                title TEXT NOT NULL, \
                description TEXT NOT NULL, \
                genre TEXT, \
                target_audience TEXT, \
                style TEXT, \
                tone TEXT, \
                length TEXT, \
                status TEXT NOT NULL, \
                content TEXT, \
                metrics TEXT, \
                stage_metadata TEXT, \
                error TEXT, \
                created_at INTEGER NOT NULL, \
                updated_at INTEGER NOT NULL \
             ); \
             CREATE INDEX IF NOT EXISTS idx_generations_status ON generations(status);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("QUILL_STORE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".quill_records.sqlite")
    }

    /// Lock the connection, recovering from poisoning; the connection stays usable.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Most recent records first.
    pub async fn list(&self, limit: usize) -> Result<Vec<GenerationRecord>, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_RECORD} ORDER BY id DESC LIMIT ?1"))?;
            let mut rows = stmt.query(params![limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_record(row)?);
            }
            Ok(out)
        })
        .await
    }
}

const SELECT_RECORD: &str = "SELECT id, title, description, genre, target_audience, style, tone, \
     length, status, content, metrics, stage_metadata, error, created_at, updated_at \
     FROM generations";

fn row_to_record(row: &Row<'_>) -> Result<GenerationRecord, StoreError> {
    let status: String = row.get(8)?;
    let metrics: Option<String> = row.get(10)?;
    let stages: Option<String> = row.get(11)?;
    Ok(GenerationRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        genre: row.get(3)?,
        target_audience: row.get(4)?,
        style: row.get(5)?,
        tone: row.get(6)?,
        length: row.get(7)?,
        status: RecordStatus::from_str(&status),
        content: row.get(9)?,
        metrics: metrics.as_deref().map(serde_json::from_str).transpose()?,
        stage_metadata: match stages {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        },
        error: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create(
        &self,
        request: &GenerationRequest,
        status: RecordStatus,
    ) -> Result<i64, StoreError> {
        let record = new_record(0, request, status, now_epoch());
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO generations (title, description, genre, target_audience, style, \
                 tone, length, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.title,
                    record.description,
                    record.genre,
                    record.target_audience,
                    record.style,
                    record.tone,
                    record.length,
                    record.status.as_str(),
                    record.created_at,
                    record.updated_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn read(&self, id: i64) -> Result<GenerationRecord, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_RECORD} WHERE id = ?1"))?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => row_to_record(row),
                None => Err(StoreError::NotFound(format!("record {id}"))),
            }
        })
        .await
    }

    async fn update(&self, id: i64, update: RecordUpdate) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let exists: Option<i64> = conn
                .query_row("SELECT id FROM generations WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("record {id}")));
            }
            let metrics = update.metrics.as_ref().map(serde_json::to_string).transpose()?;
            let stages = update
                .stage_metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            conn.execute(
                "UPDATE generations SET \
                 status = COALESCE(?1, status), \
                 content = COALESCE(?2, content), \
                 metrics = COALESCE(?3, metrics), \
                 stage_metadata = COALESCE(?4, stage_metadata), \
                 error = COALESCE(?5, error), \
                 updated_at = ?6 \
                 WHERE id = ?7",
                params![
                    update.status.map(RecordStatus::as_str),
                    update.content,
                    metrics,
                    stages,
                    update.error,
                    now_epoch(),
                    id,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_create_update_read() {
        let store = MemoryRecordStore::new();
        let req = GenerationRequest::new("a lonely lighthouse keeper").genre("literary");
        let id = store.create(&req, RecordStatus::Generating).await.unwrap();

        let rec = store.read(id).await.unwrap();
        assert_eq!(rec.title, "Untitled");
        assert_eq!(rec.status, RecordStatus::Generating);

        store
            .update(
                id,
                RecordUpdate::completed("the end".into(), Metrics::default(), Vec::new()),
            )
            .await
            .unwrap();
        let rec = store.read(id).await.unwrap();
        assert_eq!(rec.status, RecordStatus::Completed);
        assert_eq!(rec.content.as_deref(), Some("the end"));
        assert_eq!(rec.genre.as_deref(), Some("literary"));
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let store = MemoryRecordStore::new();
        assert!(matches!(store.read(7).await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.update(7, RecordUpdate::failed("x")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            RecordStatus::Draft,
            RecordStatus::Generating,
            RecordStatus::Completed,
            RecordStatus::Failed,
        ] {
            assert_eq!(RecordStatus::from_str(status.as_str()), status);
        }
    }
}
