//! Content-addressed memo of accepted stage outputs.
//!
//! Keys are the exact prompt text paired with the stage identity. Entries
//! carry a TTL; an expired entry reads as absent but stays on disk until a
//! prune. Writes are last-write-wins upserts.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::pipeline::Stage;

/// Default entry lifetime: one day.
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub stage: Stage,
    pub prompt_hash: String,
    pub key_hash: String,
}

impl CacheKey {
    pub fn new(stage: Stage, prompt: &str) -> Self {
        let prompt_hash = hash_text(prompt);
        let key_hash = hash_fields(&[stage.as_str(), &prompt_hash]);
        Self {
            stage,
            prompt_hash,
            key_hash,
        }
    }
}

/// A remembered `(output, score)` pair. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub output: String,
    pub score: f64,
    pub created_at: i64,
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait GenerationCache: Send + Sync {
    /// Live entry for `key`, or `None` when absent or expired.
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;
    /// Overwrite whatever is stored under `key`.
    async fn store(&self, key: &CacheKey, output: &str, score: f64) -> Result<(), CacheError>;
}

/// Cache that remembers nothing. Used when caching is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGenerationCache;

#[async_trait]
impl GenerationCache for NullGenerationCache {
    async fn lookup(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    async fn store(&self, _key: &CacheKey, _output: &str, _score: f64) -> Result<(), CacheError> {
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug)]
pub struct MemoryGenerationCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl Default for MemoryGenerationCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl MemoryGenerationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GenerationCache for MemoryGenerationCache {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        let now = now_epoch();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned())
    }

    async fn store(&self, key: &CacheKey, output: &str, score: f64) -> Result<(), CacheError> {
        let now = now_epoch();
        let entry = CacheEntry {
            output: output.to_string(),
            score,
            created_at: now,
            expires_at: expiry(now, self.ttl),
        };
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries.insert(key.clone(), entry);
        Ok(())
    }
}

// =============================================================================
// SQLite
// =============================================================================

#[derive(Clone)]
pub struct SqliteGenerationCache {
    path: PathBuf,
    ttl: Duration,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGenerationCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS generation_cache (\
               key_hash TEXT PRIMARY KEY,\
               stage TEXT NOT NULL,\
               prompt_hash TEXT NOT NULL,\
               output TEXT NOT NULL,\
               score REAL NOT NULL,\
               created_at INTEGER NOT NULL,\
               expires_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0 \
             );",
        )?;
        ensure_column(&conn, "last_hit_at", "INTEGER")?;

        Ok(Self {
            path,
            ttl: DEFAULT_TTL,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("QUILL_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".quill_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

fn ensure_column(conn: &Connection, name: &str, spec: &str) -> Result<(), CacheError> {
    let mut stmt = conn.prepare("PRAGMA table_info(generation_cache)")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let col_name: String = row.get(1)?;
        if col_name == name {
            return Ok(());
        }
    }
    let sql = format!("ALTER TABLE generation_cache ADD COLUMN {name} {spec}");
    conn.execute(&sql, [])?;
    Ok(())
}

#[async_trait]
impl GenerationCache for SqliteGenerationCache {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                let mut stmt = conn.prepare(
                    "SELECT output, score, created_at, expires_at \
                     FROM generation_cache WHERE key_hash = ?1 AND expires_at > ?2",
                )?;
                let mut rows = stmt.query(params![key_hash, now])?;
                if let Some(row) = rows.next()? {
                    let entry = CacheEntry {
                        output: row.get(0)?,
                        score: row.get(1)?,
                        created_at: row.get(2)?,
                        expires_at: row.get(3)?,
                    };
                    conn.execute(
                        "UPDATE generation_cache \
                         SET hit_count = hit_count + 1, last_hit_at = ?1 \
                         WHERE key_hash = ?2",
                        params![now, key_hash],
                    )?;
                    Ok(Some(entry))
                } else {
                    Ok(None)
                }
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn store(&self, key: &CacheKey, output: &str, score: f64) -> Result<(), CacheError> {
        let key = key.clone();
        let output = output.to_string();
        let ttl = self.ttl;
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO generation_cache (\
                        key_hash, stage, prompt_hash, output, score, created_at, expires_at \
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        output = excluded.output,\
                        score = excluded.score,\
                        created_at = excluded.created_at,\
                        expires_at = excluded.expires_at,\
                        hit_count = 0",
                    params![
                        key.key_hash,
                        key.stage.as_str(),
                        key.prompt_hash,
                        output,
                        score,
                        now,
                        expiry(now, ttl),
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub stage: String,
    pub prompt_hash: String,
    pub output: String,
    pub score: f64,
    pub created_at: i64,
    pub expires_at: i64,
    pub hit_count: i64,
    pub last_hit_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteGenerationCache {
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                use std::io::Write;

                let mut stmt = conn.prepare(
                    "SELECT key_hash, stage, prompt_hash, output, score,\
                            created_at, expires_at, hit_count, last_hit_at \
                     FROM generation_cache ORDER BY created_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
                let mut written = 0;
                while let Some(row) = rows.next()? {
                    let record = CacheExportRow {
                        key_hash: row.get(0)?,
                        stage: row.get(1)?,
                        prompt_hash: row.get(2)?,
                        output: row.get(3)?,
                        score: row.get(4)?,
                        created_at: row.get(5)?,
                        expires_at: row.get(6)?,
                        hit_count: row.get(7)?,
                        last_hit_at: row.get(8)?,
                    };
                    let line = serde_json::to_string(&record)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    writeln!(file, "{line}")?;
                    written += 1;
                }
                file.flush()?;
                Ok(written)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    /// Drop expired rows (when `expired`) and then the oldest rows beyond `max_rows`.
    pub async fn prune(
        &self,
        expired: bool,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if expired {
                    let removed = conn.execute(
                        "DELETE FROM generation_cache WHERE expires_at <= ?1",
                        params![now_epoch()],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    let keep = i64::try_from(max_rows).unwrap_or(i64::MAX);
                    let removed = conn.execute(
                        "DELETE FROM generation_cache WHERE key_hash IN (\
                            SELECT key_hash FROM generation_cache \
                            ORDER BY created_at DESC LIMIT -1 OFFSET ?1 \
                         )",
                        params![keep],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM generation_cache", [], |row| {
                        row.get(0)
                    })?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn expiry(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}

pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
