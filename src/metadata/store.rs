//! SQLite-backed metadata store
//!
//! A single connection behind a mutex; every call hops onto the blocking
//! pool so the async workers never wait on SQLite.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use super::{ImageRecord, NewImageRecord};
use crate::cache::EvictionListener;
use crate::error::Result;

/// How long a writer waits on a locked database file
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS image_records (
        id            TEXT PRIMARY KEY,
        local_path    TEXT NOT NULL,
        is_saved      INTEGER NOT NULL DEFAULT 0,
        is_processing INTEGER NOT NULL DEFAULT 0,
        claimed_at    INTEGER,
        uploaded_at   INTEGER NOT NULL,
        last_used_at  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_image_records_last_used
        ON image_records(last_used_at);
    CREATE INDEX IF NOT EXISTS idx_image_records_local_path
        ON image_records(local_path);
"#;

const COLUMNS: &str =
    "id, local_path, is_saved, is_processing, claimed_at, uploaded_at, last_used_at";

/// Metadata Store - image records in SQLite
#[derive(Clone)]
pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        info!("Metadata store opened at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run a closure against the connection on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await?
    }

    /// Insert a batch of fresh records in one transaction.
    ///
    /// Either every row commits or none does.
    pub async fn insert_batch(&self, records: Vec<NewImageRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let now = now_millis();
        let count = records.len();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO image_records
                        (id, local_path, is_saved, is_processing, claimed_at, uploaded_at, last_used_at)
                     VALUES (?1, ?2, 0, 0, NULL, ?3, ?3)",
                )?;
                for record in &records {
                    stmt.execute(params![
                        record.id,
                        record.local_path.to_string_lossy(),
                        now
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        debug!("Registered {} image records", count);
        Ok(())
    }

    /// Fetch one record
    pub async fn get(&self, id: &str) -> Result<Option<ImageRecord>> {
        let id = id.to_string();
        self.run(move |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {} FROM image_records WHERE id = ?1", COLUMNS),
                    params![id],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Refresh `lastUsedAt` to now. Returns false for unknown ids.
    pub async fn touch(&self, id: &str) -> Result<bool> {
        self.touch_at(id, now_millis()).await
    }

    /// Set `lastUsedAt` to an explicit UTC millisecond timestamp
    pub async fn touch_at(&self, id: &str, at_millis: i64) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE image_records SET last_used_at = ?2 WHERE id = ?1",
                params![id, at_millis],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Every record, oldest upload first
    pub async fn list(&self) -> Result<Vec<ImageRecord>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM image_records ORDER BY uploaded_at, id",
                COLUMNS
            ))?;
            let records = stmt
                .query_map([], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    /// Unsaved, unclaimed records not read for at least `older_than`
    pub async fn migration_candidates(&self, older_than: Duration) -> Result<Vec<ImageRecord>> {
        let cutoff = now_millis() - duration_millis(older_than);
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM image_records
                 WHERE last_used_at < ?1 AND is_saved = 0 AND is_processing = 0
                 ORDER BY last_used_at, id",
                COLUMNS
            ))?;
            let records = stmt
                .query_map(params![cutoff], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    /// Atomically take the migration claim for `id`.
    ///
    /// Succeeds only while the row is still unsaved and unclaimed; `false`
    /// means another worker got there first.
    pub async fn try_claim(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let now = now_millis();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE image_records SET is_processing = 1, claimed_at = ?2
                 WHERE id = ?1 AND is_saved = 0 AND is_processing = 0",
                params![id, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Record a completed migration and drop the claim
    pub async fn mark_saved(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE image_records SET is_saved = 1, is_processing = 0, claimed_at = NULL
                 WHERE id = ?1 AND is_processing = 1",
                params![id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Drop the claim after a failed attempt, leaving the row eligible again
    pub async fn release_claim(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE image_records SET is_processing = 0, claimed_at = NULL
                 WHERE id = ?1 AND is_processing = 1",
                params![id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Release claims held for longer than `older_than` (crashed workers)
    pub async fn release_stale_claims(&self, older_than: Duration) -> Result<usize> {
        let cutoff = now_millis() - duration_millis(older_than);
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE image_records SET is_processing = 0, claimed_at = NULL
                 WHERE is_processing = 1 AND is_saved = 0
                   AND (claimed_at IS NULL OR claimed_at < ?1)",
                params![cutoff],
            )?;
            Ok(changed)
        })
        .await
    }

    /// Every id, least recently used first
    pub async fn ids_by_last_used(&self) -> Result<Vec<String>> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM image_records ORDER BY last_used_at, id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    /// Record whose upload lives at `path`
    pub async fn find_by_local_path(&self, path: &Path) -> Result<Option<ImageRecord>> {
        let path = path.to_string_lossy().into_owned();
        self.run(move |conn| {
            let record = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM image_records WHERE local_path = ?1 LIMIT 1",
                        COLUMNS
                    ),
                    params![path],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Cheap liveness query used at startup
    pub async fn ping(&self) -> Result<()> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

/// Memory-tier evictions flush recency to the store
#[async_trait]
impl EvictionListener for MetadataStore {
    async fn on_evict(&self, image_id: &str, _data: &Bytes) -> Result<()> {
        self.touch(image_id).await?;
        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(0)?,
        local_path: PathBuf::from(row.get::<_, String>(1)?),
        is_saved: row.get(2)?,
        is_processing: row.get(3)?,
        claimed_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
        uploaded_at: from_millis(row.get(5)?),
        last_used_at: from_millis(row.get(6)?),
    })
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    async fn seeded(ids: &[&str]) -> MetadataStore {
        let store = MetadataStore::open_in_memory().unwrap();
        let records = ids
            .iter()
            .map(|id| NewImageRecord::new(*id, format!("/uploads/req/{}.webp", id)))
            .collect();
        store.insert_batch(records).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = seeded(&["a"]).await;
        let record = store.get("a").await.unwrap().unwrap();

        assert_eq!(record.id, "a");
        assert_eq!(record.local_path, PathBuf::from("/uploads/req/a.webp"));
        assert!(!record.is_saved);
        assert!(!record.is_processing);
        assert!(record.claimed_at.is_none());
        assert_eq!(record.uploaded_at, record.last_used_at);
        assert!(record.is_claimable());

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_batch_is_all_or_nothing() {
        let store = seeded(&["a"]).await;
        // "a" collides with the primary key, so "b" must not land either
        let result = store
            .insert_batch(vec![
                NewImageRecord::new("b", "/uploads/b"),
                NewImageRecord::new("a", "/uploads/a-again"),
            ])
            .await;

        assert!(matches!(result, Err(Error::Database(_))));
        assert!(store.get("b").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_lifecycle() {
        let store = seeded(&["a"]).await;

        assert!(store.try_claim("a").await.unwrap());
        assert!(!store.try_claim("a").await.unwrap(), "claim is exclusive");
        let claimed = store.get("a").await.unwrap().unwrap();
        assert!(claimed.is_processing);
        assert!(claimed.claimed_at.is_some());

        assert!(store.release_claim("a").await.unwrap());
        assert!(store.try_claim("a").await.unwrap(), "released claim is retakeable");

        assert!(store.mark_saved("a").await.unwrap());
        let saved = store.get("a").await.unwrap().unwrap();
        assert!(saved.is_saved);
        assert!(!saved.is_processing);
        assert!(!store.try_claim("a").await.unwrap(), "saved rows are never claimed");
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = seeded(&["contended"]).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_claim("contended").await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_migration_candidates_respect_age_and_flags() {
        let store = seeded(&["old", "fresh", "claimed", "saved"]).await;
        let long_ago = now_millis() - 10_000;
        for id in ["old", "claimed", "saved"] {
            store.touch_at(id, long_ago).await.unwrap();
        }
        store.try_claim("claimed").await.unwrap();
        store.try_claim("saved").await.unwrap();
        store.mark_saved("saved").await.unwrap();

        let candidates = store
            .migration_candidates(Duration::from_secs(5))
            .await
            .unwrap();
        let ids: Vec<_> = candidates.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["old"]);
    }

    #[tokio::test]
    async fn test_release_stale_claims() {
        let store = seeded(&["stuck", "busy"]).await;
        store.try_claim("stuck").await.unwrap();
        store.try_claim("busy").await.unwrap();

        // Backdate one claim
        let stale = now_millis() - 60_000;
        let conn = Arc::clone(&store.conn);
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .execute(
                    "UPDATE image_records SET claimed_at = ?1 WHERE id = 'stuck'",
                    params![stale],
                )
                .unwrap();
        })
        .await
        .unwrap();

        let released = store
            .release_stale_claims(Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert!(!store.get("stuck").await.unwrap().unwrap().is_processing);
        assert!(store.get("busy").await.unwrap().unwrap().is_processing);
    }

    #[tokio::test]
    async fn test_ids_by_last_used_orders_oldest_first() {
        let store = seeded(&["a", "b", "c"]).await;
        store.touch_at("a", 3_000).await.unwrap();
        store.touch_at("b", 1_000).await.unwrap();
        store.touch_at("c", 2_000).await.unwrap();

        assert_eq!(store.ids_by_last_used().await.unwrap(), vec!["b", "c", "a"]);
        assert!(!store.touch_at("missing", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_by_local_path() {
        let store = seeded(&["a", "b"]).await;
        let found = store
            .find_by_local_path(Path::new("/uploads/req/b.webp"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "b");
        assert!(store
            .find_by_local_path(Path::new("/uploads/req/zzz.webp"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_eviction_listener_refreshes_recency() {
        let store = seeded(&["a"]).await;
        store.touch_at("a", 0).await.unwrap();

        store.on_evict("a", &Bytes::new()).await.unwrap();
        let record = store.get("a").await.unwrap().unwrap();
        assert!(record.last_used_at.timestamp_millis() > 0);
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("images.db");

        let store = MetadataStore::open(&path).unwrap();
        store
            .insert_batch(vec![NewImageRecord::new("a", "/u/a")])
            .await
            .unwrap();
        drop(store);

        let reopened = MetadataStore::open(&path).unwrap();
        assert!(reopened.get("a").await.unwrap().is_some());
        reopened.ping().await.unwrap();
    }
}
