//! Ingest-area orphan collection
//!
//! A file under the ingest directory is garbage when no record points at it,
//! or when its record is already durably saved. Files younger than the grace
//! window are left alone so an ingest that has written its file but not yet
//! committed its row is never raced.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::cache::LocalCache;
use crate::error::Result;
use crate::metadata::MetadataStore;

/// Default grace window for fresh files
pub const DEFAULT_GC_GRACE: Duration = Duration::from_secs(60 * 60);

/// Summary of one orphan sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub scanned: usize,
    pub deleted: usize,
    pub retained: usize,
    pub too_young: usize,
    pub errors: usize,
}

/// Orphan collector over the ingest directory
pub struct OrphanCollector {
    local: Arc<LocalCache>,
    metadata: MetadataStore,
    grace: Duration,
}

impl OrphanCollector {
    pub fn new(local: Arc<LocalCache>, metadata: MetadataStore, grace: Duration) -> Self {
        Self {
            local,
            metadata,
            grace,
        }
    }

    /// Sweep the ingest directory once
    #[instrument(skip(self), fields(grace_secs = self.grace.as_secs()))]
    pub async fn run_once(&self) -> Result<GcReport> {
        let root = self.local.uploads_dir().to_path_buf();
        let files = tokio::task::spawn_blocking(move || list_files(root)).await?;

        let now = SystemTime::now();
        let mut report = GcReport {
            scanned: files.len(),
            ..Default::default()
        };

        for (path, modified) in files {
            let age = modified
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < self.grace {
                report.too_young += 1;
                continue;
            }

            let record = match self.metadata.find_by_local_path(&path).await {
                Ok(record) => record,
                Err(e) => {
                    warn!("Metadata lookup for {} failed: {}", path.display(), e);
                    report.errors += 1;
                    continue;
                }
            };

            let collectable = match &record {
                None => true,
                Some(record) => record.is_saved,
            };
            if !collectable {
                report.retained += 1;
                continue;
            }

            match self.local.delete_temp_upload(&path).await {
                Ok(()) => {
                    debug!(
                        "Collected {} ({})",
                        path.display(),
                        if record.is_some() { "migrated" } else { "orphaned" }
                    );
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!("Failed to collect {}: {}", path.display(), e);
                    report.errors += 1;
                }
            }
        }

        crate::metrics::GC_DELETED.inc_by(report.deleted as u64);
        if report.deleted > 0 || report.errors > 0 {
            info!(
                "Orphan sweep: {} scanned, {} deleted, {} errors",
                report.scanned, report.deleted, report.errors
            );
        }
        Ok(report)
    }
}

fn list_files(root: PathBuf) -> Vec<(PathBuf, Option<SystemTime>)> {
    WalkDir::new(&root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable upload entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            (entry.into_path(), modified)
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCacheConfig;
    use crate::metadata::NewImageRecord;
    use tempfile::TempDir;

    async fn setup(grace: Duration) -> (TempDir, Arc<LocalCache>, MetadataStore, OrphanCollector) {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(LocalCache::new(LocalCacheConfig {
            root: dir.path().join("cache"),
            uploads_dir: dir.path().join("uploads"),
            ..Default::default()
        }));
        local.ensure_dirs().await.unwrap();
        let metadata = MetadataStore::open_in_memory().unwrap();
        let gc = OrphanCollector::new(local.clone(), metadata.clone(), grace);
        (dir, local, metadata, gc)
    }

    async fn write_upload(local: &LocalCache, request: &str, name: &str) -> PathBuf {
        let path = local.uploads_dir().join(request).join(name);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"bytes").await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_collects_orphans_and_saved_but_keeps_pending() {
        let (_dir, local, metadata, gc) = setup(Duration::ZERO).await;

        let orphan = write_upload(&local, "r1", "orphan.webp").await;
        let saved = write_upload(&local, "r2", "saved.webp").await;
        let pending = write_upload(&local, "r3", "pending.webp").await;

        metadata
            .insert_batch(vec![
                NewImageRecord::new("saved", &saved),
                NewImageRecord::new("pending", &pending),
            ])
            .await
            .unwrap();
        metadata.try_claim("saved").await.unwrap();
        metadata.mark_saved("saved").await.unwrap();

        let report = gc.run_once().await.unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.retained, 1);
        assert!(!orphan.exists());
        assert!(!saved.exists());
        assert!(pending.exists());
    }

    #[tokio::test]
    async fn test_grace_window_protects_fresh_files() {
        let (_dir, local, _metadata, gc) = setup(Duration::from_secs(3600)).await;
        let fresh = write_upload(&local, "r1", "in-flight.webp.tmp").await;

        let report = gc.run_once().await.unwrap();
        assert_eq!(report.too_young, 1);
        assert_eq!(report.deleted, 0);
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_empty_ingest_dir() {
        let (_dir, _local, _metadata, gc) = setup(Duration::ZERO).await;
        let report = gc.run_once().await.unwrap();
        assert_eq!(report, GcReport::default());
    }
}
