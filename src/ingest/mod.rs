//! Ingest Pipeline
//!
//! Turns one upload request's raw buffers into registered images:
//!
//! ```text
//! (name, bytes)* ──▶ decode/normalize ──▶ {uploads}/{request}/{id}.webp.tmp
//!                      (per item)              │ rename
//!                                              ▼
//!                                   {uploads}/{request}/{id}.webp
//!                                              │ one transaction
//!                                              ▼
//!                                       metadata rows
//! ```
//!
//! Items fail independently; the metadata insert is all-or-nothing. At most
//! `concurrency` items are decoded at once, and results keep upload order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{LocalCache, PROCESSED_EXTENSION};
use crate::error::{Error, Result};
use crate::imaging;
use crate::metadata::{MetadataStore, NewImageRecord};

/// One named buffer extracted from an upload request
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub name: String,
    pub data: Bytes,
}

impl UploadItem {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// An item that did not make it into the batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedItem {
    pub name: String,
    pub reason: String,
}

/// Outcome of one ingest request
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// New ids, in upload order
    pub image_ids: Vec<String>,
    /// Items dropped from the batch
    pub rejected: Vec<RejectedItem>,
}

/// Ingest configuration
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Quality of the canonical encoding
    pub quality: u8,
    /// Items normalized in parallel per request
    pub concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            quality: imaging::DEFAULT_QUALITY,
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Ingest Pipeline - normalize, write, register
pub struct IngestPipeline {
    local: Arc<LocalCache>,
    metadata: MetadataStore,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(local: Arc<LocalCache>, metadata: MetadataStore, config: IngestConfig) -> Self {
        Self {
            local,
            metadata,
            config,
        }
    }

    /// Fresh time-ordered request id, also the per-request directory name
    pub fn new_request_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Ingest a batch. Fails with [`Error::EmptyBatch`] when nothing survives.
    #[instrument(skip(self, items), fields(request_id = %request_id, items = items.len()))]
    pub async fn ingest(&self, request_id: &str, items: Vec<UploadItem>) -> Result<IngestReport> {
        let request_dir = self.local.uploads_dir().join(request_id);
        tokio::fs::create_dir_all(&request_dir).await?;

        let quality = self.config.quality;
        let outcomes: Vec<_> = stream::iter(items)
            .map(|item| store_item(&request_dir, item, quality))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = IngestReport::default();
        let mut records = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(record) => {
                    report.image_ids.push(record.id.clone());
                    records.push(record);
                }
                Err(rejected) => {
                    warn!("Rejected upload item {}: {}", rejected.name, rejected.reason);
                    crate::metrics::UPLOADS_REJECTED.inc();
                    report.rejected.push(rejected);
                }
            }
        }

        if records.is_empty() {
            let _ = tokio::fs::remove_dir(&request_dir).await;
            return Err(Error::EmptyBatch {
                rejected: report.rejected.len(),
            });
        }

        let paths: Vec<PathBuf> = records.iter().map(|r| r.local_path.clone()).collect();
        if let Err(e) = self.metadata.insert_batch(records).await {
            for path in &paths {
                let _ = self.local.delete_temp_upload(path).await;
            }
            return Err(e);
        }

        crate::metrics::UPLOADS_ACCEPTED.inc_by(report.image_ids.len() as u64);
        info!(
            "Ingested {} image(s), rejected {}",
            report.image_ids.len(),
            report.rejected.len()
        );
        Ok(report)
    }
}

/// Normalize and durably place one item, minting its id
async fn store_item(
    request_dir: &Path,
    item: UploadItem,
    quality: u8,
) -> std::result::Result<NewImageRecord, RejectedItem> {
    let reject = |reason: String| RejectedItem {
        name: item.name.clone(),
        reason,
    };

    let normalized = imaging::normalize(item.data.clone(), quality)
        .await
        .map_err(|e| reject(e.to_string()))?;

    let id = Uuid::now_v7().to_string();
    let path = request_dir.join(format!("{}.{}", id, PROCESSED_EXTENSION));
    let tmp = request_dir.join(format!("{}.{}.tmp", id, PROCESSED_EXTENSION));

    if let Err(e) = tokio::fs::write(&tmp, &normalized).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(reject(format!("write failed: {}", e)));
    }
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(reject(format!("rename failed: {}", e)));
    }

    debug!("Stored {} as {} ({} bytes)", item.name, id, normalized.len());
    Ok(NewImageRecord::new(id, path))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCacheConfig;
    use assert_matches::assert_matches;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png(width: u32, height: u32) -> Bytes {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    fn make_pipeline(dir: &TempDir) -> (IngestPipeline, MetadataStore) {
        make_pipeline_with(dir, IngestConfig::default())
    }

    fn make_pipeline_with(dir: &TempDir, config: IngestConfig) -> (IngestPipeline, MetadataStore) {
        let local = Arc::new(LocalCache::new(LocalCacheConfig {
            root: dir.path().join("cache"),
            uploads_dir: dir.path().join("uploads"),
            ..Default::default()
        }));
        let metadata = MetadataStore::open_in_memory().unwrap();
        (
            IngestPipeline::new(local, metadata.clone(), config),
            metadata,
        )
    }

    #[tokio::test]
    async fn test_batch_with_one_corrupt_item() {
        let dir = TempDir::new().unwrap();
        let (pipeline, metadata) = make_pipeline(&dir);

        let items = vec![
            UploadItem::new("1.png", png(16, 16)),
            UploadItem::new("2.png", Bytes::from_static(b"corrupt")),
            UploadItem::new("3.png", png(8, 32)),
        ];
        let request_id = IngestPipeline::new_request_id();
        let report = pipeline.ingest(&request_id, items).await.unwrap();

        assert_eq!(report.image_ids.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].name, "2.png");

        for id in &report.image_ids {
            let record = metadata.get(id).await.unwrap().unwrap();
            assert!(!record.is_saved);
            assert!(!record.is_processing);
            assert!(record.local_path.exists());
            assert!(record
                .local_path
                .starts_with(dir.path().join("uploads").join(&request_id)));
        }
        assert_eq!(metadata.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ids_follow_upload_order() {
        let dir = TempDir::new().unwrap();
        let (pipeline, metadata) = make_pipeline(&dir);

        let items = (0..4)
            .map(|i| UploadItem::new(format!("{}.png", i), png(4 + i, 4)))
            .collect();
        let report = pipeline.ingest("req", items).await.unwrap();

        for (i, id) in report.image_ids.iter().enumerate() {
            let record = metadata.get(id).await.unwrap().unwrap();
            let bytes = std::fs::read(&record.local_path).unwrap();
            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!(decoded.width(), 4 + i as u32);
        }
    }

    #[tokio::test]
    async fn test_bounded_batch_keeps_upload_order() {
        let dir = TempDir::new().unwrap();
        let config = IngestConfig {
            concurrency: 2,
            ..Default::default()
        };
        let (pipeline, metadata) = make_pipeline_with(&dir, config);

        // Larger items first so later ones tend to finish earlier
        let widths: Vec<u32> = (0..24).map(|i| 96 - 3 * i).collect();
        let items = widths
            .iter()
            .enumerate()
            .map(|(i, w)| UploadItem::new(format!("{:02}.png", i), png(*w, 8)))
            .collect();
        let report = pipeline.ingest("req", items).await.unwrap();

        assert_eq!(report.image_ids.len(), widths.len());
        for (id, width) in report.image_ids.iter().zip(&widths) {
            let record = metadata.get(id).await.unwrap().unwrap();
            let bytes = std::fs::read(&record.local_path).unwrap();
            assert_eq!(image::load_from_memory(&bytes).unwrap().width(), *width);
        }
    }

    #[tokio::test]
    async fn test_all_corrupt_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (pipeline, metadata) = make_pipeline(&dir);

        let items = vec![
            UploadItem::new("a", Bytes::from_static(b"nope")),
            UploadItem::new("b", Bytes::new()),
        ];
        let err = pipeline.ingest("req", items).await.unwrap_err();

        assert_matches!(err, Error::EmptyBatch { rejected: 2 });
        assert!(metadata.list().await.unwrap().is_empty());
        assert!(!dir.path().join("uploads").join("req").exists());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _) = make_pipeline(&dir);

        pipeline
            .ingest("req", vec![UploadItem::new("a.png", png(4, 4))])
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("uploads").join("req"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".webp"));
    }
}
