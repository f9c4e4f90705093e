//! Image Serving - the read path
//!
//! Cheapest tier first:
//!
//! ```text
//! ┌────────┐ miss ┌──────────────┐ miss ┌──────────────────────────┐
//! │ memory │─────▶│ local        │─────▶│ resolve original         │
//! └────────┘      │ processed    │      │  mirror → durable|upload │
//!     ▲ hit       └──────────────┘      └────────────┬─────────────┘
//!     │                 │ hit                        ▼
//!   return        fill memory,                   transform
//!                 touch, return                      │
//!                                   write local + memory, touch, return
//! ```
//!
//! Caches are pure performance layers: any tier failure degrades to the next
//! tier, except a transform failure, which is surfaced and never cached.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, instrument, warn};

use crate::cache::{
    is_valid_image_id, CacheKey, CacheMetrics, LocalCache, MemoryCache, OriginalSource,
};
use crate::durable::DurableClient;
use crate::error::{Error, Result};
use crate::imaging::{self, TransformParams};
use crate::metadata::{ImageRecord, MetadataStore};

/// Tier that produced a served image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    Memory,
    LocalProcessed,
    Transform(OriginalSource),
}

impl ServedFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServedFrom::Memory => "memory",
            ServedFrom::LocalProcessed => "local",
            ServedFrom::Transform(_) => "transform",
        }
    }
}

/// A served image variant
#[derive(Debug, Clone)]
pub struct ServedImage {
    pub data: Bytes,
    pub served_from: ServedFrom,
}

/// Image Service - read path over all tiers
pub struct ImageService {
    memory: Arc<MemoryCache>,
    local: Arc<LocalCache>,
    metadata: MetadataStore,
    durable: DurableClient,
    metrics: Arc<CacheMetrics>,
}

impl ImageService {
    pub fn new(
        memory: Arc<MemoryCache>,
        local: Arc<LocalCache>,
        metadata: MetadataStore,
        durable: DurableClient,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            memory,
            local,
            metadata,
            durable,
            metrics,
        }
    }

    /// Per-instance read-path counters
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Serve `(image_id, width, quality)`
    #[instrument(skip(self), fields(w = params.width, q = params.quality))]
    pub async fn fetch(&self, image_id: &str, params: TransformParams) -> Result<ServedImage> {
        if !is_valid_image_id(image_id) {
            return Err(Error::NotFound(image_id.to_string()));
        }
        let key = CacheKey::new(image_id, params.width, params.quality);

        // L1
        if let Some(data) = self.memory.get(&key) {
            self.metrics.record_memory_hit();
            return Ok(self.served(data, ServedFrom::Memory));
        }
        self.metrics.record_memory_miss();

        // L3 processed
        match self.local.read_processed(&key).await {
            Ok(Some(data)) => return self.serve_local_hit(key, data).await,
            Ok(None) => self.metrics.record_local_miss(),
            Err(e) => {
                warn!("Reading processed variant {} failed: {}", key, e);
                self.metrics.record_local_miss();
            }
        }

        // Original + transform
        let record = self
            .metadata
            .get(image_id)
            .await?
            .ok_or_else(|| Error::NotFound(image_id.to_string()))?;

        let (original, source) = match self.resolve_original(&record).await {
            Some(found) => found,
            None => {
                self.metrics.record_original_missing();
                return Err(Error::NotFound(image_id.to_string()));
            }
        };
        self.metrics.record_original(source);

        let data = match imaging::transform(image_id, original, params).await {
            Ok(data) => data,
            Err(e) => {
                self.metrics.record_transform_failure();
                error!("Transform failed: {}", e);
                return Err(match e {
                    Error::Transform { .. } => e,
                    other => Error::Transform {
                        image_id: image_id.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
        };
        self.metrics.record_transform();
        crate::metrics::TRANSFORMS.inc();

        if let Err(e) = self.local.write_processed(&key, &data).await {
            warn!("Caching processed variant {} failed: {}", key, e);
        }
        self.fill_memory(key, data.clone()).await;
        self.touch(image_id).await;

        Ok(self.served(data, ServedFrom::Transform(source)))
    }

    async fn serve_local_hit(&self, key: CacheKey, data: Bytes) -> Result<ServedImage> {
        self.metrics.record_local_hit();
        match self.metadata.touch(key.image_id()).await {
            Ok(true) => {}
            Ok(false) => {
                // A cached variant without a record cannot be served
                error!("Processed variant {} has no metadata record", key);
                return Err(Error::NotFound(key.image_id().to_string()));
            }
            Err(e) => warn!("Refreshing recency for {} failed: {}", key.image_id(), e),
        }
        self.fill_memory(key, data.clone()).await;
        Ok(self.served(data, ServedFrom::LocalProcessed))
    }

    /// Original bytes from the first tier that has them
    async fn resolve_original(&self, record: &ImageRecord) -> Option<(Bytes, OriginalSource)> {
        let id = record.id.as_str();

        match self.local.read_original(id).await {
            Ok(Some(data)) => return Some((data, OriginalSource::LocalMirror)),
            Ok(None) => {}
            Err(e) => warn!("Reading original mirror for {} failed: {}", id, e),
        }

        if record.is_saved {
            return self.fetch_durable(id).await;
        }

        match tokio::fs::read(&record.local_path).await {
            Ok(data) => {
                let data = Bytes::from(data);
                if !self.local.contains_path(&record.local_path) {
                    self.mirror(id, &data).await;
                }
                Some((data, OriginalSource::Upload))
            }
            Err(e) => {
                debug!(
                    "Upload {} for {} unavailable: {}",
                    record.local_path.display(),
                    id,
                    e
                );
                // A migration may have committed and removed the upload
                // after `record` was read
                match self.metadata.get(id).await {
                    Ok(Some(current)) if current.is_saved => {
                        debug!("{} was migrated mid-read, falling back to durable", id);
                        self.fetch_durable(id).await
                    }
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Re-reading record for {} failed: {}", id, e);
                        None
                    }
                }
            }
        }
    }

    /// Durable original, mirrored locally on success
    async fn fetch_durable(&self, id: &str) -> Option<(Bytes, OriginalSource)> {
        match self.durable.get(id).await {
            Ok(Some(data)) => {
                self.mirror(id, &data).await;
                Some((data, OriginalSource::Durable))
            }
            Ok(None) => {
                warn!("{} is marked saved but missing from the durable store", id);
                None
            }
            Err(e) => {
                warn!("Durable fetch for {} failed: {}", id, e);
                None
            }
        }
    }

    async fn mirror(&self, id: &str, data: &[u8]) {
        if let Err(e) = self.local.write_original(id, data).await {
            warn!("Mirroring original {} failed: {}", id, e);
        }
    }

    async fn fill_memory(&self, key: CacheKey, data: Bytes) {
        let evicted = self.memory.put(key, data).await;
        if evicted > 0 {
            self.metrics.record_memory_evictions(evicted as u64);
        }
    }

    async fn touch(&self, id: &str) {
        if let Err(e) = self.metadata.touch(id).await {
            warn!("Refreshing recency for {} failed: {}", id, e);
        }
    }

    fn served(&self, data: Bytes, served_from: ServedFrom) -> ServedImage {
        crate::metrics::IMAGES_SERVED
            .with_label_values(&[served_from.as_str()])
            .inc();
        ServedImage { data, served_from }
    }
}

// =============================================================================
// Tests
// =============================================================================
