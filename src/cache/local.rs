//! Local Cache (L3) - size-bounded on-disk cache
//!
//! Two disjoint namespaces under one root:
//!
//! ```text
//! {root}/
//! ├── {h[0..2]}/{h[2..4]}/{id}_{h}.webp   processed variants, h = sha256(id_w{w}_q{q})
//! └── originals/{id}                     original mirror, one per image
//! ```
//!
//! Paths are pure functions of the key so any instance sharing the root can
//! locate an entry without a registry lookup. Writes go to a unique temp file
//! and are renamed into place, so readers never observe a partial file.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::entry::CacheKey;
use super::{DEFAULT_LOCAL_CAPACITY, LOCAL_LOW_WATERMARK, ORIGINALS_DIR, PROCESSED_EXTENSION};
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;

/// Local cache configuration
#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    /// Cache root, exclusively owned by this component
    pub root: PathBuf,
    /// Ingest directory; temp-upload cleanup never leaves it
    pub uploads_dir: PathBuf,
    /// Byte ceiling enforced by [`LocalCache::enforce_capacity`]
    pub max_bytes: u64,
    /// Fraction of `max_bytes` to shrink to once the ceiling is crossed
    pub low_watermark: f64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("ssd_cache"),
            uploads_dir: PathBuf::from("uploads"),
            max_bytes: DEFAULT_LOCAL_CAPACITY,
            low_watermark: LOCAL_LOW_WATERMARK,
        }
    }
}

impl LocalCacheConfig {
    /// Reject configurations the cache cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(Error::Config("local cache size must be non-zero".to_string()));
        }
        if !(0.0..1.0).contains(&self.low_watermark) {
            return Err(Error::Config(format!(
                "local cache low watermark must be in [0, 1), got {}",
                self.low_watermark
            )));
        }
        Ok(())
    }

    /// Byte size the eviction pass shrinks to
    pub fn target_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.low_watermark) as u64
    }
}

/// Outcome of one capacity enforcement pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Total bytes on disk before the pass
    pub size_before: u64,
    /// Total bytes on disk after the pass
    pub size_after: u64,
    /// Ids whose files were removed, oldest first
    pub evicted: Vec<String>,
}

impl EvictionReport {
    /// Bytes reclaimed by the pass
    pub fn freed_bytes(&self) -> u64 {
        self.size_before.saturating_sub(self.size_after)
    }
}

/// Files on disk attributed to one image id
#[derive(Debug, Default)]
struct IdFiles {
    files: Vec<(PathBuf, u64)>,
}

/// Snapshot of the cache tree
#[derive(Debug, Default)]
struct TreeScan {
    total_bytes: u64,
    by_id: HashMap<String, IdFiles>,
}

/// Local Cache - on-disk processed variants and original mirrors
pub struct LocalCache {
    config: LocalCacheConfig,
}

impl LocalCache {
    /// Create a local cache over the configured directories
    pub fn new(config: LocalCacheConfig) -> Self {
        Self { config }
    }

    /// Create the cache root, original namespace and ingest directory
    pub async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.config.root.join(ORIGINALS_DIR)).await?;
        tokio::fs::create_dir_all(&self.config.uploads_dir).await?;
        Ok(())
    }

    /// Cache root
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Ingest directory
    pub fn uploads_dir(&self) -> &Path {
        &self.config.uploads_dir
    }

    /// Configuration
    pub fn config(&self) -> &LocalCacheConfig {
        &self.config
    }

    /// Whether `path` lives under the cache root
    pub fn contains_path(&self, path: &Path) -> bool {
        path.starts_with(&self.config.root)
    }

    // =========================================================================
    // Processed namespace
    // =========================================================================

    /// Deterministic on-disk location of a processed variant
    pub fn processed_path(&self, key: &CacheKey) -> PathBuf {
        let hash = key.content_hash();
        self.config
            .root
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(format!("{}_{}.{}", key.image_id(), hash, PROCESSED_EXTENSION))
    }

    /// Read a processed variant
    pub async fn read_processed(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        read_optional(&self.processed_path(key)).await
    }

    /// Write a processed variant, creating shard directories as needed
    pub async fn write_processed(&self, key: &CacheKey, data: &[u8]) -> Result<PathBuf> {
        let path = self.processed_path(key);
        write_atomic(&path, data).await?;
        Ok(path)
    }

    /// Remove every processed variant of an image, returning reclaimed bytes
    pub async fn delete_processed_for(&self, image_id: &str) -> Result<u64> {
        let scan = self.scan().await?;
        let Some(entry) = scan.by_id.get(image_id) else {
            return Ok(0);
        };
        let processed: Vec<_> = entry
            .files
            .iter()
            .filter(|(path, _)| !self.is_original_path(path))
            .cloned()
            .collect();
        Ok(remove_files(&processed).await)
    }

    // =========================================================================
    // Original namespace
    // =========================================================================

    /// On-disk location of an image's original mirror
    pub fn original_path(&self, image_id: &str) -> PathBuf {
        self.config.root.join(ORIGINALS_DIR).join(image_id)
    }

    fn is_original_path(&self, path: &Path) -> bool {
        path.parent() == Some(self.config.root.join(ORIGINALS_DIR).as_path())
    }

    /// Read an original mirror
    pub async fn read_original(&self, image_id: &str) -> Result<Option<Bytes>> {
        read_optional(&self.original_path(image_id)).await
    }

    /// Write an original mirror
    pub async fn write_original(&self, image_id: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.original_path(image_id);
        write_atomic(&path, data).await?;
        Ok(path)
    }

    /// Remove an original mirror, returning reclaimed bytes
    pub async fn delete_original(&self, image_id: &str) -> Result<u64> {
        let path = self.original_path(image_id);
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Total bytes under the cache root
    pub async fn total_size(&self) -> Result<u64> {
        Ok(self.scan().await?.total_bytes)
    }

    /// Shrink the cache below the low watermark once it exceeds its ceiling.
    ///
    /// Files whose id has no metadata row can never be served, so they go
    /// first. Remaining victims are taken oldest-first by the metadata store's
    /// `lastUsedAt`. Ids with nothing on disk are passed over without counting
    /// as evicted.
    #[instrument(skip(self, metadata), fields(max_bytes = self.config.max_bytes))]
    pub async fn enforce_capacity(&self, metadata: &MetadataStore) -> Result<EvictionReport> {
        let scan = self.scan().await?;
        let mut report = EvictionReport {
            size_before: scan.total_bytes,
            size_after: scan.total_bytes,
            evicted: Vec::new(),
        };

        if scan.total_bytes <= self.config.max_bytes {
            debug!(
                "Local cache at {} bytes, under ceiling of {}",
                scan.total_bytes, self.config.max_bytes
            );
            return Ok(report);
        }

        let target = self.config.target_bytes();
        info!(
            "Local cache at {} bytes exceeds {}, shrinking to {}",
            scan.total_bytes, self.config.max_bytes, target
        );

        let ids = metadata.ids_by_last_used().await?;
        let mut by_id = scan.by_id;
        let mut remaining = scan.total_bytes;

        let known: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut unowned: Vec<String> = by_id
            .keys()
            .filter(|id| !known.contains(id.as_str()))
            .cloned()
            .collect();
        unowned.sort();
        if !unowned.is_empty() {
            debug!("{} id(s) on disk have no metadata row", unowned.len());
        }

        for id in unowned.into_iter().chain(ids.iter().cloned()) {
            if remaining <= target {
                break;
            }
            let Some(entry) = by_id.remove(&id) else {
                continue;
            };
            let freed = remove_files(&entry.files).await;
            if freed == 0 {
                continue;
            }
            remaining = remaining.saturating_sub(freed);
            debug!("Evicted {} from local cache ({} bytes)", id, freed);
            report.evicted.push(id);
        }

        if remaining > target {
            warn!(
                "Local cache still at {} bytes after eviction pass (target {})",
                remaining, target
            );
        }

        report.size_after = remaining;
        Ok(report)
    }

    /// Walk the cache tree, attributing files to image ids
    async fn scan(&self) -> Result<TreeScan> {
        let root = self.config.root.clone();
        let originals = root.join(ORIGINALS_DIR);
        let scan = tokio::task::spawn_blocking(move || scan_tree(&root, &originals)).await?;
        Ok(scan)
    }

    // =========================================================================
    // Ingest area
    // =========================================================================

    /// Delete a migrated upload and, best-effort, its emptied request directory.
    ///
    /// The parent is only removed when it sits strictly inside the ingest
    /// directory; a non-empty parent is left alone.
    pub async fn delete_temp_upload(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            if parent.starts_with(&self.config.uploads_dir) && parent != self.config.uploads_dir {
                if let Err(e) = tokio::fs::remove_dir(parent).await {
                    debug!("Keeping upload directory {}: {}", parent.display(), e);
                }
            }
        }
        Ok(())
    }
}

fn scan_tree(root: &Path, originals: &Path) -> TreeScan {
    let mut scan = TreeScan::default();

    for entry in WalkDir::new(root).into_iter() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable cache entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        scan.total_bytes += size;

        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let id = if entry.path().parent() == Some(originals) {
            Some(name.to_string())
        } else {
            processed_id(name)
        };
        if let Some(id) = id {
            scan.by_id
                .entry(id)
                .or_default()
                .files
                .push((entry.into_path(), size));
        }
    }

    scan
}

/// Extract the image id from a processed file name `{id}_{sha256hex}.webp`
fn processed_id(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(&format!(".{}", PROCESSED_EXTENSION))?;
    let (id, hash) = stem.rsplit_once('_')?;
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) || id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

async fn read_optional(path: &Path) -> Result<Option<Bytes>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write to a unique sibling temp file, then rename over `path`
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Remove files, logging and skipping individual failures
async fn remove_files(files: &[(PathBuf, u64)]) -> u64 {
    let mut freed = 0;
    for (path, size) in files {
        match tokio::fs::remove_file(path).await {
            Ok(()) => freed += size,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    freed
}

// =============================================================================
// Tests
// =============================================================================
