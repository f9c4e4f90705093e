//! Cache Metrics Collection
//!
//! Per-instance counters for the read path. The transform counter doubles as
//! the hook for verifying that a warm cache never re-runs the codec.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Where the original bytes for a transform came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginalSource {
    /// Local cache original-namespace mirror
    LocalMirror,
    /// Durable object store
    Durable,
    /// Not-yet-migrated upload in the ingest directory
    Upload,
}

impl std::fmt::Display for OriginalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginalSource::LocalMirror => write!(f, "local_mirror"),
            OriginalSource::Durable => write!(f, "durable"),
            OriginalSource::Upload => write!(f, "upload"),
        }
    }
}

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Memory tier
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    memory_evictions: AtomicU64,

    // Local tier
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    local_evictions: AtomicU64,
    local_freed_bytes: AtomicU64,

    // Original resolution
    originals_from_mirror: AtomicU64,
    originals_from_durable: AtomicU64,
    originals_from_upload: AtomicU64,
    originals_missing: AtomicU64,

    // Codec
    transforms: AtomicU64,
    transform_failures: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_miss(&self) {
        self.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_evictions(&self, count: u64) {
        self.memory_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_miss(&self) {
        self.local_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_eviction(&self, ids: u64, freed_bytes: u64) {
        self.local_evictions.fetch_add(ids, Ordering::Relaxed);
        self.local_freed_bytes
            .fetch_add(freed_bytes, Ordering::Relaxed);
    }

    pub fn record_original(&self, source: OriginalSource) {
        let counter = match source {
            OriginalSource::LocalMirror => &self.originals_from_mirror,
            OriginalSource::Durable => &self.originals_from_durable,
            OriginalSource::Upload => &self.originals_from_upload,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_original_missing(&self) {
        self.originals_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transform(&self) {
        self.transforms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transform_failure(&self) {
        self.transform_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transforms(&self) -> u64 {
        self.transforms.load(Ordering::Relaxed)
    }

    pub fn memory_hit_ratio(&self) -> f64 {
        let hits = self.memory_hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.memory_misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Take a point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
            memory_evictions: self.memory_evictions.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            local_misses: self.local_misses.load(Ordering::Relaxed),
            local_evictions: self.local_evictions.load(Ordering::Relaxed),
            local_freed_bytes: self.local_freed_bytes.load(Ordering::Relaxed),
            originals_from_mirror: self.originals_from_mirror.load(Ordering::Relaxed),
            originals_from_durable: self.originals_from_durable.load(Ordering::Relaxed),
            originals_from_upload: self.originals_from_upload.load(Ordering::Relaxed),
            originals_missing: self.originals_missing.load(Ordering::Relaxed),
            transforms: self.transforms.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            memory_hit_ratio: self.memory_hit_ratio(),
        }
    }
}

/// Point-in-time copy of [`CacheMetrics`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub memory_evictions: u64,
    pub local_hits: u64,
    pub local_misses: u64,
    pub local_evictions: u64,
    pub local_freed_bytes: u64,
    pub originals_from_mirror: u64,
    pub originals_from_durable: u64,
    pub originals_from_upload: u64,
    pub originals_missing: u64,
    pub transforms: u64,
    pub transform_failures: u64,
    pub memory_hit_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================
