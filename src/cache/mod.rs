//! Two-Tier Image Cache
//!
//! Memory (L1) and local disk (L3) tiers in front of the durable store.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Read Path                               │
//! ├───────────────────────────────────────────────────────────────┤
//! │  L1 Memory Cache      │ L3 Local Cache       │ Durable Store   │
//! │  ┌────────────────┐   │ ┌────────────────┐   │ ┌────────────┐  │
//! │  │ LRU by entry   │   │ │ processed/     │   │ │ put / get  │  │
//! │  │ count          │   │ │ originals/     │   │ │ by id      │  │
//! │  └────────────────┘   │ └────────────────┘   │ └────────────┘  │
//! │         │             │         │            │       │         │
//! │   idle sweep          │   byte ceiling,      │  reconciliation │
//! │   + recency flush     │   oldest lastUsedAt  │  loop           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no L2: the level between memory and local disk is deliberately
//! absent in this design.

mod entry;
mod local;
mod memory;
mod metrics;

pub use entry::{CacheKey, MemoryEntry};
pub use local::{EvictionReport, LocalCache, LocalCacheConfig};
pub(crate) use local::write_atomic;
pub use memory::{EvictionListener, MemoryCache, MemoryCacheConfig, MemoryCacheStats};
pub use metrics::{CacheMetrics, MetricsSnapshot, OriginalSource};

/// Default memory-tier capacity in entries
pub const DEFAULT_MEMORY_ENTRIES: usize = 100;

/// Default local-tier capacity (10GB)
pub const DEFAULT_LOCAL_CAPACITY: u64 = 10 * 1024 * 1024 * 1024;

/// Fraction of the local ceiling an eviction pass shrinks to
pub const LOCAL_LOW_WATERMARK: f64 = 0.8;

/// Sub-directory of the local root holding original mirrors
pub const ORIGINALS_DIR: &str = "originals";

/// File extension of processed variants
pub const PROCESSED_EXTENSION: &str = "webp";

/// Whether an image id is safe to embed in cache paths.
///
/// Ids are minted as UUIDs; anything outside `[A-Za-z0-9_-]` cannot name a
/// stored image and must never reach the filesystem.
pub fn is_valid_image_id(image_id: &str) -> bool {
    !image_id.is_empty()
        && image_id.len() <= 128
        && image_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// =============================================================================
// Tests
// =============================================================================
