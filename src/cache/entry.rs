//! Cache Entry Types
//!
//! Keys shared by the memory and local tiers, plus the memory-tier entry.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Cache key - composite of image id and transform parameters
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Opaque image id
    image_id: String,
    /// Target width in pixels
    width: u32,
    /// Encoder quality (1-100)
    quality: u8,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(image_id: impl Into<String>, width: u32, quality: u8) -> Self {
        Self {
            image_id: image_id.into(),
            width,
            quality,
        }
    }

    /// Get the image id
    #[inline]
    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    /// Get the target width
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Get the encoder quality
    #[inline]
    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Hex digest of the composite key, used to address the on-disk variant
    pub fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        hex::encode(digest)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_w{}_q{}", self.image_id, self.width, self.quality)
    }
}

/// Memory-tier entry: bytes plus access recency
#[derive(Clone)]
pub struct MemoryEntry {
    /// Cached encoded image
    data: Bytes,
    /// Wall-clock-free recency for the inactivity sweep
    last_used: Instant,
    /// Logical access clock; strictly increasing across the whole cache
    sequence: u64,
    /// Selected as an eviction victim; still resident until the listener returns
    evicting: bool,
}

impl MemoryEntry {
    /// Create a new entry stamped with the given access sequence
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self {
            data,
            last_used: Instant::now(),
            sequence,
            evicting: false,
        }
    }

    /// Refresh recency
    #[inline]
    pub fn touch(&mut self, sequence: u64) {
        self.last_used = Instant::now();
        self.sequence = sequence;
    }

    /// Get data (zero-copy)
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Get data size
    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Last access instant
    #[inline]
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Logical access sequence (lower = older)
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Mark as chosen for eviction
    #[inline]
    pub fn mark_evicting(&mut self) {
        self.evicting = true;
    }

    /// Whether an eviction of this entry is in flight
    #[inline]
    pub fn is_evicting(&self) -> bool {
        self.evicting
    }
}

impl fmt::Debug for MemoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEntry")
            .field("size", &self.size())
            .field("sequence", &self.sequence)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
