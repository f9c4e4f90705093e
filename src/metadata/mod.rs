//! Metadata Store
//!
//! Source of truth for "has this id been durably saved" and "when was it
//! last read". One row per image, never deleted by this crate.
//!
//! The reconciliation claim is the only place true mutual exclusion is
//! needed; it is a conditional UPDATE whose row count decides the winner, so
//! several processes may share one database file.

mod store;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use store::MetadataStore;

/// Persisted state of one uploaded image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Opaque, immutable image id
    pub id: String,
    /// Upload location; not valid once `is_saved` is set
    pub local_path: PathBuf,
    /// Durable copy exists
    pub is_saved: bool,
    /// A migration attempt holds the claim
    pub is_processing: bool,
    /// When the current claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
    /// Creation time
    pub uploaded_at: DateTime<Utc>,
    /// Last serve or memory-eviction flush
    pub last_used_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Whether the reconciliation loop may attempt to claim this record
    pub fn is_claimable(&self) -> bool {
        !self.is_saved && !self.is_processing
    }
}

/// Row to insert for a freshly ingested image
#[derive(Debug, Clone)]
pub struct NewImageRecord {
    pub id: String,
    pub local_path: PathBuf,
}

impl NewImageRecord {
    pub fn new(id: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            local_path: local_path.into(),
        }
    }
}
