//! Inkcache - Tiered Image Cache for Manga Pages
//!
//! Receives uploaded page images, normalizes them, and serves resized
//! variants while keeping a bounded amount of data in memory and on local
//! disk. The authoritative copy is migrated to a durable object store once
//! an upload goes cold.
//!
//! # Architecture
//!
//! ```text
//!   GET /image ──▶ Memory (L1) ──▶ Local processed (L3) ──▶ original ──▶ transform
//!                                                            │
//!                                   local mirror ◀───────────┤
//!                                   durable store ◀──────────┤ (isSaved)
//!                                   ingest dir ◀─────────────┘
//!
//!   POST /upload ──▶ Ingest ──▶ ingest dir + metadata rows
//!
//!   timers: reconcile (ingest dir → durable), memory sweep,
//!           local eviction, orphan GC
//! ```
//!
//! The metadata store is the single arbiter of migration rights; every
//! other layer is a cache that may be lost and repopulated.
//!
//! # Modules
//!
//! - [`cache`] - Memory and local disk tiers
//! - [`config`] - CLI / environment configuration
//! - [`durable`] - Durable object store clients
//! - [`error`] - Error types
//! - [`imaging`] - Decode, resize, encode
//! - [`ingest`] - Upload ingest pipeline
//! - [`maintenance`] - Periodic sweeps and orphan GC
//! - [`metadata`] - SQLite metadata store
//! - [`metrics`] - Prometheus metrics
//! - [`reconcile`] - Local → durable migration
//! - [`server`] - HTTP routes
//! - [`serving`] - Read path across tiers

pub mod cache;
pub mod config;
pub mod durable;
pub mod error;
pub mod imaging;
pub mod ingest;
pub mod maintenance;
pub mod metadata;
pub mod metrics;
pub mod reconcile;
pub mod server;
pub mod serving;

// Re-export commonly used types
pub use cache::{CacheKey, LocalCache, MemoryCache};
pub use error::{Error, Result};
pub use metadata::{ImageRecord, MetadataStore};
pub use serving::ImageService;
