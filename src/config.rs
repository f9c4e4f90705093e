//! Command-line and environment configuration
//!
//! Every flag has an environment fallback so the service can be configured
//! the same way in containers and on a workstation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::cache::{LocalCacheConfig, MemoryCacheConfig, LOCAL_LOW_WATERMARK};
use crate::durable::S3DurableStoreConfig;
use crate::error::{Error, Result};
use crate::imaging;
use crate::ingest::IngestConfig;
use crate::reconcile::ReconcileConfig;
use crate::server::ServerConfig;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Inkcache - tiered image cache for manga pages
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Listen host
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// SQLite metadata database
    #[arg(long, env = "DATABASE_PATH", default_value = "data/inkcache.db")]
    pub database_path: PathBuf,

    /// Ingest directory for freshly uploaded images
    #[arg(long, env = "UPLOADS_DIR", default_value = "uploads")]
    pub uploads_dir: PathBuf,

    /// Local cache root (processed variants and original mirrors)
    #[arg(long, env = "SHARED_SSD_CACHE_DIR", default_value = "ssd_cache")]
    pub cache_dir: PathBuf,

    /// Local cache ceiling in GiB
    #[arg(long, env = "MAX_SHARED_SSD_SIZE_GB", default_value = "10")]
    pub max_cache_size_gb: f64,

    /// Memory cache entry ceiling
    #[arg(long, env = "MAX_RAM_CACHE_SIZE", default_value = "100")]
    pub max_memory_entries: usize,

    /// Idle window after which memory entries are dropped
    #[arg(long, env = "RAM_CACHE_IDLE_SECONDS", default_value = "3600")]
    pub memory_idle_seconds: u64,

    /// Memory inactivity sweep interval
    #[arg(long, env = "RAM_CACHE_SWEEP_INTERVAL_SECONDS", default_value = "60")]
    pub memory_sweep_interval_seconds: u64,

    /// Inactivity before an upload becomes eligible for migration
    #[arg(long, env = "BACKTRACK_DURATION_IN_SECONDS", default_value = "172800")]
    pub backtrack_seconds: u64,

    /// Reconciliation interval
    #[arg(long, env = "RECONCILE_INTERVAL_SECONDS", default_value = "60")]
    pub reconcile_interval_seconds: u64,

    /// Local cache capacity enforcement interval
    #[arg(long, env = "SHARED_SSD_CACHE_DURATION_IN_SECONDS", default_value = "3600")]
    pub local_eviction_interval_seconds: u64,

    /// Ingest-area orphan GC interval
    #[arg(long, env = "GC_INTERVAL_SECONDS", default_value = "86400")]
    pub gc_interval_seconds: u64,

    /// Minimum age before an ingest-area file may be collected
    #[arg(long, env = "GC_GRACE_SECONDS", default_value = "3600")]
    pub gc_grace_seconds: u64,

    /// `Cache-Control` max-age for served variants
    #[arg(long, env = "CACHE_MAX_AGE", default_value = "2592000")]
    pub cache_max_age: u64,

    /// Upload body ceiling in bytes
    #[arg(long, env = "MAX_UPLOAD_SIZE", default_value = "1073741824")]
    pub max_upload_size: usize,

    /// Encoder quality for the canonical ingest encoding
    #[arg(long, env = "INGEST_QUALITY", default_value = "75")]
    pub ingest_quality: u8,

    /// Upload items normalized in parallel; defaults to the CPU count
    #[arg(long, env = "INGEST_CONCURRENCY")]
    pub ingest_concurrency: Option<usize>,

    /// Timeout for a single durable store call
    #[arg(long, env = "DURABLE_TIMEOUT_SECONDS", default_value = "300")]
    pub durable_timeout_seconds: u64,

    /// S3 endpoint (MinIO, R2, ...)
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// S3 access key id
    #[arg(long, env = "S3_ACCESS_KEY_ID")]
    pub s3_access_key_id: Option<String>,

    /// S3 secret access key
    #[arg(long, env = "S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub s3_secret_access_key: Option<String>,

    /// S3 bucket holding durable originals
    #[arg(long, env = "S3_BUCKET_NAME")]
    pub s3_bucket: String,

    /// S3 region
    #[arg(long, env = "S3_REGION")]
    pub s3_region: Option<String>,

    /// Use virtual-hosted style bucket addressing
    #[arg(long, env = "S3_VIRTUAL_HOSTED_STYLE")]
    pub s3_virtual_hosted_style: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    /// Reject settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        self.memory_cache()?;
        self.local_cache()?;
        imaging::validate_quality(self.ingest_quality)
            .map_err(|e| Error::Config(format!("INGEST_QUALITY: {}", e)))?;
        if self.ingest_concurrency == Some(0) {
            return Err(Error::Config("INGEST_CONCURRENCY must be positive".to_string()));
        }

        for (name, secs) in [
            ("RAM_CACHE_SWEEP_INTERVAL_SECONDS", self.memory_sweep_interval_seconds),
            ("RECONCILE_INTERVAL_SECONDS", self.reconcile_interval_seconds),
            ("SHARED_SSD_CACHE_DURATION_IN_SECONDS", self.local_eviction_interval_seconds),
            ("GC_INTERVAL_SECONDS", self.gc_interval_seconds),
            ("DURABLE_TIMEOUT_SECONDS", self.durable_timeout_seconds),
        ] {
            if secs == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        if self.max_upload_size == 0 {
            return Err(Error::Config("MAX_UPLOAD_SIZE must be positive".to_string()));
        }
        if self.s3_bucket.trim().is_empty() {
            return Err(Error::Config("S3_BUCKET_NAME is required".to_string()));
        }
        if self.s3_access_key_id.is_some() != self.s3_secret_access_key.is_some() {
            return Err(Error::Config(
                "S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together".to_string(),
            ));
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address {}:{}: {}", self.host, self.port, e)))
    }

    pub fn memory_cache(&self) -> Result<MemoryCacheConfig> {
        let config = MemoryCacheConfig {
            max_entries: self.max_memory_entries,
            idle_timeout: Duration::from_secs(self.memory_idle_seconds),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn local_cache(&self) -> Result<LocalCacheConfig> {
        if !self.max_cache_size_gb.is_finite() || self.max_cache_size_gb <= 0.0 {
            return Err(Error::Config(format!(
                "MAX_SHARED_SSD_SIZE_GB must be positive, got {}",
                self.max_cache_size_gb
            )));
        }
        let config = LocalCacheConfig {
            root: self.cache_dir.clone(),
            uploads_dir: self.uploads_dir.clone(),
            max_bytes: (self.max_cache_size_gb * GIB) as u64,
            low_watermark: LOCAL_LOW_WATERMARK,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn ingest(&self) -> IngestConfig {
        let defaults = IngestConfig::default();
        IngestConfig {
            quality: self.ingest_quality,
            concurrency: self.ingest_concurrency.unwrap_or(defaults.concurrency),
        }
    }

    pub fn reconcile(&self) -> ReconcileConfig {
        ReconcileConfig {
            backtrack: Duration::from_secs(self.backtrack_seconds),
            stale_claim_after: self.durable_timeout() * 2,
        }
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            cache_max_age: Duration::from_secs(self.cache_max_age),
            max_upload_size: self.max_upload_size,
        }
    }

    pub fn s3(&self) -> S3DurableStoreConfig {
        let mut config = S3DurableStoreConfig::new(self.s3_bucket.clone());
        if let Some(endpoint) = &self.s3_endpoint {
            config = config.with_endpoint_url(endpoint.clone());
        }
        if let Some(region) = &self.s3_region {
            config = config.with_region(region.clone());
        }
        if let (Some(key), Some(secret)) = (&self.s3_access_key_id, &self.s3_secret_access_key) {
            config = config.with_credentials(key.clone(), secret.clone());
        }
        config.virtual_hosted_style = self.s3_virtual_hosted_style;
        config
    }

    pub fn durable_timeout(&self) -> Duration {
        Duration::from_secs(self.durable_timeout_seconds)
    }

    pub fn memory_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.memory_sweep_interval_seconds)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    pub fn local_eviction_interval(&self) -> Duration {
        Duration::from_secs(self.local_eviction_interval_seconds)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_seconds)
    }

    pub fn gc_grace(&self) -> Duration {
        Duration::from_secs(self.gc_grace_seconds)
    }
}

// =============================================================================
// Tests
// =============================================================================
