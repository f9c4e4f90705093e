//! Durable Store
//!
//! Remote object storage holding the authoritative copy of every migrated
//! original. Accessed only by key; retry policy belongs to the caller.

mod s3;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::warn;

use crate::error::{Error, Result};

pub use s3::{S3DurableStore, S3DurableStoreConfig};

/// Default per-call timeout for durable store operations
pub const DEFAULT_DURABLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Durable object store backend
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Store an object, overwriting any previous value
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fetch an object; `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Durable store access with a request-level timeout on every call
#[derive(Clone)]
pub struct DurableClient {
    store: Arc<dyn DurableStore>,
    timeout: Duration,
}

impl DurableClient {
    /// Wrap a backend
    pub fn new(store: Arc<dyn DurableStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Store an object. A timeout aborts the call and counts as a failure.
    pub async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.store.put(key, data)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "{} put for {} timed out after {:?}",
                    self.store.name(),
                    key,
                    self.timeout
                );
                Err(Error::DurableTimeout {
                    key: key.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Fetch an object
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match tokio::time::timeout(self.timeout, self.store.get(key)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DurableTimeout {
                key: key.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

impl std::fmt::Debug for DurableClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableClient")
            .field("backend", &self.store.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

/// In-memory durable store for tests and local development
#[derive(Default)]
pub struct InMemoryDurableStore {
    objects: DashMap<String, Bytes>,
    puts: AtomicU64,
    gets: AtomicU64,
    fail_puts: AtomicBool,
    latency_ms: AtomicU64,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail (or succeed again)
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `put` calls that stored an object
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `get` calls
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Whether `key` is stored
    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.simulate_latency().await;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(Error::DurableStore {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.objects.insert(key.to_string(), data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.simulate_latency().await;
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.get(key).map(|data| data.clone()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// =============================================================================
// Tests
// =============================================================================
