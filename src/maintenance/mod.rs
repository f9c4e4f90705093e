//! Background Maintenance
//!
//! Four independent periodic tasks share the caches and the metadata store:
//!
//! | Task             | Work                                   |
//! |------------------|----------------------------------------|
//! | `reconcile`      | local → durable migration              |
//! | `memory-sweep`   | drop idle memory entries               |
//! | `local-eviction` | shrink the local cache below its limit |
//! | `orphan-gc`      | delete redundant ingest-area files     |
//!
//! Each tick runs in its own task so a panic is caught at the join handle
//! and logged; neither the timer nor the process goes down with it. A tick
//! that overruns its period causes missed ticks to be skipped, never queued.

mod gc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::{CacheMetrics, LocalCache, MemoryCache};
use crate::error::Result;
use crate::metadata::MetadataStore;
use crate::reconcile::Reconciler;

pub use gc::{GcReport, OrphanCollector, DEFAULT_GC_GRACE};

/// One unit of periodic background work
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// Stable name for logs and metrics
    fn name(&self) -> &'static str;

    /// Run a single tick
    async fn run_tick(&self) -> Result<()>;
}

/// Drive `task` every `period` until `cancel` fires.
///
/// The first tick happens one period after start.
pub fn spawn_periodic(
    task: Arc<dyn PeriodicTask>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = task.name();
        info!("Starting periodic task {} every {:?}", name, period);

        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Periodic task {} shutting down", name);
                    break;
                }
                _ = tick.tick() => {
                    run_guarded(Arc::clone(&task)).await;
                }
            }
        }
    })
}

/// Run one tick in isolation, logging errors and panics
async fn run_guarded(task: Arc<dyn PeriodicTask>) {
    let name = task.name();
    let handle = tokio::spawn(async move { task.run_tick().await });
    match handle.await {
        Ok(Ok(())) => debug!("Periodic task {} tick complete", name),
        Ok(Err(e)) => {
            crate::metrics::TASK_FAILURES.with_label_values(&[name]).inc();
            error!("Periodic task {} failed: {}", name, e);
        }
        Err(e) => {
            crate::metrics::TASK_FAILURES.with_label_values(&[name]).inc();
            error!("Periodic task {} panicked: {}", name, e);
        }
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Memory cache inactivity sweep
pub struct MemorySweepTask {
    memory: Arc<MemoryCache>,
}

impl MemorySweepTask {
    pub fn new(memory: Arc<MemoryCache>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl PeriodicTask for MemorySweepTask {
    fn name(&self) -> &'static str {
        "memory-sweep"
    }

    async fn run_tick(&self) -> Result<()> {
        let removed = self.memory.sweep_inactive().await;
        if removed > 0 {
            info!("Memory sweep removed {} idle entr(ies)", removed);
        }
        Ok(())
    }
}

/// Local cache capacity enforcement
pub struct LocalEvictionTask {
    local: Arc<LocalCache>,
    metadata: MetadataStore,
    metrics: Arc<CacheMetrics>,
}

impl LocalEvictionTask {
    pub fn new(local: Arc<LocalCache>, metadata: MetadataStore, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            local,
            metadata,
            metrics,
        }
    }
}

#[async_trait]
impl PeriodicTask for LocalEvictionTask {
    fn name(&self) -> &'static str {
        "local-eviction"
    }

    async fn run_tick(&self) -> Result<()> {
        let report = self.local.enforce_capacity(&self.metadata).await?;
        if !report.evicted.is_empty() {
            self.metrics
                .record_local_eviction(report.evicted.len() as u64, report.freed_bytes());
            crate::metrics::LOCAL_EVICTED_BYTES.inc_by(report.freed_bytes());
            info!(
                "Local eviction freed {} bytes from {} image(s)",
                report.freed_bytes(),
                report.evicted.len()
            );
        }
        Ok(())
    }
}

/// Local → durable migration sweep
pub struct ReconcileTask {
    reconciler: Arc<Reconciler>,
}

impl ReconcileTask {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl PeriodicTask for ReconcileTask {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    async fn run_tick(&self) -> Result<()> {
        self.reconciler.run_once().await?;
        Ok(())
    }
}

/// Ingest-area orphan GC
pub struct OrphanGcTask {
    collector: OrphanCollector,
}

impl OrphanGcTask {
    pub fn new(collector: OrphanCollector) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl PeriodicTask for OrphanGcTask {
    fn name(&self) -> &'static str {
        "orphan-gc"
    }

    async fn run_tick(&self) -> Result<()> {
        self.collector.run_once().await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts ticks; fails or panics on selected ticks
    struct FlakyTask {
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl PeriodicTask for FlakyTask {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn run_tick(&self) -> Result<()> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => panic!("first tick explodes"),
                1 => Err(Error::Internal("second tick fails".to_string())),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_panics_and_errors_do_not_stop_the_timer() {
        let task = Arc::new(FlakyTask {
            ticks: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let handle = spawn_periodic(task.clone(), Duration::from_millis(10), cancel.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while task.ticks.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timer kept ticking");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_before_first_tick() {
        let task = Arc::new(FlakyTask {
            ticks: AtomicUsize::new(2),
        });
        let cancel = CancellationToken::new();
        let handle = spawn_periodic(task.clone(), Duration::from_secs(3600), cancel.clone());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(task.ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_memory_sweep_task_runs() {
        use crate::cache::{CacheKey, MemoryCacheConfig};
        use bytes::Bytes;

        let memory = Arc::new(MemoryCache::new(MemoryCacheConfig {
            max_entries: 4,
            idle_timeout: Duration::ZERO,
        }));
        memory
            .put(CacheKey::new("a", 10, 10), Bytes::from_static(b"a"))
            .await;
        std::thread::sleep(Duration::from_millis(2));

        MemorySweepTask::new(memory.clone()).run_tick().await.unwrap();
        assert!(memory.is_empty());
    }
}
