//! Inkcache service binary
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          inkcache                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HTTP ──▶ ImageService ──▶ Memory ─▶ Local ─▶ Durable (S3)  │
//! │       └─▶ IngestPipeline ──▶ uploads/ + SQLite              │
//! │                                                             │
//! │  reconcile · memory-sweep · local-eviction · orphan-gc      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use inkcache::cache::{CacheMetrics, LocalCache, MemoryCache};
use inkcache::config::Args;
use inkcache::durable::{DurableClient, S3DurableStore};
use inkcache::ingest::IngestPipeline;
use inkcache::maintenance::{
    spawn_periodic, LocalEvictionTask, MemorySweepTask, OrphanCollector, OrphanGcTask,
    ReconcileTask,
};
use inkcache::metadata::MetadataStore;
use inkcache::reconcile::Reconciler;
use inkcache::server::{self, AppState};
use inkcache::serving::ImageService;

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);
    args.validate().context("invalid configuration")?;

    info!("Starting inkcache");
    info!("  Uploads dir: {}", args.uploads_dir.display());
    info!("  Local cache: {} ({} GiB)", args.cache_dir.display(), args.max_cache_size_gb);
    info!("  Memory cache: {} entries", args.max_memory_entries);
    info!("  Backtrack: {}s", args.backtrack_seconds);
    info!("  Bucket: {}", args.s3_bucket);

    // Metadata store is the one dependency the service cannot start without
    let metadata = MetadataStore::open(&args.database_path).with_context(|| {
        format!("opening metadata store at {}", args.database_path.display())
    })?;
    metadata.ping().await.context("metadata store unreachable")?;

    let local = Arc::new(LocalCache::new(args.local_cache()?));
    local
        .ensure_dirs()
        .await
        .context("creating cache and upload directories")?;

    let memory = Arc::new(MemoryCache::with_listener(
        args.memory_cache()?,
        Arc::new(metadata.clone()),
    ));

    let s3 = S3DurableStore::new(args.s3())
        .await
        .context("configuring durable store")?;
    let durable = DurableClient::new(Arc::new(s3), args.durable_timeout());

    let metrics = Arc::new(CacheMetrics::new());
    let images = ImageService::new(
        memory.clone(),
        local.clone(),
        metadata.clone(),
        durable.clone(),
        metrics.clone(),
    );
    let ingest = IngestPipeline::new(local.clone(), metadata.clone(), args.ingest());
    let reconciler = Arc::new(Reconciler::new(
        metadata.clone(),
        local.clone(),
        memory.clone(),
        durable,
        args.reconcile(),
    ));

    // Background loops
    let cancel = CancellationToken::new();
    let tasks = vec![
        spawn_periodic(
            Arc::new(ReconcileTask::new(reconciler)),
            args.reconcile_interval(),
            cancel.clone(),
        ),
        spawn_periodic(
            Arc::new(MemorySweepTask::new(memory.clone())),
            args.memory_sweep_interval(),
            cancel.clone(),
        ),
        spawn_periodic(
            Arc::new(LocalEvictionTask::new(local.clone(), metadata.clone(), metrics)),
            args.local_eviction_interval(),
            cancel.clone(),
        ),
        spawn_periodic(
            Arc::new(OrphanGcTask::new(OrphanCollector::new(
                local.clone(),
                metadata.clone(),
                args.gc_grace(),
            ))),
            args.gc_interval(),
            cancel.clone(),
        ),
    ];

    // HTTP
    let addr = args.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    let state = Arc::new(AppState::new(images, ingest, metadata, args.server())?);
    let server_handle = tokio::spawn(server::serve(listener, state, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("Shutdown requested");

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Periodic task ended abnormally: {}", e);
        }
    }
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Image server error: {}", e),
        Err(e) => error!("Image server task failed: {}", e),
    }

    memory.close().await;
    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "aws_config=warn", "aws_smithy_runtime=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
