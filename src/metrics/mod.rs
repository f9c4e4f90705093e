//! Prometheus metrics
//!
//! Process-wide counters registered in the default registry and exposed on
//! `GET /metrics`. Per-instance read-path counters live in
//! [`crate::cache::CacheMetrics`].

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

use crate::error::{Error, Result};

pub static IMAGES_SERVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "inkcache_images_served_total",
        "Images served, by the tier that produced them",
        &["tier"]
    )
    .expect("metric registration")
});

pub static TRANSFORMS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "inkcache_transforms_total",
        "Resize and re-encode operations on the read path"
    )
    .expect("metric registration")
});

pub static MEMORY_EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "inkcache_memory_evictions_total",
        "Entries removed from the memory cache"
    )
    .expect("metric registration")
});

pub static LOCAL_EVICTED_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "inkcache_local_evicted_bytes_total",
        "Bytes reclaimed from the local cache by capacity enforcement"
    )
    .expect("metric registration")
});

pub static UPLOADS_ACCEPTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "inkcache_uploads_accepted_total",
        "Images registered by the ingest pipeline"
    )
    .expect("metric registration")
});

pub static UPLOADS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "inkcache_uploads_rejected_total",
        "Upload items rejected by the ingest pipeline"
    )
    .expect("metric registration")
});

pub static MIGRATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "inkcache_migrations_total",
        "Reconciliation outcomes per candidate",
        &["outcome"]
    )
    .expect("metric registration")
});

pub static GC_DELETED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "inkcache_gc_deleted_total",
        "Ingest-area files removed by the orphan sweep"
    )
    .expect("metric registration")
});

pub static TASK_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "inkcache_task_failures_total",
        "Periodic task ticks that returned an error or panicked",
        &["task"]
    )
    .expect("metric registration")
});

pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "inkcache_http_requests_total",
        "HTTP requests by route and status",
        &["route", "status"]
    )
    .expect("metric registration")
});

/// Render every registered metric in the text exposition format.
///
/// Returns the body and its content type.
pub fn render() -> Result<(Vec<u8>, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
    Ok((buffer, encoder.format_type().to_string()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_touched_metrics() {
        TRANSFORMS.inc();
        MIGRATIONS.with_label_values(&["saved"]).inc();

        let (body, content_type) = render().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("inkcache_transforms_total"));
        assert!(text.contains("inkcache_migrations_total{outcome=\"saved\"}"));
    }
}
