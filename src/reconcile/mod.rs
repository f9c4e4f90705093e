//! Reconciliation Loop - local to durable migration
//!
//! Moves aged uploads into the durable store exactly once, even when several
//! workers (or instances) sweep the same rows.
//!
//! # Guarantees
//!
//! 1. Only the worker whose conditional claim succeeds touches an id
//! 2. The local upload is deleted only after the durable put and the
//!    `isSaved` flip both succeeded
//! 3. Any failure releases the claim, so the id is retried on a later sweep
//! 4. One failing id never stops the rest of the batch

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{LocalCache, MemoryCache};
use crate::durable::{DurableClient, DEFAULT_DURABLE_TIMEOUT};
use crate::error::Result;
use crate::metadata::{ImageRecord, MetadataStore};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Minimum inactivity before an upload is eligible for migration
    pub backtrack: Duration,

    /// Claims older than this are presumed abandoned and released
    pub stale_claim_after: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            backtrack: Duration::from_secs(2 * 24 * 60 * 60), // 2 days
            stale_claim_after: DEFAULT_DURABLE_TIMEOUT * 2,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// What happened to one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationOutcome {
    /// Durably stored and local copy released
    Saved,
    /// Still resident in memory, left for a later sweep
    SkippedHot,
    /// Another worker holds the claim
    LostClaim,
    /// Attempt failed; claim released for retry
    Failed,
}

impl MigrationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationOutcome::Saved => "saved",
            MigrationOutcome::SkippedHot => "skipped_hot",
            MigrationOutcome::LostClaim => "lost_claim",
            MigrationOutcome::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub candidates: usize,
    pub saved: usize,
    pub skipped_hot: usize,
    pub lost_claims: usize,
    pub failed: usize,
    pub stale_claims_released: usize,
}

impl ReconcileReport {
    fn record(&mut self, outcome: MigrationOutcome) {
        match outcome {
            MigrationOutcome::Saved => self.saved += 1,
            MigrationOutcome::SkippedHot => self.skipped_hot += 1,
            MigrationOutcome::LostClaim => self.lost_claims += 1,
            MigrationOutcome::Failed => self.failed += 1,
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciler - migrates aged uploads to the durable store
pub struct Reconciler {
    metadata: MetadataStore,
    local: Arc<LocalCache>,
    memory: Arc<MemoryCache>,
    durable: DurableClient,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        metadata: MetadataStore,
        local: Arc<LocalCache>,
        memory: Arc<MemoryCache>,
        durable: DurableClient,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            metadata,
            local,
            memory,
            durable,
            config,
        }
    }

    /// One sweep over every eligible record
    #[instrument(skip(self), fields(backtrack_secs = self.config.backtrack.as_secs()))]
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        report.stale_claims_released = self
            .metadata
            .release_stale_claims(self.config.stale_claim_after)
            .await?;
        if report.stale_claims_released > 0 {
            warn!(
                "Released {} stale migration claim(s)",
                report.stale_claims_released
            );
        }

        let candidates = self
            .metadata
            .migration_candidates(self.config.backtrack)
            .await?;
        report.candidates = candidates.len();

        for record in &candidates {
            let outcome = self.migrate(record).await;
            crate::metrics::MIGRATIONS
                .with_label_values(&[outcome.as_str()])
                .inc();
            report.record(outcome);
        }

        if report.candidates > 0 {
            info!(
                "Reconcile pass: {} candidate(s), {} saved, {} hot, {} contended, {} failed",
                report.candidates,
                report.saved,
                report.skipped_hot,
                report.lost_claims,
                report.failed
            );
        }
        Ok(report)
    }

    /// Claim and migrate one record
    #[instrument(skip(self, record), fields(image_id = %record.id))]
    pub async fn migrate(&self, record: &ImageRecord) -> MigrationOutcome {
        if self.memory.contains_image(&record.id) {
            debug!("Still hot in memory, deferring");
            return MigrationOutcome::SkippedHot;
        }

        match self.metadata.try_claim(&record.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Claim held elsewhere");
                return MigrationOutcome::LostClaim;
            }
            Err(e) => {
                error!("Claim query failed: {}", e);
                return MigrationOutcome::Failed;
            }
        }

        match self.upload(record).await {
            Ok(true) => {
                if let Err(e) = self.local.delete_temp_upload(&record.local_path).await {
                    // Durable copy is committed; GC collects the leftover
                    warn!(
                        "Failed to delete migrated upload {}: {}",
                        record.local_path.display(),
                        e
                    );
                }
                MigrationOutcome::Saved
            }
            Ok(false) => {
                // Released as stale while the put was in flight; the claim
                // may belong to someone else now, so leave it alone
                warn!("Claim lost before commit, keeping local upload");
                MigrationOutcome::LostClaim
            }
            Err(e) => {
                error!("Migration failed: {}", e);
                if let Err(release_err) = self.metadata.release_claim(&record.id).await {
                    error!("Failed to release claim: {}", release_err);
                }
                MigrationOutcome::Failed
            }
        }
    }

    /// Push the upload and commit `isSaved`. `Ok(false)` when the claim was
    /// no longer ours at commit time.
    async fn upload(&self, record: &ImageRecord) -> Result<bool> {
        let data = Bytes::from(tokio::fs::read(&record.local_path).await?);
        let size = data.len();
        self.durable.put(&record.id, data).await?;
        let committed = self.metadata.mark_saved(&record.id).await?;
        if committed {
            debug!("Stored {} bytes durably", size);
        }
        Ok(committed)
    }
}

// =============================================================================
// Tests
// =============================================================================
