// Copyright (c) 2025-2026 The commitlog-replay authors. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The replay engine.
//!
//! Consumes ordered diff files, reconstructs per-transaction manifests,
//! classifies and orders their operations, applies them transactionally to
//! the target store, and advances the watermark.
//!
//! # Ordering
//!
//! Cross-manifest order is commit-time order and is **absolute**: every
//! operation of an earlier manifest is visible in the target store before
//! any operation of a later one. Weight-based reordering applies only
//! *within* one manifest - surviving mutations sort by ascending
//! classification weight (stable, so ties keep original transaction
//! order), and deletions apply strictly after all of that manifest's
//! mutations. Manifest application is strictly sequential; correctness
//! depends entirely on the derived order.
//!
//! # Resumability
//!
//! The watermark advances once per fully-consumed diff file, in the same
//! transaction as that file's last manifest. Any failure aborts the run
//! with the watermark at the last completed file; the next scheduled tick
//! retries from there. Every operation is idempotent (upserts overwrite
//! identically, deletes of absent rows are no-ops), so at-least-once
//! delivery yields exactly-once effect.
//!
//! # Mutual Exclusion
//!
//! A run holds the fleet-wide replication lock for its whole duration and
//! releases it on every exit path, including failures. Lock contention and
//! a disabled config are benign no-op outcomes, not errors.

use crate::catalog::DiffFileCatalog;
use crate::checkpoint::CheckpointStore;
use crate::classifier::EntityClassifier;
use crate::config::ReplayConfig;
use crate::error::Result;
use crate::lock::SqlReplicationLock;
use crate::manifest::{Manifest, Operation};
use crate::metrics;
use crate::target::{ManifestStats, TargetStore};
use chrono::{DateTime, Utc};
use object_store::ObjectStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of one replay invocation.
///
/// The first two variants are expected control-flow outcomes, reported as
/// benign no-ops; they are never logged as failures and the next scheduled
/// tick is their retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Replication is disabled by configuration. Nothing was touched.
    Disabled,
    /// The replication lock is held by a live owner. Nothing was touched.
    LockUnavailable,
    /// The watermark already matches the latest checkpoint.
    UpToDate { watermark: Option<DateTime<Utc>> },
    /// Diff files were applied and the watermark advanced.
    Applied {
        new_watermark: DateTime<Utc>,
        files: usize,
        manifests: usize,
        stats: ManifestStats,
    },
}

impl ReplayOutcome {
    /// Stable label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ReplayOutcome::Disabled => "disabled",
            ReplayOutcome::LockUnavailable => "lock_unavailable",
            ReplayOutcome::UpToDate { .. } => "up_to_date",
            ReplayOutcome::Applied { .. } => "applied",
        }
    }
}

/// One manifest's operations in final application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedManifest {
    /// Surviving operations: mutations by ascending weight, then deletions.
    pub ops: Vec<Operation>,
    /// Operations dropped because their kind is excluded.
    pub excluded: usize,
}

/// Partition and order one manifest's operations for application.
///
/// Excluded kinds are dropped from both the mutation and deletion paths
/// with zero side effects. The mutation sort is stable: equal weights keep
/// original transaction order.
pub fn plan_manifest(manifest: Manifest, classifier: &EntityClassifier) -> OrderedManifest {
    let mut excluded = 0usize;

    let mut ranked: Vec<(u8, Operation)> = Vec::with_capacity(manifest.mutations.len());
    for mutation in manifest.mutations {
        let classification = classifier.classify(&mutation.kind);
        if !classification.included {
            excluded += 1;
            continue;
        }
        ranked.push((
            classification.weight,
            Operation::Upsert {
                kind: mutation.kind,
                entity: mutation.entity,
            },
        ));
    }
    ranked.sort_by_key(|(weight, _)| *weight);

    let mut ops: Vec<Operation> = ranked.into_iter().map(|(_, op)| op).collect();

    for deleted in manifest.deleted_keys {
        if !classifier.is_included(&deleted.kind) {
            excluded += 1;
            continue;
        }
        ops.push(Operation::Delete {
            kind: deleted.kind,
            key: deleted.key,
        });
    }

    OrderedManifest { ops, excluded }
}

/// Sequence number distinguishing concurrent runs within one process.
static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// The commit-log replay engine.
///
/// All collaborators are injected: the target store handle, the checkpoint
/// store, the lock, and the bucket. There is no ambient store selection
/// anywhere in the engine.
pub struct ReplayEngine<S: TargetStore> {
    config: ReplayConfig,
    classifier: EntityClassifier,
    catalog: DiffFileCatalog,
    lock: SqlReplicationLock,
    checkpoints: Arc<CheckpointStore>,
    target: Arc<S>,
    owner: String,
}

impl<S: TargetStore> ReplayEngine<S> {
    /// Create a replay engine over the given collaborators.
    pub fn new(
        config: ReplayConfig,
        classifier: EntityClassifier,
        bucket: Arc<dyn ObjectStore>,
        lock: SqlReplicationLock,
        checkpoints: Arc<CheckpointStore>,
        target: Arc<S>,
    ) -> Self {
        let catalog = DiffFileCatalog::new(bucket, config.catalog_fetch_concurrency);
        let owner = format!(
            "replay-{}-{}",
            std::process::id(),
            RUN_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            config,
            classifier,
            catalog,
            lock,
            checkpoints,
            target,
            owner,
        }
    }

    /// The target store handle (for diagnostics endpoints).
    pub fn target(&self) -> &Arc<S> {
        &self.target
    }

    /// The checkpoint store handle (for diagnostics endpoints).
    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Run one replay pass.
    ///
    /// Short-circuits without touching any state when replication is
    /// disabled, and without reading the watermark or listing files when
    /// the lock is unavailable. The lock is released on every exit path.
    pub async fn replay(&self) -> Result<ReplayOutcome> {
        let started = Instant::now();

        if !self.config.enabled {
            debug!("Replay called but disabled in the config");
            metrics::record_replay_run("disabled");
            return Ok(ReplayOutcome::Disabled);
        }

        let lease = self.config.lock_lease_duration();
        if !self.lock.acquire(&self.owner, lease).await? {
            metrics::record_lock_contention();
            metrics::record_replay_run("lock_unavailable");
            return Ok(ReplayOutcome::LockUnavailable);
        }

        let result = self.replay_locked().await;

        if let Err(e) = self.lock.release(&self.owner).await {
            // The lease bounds how long this can block the next run.
            warn!(error = %e, "Failed to release replication lock");
        }

        match &result {
            Ok(outcome) => {
                metrics::record_replay_run(outcome.label());
                metrics::record_replay_duration(started.elapsed());
            }
            Err(_) => metrics::record_replay_run("failed"),
        }
        result
    }

    /// The main algorithm, entered only with the lock held.
    async fn replay_locked(&self) -> Result<ReplayOutcome> {
        let watermark = self.target.watermark().await?;
        let resume = watermark.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let Some(target_checkpoint) = self.checkpoints.last().await? else {
            debug!("No checkpoint exported yet, nothing to replay");
            return Ok(ReplayOutcome::UpToDate { watermark });
        };
        if target_checkpoint <= resume {
            debug!(watermark = %resume, "Watermark already at latest checkpoint");
            return Ok(ReplayOutcome::UpToDate { watermark });
        }

        info!(
            from = %resume,
            to = %target_checkpoint,
            "Replaying commit logs"
        );

        let files = self.catalog.list_files(resume, target_checkpoint).await?;
        let file_count = files.len();

        let mut total = ManifestStats::default();
        let mut manifests_applied = 0usize;
        let mut excluded_total = 0usize;

        for file in files {
            let upper = file.upper_bound();
            let manifest_count = file.manifests.len();

            if manifest_count == 0 {
                // A checkpoint cycle with no transactions still moves the
                // watermark forward.
                self.target.advance_watermark(upper).await?;
                debug!(upper = %upper, "Consumed empty diff file");
                continue;
            }

            for (index, manifest) in file.manifests.into_iter().enumerate() {
                let commit_time = manifest.commit_time;
                let planned = plan_manifest(manifest, &self.classifier);
                excluded_total += planned.excluded;

                let advance_to = (index + 1 == manifest_count).then_some(upper);
                let stats = self
                    .target
                    .apply_manifest(commit_time, planned.ops, advance_to)
                    .await?;
                total.merge(stats);
                manifests_applied += 1;
            }

            debug!(upper = %upper, manifests = manifest_count, "Consumed diff file");
        }

        metrics::record_files_consumed(file_count);
        metrics::record_manifests_applied(manifests_applied);
        metrics::record_operations_applied(total.upserted, total.deleted, total.absent_deletes);
        metrics::record_operations_excluded(excluded_total);
        metrics::record_watermark_lag(
            (Utc::now() - target_checkpoint)
                .to_std()
                .unwrap_or_default(),
        );

        info!(
            new_watermark = %target_checkpoint,
            files = file_count,
            manifests = manifests_applied,
            upserted = total.upserted,
            deleted = total.deleted,
            "Replay complete"
        );

        Ok(ReplayOutcome::Applied {
            new_watermark: target_checkpoint,
            files: file_count,
            manifests: manifests_applied,
            stats: total,
        })
    }
}
