//! Shared fixtures for the integration tests.
//!
//! Builds a full in-process pipeline: file-backed SQLite stores in a temp
//! directory, an in-memory object-store bucket, and a replay engine wired
//! the way the daemon wires it. Also provides `RecordingTarget`, a mock
//! target store that records every call for ordering and filtering
//! assertions.

#![allow(dead_code)] // Each test binary uses a subset of the fixtures.

use chrono::{DateTime, TimeZone, Utc};
use commitlog_replay::checkpoint::CheckpointStore;
use commitlog_replay::classifier::EntityClassifier;
use commitlog_replay::config::ReplayConfig;
use commitlog_replay::lock::{LeaseExpiryOnly, SqlReplicationLock, REPLAY_LOCK_NAME};
use commitlog_replay::manifest::{DiffFile, EntityKey, Manifest, Mutation, Operation};
use commitlog_replay::replay::ReplayEngine;
use commitlog_replay::target::{BoxFuture, ManifestStats, SqlTargetStore, TargetStore};
use commitlog_replay::Result;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

pub fn ts(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
}

/// A minimal serialized entity: a JSON document keyed by `id`.
pub fn entity(id: &str) -> Vec<u8> {
    format!(r#"{{"id": "{}"}}"#, id).into_bytes()
}

/// Builder for manifests in tests.
pub struct ManifestBuilder {
    manifest: Manifest,
}

impl ManifestBuilder {
    pub fn at(commit_millis: i64) -> Self {
        Self {
            manifest: Manifest::new(ts(commit_millis)),
        }
    }

    pub fn adds(mut self, kind: &str, ids: &[&str]) -> Self {
        for id in ids {
            self.manifest.mutations.push(Mutation {
                kind: kind.to_string(),
                entity: entity(id),
            });
        }
        self
    }

    pub fn deletes(mut self, kind: &str, keys: &[&str]) -> Self {
        for key in keys {
            self.manifest
                .deleted_keys
                .push(EntityKey::new(kind, *key));
        }
        self
    }

    pub fn build(self) -> Manifest {
        self.manifest
    }
}

/// Full pipeline over real stores.
pub struct TestPipeline {
    pub dir: TempDir,
    pub bucket: Arc<InMemory>,
    pub target: Arc<SqlTargetStore>,
    pub checkpoints: Arc<CheckpointStore>,
}

impl TestPipeline {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(
            SqlTargetStore::open(&dir.path().join("target.db").to_string_lossy())
                .await
                .unwrap(),
        );
        let checkpoints = Arc::new(
            CheckpointStore::open(&dir.path().join("checkpoints.db").to_string_lossy())
                .await
                .unwrap(),
        );
        Self {
            dir,
            bucket: Arc::new(InMemory::new()),
            target,
            checkpoints,
        }
    }

    /// Put a diff file in the bucket and advance the checkpoint record to
    /// its upper bound, as the export path would.
    pub async fn publish(&self, file: &DiffFile) {
        self.bucket
            .put(
                &Path::from(file.blob_name()),
                PutPayload::from(file.to_bytes().unwrap()),
            )
            .await
            .unwrap();
        self.checkpoints.try_advance(file.upper_bound()).await.unwrap();
    }

    /// Build an engine over this pipeline's real target store.
    pub async fn engine(&self) -> ReplayEngine<SqlTargetStore> {
        self.engine_with_config(ReplayConfig::default()).await
    }

    pub async fn engine_with_config(&self, config: ReplayConfig) -> ReplayEngine<SqlTargetStore> {
        let lock = SqlReplicationLock::new(
            self.target.pool().clone(),
            REPLAY_LOCK_NAME,
            Arc::new(LeaseExpiryOnly),
        )
        .await
        .unwrap();
        ReplayEngine::new(
            config,
            EntityClassifier::registry(),
            Arc::clone(&self.bucket) as Arc<dyn ObjectStore>,
            lock,
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.target),
        )
    }

    /// Build an engine over a recording mock target instead.
    pub async fn recording_engine(
        &self,
        recording: Arc<RecordingTarget>,
    ) -> ReplayEngine<RecordingTarget> {
        let lock = SqlReplicationLock::new(
            self.target.pool().clone(),
            REPLAY_LOCK_NAME,
            Arc::new(LeaseExpiryOnly),
        )
        .await
        .unwrap();
        ReplayEngine::new(
            ReplayConfig::default(),
            EntityClassifier::registry(),
            Arc::clone(&self.bucket) as Arc<dyn ObjectStore>,
            lock,
            Arc::clone(&self.checkpoints),
            recording,
        )
    }

    /// A second lock handle over the same lease table, for contention tests.
    pub async fn lock_handle(&self) -> SqlReplicationLock {
        SqlReplicationLock::new(
            self.target.pool().clone(),
            REPLAY_LOCK_NAME,
            Arc::new(LeaseExpiryOnly),
        )
        .await
        .unwrap()
    }
}

/// A recorded target-store call, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Upsert { kind: String, entity: Vec<u8> },
    Delete { kind: String, key: String },
    Watermark(DateTime<Utc>),
}

/// Mock target store that records every call for assertions.
///
/// Can be configured to fail after N applied manifests, for
/// failure-semantics tests.
#[derive(Default)]
pub struct RecordingTarget {
    calls: Mutex<Vec<RecordedCall>>,
    watermark: Mutex<Option<DateTime<Utc>>>,
    manifests_applied: AtomicUsize,
    fail_after_manifests: AtomicUsize,
}

impl RecordingTarget {
    pub fn new() -> Self {
        Self {
            fail_after_manifests: AtomicUsize::new(usize::MAX),
            ..Self::default()
        }
    }

    /// Fail the Nth (0-based) apply_manifest call and every one after it.
    pub fn failing_after(manifests: usize) -> Self {
        Self {
            fail_after_manifests: AtomicUsize::new(manifests),
            ..Self::new()
        }
    }

    /// Stop failing (crash-and-retry tests).
    pub fn heal(&self) {
        self.fail_after_manifests.store(usize::MAX, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    /// Kinds that ever reached the store's write path (put or delete).
    pub async fn touched_kinds(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                RecordedCall::Upsert { kind, .. } => Some(kind.clone()),
                RecordedCall::Delete { kind, .. } => Some(kind.clone()),
                RecordedCall::Watermark(_) => None,
            })
            .collect()
    }
}

impl TargetStore for RecordingTarget {
    fn watermark(&self) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        Box::pin(async move { Ok(*self.watermark.lock().await) })
    }

    fn apply_manifest(
        &self,
        _commit_time: DateTime<Utc>,
        ops: Vec<Operation>,
        advance_to: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, ManifestStats> {
        Box::pin(async move {
            let applied = self.manifests_applied.fetch_add(1, Ordering::SeqCst);
            if applied >= self.fail_after_manifests.load(Ordering::SeqCst) {
                return Err(commitlog_replay::ReplayError::Internal(
                    "injected apply failure".to_string(),
                ));
            }

            let mut stats = ManifestStats::default();
            let mut calls = self.calls.lock().await;
            for op in ops {
                match op {
                    Operation::Upsert { kind, entity } => {
                        calls.push(RecordedCall::Upsert { kind, entity });
                        stats.upserted += 1;
                    }
                    Operation::Delete { kind, key } => {
                        calls.push(RecordedCall::Delete { kind, key });
                        stats.deleted += 1;
                    }
                }
            }
            if let Some(to) = advance_to {
                calls.push(RecordedCall::Watermark(to));
                *self.watermark.lock().await = Some(to);
            }
            Ok(stats)
        })
    }

    fn advance_watermark(&self, to: DateTime<Utc>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.calls.lock().await.push(RecordedCall::Watermark(to));
            *self.watermark.lock().await = Some(to);
            Ok(())
        })
    }
}

/// Apply manifests directly in commit order, bypassing diff files - the
/// reference behavior for the round-trip property.
pub async fn apply_directly(
    target: &SqlTargetStore,
    classifier: &EntityClassifier,
    manifests: Vec<Manifest>,
) -> Result<()> {
    for manifest in manifests {
        let commit_time = manifest.commit_time;
        let planned = commitlog_replay::replay::plan_manifest(manifest, classifier);
        target.apply_manifest(commit_time, planned.ops, None).await?;
    }
    Ok(())
}
