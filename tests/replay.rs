// Copyright (c) 2025-2026 The commitlog-replay authors. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the replay engine.
//!
//! All stores run in-process: file-backed SQLite in a temp directory and an
//! in-memory object-store bucket.
//!
//! # Test Organization
//! - `replay_*` - End-to-end replay runs against the real SQL target
//! - `ordering_*` - Commit-time and intra-manifest ordering invariants
//! - `filtering_*` - Excluded-kind handling
//! - `failure_*` - Crash/retry and catalog-gap semantics

mod common;

use common::{apply_directly, entity, ts, ManifestBuilder, RecordedCall, RecordingTarget, TestPipeline};
use commitlog_replay::classifier::EntityClassifier;
use commitlog_replay::config::ReplayConfig;
use commitlog_replay::manifest::DiffFile;
use commitlog_replay::replay::ReplayOutcome;
use commitlog_replay::target::{SqlTargetStore, TargetStore};
use commitlog_replay::ReplayError;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// End-to-end replay
// =============================================================================

/// The canonical scenario: two diff files, three manifests, adds and
/// deletes interleaved across transaction boundaries.
#[tokio::test]
async fn replay_applies_files_in_order_to_expected_end_state() {
    let pipeline = TestPipeline::new().await;

    // Start state: {"keep", "delete-me"}.
    pipeline
        .target
        .apply_manifest(
            ts(100),
            vec![
                upsert("domain", "keep"),
                upsert("domain", "delete-me"),
            ],
            None,
        )
        .await
        .unwrap();

    // File 1 (epoch, 2_000]: manifest A adds {a,b}, deletes {delete-me};
    // manifest B adds {c,d}, deletes {a}.
    let file1 = DiffFile::new(
        ts(0),
        ts(2_000),
        vec![
            ManifestBuilder::at(1_700)
                .adds("domain", &["a", "b"])
                .deletes("domain", &["delete-me"])
                .build(),
            ManifestBuilder::at(1_800)
                .adds("domain", &["c", "d"])
                .deletes("domain", &["a"])
                .build(),
        ],
    )
    .unwrap();

    // File 2 (2_000, 3_000]: manifest C adds {e,f}, deletes {c}.
    let file2 = DiffFile::new(
        ts(2_000),
        ts(3_000),
        vec![ManifestBuilder::at(2_900)
            .adds("domain", &["e", "f"])
            .deletes("domain", &["c"])
            .build()],
    )
    .unwrap();

    pipeline.publish(&file1).await;
    pipeline.publish(&file2).await;

    let engine = pipeline.engine().await;
    let outcome = engine.replay().await.unwrap();

    let ReplayOutcome::Applied {
        new_watermark,
        files,
        manifests,
        stats,
    } = outcome
    else {
        panic!("expected applied, got {:?}", outcome);
    };
    assert_eq!(new_watermark, ts(3_000));
    assert_eq!(files, 2);
    assert_eq!(manifests, 3);
    assert_eq!(stats.upserted, 6);
    assert_eq!(stats.deleted, 3);

    assert_eq!(
        pipeline.target.keys_of_kind("domain").await.unwrap(),
        vec!["b", "d", "e", "f", "keep"]
    );
    assert_eq!(
        pipeline.target.watermark().await.unwrap(),
        Some(ts(3_000))
    );
}

#[tokio::test]
async fn replay_is_idempotent_after_watermark_rollback() {
    let pipeline = TestPipeline::new().await;

    let file = DiffFile::new(
        ts(0),
        ts(2_000),
        vec![ManifestBuilder::at(1_500)
            .adds("contact", &["c-1", "c-2"])
            .deletes("contact", &["never-existed"])
            .build()],
    )
    .unwrap();
    pipeline.publish(&file).await;

    let engine = pipeline.engine().await;
    assert!(matches!(
        engine.replay().await.unwrap(),
        ReplayOutcome::Applied { .. }
    ));
    let state_after_first = pipeline.target.keys_of_kind("contact").await.unwrap();

    // Simulate a crash-and-retry that lost the watermark advance: the same
    // file is consumed a second time.
    pipeline.target.advance_watermark(ts(0)).await.unwrap();
    let outcome = engine.replay().await.unwrap();

    assert!(matches!(outcome, ReplayOutcome::Applied { .. }));
    assert_eq!(
        pipeline.target.keys_of_kind("contact").await.unwrap(),
        state_after_first
    );
    assert_eq!(pipeline.target.watermark().await.unwrap(), Some(ts(2_000)));
}

#[tokio::test]
async fn replay_noop_when_watermark_at_latest_checkpoint() {
    let pipeline = TestPipeline::new().await;

    let file = DiffFile::new(
        ts(0),
        ts(1_000),
        vec![ManifestBuilder::at(500).adds("tld", &["test"]).build()],
    )
    .unwrap();
    pipeline.publish(&file).await;

    let engine = pipeline.engine().await;
    assert!(matches!(
        engine.replay().await.unwrap(),
        ReplayOutcome::Applied { .. }
    ));

    // Nothing new exported: the second run is a no-op.
    let outcome = engine.replay().await.unwrap();
    assert!(
        matches!(outcome, ReplayOutcome::UpToDate { watermark: Some(w) } if w == ts(1_000)),
        "got {:?}",
        outcome
    );
}

#[tokio::test]
async fn replay_noop_when_nothing_ever_exported() {
    let pipeline = TestPipeline::new().await;
    let engine = pipeline.engine().await;

    let outcome = engine.replay().await.unwrap();
    assert!(matches!(
        outcome,
        ReplayOutcome::UpToDate { watermark: None }
    ));
}

#[tokio::test]
async fn replay_consumes_empty_diff_file() {
    let pipeline = TestPipeline::new().await;

    // A checkpoint cycle with no transactions.
    let empty = DiffFile::new(ts(0), ts(1_000), vec![]).unwrap();
    let busy = DiffFile::new(
        ts(1_000),
        ts(2_000),
        vec![ManifestBuilder::at(1_500).adds("host", &["ns1.test"]).build()],
    )
    .unwrap();
    pipeline.publish(&empty).await;
    pipeline.publish(&busy).await;

    let engine = pipeline.engine().await;
    let outcome = engine.replay().await.unwrap();

    let ReplayOutcome::Applied {
        new_watermark,
        files,
        manifests,
        ..
    } = outcome
    else {
        panic!("expected applied");
    };
    assert_eq!(new_watermark, ts(2_000));
    assert_eq!(files, 2);
    assert_eq!(manifests, 1);
}

/// Round-trip property: replay through diff files produces the same state
/// as applying the original transactions directly in commit order.
#[tokio::test]
async fn replay_matches_direct_application() {
    let pipeline = TestPipeline::new().await;

    let manifests = vec![
        ManifestBuilder::at(500)
            .adds("registrar", &["r-1"])
            .adds("contact", &["c-1"])
            .build(),
        ManifestBuilder::at(1_500)
            .adds("domain", &["one.test", "two.test"])
            .deletes("contact", &["c-1"])
            .build(),
        ManifestBuilder::at(2_500)
            .deletes("domain", &["one.test"])
            .adds("host", &["ns1.two.test"])
            .build(),
    ];

    // Split across two files at 2_000.
    let file1 = DiffFile::new(ts(0), ts(2_000), manifests[..2].to_vec()).unwrap();
    let file2 = DiffFile::new(ts(2_000), ts(3_000), manifests[2..].to_vec()).unwrap();
    pipeline.publish(&file1).await;
    pipeline.publish(&file2).await;

    let engine = pipeline.engine().await;
    assert!(matches!(
        engine.replay().await.unwrap(),
        ReplayOutcome::Applied { .. }
    ));

    // Reference: a fresh store, manifests applied directly in commit order.
    let reference_dir = tempfile::tempdir().unwrap();
    let reference = SqlTargetStore::open(
        &reference_dir.path().join("reference.db").to_string_lossy(),
    )
    .await
    .unwrap();
    apply_directly(&reference, &EntityClassifier::registry(), manifests)
        .await
        .unwrap();

    for kind in ["registrar", "contact", "domain", "host"] {
        assert_eq!(
            pipeline.target.keys_of_kind(kind).await.unwrap(),
            reference.keys_of_kind(kind).await.unwrap(),
            "state mismatch for kind {}",
            kind
        );
    }
}

// =============================================================================
// Short-circuits
// =============================================================================

#[tokio::test]
async fn replay_disabled_touches_nothing() {
    let pipeline = TestPipeline::new().await;

    // A checkpoint exists but the bucket is empty: if the run listed the
    // catalog it would fail with a coverage gap. Disabled must
    // short-circuit before any of that.
    pipeline.checkpoints.try_advance(ts(5_000)).await.unwrap();

    let engine = pipeline
        .engine_with_config(ReplayConfig {
            enabled: false,
            ..Default::default()
        })
        .await;
    assert!(matches!(
        engine.replay().await.unwrap(),
        ReplayOutcome::Disabled
    ));

    // No watermark written, no lock taken.
    assert!(pipeline.target.watermark().await.unwrap().is_none());
    assert!(pipeline.lock_handle().await.holder().await.unwrap().is_none());
}

#[tokio::test]
async fn replay_lock_held_by_live_owner_is_a_noop() {
    let pipeline = TestPipeline::new().await;

    let file = DiffFile::new(
        ts(0),
        ts(1_000),
        vec![ManifestBuilder::at(500).adds("tld", &["test"]).build()],
    )
    .unwrap();
    pipeline.publish(&file).await;

    // Another live run holds the lock.
    let other = pipeline.lock_handle().await;
    assert!(other
        .acquire("other-run", Duration::from_secs(600))
        .await
        .unwrap());

    let engine = pipeline.engine().await;
    let outcome = engine.replay().await.unwrap();

    assert!(matches!(outcome, ReplayOutcome::LockUnavailable));
    // Watermark untouched; the other run still holds the lock.
    assert!(pipeline.target.watermark().await.unwrap().is_none());
    assert_eq!(
        other.holder().await.unwrap().unwrap().owner,
        "other-run"
    );
}

// =============================================================================
// Ordering invariants
// =============================================================================

/// A delete in an earlier manifest is visible before any operation of a
/// later manifest, even though deletes carry the highest intra-manifest
/// weight.
#[tokio::test]
async fn ordering_commit_time_overrides_weights() {
    let pipeline = TestPipeline::new().await;

    let file = DiffFile::new(
        ts(0),
        ts(3_000),
        vec![
            ManifestBuilder::at(1_000)
                .deletes("contact", &["x"])
                .build(),
            ManifestBuilder::at(2_000)
                .adds("domain", &["fresh.test"])
                .build(),
        ],
    )
    .unwrap();
    pipeline.publish(&file).await;

    let recording = Arc::new(RecordingTarget::new());
    let engine = pipeline.recording_engine(Arc::clone(&recording)).await;
    engine.replay().await.unwrap();

    let calls = recording.calls().await;
    let delete_pos = calls
        .iter()
        .position(|c| matches!(c, RecordedCall::Delete { key, .. } if key == "x"))
        .expect("delete of x was recorded");
    let upsert_pos = calls
        .iter()
        .position(|c| matches!(c, RecordedCall::Upsert { kind, .. } if kind == "domain"))
        .expect("upsert of domain was recorded");
    assert!(
        delete_pos < upsert_pos,
        "earlier manifest's delete must precede later manifest's upsert: {:?}",
        calls
    );
}

#[tokio::test]
async fn ordering_within_manifest_by_weight_with_deletes_last() {
    let pipeline = TestPipeline::new().await;

    let file = DiffFile::new(
        ts(0),
        ts(2_000),
        vec![ManifestBuilder::at(1_000)
            .adds("billing-event", &["b-1"])
            .adds("registrar", &["r-1"])
            .adds("domain", &["d.test"])
            .deletes("registrar", &["r-old"])
            .build()],
    )
    .unwrap();
    pipeline.publish(&file).await;

    let recording = Arc::new(RecordingTarget::new());
    let engine = pipeline.recording_engine(Arc::clone(&recording)).await;
    engine.replay().await.unwrap();

    let ops: Vec<RecordedCall> = recording
        .calls()
        .await
        .into_iter()
        .filter(|c| !matches!(c, RecordedCall::Watermark(_)))
        .collect();

    // registrar (0) before domain (2) before billing-event (3), delete last.
    assert_eq!(ops.len(), 4);
    assert!(matches!(&ops[0], RecordedCall::Upsert { kind, .. } if kind == "registrar"));
    assert!(matches!(&ops[1], RecordedCall::Upsert { kind, .. } if kind == "domain"));
    assert!(matches!(&ops[2], RecordedCall::Upsert { kind, .. } if kind == "billing-event"));
    assert!(matches!(&ops[3], RecordedCall::Delete { key, .. } if key == "r-old"));
}

// =============================================================================
// Filtering
// =============================================================================

/// Excluded kinds never reach the store's put or delete paths at all.
#[tokio::test]
async fn filtering_excluded_kinds_never_reach_the_store() {
    let pipeline = TestPipeline::new().await;

    let file = DiffFile::new(
        ts(0),
        ts(2_000),
        vec![ManifestBuilder::at(1_000)
            .adds("cache-invalidation", &["marker-1"])
            .adds("domain", &["real.test"])
            .deletes("epp-resource-index", &["idx-1"])
            .build()],
    )
    .unwrap();
    pipeline.publish(&file).await;

    let recording = Arc::new(RecordingTarget::new());
    let engine = pipeline.recording_engine(Arc::clone(&recording)).await;
    engine.replay().await.unwrap();

    let touched = recording.touched_kinds().await;
    assert_eq!(touched, vec!["domain"]);
}

#[tokio::test]
async fn filtering_delete_of_absent_key_is_silent() {
    let pipeline = TestPipeline::new().await;

    let file = DiffFile::new(
        ts(0),
        ts(2_000),
        vec![ManifestBuilder::at(1_000)
            .deletes("domain", &["was-never-replicated.test"])
            .build()],
    )
    .unwrap();
    pipeline.publish(&file).await;

    let engine = pipeline.engine().await;
    let ReplayOutcome::Applied { stats, .. } = engine.replay().await.unwrap() else {
        panic!("expected applied");
    };
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats.absent_deletes, 1);
}

// =============================================================================
// Failure semantics
// =============================================================================

#[tokio::test]
async fn failure_catalog_gap_aborts_without_advancing_watermark() {
    let pipeline = TestPipeline::new().await;

    // (0, 1_000] and (2_000, 3_000] exported; (1_000, 2_000] missing.
    let file1 = DiffFile::new(
        ts(0),
        ts(1_000),
        vec![ManifestBuilder::at(500).adds("tld", &["test"]).build()],
    )
    .unwrap();
    let file3 = DiffFile::new(
        ts(2_000),
        ts(3_000),
        vec![ManifestBuilder::at(2_500).adds("tld", &["example"]).build()],
    )
    .unwrap();
    pipeline.publish(&file1).await;
    pipeline.publish(&file3).await;

    let engine = pipeline.engine().await;
    let err = engine.replay().await.unwrap_err();

    assert!(matches!(err, ReplayError::CatalogIncomplete { .. }));
    assert!(pipeline.target.watermark().await.unwrap().is_none());
    // Lock released despite the failure.
    assert!(pipeline.lock_handle().await.holder().await.unwrap().is_none());
}

#[tokio::test]
async fn failure_mid_run_keeps_watermark_at_last_complete_file() {
    let pipeline = TestPipeline::new().await;

    let file1 = DiffFile::new(
        ts(0),
        ts(1_000),
        vec![
            ManifestBuilder::at(400).adds("contact", &["c-1"]).build(),
            ManifestBuilder::at(600).adds("contact", &["c-2"]).build(),
        ],
    )
    .unwrap();
    let file2 = DiffFile::new(
        ts(1_000),
        ts(2_000),
        vec![ManifestBuilder::at(1_500).adds("contact", &["c-3"]).build()],
    )
    .unwrap();
    pipeline.publish(&file1).await;
    pipeline.publish(&file2).await;

    // Fail on the third manifest: file 1 completes, file 2 does not.
    let recording = Arc::new(RecordingTarget::failing_after(2));
    let engine = pipeline.recording_engine(Arc::clone(&recording)).await;

    let err = engine.replay().await.unwrap_err();
    assert!(matches!(err, ReplayError::Internal(_)));
    assert_eq!(recording.watermark().await.unwrap(), Some(ts(1_000)));
    // Lock released on the failure path.
    assert!(pipeline.lock_handle().await.holder().await.unwrap().is_none());

    // Next tick retries from the watermark and completes.
    recording.heal();
    let outcome = engine.replay().await.unwrap();
    assert!(
        matches!(outcome, ReplayOutcome::Applied { new_watermark, .. } if new_watermark == ts(2_000))
    );
}

fn upsert(kind: &str, id: &str) -> commitlog_replay::Operation {
    commitlog_replay::Operation::Upsert {
        kind: kind.to_string(),
        entity: entity(id),
    }
}
