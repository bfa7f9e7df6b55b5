//! # Commit-Log Replay
//!
//! The registry's commit-log replication pipeline: migrates writes from the
//! legacy, eventually-consistent primary store to the transactional SQL
//! store while the registry keeps serving live traffic - no split-brain, no
//! data loss.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            commitlog-replay                              │
//! │                                                                          │
//! │  ┌───────────────────────┐      delayed      ┌────────────────────────┐  │
//! │  │ CheckpointCoordinator │──────schedule────►│ DiffExporter (external)│  │
//! │  │ (monotonic CAS)       │                   │ writes diff file blob  │  │
//! │  └───────────────────────┘                   └───────────┬────────────┘  │
//! │                                                          ▼               │
//! │  ┌──────────────┐    ┌─────────────────┐    ┌──────────────────────┐     │
//! │  │ ReplayEngine │───►│ DiffFileCatalog │───►│ Object-store bucket  │     │
//! │  │ (lock-guarded│    │ (list + tile)   │    │ (immutable blobs)    │     │
//! │  │  sequential  │    └─────────────────┘    └──────────────────────┘     │
//! │  │  apply)      │                                                        │
//! │  └──────┬───────┘    ┌──────────────────────────────────────────────┐    │
//! │         └───────────►│ TargetStore (SQL): entities + watermark +    │    │
//! │                      │ replication lock, one tx per manifest        │    │
//! │                      └──────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Commit-time order is absolute**: manifests apply strictly in commit
//!    order; weight-based reordering never crosses a manifest boundary.
//! 2. **Exactly-once effect**: at-least-once delivery with idempotent
//!    application; the watermark advances only with fully-consumed files.
//! 3. **Mutual exclusion**: one replay run fleet-wide, enforced by a
//!    durable lease with a liveness probe.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use commitlog_replay::{
//!     CheckpointCoordinator, CheckpointStore, EntityClassifier, NoInFlight,
//!     ReplayEngine, ReplicationConfig, ReplicationService, SqlReplicationLock,
//!     SqlTargetStore,
//! };
//! use commitlog_replay::checkpoint::DiffExporter;
//! use commitlog_replay::lock::{LeaseExpiryOnly, REPLAY_LOCK_NAME};
//! use object_store::memory::InMemory;
//! use std::sync::Arc;
//!
//! # async fn example(exporter: Arc<dyn DiffExporter>) -> commitlog_replay::Result<()> {
//! let config = ReplicationConfig::default();
//!
//! let target = Arc::new(SqlTargetStore::open(&config.target.sqlite_path).await?);
//! let checkpoints = Arc::new(CheckpointStore::open(&config.source.sqlite_path).await?);
//! let lock = SqlReplicationLock::new(
//!     target.pool().clone(),
//!     REPLAY_LOCK_NAME,
//!     Arc::new(LeaseExpiryOnly),
//! )
//! .await?;
//!
//! let engine = ReplayEngine::new(
//!     config.replay.clone(),
//!     EntityClassifier::registry(),
//!     Arc::new(InMemory::new()),
//!     lock,
//!     Arc::clone(&checkpoints),
//!     target,
//! );
//! let coordinator = CheckpointCoordinator::new(
//!     checkpoints,
//!     Arc::new(NoInFlight),
//!     exporter,
//!     config.checkpoint.export_delay_duration(),
//! );
//!
//! let service = Arc::new(ReplicationService { engine, coordinator });
//! commitlog_replay::server::serve("0.0.0.0:8080".parse().unwrap(), service).await
//! # }
//! ```

pub mod catalog;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod metrics;
pub mod replay;
pub mod server;
pub mod target;

// Re-exports for convenience
pub use catalog::DiffFileCatalog;
pub use checkpoint::{CheckpointCoordinator, CheckpointStore, DiffExporter, NoInFlight, SourceTimeline};
pub use classifier::{Classification, EntityClassifier};
pub use config::ReplicationConfig;
pub use error::{ReplayError, Result};
pub use lock::{LivenessProbe, SqlReplicationLock};
pub use manifest::{Checkpoint, DiffFile, EntityKey, Manifest, Mutation, Operation};
pub use replay::{ReplayEngine, ReplayOutcome};
pub use server::ReplicationService;
pub use target::{ManifestStats, SqlTargetStore, TargetStore};
