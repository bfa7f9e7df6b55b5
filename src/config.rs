//! Configuration for the commit-log replay pipeline.
//!
//! Configuration is passed to the component constructors and can be built
//! programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use commitlog_replay::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     replay: commitlog_replay::config::ReplayConfig {
//!         bucket: "commit-logs-prod".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── replay: ReplayConfig          # enable flag, bucket, lock lease
//! ├── checkpoint: CheckpointConfig  # export-task delay
//! ├── target: TargetStoreConfig     # target SQL store (SQLite path)
//! └── source: SourceStoreConfig     # source-side checkpoint store
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! replay:
//!   enabled: true
//!   bucket: "commit-logs-prod"
//!   lock_lease: "5m"
//!   catalog_fetch_concurrency: 8
//!
//! checkpoint:
//!   export_delay: "2m"
//!
//! target:
//!   sqlite_path: "/var/lib/registry/target.db"
//!
//! source:
//!   sqlite_path: "/var/lib/registry/checkpoints.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Top-level configuration for the replication pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationConfig {
    /// Replay-side settings (trigger endpoint, lock, catalog).
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Checkpoint coordinator settings.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Target SQL store (entities + watermark + lock records).
    #[serde(default)]
    pub target: TargetStoreConfig,

    /// Source-side checkpoint store.
    #[serde(default)]
    pub source: SourceStoreConfig,
}

impl ReplicationConfig {
    /// Create a minimal config for testing, with stores rooted in `dir`.
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            replay: ReplayConfig::default(),
            checkpoint: CheckpointConfig {
                export_delay: "0s".to_string(),
            },
            target: TargetStoreConfig {
                sqlite_path: dir.join("target.db").to_string_lossy().into_owned(),
            },
            source: SourceStoreConfig {
                sqlite_path: dir.join("checkpoints.db").to_string_lossy().into_owned(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplayConfig: the replay trigger's own knobs
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the replay run itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Whether commit-log replay is enabled.
    ///
    /// When `false`, the trigger endpoint responds immediately without
    /// touching the lock, the watermark, or the bucket.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Object-store bucket holding exported diff files.
    ///
    /// The bucket may contain unrelated blobs; the catalog filters by each
    /// file's embedded time range, not by name.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Replication lock lease as a duration string (e.g. "5m").
    ///
    /// Bounds how long a crashed run can block the next one.
    #[serde(default = "default_lock_lease")]
    pub lock_lease: String,

    /// Maximum concurrent diff-file fetches during catalog listing.
    #[serde(default = "default_fetch_concurrency")]
    pub catalog_fetch_concurrency: usize,
}

fn default_true() -> bool {
    true
}

fn default_bucket() -> String {
    "commit-logs".to_string()
}

fn default_lock_lease() -> String {
    "5m".to_string()
}

fn default_fetch_concurrency() -> usize {
    8
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket: "commit-logs".to_string(),
            lock_lease: "5m".to_string(),
            catalog_fetch_concurrency: 8,
        }
    }
}

impl ReplayConfig {
    /// Parse the lock lease string to a Duration.
    pub fn lock_lease_duration(&self) -> Duration {
        humantime::parse_duration(&self.lock_lease).unwrap_or(Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig: coordinator settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Checkpoint coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Delay before the diff-export task runs, as a duration string.
    ///
    /// Must exceed the source store's commit-visibility latency, so the
    /// exporter never runs before the transaction that produced the
    /// checkpoint is externally visible.
    #[serde(default = "default_export_delay")]
    pub export_delay: String,
}

fn default_export_delay() -> String {
    "2m".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            export_delay: "2m".to_string(),
        }
    }
}

impl CheckpointConfig {
    /// Parse the export delay string to a Duration.
    pub fn export_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.export_delay).unwrap_or(Duration::from_secs(120))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store configs
// ═══════════════════════════════════════════════════════════════════════════════

/// Target SQL store configuration.
///
/// Holds replicated entities, the watermark singleton, and the replication
/// lock record. The connection pool is shared with live traffic during
/// migration, so it stays small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetStoreConfig {
    /// Path to the target SQLite database.
    pub sqlite_path: String,
}

impl Default for TargetStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_target.db".to_string(),
        }
    }
}

/// Source-side checkpoint store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStoreConfig {
    /// Path to the checkpoint SQLite database.
    pub sqlite_path: String,
}

impl Default for SourceStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "commit_checkpoints.db".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
