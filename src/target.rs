// Copyright (c) 2025-2026 The commitlog-replay authors. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Target-store integration trait and the SQL implementation.
//!
//! The replay engine takes a [`TargetStore`] handle as a constructor
//! argument - there is no ambient "current store" selection anywhere in the
//! engine. The trait is object-safe (boxed-future methods) so tests can
//! substitute a recording mock.
//!
//! # Transaction Boundaries
//!
//! One call to [`TargetStore::apply_manifest`] is one ACID transaction: a
//! manifest is either fully visible or fully absent in the target store.
//! When the manifest is the last of its diff file, the watermark write joins
//! the same transaction, so a crash mid-file never advances the watermark
//! past partially-applied work.
//!
//! # Entity Payloads
//!
//! The serialized entity is a JSON document whose `id` field is the entity
//! key. Keys are extracted *before* the transaction touches the store, so a
//! malformed payload fails the run without writing anything.

use crate::db;
use crate::error::{ReplayError, Result};
use crate::manifest::Operation;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Per-manifest application statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifestStats {
    /// Entities upserted.
    pub upserted: usize,
    /// Entities deleted.
    pub deleted: usize,
    /// Deletes whose target key was already absent (treated as applied).
    pub absent_deletes: usize,
}

impl ManifestStats {
    /// Accumulate another manifest's stats into this one.
    pub fn merge(&mut self, other: ManifestStats) {
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.absent_deletes += other.absent_deletes;
    }
}

/// What the replay engine needs from the target SQL store.
///
/// Implementations must be transactional per `apply_manifest` call and must
/// treat deletes of absent keys as already-applied no-ops.
pub trait TargetStore: Send + Sync + 'static {
    /// Read the watermark: commit time of the latest fully-applied diff
    /// file. `None` means nothing has ever been replayed (epoch start).
    fn watermark(&self) -> BoxFuture<'_, Option<DateTime<Utc>>>;

    /// Apply one manifest's ordered operations in a single transaction.
    ///
    /// `commit_time` is the manifest's original commit time; `advance_to`,
    /// when set, advances the watermark inside the same transaction.
    fn apply_manifest(
        &self,
        commit_time: DateTime<Utc>,
        ops: Vec<Operation>,
        advance_to: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, ManifestStats>;

    /// Advance the watermark on its own (used for diff files that carry no
    /// manifests).
    fn advance_watermark(&self, to: DateTime<Utc>) -> BoxFuture<'_, ()>;
}

/// Internal form of an operation after key extraction.
#[derive(Debug, Clone)]
enum PlannedOp {
    Upsert {
        kind: String,
        key: String,
        data: Vec<u8>,
    },
    Delete {
        kind: String,
        key: String,
    },
}

/// Extract the entity key from a serialized entity payload.
fn entity_key(kind: &str, entity: &[u8]) -> Result<String> {
    let value: serde_json::Value = serde_json::from_slice(entity)
        .map_err(|e| ReplayError::Decode(format!("{} entity: {}", kind, e)))?;
    value
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ReplayError::Decode(format!("{} entity has no string `id` field", kind)))
}

/// SQL target store backed by SQLite via sqlx.
///
/// Schema:
/// - `entities(kind, key, data, updated_at)` with PK `(kind, key)`
/// - `watermark(id = 0, commit_time)` singleton
///
/// The pool is also handed to [`SqlReplicationLock`](crate::lock::SqlReplicationLock)
/// so the lock record lives in the same durable store.
pub struct SqlTargetStore {
    pool: SqlitePool,
}

impl SqlTargetStore {
    /// Open (or create) the target store at the given path.
    pub async fn open(path: &str) -> Result<Self> {
        let pool = db::open_pool(path).await?;
        Self::with_pool(pool).await
    }

    /// Build on an existing pool, creating tables if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                data BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (kind, key)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watermark (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                commit_time INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("Target store ready");
        Ok(Self { pool })
    }

    /// The underlying pool (shared with the replication lock).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fetch one entity's payload (diagnostics and tests).
    pub async fn get(&self, kind: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM entities WHERE kind = ? AND key = ?")
                .bind(kind)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(data,)| data))
    }

    /// All keys of one kind, sorted (diagnostics and tests).
    pub async fn keys_of_kind(&self, kind: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM entities WHERE kind = ? ORDER BY key")
                .bind(kind)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    /// Close the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Target store closed");
    }
}

impl TargetStore for SqlTargetStore {
    fn watermark(&self) -> BoxFuture<'_, Option<DateTime<Utc>>> {
        Box::pin(async move {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT commit_time FROM watermark WHERE id = 0")
                    .fetch_optional(&self.pool)
                    .await?;
            match row {
                Some((millis,)) => Ok(Some(db::from_millis(millis)?)),
                None => Ok(None),
            }
        })
    }

    fn apply_manifest(
        &self,
        commit_time: DateTime<Utc>,
        ops: Vec<Operation>,
        advance_to: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, ManifestStats> {
        Box::pin(async move {
            // Key extraction happens before the transaction so a malformed
            // entity aborts the run with nothing written.
            let planned: Vec<PlannedOp> = ops
                .into_iter()
                .map(|op| match op {
                    Operation::Upsert { kind, entity } => {
                        let key = entity_key(&kind, &entity)?;
                        Ok(PlannedOp::Upsert {
                            kind,
                            key,
                            data: entity,
                        })
                    }
                    Operation::Delete { kind, key } => Ok(PlannedOp::Delete { kind, key }),
                })
                .collect::<Result<_>>()?;

            let commit_millis = db::to_millis(commit_time);
            let advance_millis = advance_to.map(db::to_millis);
            let pool = &self.pool;

            let stats = db::execute_with_retry("apply_manifest", || async {
                let mut tx = pool.begin().await?;
                let mut stats = ManifestStats::default();

                for op in &planned {
                    match op {
                        PlannedOp::Upsert { kind, key, data } => {
                            sqlx::query(
                                r#"
                                INSERT INTO entities (kind, key, data, updated_at)
                                VALUES (?, ?, ?, ?)
                                ON CONFLICT(kind, key) DO UPDATE SET
                                    data = excluded.data,
                                    updated_at = excluded.updated_at
                                "#,
                            )
                            .bind(kind)
                            .bind(key)
                            .bind(data)
                            .bind(commit_millis)
                            .execute(&mut *tx)
                            .await?;
                            stats.upserted += 1;
                        }
                        PlannedOp::Delete { kind, key } => {
                            let result =
                                sqlx::query("DELETE FROM entities WHERE kind = ? AND key = ?")
                                    .bind(kind)
                                    .bind(key)
                                    .execute(&mut *tx)
                                    .await?;
                            if result.rows_affected() == 0 {
                                // Already absent: the usual case is the
                                // delete target was never replicated or a
                                // prior partial run removed it.
                                stats.absent_deletes += 1;
                            } else {
                                stats.deleted += 1;
                            }
                        }
                    }
                }

                if let Some(watermark) = advance_millis {
                    sqlx::query(
                        r#"
                        INSERT INTO watermark (id, commit_time) VALUES (0, ?)
                        ON CONFLICT(id) DO UPDATE SET commit_time = excluded.commit_time
                        "#,
                    )
                    .bind(watermark)
                    .execute(&mut *tx)
                    .await?;
                }

                tx.commit().await?;
                Ok(stats)
            })
            .await?;

            debug!(
                commit_time = %commit_time,
                upserted = stats.upserted,
                deleted = stats.deleted,
                absent = stats.absent_deletes,
                "Applied manifest"
            );
            Ok(stats)
        })
    }

    fn advance_watermark(&self, to: DateTime<Utc>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let millis = db::to_millis(to);
            let pool = &self.pool;
            db::execute_with_retry("advance_watermark", || async {
                sqlx::query(
                    r#"
                    INSERT INTO watermark (id, commit_time) VALUES (0, ?)
                    ON CONFLICT(id) DO UPDATE SET commit_time = excluded.commit_time
                    "#,
                )
                .bind(millis)
                .execute(pool)
                .await
            })
            .await?;
            debug!(watermark = %to, "Advanced watermark");
            Ok(())
        })
    }
}
