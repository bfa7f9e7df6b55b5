// Copyright (c) 2025-2026 The commitlog-replay authors. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fleet-wide replication lock.
//!
//! At most one replay run may be active system-wide. The lock is a single
//! durable lease row in the target store's database: acquisition is a
//! transactional compare-and-set, so two concurrent invocations cannot both
//! win regardless of which process they run in.
//!
//! # Liveness
//!
//! A crashed holder would otherwise block replay for a full lease. The
//! [`LivenessProbe`] seam lets deployments reclaim a lock whose holder is
//! provably dead (e.g. its instance no longer exists) without waiting out
//! the lease. The default probe trusts the lease alone.
//!
//! The lock is not reentrant: a held, live lock makes `acquire` return
//! `false` immediately rather than block - the caller's next scheduled tick
//! is the retry.

use crate::db;
use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the commit-log replay lock.
pub const REPLAY_LOCK_NAME: &str = "sql-commit-log-replay";

/// Decides whether a lease holder is still alive.
///
/// Consulted only for unexpired leases; an expired lease is always
/// reclaimable.
pub trait LivenessProbe: Send + Sync + 'static {
    fn is_live(&self, owner: &str) -> bool;
}

/// Default probe: trust the lease, assume every unexpired holder is alive.
pub struct LeaseExpiryOnly;

impl LivenessProbe for LeaseExpiryOnly {
    fn is_live(&self, _owner: &str) -> bool {
        true
    }
}

/// A snapshot of the current lease row (diagnostics).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Durable lease-based mutual exclusion backed by SQLite.
pub struct SqlReplicationLock {
    pool: SqlitePool,
    name: String,
    probe: Arc<dyn LivenessProbe>,
}

impl SqlReplicationLock {
    /// Create the lock over an existing pool, creating the lease table if
    /// needed.
    pub async fn new(
        pool: SqlitePool,
        name: impl Into<String>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            name: name.into(),
            probe,
        })
    }

    /// Try to acquire the lock for `owner` with the given lease duration.
    ///
    /// Returns `false` without blocking when another live holder has the
    /// lock. Reclaims leases that have expired or whose holder fails the
    /// liveness probe.
    pub async fn acquire(&self, owner: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let now_millis = db::to_millis(now);
        let expires_millis = db::to_millis(
            now + ChronoDuration::milliseconds(lease.as_millis() as i64),
        );
        let pool = &self.pool;
        let name = &self.name;
        let probe = &self.probe;

        let acquired = db::execute_with_retry("lock_acquire", || async {
            let mut tx = pool.begin().await?;

            let row: Option<(String, i64)> =
                sqlx::query_as("SELECT owner, expires_at FROM leases WHERE name = ?")
                    .bind(name)
                    .fetch_optional(&mut *tx)
                    .await?;

            if let Some((holder, holder_expires)) = row {
                let expired = holder_expires <= now_millis;
                if !expired && probe.is_live(&holder) {
                    // Held by a live owner; do not block, do not steal.
                    tx.rollback().await?;
                    return Ok(false);
                }
                if expired {
                    debug!(holder = %holder, "Reclaiming expired replication lock");
                } else {
                    warn!(holder = %holder, "Reclaiming replication lock from dead holder");
                }
            }

            sqlx::query(
                r#"
                INSERT INTO leases (name, owner, acquired_at, expires_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    owner = excluded.owner,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                "#,
            )
            .bind(name)
            .bind(owner)
            .bind(now_millis)
            .bind(expires_millis)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await?;

        if acquired {
            info!(owner = %owner, lock = %self.name, "Acquired replication lock");
        } else {
            debug!(owner = %owner, lock = %self.name, "Replication lock unavailable");
        }
        Ok(acquired)
    }

    /// Release the lock, but only if `owner` still holds it.
    ///
    /// Releasing a lock that was already reclaimed by another run is a
    /// no-op; the reclaimer now owns it.
    pub async fn release(&self, owner: &str) -> Result<()> {
        let pool = &self.pool;
        let name = &self.name;

        let released = db::execute_with_retry("lock_release", || async {
            sqlx::query("DELETE FROM leases WHERE name = ? AND owner = ?")
                .bind(name)
                .bind(owner)
                .execute(pool)
                .await
        })
        .await?;

        if released.rows_affected() > 0 {
            info!(owner = %owner, lock = %self.name, "Released replication lock");
        } else {
            debug!(owner = %owner, lock = %self.name, "Release was a no-op (not the holder)");
        }
        Ok(())
    }

    /// Current lease row, if any (diagnostics).
    pub async fn holder(&self) -> Result<Option<LockHolder>> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            "SELECT owner, acquired_at, expires_at FROM leases WHERE name = ?",
        )
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((owner, acquired, expires)) => Ok(Some(LockHolder {
                owner,
                acquired_at: db::from_millis(acquired)?,
                expires_at: db::from_millis(expires)?,
            })),
            None => Ok(None),
        }
    }
}
