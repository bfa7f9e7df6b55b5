// Copyright (c) 2025-2026 The commitlog-replay authors. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint computation and export scheduling.
//!
//! The coordinator periodically computes a new checkpoint time and persists
//! it only if it advances monotonically; a candidate at or before the last
//! persisted checkpoint is a logged no-op, never an error. This
//! compare-and-set is what keeps two racing coordinator invocations from
//! producing duplicate or backward-moving export cycles.
//!
//! Diff export itself is external. After advancing, the coordinator
//! schedules the exporter for the newly covered range with a fixed delay
//! calibrated to exceed the source store's commit-visibility latency, so
//! the exporter never runs before the transaction that produced the
//! checkpoint is externally visible.

use crate::db;
use crate::error::Result;
use crate::target::BoxFuture;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Source-store boundary: the commit timeline the checkpoint must respect.
///
/// A checkpoint at time `C` guarantees no write at or before `C` is still
/// uncommitted, so the candidate is bounded by the oldest in-flight source
/// transaction.
pub trait SourceTimeline: Send + Sync + 'static {
    /// Commit time of the oldest transaction still open against the source
    /// store, if any.
    fn oldest_in_flight(&self) -> Option<DateTime<Utc>>;
}

/// Timeline with no in-flight transaction tracking: checkpoints at "now".
pub struct NoInFlight;

impl SourceTimeline for NoInFlight {
    fn oldest_in_flight(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// External diff-export boundary.
///
/// Implementations turn the source store's native transaction log for
/// `(lower, upper]` into a diff file in the bucket. This crate only
/// schedules the call.
pub trait DiffExporter: Send + Sync + 'static {
    fn export(&self, lower: DateTime<Utc>, upper: DateTime<Utc>) -> BoxFuture<'_, ()>;
}

/// Result of a checkpoint compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The checkpoint advanced; `previous` is the prior checkpoint time.
    Advanced {
        previous: Option<DateTime<Utc>>,
    },
    /// Another coordinator already advanced to or past the candidate.
    Behind {
        last: DateTime<Utc>,
    },
}

/// Durable, monotonic checkpoint record on the source side.
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint store at the given path.
    pub async fn open(path: &str) -> Result<Self> {
        let pool = db::open_pool(path).await?;
        Self::with_pool(pool).await
    }

    /// Build on an existing pool, creating the table if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_time INTEGER PRIMARY KEY
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Latest persisted checkpoint time, if any.
    pub async fn last(&self) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT MAX(checkpoint_time) FROM checkpoints")
                .fetch_optional(&self.pool)
                .await?;
        match row.and_then(|(millis,)| millis) {
            Some(millis) => Ok(Some(db::from_millis(millis)?)),
            None => Ok(None),
        }
    }

    /// Persist `candidate` iff it is strictly after the last checkpoint.
    pub async fn try_advance(&self, candidate: DateTime<Utc>) -> Result<Advance> {
        let candidate_millis = db::to_millis(candidate);
        let pool = &self.pool;

        let advance = db::execute_with_retry("checkpoint_advance", || async {
            let mut tx = pool.begin().await?;

            let row: Option<(Option<i64>,)> =
                sqlx::query_as("SELECT MAX(checkpoint_time) FROM checkpoints")
                    .fetch_optional(&mut *tx)
                    .await?;
            let last = row.and_then(|(millis,)| millis);

            if let Some(last_millis) = last {
                if candidate_millis <= last_millis {
                    tx.rollback().await?;
                    return Ok(Advance::Behind {
                        last: Utc
                            .timestamp_millis_opt(last_millis)
                            .single()
                            .unwrap_or(DateTime::<Utc>::MIN_UTC),
                    });
                }
            }

            sqlx::query("INSERT INTO checkpoints (checkpoint_time) VALUES (?)")
                .bind(candidate_millis)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            Ok(Advance::Advanced {
                previous: last.and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            })
        })
        .await?;

        Ok(advance)
    }

    /// Close the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Outcome of one coordinator tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Checkpoint advanced and export scheduled for `(from, to]`.
    Advanced {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// Candidate did not advance past the last checkpoint.
    Skipped {
        candidate: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

/// Periodically invoked checkpoint coordinator.
pub struct CheckpointCoordinator {
    store: Arc<CheckpointStore>,
    timeline: Arc<dyn SourceTimeline>,
    exporter: Arc<dyn DiffExporter>,
    export_delay: Duration,
}

impl CheckpointCoordinator {
    pub fn new(
        store: Arc<CheckpointStore>,
        timeline: Arc<dyn SourceTimeline>,
        exporter: Arc<dyn DiffExporter>,
        export_delay: Duration,
    ) -> Self {
        Self {
            store,
            timeline,
            exporter,
            export_delay,
        }
    }

    /// Compute, persist, and schedule export for a new checkpoint.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let now = Utc::now();
        // The candidate may not reach into time still covered by an open
        // source transaction.
        let candidate = match self.timeline.oldest_in_flight() {
            Some(oldest) => now.min(oldest - ChronoDuration::milliseconds(1)),
            None => now,
        };

        match self.store.try_advance(candidate).await? {
            Advance::Behind { last } => {
                debug!(
                    candidate = %candidate,
                    last = %last,
                    "Checkpoint already advanced past candidate, skipping"
                );
                Ok(TickOutcome::Skipped { candidate, last })
            }
            Advance::Advanced { previous } => {
                let from = previous.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                info!(from = %from, to = %candidate, "Checkpoint advanced");
                self.schedule_export(from, candidate);
                Ok(TickOutcome::Advanced {
                    from,
                    to: candidate,
                })
            }
        }
    }

    /// Schedule the external diff export after the visibility delay.
    fn schedule_export(&self, lower: DateTime<Utc>, upper: DateTime<Utc>) {
        let exporter = Arc::clone(&self.exporter);
        let delay = self.export_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = exporter.export(lower, upper).await {
                error!(
                    lower = %lower,
                    upper = %upper,
                    error = %e,
                    "Diff export failed; range will be re-exported on operator action"
                );
            }
        });
    }
}
