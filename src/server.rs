// Copyright (c) 2025-2026 The commitlog-replay authors. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP trigger endpoints.
//!
//! Each pipeline component is invoked by an external cron-style scheduler
//! through a small axum router; there is no long-running in-process
//! scheduler loop.
//!
//! # Response Contract
//!
//! `POST /_task/replayCommitLogs`:
//! - `200` + JSON payload describing the new watermark on success.
//! - `204` + `"replayCommitLogs was called but disabled in the config."`
//! - `204` + `"Can't acquire SQL commit log replay lock, aborting."`
//! - `500` + the underlying error message on a mid-run failure.
//!
//! `POST /_task/checkpointCommitLogs`: `200` on advance, `204` when another
//! coordinator already advanced past the candidate.
//!
//! `GET /healthz`: watermark / checkpoint / lag snapshot.
//!
//! The benign `204` outcomes are part of normal operation - the scheduler's
//! next tick is the retry - and are never reported as failures.

use crate::checkpoint::{CheckpointCoordinator, TickOutcome};
use crate::error::{ReplayError, Result};
use crate::replay::{ReplayEngine, ReplayOutcome};
use crate::target::TargetStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Payload when replay is disabled by configuration.
pub const DISABLED_PAYLOAD: &str = "replayCommitLogs was called but disabled in the config.";

/// Payload when the replication lock is held by a live owner.
pub const LOCK_UNAVAILABLE_PAYLOAD: &str =
    "Can't acquire SQL commit log replay lock, aborting.";

/// The scheduler-facing service: replay engine plus checkpoint coordinator.
pub struct ReplicationService<S: TargetStore> {
    pub engine: ReplayEngine<S>,
    pub coordinator: CheckpointCoordinator,
}

/// JSON payload for a successful replay response.
#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub status: &'static str,
    pub new_watermark: Option<DateTime<Utc>>,
    pub files: usize,
    pub manifests: usize,
    pub upserted: usize,
    pub deleted: usize,
}

/// JSON payload for the health endpoint.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub watermark: Option<DateTime<Utc>>,
    pub latest_checkpoint: Option<DateTime<Utc>>,
    pub lag_seconds: Option<i64>,
}

/// Build the router for the given service.
pub fn router<S: TargetStore>(service: Arc<ReplicationService<S>>) -> Router {
    Router::new()
        .route("/_task/replayCommitLogs", post(replay_commit_logs::<S>))
        .route("/_task/checkpointCommitLogs", post(checkpoint_commit_logs::<S>))
        .route("/healthz", get(healthz::<S>))
        .with_state(service)
}

/// Bind and serve until the process is stopped.
pub async fn serve<S: TargetStore>(
    addr: SocketAddr,
    service: Arc<ReplicationService<S>>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ReplayError::Config(format!("bind {}: {}", addr, e)))?;
    info!(addr = %addr, "Replication service listening");
    axum::serve(listener, router(service))
        .await
        .map_err(|e| ReplayError::Internal(format!("server: {}", e)))
}

async fn replay_commit_logs<S: TargetStore>(
    State(service): State<Arc<ReplicationService<S>>>,
) -> Response {
    match service.engine.replay().await {
        Ok(ReplayOutcome::Disabled) => {
            (StatusCode::NO_CONTENT, DISABLED_PAYLOAD).into_response()
        }
        Ok(ReplayOutcome::LockUnavailable) => {
            (StatusCode::NO_CONTENT, LOCK_UNAVAILABLE_PAYLOAD).into_response()
        }
        Ok(ReplayOutcome::UpToDate { watermark }) => (
            StatusCode::OK,
            Json(ReplayResponse {
                status: "up_to_date",
                new_watermark: watermark,
                files: 0,
                manifests: 0,
                upserted: 0,
                deleted: 0,
            }),
        )
            .into_response(),
        Ok(ReplayOutcome::Applied {
            new_watermark,
            files,
            manifests,
            stats,
        }) => (
            StatusCode::OK,
            Json(ReplayResponse {
                status: "applied",
                new_watermark: Some(new_watermark),
                files,
                manifests,
                upserted: stats.upserted,
                deleted: stats.deleted,
            }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "Replay failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn checkpoint_commit_logs<S: TargetStore>(
    State(service): State<Arc<ReplicationService<S>>>,
) -> Response {
    match service.coordinator.tick().await {
        Ok(TickOutcome::Advanced { from, to }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "advanced",
                "from": from,
                "to": to,
            })),
        )
            .into_response(),
        Ok(TickOutcome::Skipped { .. }) => (
            StatusCode::NO_CONTENT,
            "Checkpoint did not advance, skipping export.",
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Checkpoint tick failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn healthz<S: TargetStore>(
    State(service): State<Arc<ReplicationService<S>>>,
) -> Response {
    let watermark = match service.engine.target().watermark().await {
        Ok(w) => w,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };
    let latest_checkpoint = match service.engine.checkpoints().last().await {
        Ok(c) => c,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let lag_seconds = match (watermark, latest_checkpoint) {
        (Some(w), Some(c)) => Some((c - w).num_seconds().max(0)),
        _ => None,
    };

    (
        StatusCode::OK,
        Json(HealthResponse {
            watermark,
            latest_checkpoint,
            lag_seconds,
        }),
    )
        .into_response()
}
