//! Handlers for `/retention/snapshots` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/retention/snapshots` | Optional body `{"product_id":N}`; 202 when queued |
//! | `GET`  | `/retention/snapshots/jobs/:job_id` | 404 with `success:false` if unknown |
//! | `GET`  | `/retention/snapshots/stats` | Table summary |

use std::sync::Arc;

use axum::{
  Json,
  body::Bytes,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use cohort_core::{
  history::ProductId,
  job::{ExecutionMode, SnapshotService},
  snapshot::SnapshotStats,
  store::RetentionStore,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

// ─── Trigger ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TriggerBody {
  pub product_id: Option<ProductId>,
}

/// `POST /retention/snapshots`
///
/// An empty body rebuilds every scope.
pub async fn trigger<S>(
  State(service): State<Arc<SnapshotService<S>>>,
  body: Bytes,
) -> Result<impl IntoResponse, ApiError>
where
  S: RetentionStore + 'static,
{
  let body: TriggerBody = if body.iter().all(u8::is_ascii_whitespace) {
    TriggerBody::default()
  } else {
    serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
  };

  let response = service.trigger(body.product_id).await;
  let status = match (response.success, response.mode) {
    (false, _) => StatusCode::INTERNAL_SERVER_ERROR,
    (true, ExecutionMode::Background) => StatusCode::ACCEPTED,
    (true, ExecutionMode::Synchronous) => StatusCode::OK,
  };
  Ok((status, Json(response)))
}

// ─── Status ───────────────────────────────────────────────────────────────────

/// `GET /retention/snapshots/jobs/:job_id`
pub async fn job_status<S>(
  State(service): State<Arc<SnapshotService<S>>>,
  Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
  S: RetentionStore + 'static,
{
  let response = service.job_status(&job_id).await?;
  let status = if response.success { StatusCode::OK } else { StatusCode::NOT_FOUND };
  Ok((status, Json(response)))
}

// ─── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatsResponse {
  pub success: bool,
  pub stats:   SnapshotStats,
}

/// `GET /retention/snapshots/stats`
pub async fn stats<S>(
  State(service): State<Arc<SnapshotService<S>>>,
) -> Result<Json<StatsResponse>, ApiError>
where
  S: RetentionStore + 'static,
{
  let stats = service.stats().await?;
  Ok(Json(StatsResponse { success: true, stats }))
}
