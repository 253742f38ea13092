//! JSON REST API for cohort retention analytics.
//!
//! Exposes an axum [`Router`] backed by a [`SnapshotService`] over any
//! [`cohort_core::store::RetentionStore`]. Auth, TLS, and transport concerns
//! are the caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", cohort_api::api_router(service.clone()))
//! ```

pub mod cohorts;
pub mod error;
pub mod history;
pub mod snapshots;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use cohort_core::{job::SnapshotService, store::RetentionStore};

pub use error::ApiError;

/// Build a fully-materialised API router for `service`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(service: Arc<SnapshotService<S>>) -> Router<()>
where
  S: RetentionStore + 'static,
{
  Router::new()
    // Retention
    .route("/retention/snapshots", post(snapshots::trigger::<S>))
    .route("/retention/snapshots/jobs/{job_id}", get(snapshots::job_status::<S>))
    .route("/retention/snapshots/stats", get(snapshots::stats::<S>))
    .route("/retention/cohorts", get(cohorts::handler::<S>))
    // History
    .route("/products", post(history::create_product::<S>))
    .route("/variations", post(history::create_variation::<S>))
    .route("/subscriptions", post(history::create_subscription::<S>))
    .route("/orders", post(history::create_order::<S>))
    .with_state(service)
}
