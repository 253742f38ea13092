//! HTTP server, configuration and background worker for cohort retention.
//!
//! Mounts the [`cohort_api`] router under `/api` behind admin Basic auth and
//! wires a [`SnapshotService`] to an in-process job worker.

pub mod auth;
pub mod error;
pub mod worker;

pub use error::Error;

use std::{path::PathBuf, sync::Arc, time::Duration};

use argon2::PasswordHash;
use axum::{Router, middleware};
use cohort_core::{job::SnapshotService, store::RetentionStore};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use auth::AuthConfig;

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml` and
/// `COHORT_*` environment variables.
#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:                 String,
  #[serde(default = "default_port")]
  pub port:                 u16,
  pub store_path:           PathBuf,
  #[serde(default)]
  pub admin_username:       String,
  #[serde(default)]
  pub admin_password_hash:  String,
  /// Run triggered builds on the in-process worker instead of inline.
  #[serde(default = "default_background_jobs")]
  pub background_jobs:      bool,
  /// Wall-clock budget per background run, in seconds; 0 disables it.
  #[serde(default = "default_job_time_budget_secs")]
  pub job_time_budget_secs: u64,
}

fn default_host() -> String { "127.0.0.1".to_string() }

fn default_port() -> u16 { 8080 }

fn default_background_jobs() -> bool { true }

fn default_job_time_budget_secs() -> u64 { 25 }

impl ServerConfig {
  /// Check the settings `serve` depends on.
  pub fn validate(&self) -> Result<(), Error> {
    if self.admin_username.trim().is_empty() {
      return Err(Error::Config("admin_username must be set".into()));
    }
    if self.admin_username.contains(':') {
      return Err(Error::Config("admin_username must not contain ':'".into()));
    }
    PasswordHash::new(&self.admin_password_hash).map_err(|e| {
      Error::Config(format!("admin_password_hash is not an argon2 PHC string: {e}"))
    })?;
    if self.port == 0 {
      return Err(Error::Config("port must be non-zero".into()));
    }
    Ok(())
  }

  /// `None` when the budget is disabled.
  pub fn job_time_budget(&self) -> Option<Duration> {
    (self.job_time_budget_secs > 0).then(|| Duration::from_secs(self.job_time_budget_secs))
  }

  pub fn auth(&self) -> AuthConfig {
    AuthConfig {
      username:      self.admin_username.clone(),
      password_hash: self.admin_password_hash.clone(),
    }
  }
}

// ─── Application state ────────────────────────────────────────────────────────

/// Everything the router needs, built once at startup.
#[derive(Clone)]
pub struct AppState<S> {
  pub service: Arc<SnapshotService<S>>,
  pub auth:    Arc<AuthConfig>,
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the top-level axum [`Router`]: `/api/*` requires admin credentials.
pub fn router<S>(state: AppState<S>) -> Router
where
  S: RetentionStore + 'static,
{
  let api = cohort_api::api_router(state.service)
    .layer(middleware::from_fn_with_state(state.auth, auth::require_admin));

  Router::new()
    .nest("/api", api)
    .layer(TraceLayer::new_for_http())
}
