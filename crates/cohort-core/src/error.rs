//! Error types for `cohort-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid month {0:?}: expected YYYY-MM")]
  InvalidMonth(String),

  #[error("unknown billing interval: {0:?}")]
  UnknownBillingInterval(String),

  #[error("unknown job status: {0:?}")]
  UnknownJobStatus(String),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Box a backend error so it can cross the store boundary.
  pub fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
