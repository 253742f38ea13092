//! Error type for `cohort-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] cohort_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("product not found: {0}")]
  ProductNotFound(i64),

  #[error("variation {variation_id} does not belong to product {product_id}")]
  VariationNotInProduct { variation_id: i64, product_id: i64 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
