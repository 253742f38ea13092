//! Handlers for history ingestion.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/products` | Body: `{"name":"..."}` |
//! | `POST` | `/variations` | Body: `{"product_id":N,"name":"..."}` |
//! | `POST` | `/subscriptions` | Body: [`NewSubscription`] |
//! | `POST` | `/orders` | Body: [`NewOrder`] |
//!
//! All return 201 with the stored record. Snapshots are not rebuilt here.

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use cohort_core::{
  history::{NewOrder, NewSubscription, ProductId, VariationId},
  job::SnapshotService,
  store::RetentionStore,
};
use serde::Deserialize;

use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ProductBody {
  pub name: String,
}

/// `POST /products`
pub async fn create_product<S>(
  State(service): State<Arc<SnapshotService<S>>>,
  Json(body): Json<ProductBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: RetentionStore + 'static,
{
  let name = non_blank(body.name)?;
  let product = service.store().add_product(name).await.map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(product)))
}

#[derive(Debug, Deserialize)]
pub struct VariationBody {
  pub product_id: ProductId,
  pub name:       String,
}

/// `POST /variations`
pub async fn create_variation<S>(
  State(service): State<Arc<SnapshotService<S>>>,
  Json(body): Json<VariationBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: RetentionStore + 'static,
{
  let name = non_blank(body.name)?;
  let variation = service
    .store()
    .add_variation(body.product_id, name)
    .await
    .map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(variation)))
}

/// `POST /subscriptions`
pub async fn create_subscription<S>(
  State(service): State<Arc<SnapshotService<S>>>,
  Json(body): Json<NewSubscription>,
) -> Result<impl IntoResponse, ApiError>
where
  S: RetentionStore + 'static,
{
  if body.recurring_amount < 0 {
    return Err(ApiError::BadRequest("recurring_amount must not be negative".into()));
  }
  check_variation(&service, body.product_id, body.variation_id).await?;
  let subscription = service.store().record_subscription(body).await.map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(subscription)))
}

/// `POST /orders`
pub async fn create_order<S>(
  State(service): State<Arc<SnapshotService<S>>>,
  Json(body): Json<NewOrder>,
) -> Result<impl IntoResponse, ApiError>
where
  S: RetentionStore + 'static,
{
  if body.total < 0 {
    return Err(ApiError::BadRequest("total must not be negative".into()));
  }
  check_variation(&service, body.product_id, body.variation_id).await?;
  let order = service.store().record_order(body).await.map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(order)))
}

/// Reject a variation that is unknown or owned by another product.
async fn check_variation<S>(
  service: &SnapshotService<S>,
  product_id: ProductId,
  variation_id: Option<VariationId>,
) -> Result<(), ApiError>
where
  S: RetentionStore,
{
  let Some(variation_id) = variation_id else { return Ok(()) };
  let owners = service
    .store()
    .product_ids_for_variations(&[variation_id])
    .await
    .map_err(ApiError::store)?;
  if owners != [product_id] {
    return Err(ApiError::BadRequest(format!(
      "variation {variation_id} does not belong to product {product_id}"
    )));
  }
  Ok(())
}

fn non_blank(name: String) -> Result<String, ApiError> {
  let trimmed = name.trim();
  if trimmed.is_empty() {
    return Err(ApiError::BadRequest("name must not be empty".into()));
  }
  Ok(trimmed.to_owned())
}
