//! The `RetentionStore` trait.
//!
//! Implemented by storage backends (e.g. `cohort-store-sqlite`). The builder,
//! the cohort query and the job trigger depend on this abstraction, not on
//! any concrete backend.

use std::future::Future;

use crate::{
  history::{
    History, NewOrder, NewSubscription, Order, Product, ProductId, Subscription,
    Variation, VariationId,
  },
  job::JobRecord,
  snapshot::{RetentionSnapshot, SnapshotFilter, SnapshotStats},
};

/// Abstraction over a retention analytics backend.
///
/// All methods return `Send` futures so the trait can be used in multi-threaded
/// async runtimes (e.g. tokio with `axum`).
pub trait RetentionStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── History ───────────────────────────────────────────────────────────

  fn add_product(
    &self,
    name: String,
  ) -> impl Future<Output = Result<Product, Self::Error>> + Send + '_;

  fn add_variation(
    &self,
    product_id: ProductId,
    name: String,
  ) -> impl Future<Output = Result<Variation, Self::Error>> + Send + '_;

  fn record_subscription(
    &self,
    input: NewSubscription,
  ) -> impl Future<Output = Result<Subscription, Self::Error>> + Send + '_;

  fn record_order(
    &self,
    input: NewOrder,
  ) -> impl Future<Output = Result<Order, Self::Error>> + Send + '_;

  /// Products that appear in any subscription or order, ascending.
  fn active_product_ids(
    &self,
  ) -> impl Future<Output = Result<Vec<ProductId>, Self::Error>> + Send + '_;

  /// Map variation ids to the distinct ids of their owning products.
  /// Unknown variation ids are ignored.
  fn product_ids_for_variations<'a>(
    &'a self,
    variation_ids: &'a [VariationId],
  ) -> impl Future<Output = Result<Vec<ProductId>, Self::Error>> + Send + 'a;

  /// All subscriptions and orders, restricted to one product if given.
  fn load_history(
    &self,
    product_id: Option<ProductId>,
  ) -> impl Future<Output = Result<History, Self::Error>> + Send + '_;

  // ── Snapshots ─────────────────────────────────────────────────────────

  /// Insert or overwrite rows keyed by `(cohort, period, product_id)`.
  /// Returns the number of rows written.
  fn upsert_snapshots(
    &self,
    rows: Vec<RetentionSnapshot>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  /// Rows matching `filter`, ordered by `(cohort, period, product_id)`.
  fn query_snapshots<'a>(
    &'a self,
    filter: &'a SnapshotFilter,
  ) -> impl Future<Output = Result<Vec<RetentionSnapshot>, Self::Error>> + Send + 'a;

  fn snapshot_stats(
    &self,
  ) -> impl Future<Output = Result<SnapshotStats, Self::Error>> + Send + '_;

  // ── Job status ────────────────────────────────────────────────────────

  /// Insert or replace the status record for `record.job_id`.
  fn put_job<'a>(
    &'a self,
    record: &'a JobRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn get_job<'a>(
    &'a self,
    job_id: &'a str,
  ) -> impl Future<Output = Result<Option<JobRecord>, Self::Error>> + Send + 'a;
}
