//! Retention snapshot rows, the denormalised output of the builder.

use serde::{Deserialize, Serialize};

use crate::{history::ProductId, month::Month};

/// One row per `(cohort, period, product_id)`; `product_id = None` holds the
/// all-products aggregate.
///
/// Rows are upserted by that triple, so rebuilding a snapshot overwrites the
/// counts in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionSnapshot {
  pub cohort:                   Month,
  pub period:                   Month,
  pub product_id:               Option<ProductId>,
  pub cohort_customers:         i64,
  /// Cohort revenue in the cohort month, minor units.
  pub cohort_mrr:               i64,
  pub retained_customers:       i64,
  pub retained_mrr:             i64,
  pub new_customers:            i64,
  pub churned_customers:        i64,
  pub retention_rate_customers: Option<f64>,
  pub retention_rate_mrr:       Option<f64>,
  /// Whole months from `cohort` to `period`, fixed at write time.
  pub period_offset:            i32,
}

impl RetentionSnapshot {
  /// The uniqueness key of the snapshot table.
  pub fn key(&self) -> (Month, Month, Option<ProductId>) {
    (self.cohort, self.period, self.product_id)
  }
}

/// `retained / baseline` as a percentage rounded to two decimals; `None`
/// when the baseline is not positive.
pub fn retention_rate(retained: i64, baseline: i64) -> Option<f64> {
  if baseline <= 0 {
    return None;
  }
  let pct = retained as f64 / baseline as f64 * 100.0;
  Some((pct * 100.0).round() / 100.0)
}

/// Summary of the snapshot table, reported after every build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
  pub total_records:   u64,
  pub unique_cohorts:  u64,
  pub unique_periods:  u64,
  /// Distinct non-null products; the all-products rows are not counted.
  pub unique_products: u64,
}

/// Parameters for [`crate::store::RetentionStore::query_snapshots`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
  /// Empty selects the all-products rows (`product_id IS NULL`).
  pub product_ids: Vec<ProductId>,
  /// Inclusive lower bound on `cohort`.
  pub cohort_from: Option<Month>,
  /// Inclusive upper bound on `cohort`.
  pub cohort_to:   Option<Month>,
}
