//! The retention query service: snapshot rows reshaped into cohort matrices.
//!
//! Rows are cohorts, columns are period offsets `0..max_periods`. Every row
//! has exactly `max_periods` cells; a cell with no underlying data is `None`.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  history::{ProductId, VariationId},
  month::Month,
  snapshot::{RetentionSnapshot, SnapshotFilter, retention_rate},
  store::RetentionStore,
};

/// Columns shown for yearly grouping when no wider date range is requested.
pub const DEFAULT_YEARLY_PERIODS: u32 = 8;
/// Columns shown for monthly grouping.
pub const DEFAULT_MONTHLY_PERIODS: u32 = 18;

// ─── Parameters ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
  Month,
  #[default]
  Year,
}

impl GroupBy {
  /// Parse a caller-supplied value; anything unrecognised means `Year`.
  pub fn parse_lossy(s: &str) -> Self {
    match s.trim().to_ascii_lowercase().as_str() {
      "month" | "monthly" => Self::Month,
      _ => Self::Year,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
  #[default]
  Subscribers,
  Mrr,
}

impl Metric {
  /// Parse a caller-supplied value; anything unrecognised means `Subscribers`.
  pub fn parse_lossy(s: &str) -> Self {
    match s.trim().to_ascii_lowercase().as_str() {
      "mrr" | "revenue" => Self::Mrr,
      _ => Self::Subscribers,
    }
  }
}

/// Whether cells hold retention percentages or raw retained amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellValue {
  #[default]
  Rate,
  Count,
}

impl CellValue {
  /// Anything other than `count` means `Rate`.
  pub fn parse_lossy(s: &str) -> Self {
    match s.trim().to_ascii_lowercase().as_str() {
      "count" | "absolute" => Self::Count,
      _ => Self::Rate,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct CohortFilters {
  pub start_date:    Option<NaiveDate>,
  pub end_date:      Option<NaiveDate>,
  pub product_ids:   Vec<ProductId>,
  pub variation_ids: Vec<VariationId>,
  pub group_by:      GroupBy,
  pub metric:        Metric,
  pub value:         CellValue,
}

impl CohortFilters {
  /// Number of period columns.
  ///
  /// Monthly grouping always shows 18. Yearly grouping shows 8, or the number
  /// of years spanned by the date range when that is larger.
  pub fn max_periods(&self) -> u32 {
    match self.group_by {
      GroupBy::Month => DEFAULT_MONTHLY_PERIODS,
      GroupBy::Year => match (self.start_date, self.end_date) {
        (Some(start), Some(end)) if end >= start => {
          let span = (end.year() - start.year()) as u32 + 1;
          span.max(DEFAULT_YEARLY_PERIODS)
        }
        _ => DEFAULT_YEARLY_PERIODS,
      },
    }
  }

  /// Inclusive cohort-month bounds implied by the date range.
  fn cohort_bounds(&self) -> (Option<Month>, Option<Month>) {
    match self.group_by {
      GroupBy::Month => (self.start_date.map(Month::of), self.end_date.map(Month::of)),
      GroupBy::Year => (
        self.start_date.map(|d| Month::first_of_year(d.year())),
        self.end_date.map(|d| Month::last_of_year(d.year())),
      ),
    }
  }
}

// ─── Output ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortRow {
  /// `YYYY-MM` for monthly grouping, `YYYY` for yearly grouping.
  pub cohort:   String,
  /// Cohort size in the chosen metric (customers, or revenue in minor units).
  pub baseline: i64,
  pub cells:    Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortMatrix {
  pub group_by:    GroupBy,
  pub metric:      Metric,
  pub value:       CellValue,
  pub max_periods: u32,
  /// Column headers: `0..max_periods`.
  pub periods:     Vec<u32>,
  pub rows:        Vec<CohortRow>,
  /// Per-column summary across rows with data: the baseline-weighted rate
  /// for [`CellValue::Rate`], the mean for [`CellValue::Count`].
  pub averages:    Vec<Option<f64>>,
}

// ─── Aggregation ─────────────────────────────────────────────────────────────

/// Snapshot measures summed across the products in the filter.
#[derive(Debug, Clone, Copy, Default)]
struct Measures {
  cohort_customers:   i64,
  cohort_mrr:         i64,
  retained_customers: i64,
  retained_mrr:       i64,
}

impl Measures {
  fn add(&mut self, row: &RetentionSnapshot) {
    self.cohort_customers += row.cohort_customers;
    self.cohort_mrr = self.cohort_mrr.saturating_add(row.cohort_mrr);
    self.retained_customers += row.retained_customers;
    self.retained_mrr = self.retained_mrr.saturating_add(row.retained_mrr);
  }

  fn baseline(&self, metric: Metric) -> i64 {
    match metric {
      Metric::Subscribers => self.cohort_customers,
      Metric::Mrr => self.cohort_mrr,
    }
  }

  fn retained(&self, metric: Metric) -> i64 {
    match metric {
      Metric::Subscribers => self.retained_customers,
      Metric::Mrr => self.retained_mrr,
    }
  }
}

/// A row under construction: baseline plus per-offset retained sums.
struct Bucket {
  baseline: i64,
  retained: Vec<Option<i64>>,
}

impl Bucket {
  fn empty(width: usize) -> Self { Self { baseline: 0, retained: vec![None; width] } }

  fn credit(&mut self, offset: usize, amount: i64) {
    if let Some(cell) = self.retained.get_mut(offset) {
      *cell = Some(cell.unwrap_or(0).saturating_add(amount));
    }
  }
}

/// Reshape snapshot rows into a cohort matrix. Pure; no I/O.
pub fn build_matrix(rows: &[RetentionSnapshot], filters: &CohortFilters) -> CohortMatrix {
  let max_periods = filters.max_periods();
  let width = max_periods as usize;
  let metric = filters.metric;

  // (cohort, period) → measures summed over products.
  let mut grid: BTreeMap<(Month, Month), Measures> = BTreeMap::new();
  for row in rows {
    grid.entry((row.cohort, row.period)).or_default().add(row);
  }

  // Latest period built for each monthly cohort.
  let mut latest: BTreeMap<Month, Month> = BTreeMap::new();
  for (cohort, period) in grid.keys() {
    let slot = latest.entry(*cohort).or_insert(*period);
    *slot = (*slot).max(*period);
  }

  let mut buckets: BTreeMap<String, Bucket> = BTreeMap::new();

  for (&cohort, &last) in &latest {
    let base = grid
      .get(&(cohort, cohort))
      .map_or(0, |m| m.baseline(metric));

    match filters.group_by {
      GroupBy::Month => {
        let bucket = buckets
          .entry(cohort.to_string())
          .or_insert_with(|| Bucket::empty(width));
        bucket.baseline = bucket.baseline.saturating_add(base);
        for offset in 0..width {
          let period = cohort.plus(offset as i32);
          if let Some(m) = grid.get(&(cohort, period)) {
            bucket.credit(offset, m.retained(metric));
          }
        }
      }
      GroupBy::Year => {
        let bucket = buckets
          .entry(cohort.year().to_string())
          .or_insert_with(|| Bucket::empty(width));
        bucket.baseline = bucket.baseline.saturating_add(base);
        for offset in 0..width {
          let year = cohort.year() + offset as i32;
          if year > last.year() {
            break;
          }
          // Measured at year end, or at the latest built month of this year.
          let period = Month::last_of_year(year).min(last);
          if let Some(m) = grid.get(&(cohort, period)) {
            bucket.credit(offset, m.retained(metric));
          }
        }
      }
    }
  }

  // With an explicit range every bucket in it gets a row, data or not.
  if let (Some(from), Some(to)) = filters.cohort_bounds() {
    match filters.group_by {
      GroupBy::Month => {
        for month in from.through(to) {
          buckets.entry(month.to_string()).or_insert_with(|| Bucket::empty(width));
        }
      }
      GroupBy::Year => {
        for year in from.year()..=to.year() {
          buckets.entry(year.to_string()).or_insert_with(|| Bucket::empty(width));
        }
      }
    }
  }

  let matrix_rows: Vec<CohortRow> = buckets
    .iter()
    .map(|(key, bucket)| CohortRow {
      cohort:   key.clone(),
      baseline: bucket.baseline,
      cells:    bucket
        .retained
        .iter()
        .map(|cell| {
          cell.and_then(|retained| match filters.value {
            CellValue::Rate => retention_rate(retained, bucket.baseline),
            CellValue::Count => Some(retained as f64),
          })
        })
        .collect(),
    })
    .collect();

  let averages = (0..width)
    .map(|offset| column_average(&buckets, offset, filters.value))
    .collect();

  CohortMatrix {
    group_by: filters.group_by,
    metric,
    value: filters.value,
    max_periods,
    periods: (0..max_periods).collect(),
    rows: matrix_rows,
    averages,
  }
}

fn column_average(
  buckets: &BTreeMap<String, Bucket>,
  offset: usize,
  value: CellValue,
) -> Option<f64> {
  let present: Vec<(i64, i64)> = buckets
    .values()
    .filter_map(|b| b.retained[offset].map(|r| (r, b.baseline)))
    .collect();
  if present.is_empty() {
    return None;
  }
  match value {
    CellValue::Rate => {
      let retained = present.iter().fold(0i64, |acc, (r, _)| acc.saturating_add(*r));
      let baseline = present.iter().fold(0i64, |acc, (_, b)| acc.saturating_add(*b));
      retention_rate(retained, baseline)
    }
    CellValue::Count => {
      let total = present.iter().fold(0i64, |acc, (r, _)| acc.saturating_add(*r));
      let mean = total as f64 / present.len() as f64;
      Some((mean * 100.0).round() / 100.0)
    }
  }
}

// ─── Service entry point ─────────────────────────────────────────────────────

/// Resolve filters against `store` and build the cohort matrix.
///
/// Variation ids are translated to their owning products first; the snapshot
/// table is kept at product granularity.
pub async fn cohort_matrix<S>(store: &S, filters: &CohortFilters) -> Result<CohortMatrix>
where
  S: RetentionStore,
{
  let mut product_ids = filters.product_ids.clone();
  if !filters.variation_ids.is_empty() {
    let mapped = store
      .product_ids_for_variations(&filters.variation_ids)
      .await
      .map_err(Error::store)?;
    if mapped.is_empty() && product_ids.is_empty() {
      // An empty product list would select the all-products rows.
      tracing::debug!(variation_ids = ?filters.variation_ids, "variation filter matched no products");
      return Ok(build_matrix(&[], filters));
    }
    product_ids.extend(mapped);
  }
  product_ids.sort_unstable();
  product_ids.dedup();

  let (cohort_from, cohort_to) = filters.cohort_bounds();
  let snapshot_filter = SnapshotFilter { product_ids, cohort_from, cohort_to };

  let rows = store
    .query_snapshots(&snapshot_filter)
    .await
    .map_err(Error::store)?;
  tracing::debug!(rows = rows.len(), group_by = ?filters.group_by, "building cohort matrix");

  Ok(build_matrix(&rows, filters))
}
