//! Handler for `GET /retention/cohorts`.
//!
//! Query params map onto [`CohortFilters`]. `product_ids` and
//! `variation_ids` are accepted as comma-separated integers; unrecognised
//! `group_by`, `metric` and `value` strings fall back to their defaults.

use std::sync::Arc;

use axum::{
  Json,
  extract::{Query, State},
};
use chrono::NaiveDate;
use cohort_core::{
  job::SnapshotService,
  query::{CellValue, CohortFilters, CohortMatrix, GroupBy, Metric},
  store::RetentionStore,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Deserialize, Default)]
pub struct CohortParams {
  pub start_date:    Option<NaiveDate>,
  pub end_date:      Option<NaiveDate>,
  /// Comma-separated product ids, e.g. `3,7`.
  pub product_ids:   Option<String>,
  /// Comma-separated variation ids; mapped to their owning products.
  pub variation_ids: Option<String>,
  /// `month` or `year` (default).
  pub group_by:      Option<String>,
  /// `subscribers` (default) or `mrr`.
  pub metric:        Option<String>,
  /// `rate` (default) or `count`.
  pub value:         Option<String>,
}

impl CohortParams {
  pub fn into_filters(self) -> Result<CohortFilters, ApiError> {
    if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
      if end < start {
        return Err(ApiError::BadRequest(format!("end_date {end} precedes start_date {start}")));
      }
    }

    Ok(CohortFilters {
      start_date:    self.start_date,
      end_date:      self.end_date,
      product_ids:   parse_id_list("product_ids", self.product_ids.as_deref())?,
      variation_ids: parse_id_list("variation_ids", self.variation_ids.as_deref())?,
      group_by:      self.group_by.as_deref().map(GroupBy::parse_lossy).unwrap_or_default(),
      metric:        self.metric.as_deref().map(Metric::parse_lossy).unwrap_or_default(),
      value:         self.value.as_deref().map(CellValue::parse_lossy).unwrap_or_default(),
    })
  }
}

fn parse_id_list(field: &str, raw: Option<&str>) -> Result<Vec<i64>, ApiError> {
  let Some(raw) = raw else { return Ok(Vec::new()) };
  raw
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(|s| {
      s.parse::<i64>()
        .map_err(|_| ApiError::BadRequest(format!("{field}: {s:?} is not an integer id")))
    })
    .collect()
}

#[derive(Debug, Serialize)]
pub struct CohortResponse {
  pub success: bool,
  #[serde(flatten)]
  pub matrix:  CohortMatrix,
}

/// `GET /retention/cohorts[?start_date=..][&end_date=..][&product_ids=..][&group_by=..][&metric=..]`
pub async fn handler<S>(
  State(service): State<Arc<SnapshotService<S>>>,
  Query(params): Query<CohortParams>,
) -> Result<Json<CohortResponse>, ApiError>
where
  S: RetentionStore + 'static,
{
  let filters = params.into_filters()?;
  let matrix = service.cohort_matrix(&filters).await?;
  Ok(Json(CohortResponse { success: true, matrix }))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn id_lists_tolerate_spaces_and_trailing_commas() {
    assert_eq!(parse_id_list("product_ids", Some(" 3, 7,")).unwrap(), vec![3, 7]);
    assert!(parse_id_list("product_ids", None).unwrap().is_empty());
    assert!(matches!(
      parse_id_list("variation_ids", Some("3,x")),
      Err(ApiError::BadRequest(_))
    ));
  }

  #[test]
  fn unknown_options_fall_back_to_defaults() {
    let filters = CohortParams {
      group_by: Some("week".into()),
      metric: Some("ltv".into()),
      value: Some("percent".into()),
      ..Default::default()
    }
    .into_filters()
    .unwrap();
    assert_eq!(filters.group_by, GroupBy::Year);
    assert_eq!(filters.metric, Metric::Subscribers);
    assert_eq!(filters.value, CellValue::Rate);
  }

  #[test]
  fn inverted_range_is_rejected() {
    let params = CohortParams {
      start_date: Some(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()),
      end_date: Some(NaiveDate::from_ymd_opt(2023, 5, 1).unwrap()),
      ..Default::default()
    };
    assert!(matches!(params.into_filters(), Err(ApiError::BadRequest(_))));
  }
}
