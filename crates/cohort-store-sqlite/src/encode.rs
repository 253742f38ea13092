//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings, calendar dates are `YYYY-MM-DD`, months
//! are `YYYY-MM`. Job records are stored as compact JSON.

use chrono::{DateTime, NaiveDate, Utc};
use cohort_core::{
  history::{BillingInterval, Order, Subscription},
  job::JobRecord,
  month::Month,
  snapshot::RetentionSnapshot,
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

// ─── NaiveDate ───────────────────────────────────────────────────────────────

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

// ─── Month ───────────────────────────────────────────────────────────────────

pub fn decode_month(s: &str) -> Result<Month> { Ok(s.parse()?) }

/// `None` (all products) is stored as key 0; product ids start at 1.
pub fn encode_product_key(product_id: Option<i64>) -> i64 { product_id.unwrap_or(0) }

// ─── Job records ─────────────────────────────────────────────────────────────

pub fn encode_job(record: &JobRecord) -> Result<String> { Ok(serde_json::to_string(record)?) }

pub fn decode_job(s: &str) -> Result<JobRecord> { Ok(serde_json::from_str(s)?) }

// ─── Raw row types ───────────────────────────────────────────────────────────

/// Raw row from `subscriptions` before decoding.
pub struct RawSubscription {
  pub subscription_id:  i64,
  pub customer_id:      i64,
  pub product_id:       i64,
  pub variation_id:     Option<i64>,
  pub started_at:       String,
  pub ended_at:         Option<String>,
  pub recurring_amount: i64,
  pub billing_interval: String,
}

impl RawSubscription {
  pub const COLUMNS: &'static str = "subscription_id, customer_id, product_id, variation_id, \
                                     started_at, ended_at, recurring_amount, billing_interval";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subscription_id:  row.get(0)?,
      customer_id:      row.get(1)?,
      product_id:       row.get(2)?,
      variation_id:     row.get(3)?,
      started_at:       row.get(4)?,
      ended_at:         row.get(5)?,
      recurring_amount: row.get(6)?,
      billing_interval: row.get(7)?,
    })
  }

  pub fn into_subscription(self) -> Result<Subscription> {
    Ok(Subscription {
      subscription_id:  self.subscription_id,
      customer_id:      self.customer_id,
      product_id:       self.product_id,
      variation_id:     self.variation_id,
      started_at:       decode_date(&self.started_at)?,
      ended_at:         self.ended_at.as_deref().map(decode_date).transpose()?,
      recurring_amount: self.recurring_amount,
      billing_interval: self.billing_interval.parse::<BillingInterval>()?,
    })
  }
}

/// Raw row from `orders` before decoding.
pub struct RawOrder {
  pub order_id:     i64,
  pub customer_id:  i64,
  pub product_id:   i64,
  pub variation_id: Option<i64>,
  pub paid_at:      String,
  pub total:        i64,
}

impl RawOrder {
  pub const COLUMNS: &'static str =
    "order_id, customer_id, product_id, variation_id, paid_at, total";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      order_id:     row.get(0)?,
      customer_id:  row.get(1)?,
      product_id:   row.get(2)?,
      variation_id: row.get(3)?,
      paid_at:      row.get(4)?,
      total:        row.get(5)?,
    })
  }

  pub fn into_order(self) -> Result<Order> {
    Ok(Order {
      order_id:     self.order_id,
      customer_id:  self.customer_id,
      product_id:   self.product_id,
      variation_id: self.variation_id,
      paid_at:      decode_date(&self.paid_at)?,
      total:        self.total,
    })
  }
}

/// Raw row from `retention_snapshots` before decoding.
pub struct RawSnapshot {
  pub cohort:                   String,
  pub period:                   String,
  pub product_id:               Option<i64>,
  pub cohort_customers:         i64,
  pub cohort_mrr:               i64,
  pub retained_customers:       i64,
  pub retained_mrr:             i64,
  pub new_customers:            i64,
  pub churned_customers:        i64,
  pub retention_rate_customers: Option<f64>,
  pub retention_rate_mrr:       Option<f64>,
  pub period_offset:            i32,
}

impl RawSnapshot {
  pub const COLUMNS: &'static str = "cohort, period, product_id, cohort_customers, cohort_mrr, \
                                     retained_customers, retained_mrr, new_customers, \
                                     churned_customers, retention_rate_customers, \
                                     retention_rate_mrr, period_offset";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      cohort:                   row.get(0)?,
      period:                   row.get(1)?,
      product_id:               row.get(2)?,
      cohort_customers:         row.get(3)?,
      cohort_mrr:               row.get(4)?,
      retained_customers:       row.get(5)?,
      retained_mrr:             row.get(6)?,
      new_customers:            row.get(7)?,
      churned_customers:        row.get(8)?,
      retention_rate_customers: row.get(9)?,
      retention_rate_mrr:       row.get(10)?,
      period_offset:            row.get(11)?,
    })
  }

  pub fn into_snapshot(self) -> Result<RetentionSnapshot> {
    Ok(RetentionSnapshot {
      cohort:                   decode_month(&self.cohort)?,
      period:                   decode_month(&self.period)?,
      product_id:               self.product_id,
      cohort_customers:         self.cohort_customers,
      cohort_mrr:               self.cohort_mrr,
      retained_customers:       self.retained_customers,
      retained_mrr:             self.retained_mrr,
      new_customers:            self.new_customers,
      churned_customers:        self.churned_customers,
      retention_rate_customers: self.retention_rate_customers,
      retention_rate_mrr:       self.retention_rate_mrr,
      period_offset:            self.period_offset,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn date_roundtrip() {
    let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    assert_eq!(encode_date(d), "2024-02-29");
    assert_eq!(decode_date("2024-02-29").unwrap(), d);
    assert!(decode_date("2024-02-30").is_err());
  }

  #[test]
  fn product_key_maps_null_to_zero() {
    assert_eq!(encode_product_key(None), 0);
    assert_eq!(encode_product_key(Some(12)), 12);
  }

  #[test]
  fn bad_month_surfaces_as_core_error() {
    assert!(matches!(decode_month("2024-13"), Err(Error::Core(_))));
  }
}
