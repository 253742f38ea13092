//! Commerce history: the input to the snapshot builder.
//!
//! Subscriptions make a customer active in every month their billing span
//! touches; one-off orders make a customer active in the month they were paid.
//! All monetary amounts are integer minor units (cents).

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{Error, month::Month};

pub type CustomerId = i64;
pub type ProductId = i64;
pub type VariationId = i64;

// ─── Catalogue ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
  pub product_id: ProductId,
  pub name:       String,
}

/// A purchasable variant of a product. Snapshots are kept at product
/// granularity, so variation filters are mapped back to their product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variation {
  pub variation_id: VariationId,
  pub product_id:   ProductId,
  pub name:         String,
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
  Day,
  Week,
  Month,
  Quarter,
  HalfYear,
  Year,
}

impl BillingInterval {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Day => "day",
      Self::Week => "week",
      Self::Month => "month",
      Self::Quarter => "quarter",
      Self::HalfYear => "half_year",
      Self::Year => "year",
    }
  }

  /// Normalise a per-interval amount to a monthly amount, truncating toward
  /// zero in minor units. Amounts beyond `i64` saturate.
  pub fn monthly_amount(self, amount: i64) -> i64 {
    let scaled = |per_year: i128| {
      let monthly = i128::from(amount) * per_year / 12;
      i64::try_from(monthly).unwrap_or(if monthly < 0 { i64::MIN } else { i64::MAX })
    };
    match self {
      Self::Day => scaled(365),
      Self::Week => scaled(52),
      Self::Month => amount,
      Self::Quarter => amount / 3,
      Self::HalfYear => amount / 6,
      Self::Year => amount / 12,
    }
  }
}

impl fmt::Display for BillingInterval {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for BillingInterval {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "day" | "daily" => Ok(Self::Day),
      "week" | "weekly" => Ok(Self::Week),
      "month" | "monthly" => Ok(Self::Month),
      "quarter" | "quarterly" => Ok(Self::Quarter),
      "half_year" | "half_yearly" => Ok(Self::HalfYear),
      "year" | "yearly" => Ok(Self::Year),
      other => Err(Error::UnknownBillingInterval(other.to_owned())),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
  pub subscription_id:  i64,
  pub customer_id:      CustomerId,
  pub product_id:       ProductId,
  pub variation_id:     Option<VariationId>,
  pub started_at:       NaiveDate,
  /// Cancellation or expiry date; `None` while the subscription is live.
  pub ended_at:         Option<NaiveDate>,
  /// Amount charged per `billing_interval`, in minor units.
  pub recurring_amount: i64,
  pub billing_interval: BillingInterval,
}

impl Subscription {
  /// Monthly recurring revenue contributed while active.
  pub fn mrr(&self) -> i64 { self.billing_interval.monthly_amount(self.recurring_amount) }
}

/// Input to [`crate::store::RetentionStore::record_subscription`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
  pub customer_id:      CustomerId,
  pub product_id:       ProductId,
  #[serde(default)]
  pub variation_id:     Option<VariationId>,
  pub started_at:       NaiveDate,
  #[serde(default)]
  pub ended_at:         Option<NaiveDate>,
  pub recurring_amount: i64,
  pub billing_interval: BillingInterval,
}

// ─── Orders ──────────────────────────────────────────────────────────────────

/// A paid one-off purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
  pub order_id:     i64,
  pub customer_id:  CustomerId,
  pub product_id:   ProductId,
  pub variation_id: Option<VariationId>,
  pub paid_at:      NaiveDate,
  pub total:        i64,
}

/// Input to [`crate::store::RetentionStore::record_order`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
  pub customer_id:  CustomerId,
  pub product_id:   ProductId,
  #[serde(default)]
  pub variation_id: Option<VariationId>,
  pub paid_at:      NaiveDate,
  pub total:        i64,
}

// ─── Activity ────────────────────────────────────────────────────────────────

/// Everything the builder needs for one scope (a product, or all products).
#[derive(Debug, Clone, Default)]
pub struct History {
  pub subscriptions: Vec<Subscription>,
  pub orders:        Vec<Order>,
}

/// The months a customer was active in, with the revenue attributed to each.
///
/// A month is present iff the customer was active in it, even if the revenue
/// for that month is zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerActivity {
  pub revenue: BTreeMap<Month, i64>,
}

impl CustomerActivity {
  /// The month of first activity. `None` only for an empty ledger entry.
  pub fn cohort(&self) -> Option<Month> { self.revenue.keys().next().copied() }

  pub fn is_active(&self, month: Month) -> bool { self.revenue.contains_key(&month) }

  pub fn revenue_in(&self, month: Month) -> i64 {
    self.revenue.get(&month).copied().unwrap_or(0)
  }

  fn credit(&mut self, month: Month, amount: i64) {
    let total = self.revenue.entry(month).or_insert(0);
    *total = total.saturating_add(amount);
  }
}

impl History {
  /// Fold subscriptions and orders into per-customer monthly activity.
  ///
  /// Activity after `current` is ignored; open-ended subscriptions run
  /// through `current`. A subscription whose end precedes its start is
  /// treated as active in its start month only.
  pub fn activity(&self, current: Month) -> BTreeMap<CustomerId, CustomerActivity> {
    let mut ledger: BTreeMap<CustomerId, CustomerActivity> = BTreeMap::new();

    for sub in &self.subscriptions {
      let start = Month::of(sub.started_at);
      if start > current {
        continue;
      }
      let end = sub
        .ended_at
        .map(Month::of)
        .map_or(current, |end| end.clamp(start, current));
      let mrr = sub.mrr();
      let entry = ledger.entry(sub.customer_id).or_default();
      for month in start.through(end) {
        entry.credit(month, mrr);
      }
    }

    for order in &self.orders {
      let month = Month::of(order.paid_at);
      if month > current {
        continue;
      }
      ledger
        .entry(order.customer_id)
        .or_default()
        .credit(month, order.total);
    }

    ledger
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn d(s: &str) -> NaiveDate { s.parse().unwrap() }
  fn m(s: &str) -> Month { s.parse().unwrap() }

  fn sub(customer_id: i64, start: &str, end: Option<&str>, amount: i64) -> Subscription {
    Subscription {
      subscription_id: 0,
      customer_id,
      product_id: 1,
      variation_id: None,
      started_at: d(start),
      ended_at: end.map(d),
      recurring_amount: amount,
      billing_interval: BillingInterval::Month,
    }
  }

  #[test]
  fn interval_normalisation() {
    assert_eq!(BillingInterval::Year.monthly_amount(12_000), 1_000);
    assert_eq!(BillingInterval::Quarter.monthly_amount(3_000), 1_000);
    assert_eq!(BillingInterval::HalfYear.monthly_amount(6_000), 1_000);
    assert_eq!(BillingInterval::Week.monthly_amount(1_200), 5_200);
    assert_eq!(BillingInterval::Day.monthly_amount(12), 365);
    assert_eq!(BillingInterval::Month.monthly_amount(999), 999);
  }

  #[test]
  fn oversized_amounts_saturate() {
    assert_eq!(BillingInterval::Day.monthly_amount(1_000_000_000_000_000_000), i64::MAX);
    assert_eq!(BillingInterval::Week.monthly_amount(i64::MAX), i64::MAX);
    assert_eq!(BillingInterval::Week.monthly_amount(1_000_000_000_000_000_000), 4_333_333_333_333_333_333);

    let history = History {
      subscriptions: vec![
        Subscription { billing_interval: BillingInterval::Day, ..sub(1, "2024-01-01", None, i64::MAX) },
        sub(1, "2024-01-01", None, 500),
      ],
      orders:        Vec::new(),
    };
    let ledger = history.activity(m("2024-01"));
    assert_eq!(ledger[&1].revenue_in(m("2024-01")), i64::MAX);
  }

  #[test]
  fn interval_parses_aliases() {
    assert_eq!("yearly".parse::<BillingInterval>().unwrap(), BillingInterval::Year);
    assert_eq!("half_year".parse::<BillingInterval>().unwrap(), BillingInterval::HalfYear);
    assert!("fortnight".parse::<BillingInterval>().is_err());
  }

  #[test]
  fn subscription_spans_months_inclusive() {
    let history = History {
      subscriptions: vec![sub(7, "2024-01-15", Some("2024-03-02"), 500)],
      orders:        vec![],
    };
    let ledger = history.activity(m("2024-12"));
    let months: Vec<_> = ledger[&7].revenue.keys().copied().collect();
    assert_eq!(months, vec![m("2024-01"), m("2024-02"), m("2024-03")]);
    assert_eq!(ledger[&7].revenue_in(m("2024-02")), 500);
    assert_eq!(ledger[&7].cohort(), Some(m("2024-01")));
  }

  #[test]
  fn open_subscription_runs_to_current_month() {
    let history = History {
      subscriptions: vec![sub(1, "2024-11-01", None, 100)],
      orders:        vec![],
    };
    let ledger = history.activity(m("2025-01"));
    assert_eq!(ledger[&1].revenue.len(), 3);
    assert!(ledger[&1].is_active(m("2025-01")));
  }

  #[test]
  fn future_activity_is_ignored() {
    let history = History {
      subscriptions: vec![sub(1, "2030-01-01", None, 100)],
      orders:        vec![Order {
        order_id:     1,
        customer_id:  2,
        product_id:   1,
        variation_id: None,
        paid_at:      d("2030-05-05"),
        total:        10,
      }],
    };
    assert!(history.activity(m("2024-06")).is_empty());
  }

  #[test]
  fn orders_and_subscriptions_accumulate_revenue() {
    let history = History {
      subscriptions: vec![sub(1, "2024-02-01", Some("2024-02-28"), 100)],
      orders:        vec![Order {
        order_id:     9,
        customer_id:  1,
        product_id:   2,
        variation_id: None,
        paid_at:      d("2024-02-10"),
        total:        250,
      }],
    };
    let ledger = history.activity(m("2024-06"));
    assert_eq!(ledger[&1].revenue_in(m("2024-02")), 350);
    assert!(!ledger[&1].is_active(m("2024-03")));
  }

  #[test]
  fn end_before_start_counts_start_month_only() {
    let history = History {
      subscriptions: vec![sub(3, "2024-05-10", Some("2024-02-01"), 100)],
      orders:        vec![],
    };
    let ledger = history.activity(m("2024-12"));
    assert_eq!(ledger[&3].revenue.keys().copied().collect::<Vec<_>>(), vec![m("2024-05")]);
  }
}
