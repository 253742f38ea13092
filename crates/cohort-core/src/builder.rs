//! The snapshot builder.
//!
//! Recomputes every `(cohort, period, product_or_null)` row derivable from the
//! commerce history and upserts it into the snapshot table.
//!
//! Work is split into units of one `(scope, cohort)` pair, processed in
//! ascending order. Each unit is written in full before the optional time
//! budget is consulted, so a budgeted run always completes at least one unit
//! and returns a [`Checkpoint`] naming the last unit written. Resuming from
//! that checkpoint, or rerunning from scratch, converges on the same table.

use std::{
  collections::BTreeMap,
  time::{Duration, Instant},
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  history::{CustomerActivity, ProductId},
  month::Month,
  snapshot::{RetentionSnapshot, SnapshotStats, retention_rate},
  store::RetentionStore,
};

// ─── Progress reporting ──────────────────────────────────────────────────────

/// Severity of a progress message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
  Info,
  Success,
  Warning,
  Error,
}

/// Receives `(message, level)` pairs while a build runs.
pub type Progress<'a> = &'a (dyn Fn(&str, ProgressLevel) + Send + Sync);

/// A progress sink that drops everything.
pub fn silent(_: &str, _: ProgressLevel) {}

// ─── Options and results ─────────────────────────────────────────────────────

/// The last `(scope, cohort)` unit a budgeted run wrote.
///
/// `product_id = None` is the all-products scope, which sorts before every
/// product scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
  pub product_id: Option<ProductId>,
  pub cohort:     Month,
}

impl Checkpoint {
  fn covers(&self, product_id: Option<ProductId>, cohort: Month) -> bool {
    (product_id, cohort) <= (self.product_id, self.cohort)
  }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
  /// Restrict the build to one product's scope. `None` builds the
  /// all-products scope plus one scope per product with history.
  pub product_id: Option<ProductId>,
  /// The last period built is the month containing `today`.
  pub today:      NaiveDate,
  /// Wall-clock budget checked between units. `None` runs to completion.
  pub budget:     Option<Duration>,
  /// Skip every unit up to and including this one.
  pub resume:     Option<Checkpoint>,
}

impl BuildOptions {
  pub fn new(product_id: Option<ProductId>, today: NaiveDate) -> Self {
    Self { product_id, today, budget: None, resume: None }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildOutcome {
  Complete,
  /// The budget ran out; continue with `BuildOptions::resume = checkpoint`.
  Partial { checkpoint: Checkpoint },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
  pub rows_written: usize,
  /// `(scope, cohort)` units written by this invocation.
  pub units:        usize,
  pub outcome:      BuildOutcome,
  /// Table summary after this invocation.
  pub stats:        SnapshotStats,
}

impl BuildReport {
  pub fn is_complete(&self) -> bool { matches!(self.outcome, BuildOutcome::Complete) }
}

// ─── Pure computation ────────────────────────────────────────────────────────

/// Group a customer ledger by cohort month (the month of first activity).
pub fn cohorts(
  ledger: &BTreeMap<i64, CustomerActivity>,
) -> BTreeMap<Month, Vec<&CustomerActivity>> {
  let mut out: BTreeMap<Month, Vec<&CustomerActivity>> = BTreeMap::new();
  for activity in ledger.values() {
    if let Some(cohort) = activity.cohort() {
      out.entry(cohort).or_default().push(activity);
    }
  }
  out
}

/// Snapshot rows for one cohort, one per period from `cohort` to `current`.
pub fn cohort_snapshots(
  product_id: Option<ProductId>,
  cohort: Month,
  members: &[&CustomerActivity],
  current: Month,
) -> Vec<RetentionSnapshot> {
  let cohort_customers = members.len() as i64;
  let cohort_mrr = members
    .iter()
    .fold(0i64, |acc, a| acc.saturating_add(a.revenue_in(cohort)));

  cohort
    .through(current)
    .map(|period| {
      let offset = period.offset_from(cohort);
      let prior = period.prev();

      let mut retained_customers = 0;
      let mut retained_mrr: i64 = 0;
      let mut new_customers = 0;
      let mut churned_customers = 0;

      for member in members {
        let active_now = member.is_active(period);
        let active_before = offset > 0 && member.is_active(prior);
        if active_now {
          retained_customers += 1;
          retained_mrr = retained_mrr.saturating_add(member.revenue_in(period));
          if !active_before {
            new_customers += 1;
          }
        } else if active_before {
          churned_customers += 1;
        }
      }

      RetentionSnapshot {
        cohort,
        period,
        product_id,
        cohort_customers,
        cohort_mrr,
        retained_customers,
        retained_mrr,
        new_customers,
        churned_customers,
        retention_rate_customers: retention_rate(retained_customers, cohort_customers),
        retention_rate_mrr: retention_rate(retained_mrr, cohort_mrr),
        period_offset: offset,
      }
    })
    .collect()
}

// ─── Builder ─────────────────────────────────────────────────────────────────

fn scope_label(product_id: Option<ProductId>) -> String {
  match product_id {
    Some(id) => format!("product {id}"),
    None => "all products".to_owned(),
  }
}

/// Run the snapshot builder against `store`.
pub async fn build_snapshots<S>(
  store: &S,
  options: &BuildOptions,
  progress: Progress<'_>,
) -> Result<BuildReport>
where
  S: RetentionStore,
{
  let started = Instant::now();
  let current = Month::of(options.today);

  let scopes: Vec<Option<ProductId>> = match options.product_id {
    Some(id) => vec![Some(id)],
    None => {
      let products = store.active_product_ids().await.map_err(Error::store)?;
      std::iter::once(None).chain(products.into_iter().map(Some)).collect()
    }
  };

  if let Some(resume) = &options.resume {
    progress(
      &format!("Resuming after {} cohort {}", scope_label(resume.product_id), resume.cohort),
      ProgressLevel::Info,
    );
  }

  let mut rows_written = 0;
  let mut units = 0;
  let mut yielded: Option<Checkpoint> = None;
  // Set only when a unit was left unprocessed after the budget ran out.
  let mut more_work = false;

  'scopes: for scope in scopes {
    let history = store.load_history(scope).await.map_err(Error::store)?;
    let ledger = history.activity(current);
    let by_cohort = cohorts(&ledger);

    if by_cohort.is_empty() {
      progress(
        &format!("No subscription or order history for {}", scope_label(scope)),
        ProgressLevel::Warning,
      );
      continue;
    }

    progress(
      &format!(
        "Processing {} ({} customers, {} cohorts)",
        scope_label(scope),
        ledger.len(),
        by_cohort.len()
      ),
      ProgressLevel::Info,
    );

    for (cohort, members) in &by_cohort {
      if options.resume.is_some_and(|r| r.covers(scope, *cohort)) {
        continue;
      }
      if yielded.is_some() {
        more_work = true;
        break 'scopes;
      }

      let rows = cohort_snapshots(scope, *cohort, members, current);
      let written = store.upsert_snapshots(rows).await.map_err(Error::store)?;
      rows_written += written;
      units += 1;
      tracing::debug!(scope = ?scope, %cohort, written, "cohort snapshot written");

      if options.budget.is_some_and(|b| started.elapsed() >= b) {
        yielded = Some(Checkpoint { product_id: scope, cohort: *cohort });
      }
    }
  }

  let stats = store.snapshot_stats().await.map_err(Error::store)?;

  let outcome = match yielded {
    Some(checkpoint) if more_work => {
      progress(
        &format!("Time budget reached after {units} cohorts; continuing in a follow-up run"),
        ProgressLevel::Warning,
      );
      BuildOutcome::Partial { checkpoint }
    }
    _ => {
      progress(
        &format!(
          "Snapshot generation complete: {rows_written} rows written, {} total records",
          stats.total_records
        ),
        ProgressLevel::Success,
      );
      BuildOutcome::Complete
    }
  };

  Ok(BuildReport { rows_written, units, outcome, stats })
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;
  use crate::{
    history::{BillingInterval, NewOrder, NewSubscription},
    testing::MemoryStore,
  };

  fn d(s: &str) -> NaiveDate { s.parse().unwrap() }
  fn m(s: &str) -> Month { s.parse().unwrap() }

  fn activity(months: &[(&str, i64)]) -> CustomerActivity {
    CustomerActivity {
      revenue: months.iter().map(|(mo, amt)| (m(mo), *amt)).collect(),
    }
  }

  fn monthly(customer_id: i64, product_id: i64, start: &str, end: Option<&str>, amount: i64) -> NewSubscription {
    NewSubscription {
      customer_id,
      product_id,
      variation_id: None,
      started_at: d(start),
      ended_at: end.map(d),
      recurring_amount: amount,
      billing_interval: BillingInterval::Month,
    }
  }

  // ── Pure computation ──────────────────────────────────────────────────────

  #[test]
  fn cohort_rows_cover_cohort_through_current() {
    let a = activity(&[("2024-01", 100), ("2024-02", 100)]);
    let rows = cohort_snapshots(None, m("2024-01"), &[&a], m("2024-04"));
    assert_eq!(rows.len(), 4);
    assert_eq!(rows.iter().map(|r| r.period_offset).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(rows[3].period, m("2024-04"));
    assert_eq!(rows[3].period_offset, 3);
  }

  #[test]
  fn retained_churned_and_recycled_counts() {
    // a: active throughout; b: churns in March, returns in April; c: only January.
    let a = activity(&[("2024-01", 100), ("2024-02", 100), ("2024-03", 100), ("2024-04", 100)]);
    let b = activity(&[("2024-01", 50), ("2024-02", 50), ("2024-04", 80)]);
    let c = activity(&[("2024-01", 30)]);
    let rows = cohort_snapshots(Some(4), m("2024-01"), &[&a, &b, &c], m("2024-04"));

    let jan = &rows[0];
    assert_eq!(jan.cohort_customers, 3);
    assert_eq!(jan.cohort_mrr, 180);
    assert_eq!(jan.retained_customers, 3);
    assert_eq!(jan.new_customers, 3);
    assert_eq!(jan.churned_customers, 0);
    assert_eq!(jan.retention_rate_customers, Some(100.0));

    let feb = &rows[1];
    assert_eq!(feb.retained_customers, 2);
    assert_eq!(feb.churned_customers, 1);
    assert_eq!(feb.new_customers, 0);
    assert_eq!(feb.retained_mrr, 150);
    assert_eq!(feb.retention_rate_customers, Some(66.67));
    assert_eq!(feb.retention_rate_mrr, Some(83.33));

    let mar = &rows[2];
    assert_eq!(mar.retained_customers, 1);
    assert_eq!(mar.churned_customers, 1);

    let apr = &rows[3];
    assert_eq!(apr.retained_customers, 2);
    assert_eq!(apr.new_customers, 1, "b came back");
    assert_eq!(apr.churned_customers, 0);
    assert_eq!(apr.retained_mrr, 180);
    assert!(rows.iter().all(|r| r.product_id == Some(4)));
  }

  #[test]
  fn zero_revenue_baseline_yields_null_mrr_rate() {
    let a = activity(&[("2024-01", 0), ("2024-02", 0)]);
    let rows = cohort_snapshots(None, m("2024-01"), &[&a], m("2024-02"));
    assert_eq!(rows[1].retention_rate_mrr, None);
    assert_eq!(rows[1].retention_rate_customers, Some(100.0));
  }

  #[test]
  fn cohorts_group_by_first_month() {
    let mut ledger = BTreeMap::new();
    ledger.insert(1, activity(&[("2024-01", 1), ("2024-03", 1)]));
    ledger.insert(2, activity(&[("2024-03", 1)]));
    ledger.insert(3, activity(&[("2024-01", 1)]));
    let grouped = cohorts(&ledger);
    assert_eq!(grouped[&m("2024-01")].len(), 2);
    assert_eq!(grouped[&m("2024-03")].len(), 1);
  }

  // ── Builder against a store ───────────────────────────────────────────────

  async fn seeded() -> MemoryStore {
    let store = MemoryStore::default();
    store.record_subscription(monthly(1, 10, "2024-01-05", None, 1_000)).await.unwrap();
    store.record_subscription(monthly(2, 10, "2024-01-20", Some("2024-02-10"), 500)).await.unwrap();
    store.record_subscription(monthly(3, 20, "2024-02-01", Some("2024-03-31"), 2_000)).await.unwrap();
    store
      .record_order(NewOrder {
        customer_id:  4,
        product_id:   20,
        variation_id: None,
        paid_at:      d("2024-03-15"),
        total:        4_200,
      })
      .await
      .unwrap();
    store
  }

  #[tokio::test]
  async fn full_build_writes_all_scopes() {
    let store = seeded().await;
    let report = build_snapshots(&store, &BuildOptions::new(None, d("2024-04-30")), &silent)
      .await
      .unwrap();

    assert!(report.is_complete());
    // all-products: cohorts 01 (4 periods), 02 (3), 03 (2) = 9
    // product 10: cohort 01 (4) = 4
    // product 20: cohorts 02 (3), 03 (2) = 5
    assert_eq!(report.rows_written, 18);
    assert_eq!(report.stats.total_records, 18);
    assert_eq!(report.stats.unique_cohorts, 3);
    assert_eq!(report.stats.unique_periods, 4);
    assert_eq!(report.stats.unique_products, 2);
  }

  #[tokio::test]
  async fn rebuild_is_idempotent() {
    let store = seeded().await;
    let options = BuildOptions::new(None, d("2024-04-30"));
    build_snapshots(&store, &options, &silent).await.unwrap();
    let first = store.all_snapshots();

    let report = build_snapshots(&store, &options, &silent).await.unwrap();
    assert_eq!(report.stats.total_records, first.len() as u64);
    assert_eq!(store.all_snapshots(), first);
  }

  #[tokio::test]
  async fn product_filter_builds_only_that_scope() {
    let store = seeded().await;
    let report = build_snapshots(&store, &BuildOptions::new(Some(20), d("2024-04-30")), &silent)
      .await
      .unwrap();
    assert_eq!(report.rows_written, 5);
    assert!(store.all_snapshots().iter().all(|r| r.product_id == Some(20)));
  }

  #[tokio::test]
  async fn zero_budget_yields_after_each_unit_and_converges() {
    let store = seeded().await;
    let mut options = BuildOptions::new(None, d("2024-04-30"));
    options.budget = Some(Duration::ZERO);

    let mut invocations = 0;
    loop {
      invocations += 1;
      let report = build_snapshots(&store, &options, &silent).await.unwrap();
      assert_eq!(report.units, 1, "every invocation makes progress");
      match report.outcome {
        BuildOutcome::Complete => break,
        BuildOutcome::Partial { checkpoint } => options.resume = Some(checkpoint),
      }
      assert!(invocations < 20, "runaway resume loop");
    }
    // 3 + 1 + 2 units across the three scopes.
    assert_eq!(invocations, 6);

    let reference = seeded().await;
    build_snapshots(&reference, &BuildOptions::new(None, d("2024-04-30")), &silent)
      .await
      .unwrap();
    assert_eq!(store.all_snapshots(), reference.all_snapshots());
  }

  #[tokio::test]
  async fn empty_history_warns_and_completes() {
    let store = MemoryStore::default();
    let messages = Mutex::new(Vec::new());
    let sink = |msg: &str, level: ProgressLevel| {
      messages.lock().unwrap().push((msg.to_owned(), level));
    };
    let report = build_snapshots(&store, &BuildOptions::new(None, d("2024-04-30")), &sink)
      .await
      .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.rows_written, 0);
    let messages = messages.into_inner().unwrap();
    assert!(messages.iter().any(|(_, l)| *l == ProgressLevel::Warning));
    assert_eq!(messages.last().map(|(_, l)| *l), Some(ProgressLevel::Success));
  }
}
