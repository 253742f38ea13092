//! A minimal in-memory [`RetentionStore`] for unit tests.

use std::{collections::BTreeMap, convert::Infallible, sync::Mutex};

use crate::{
  history::{
    History, NewOrder, NewSubscription, Order, Product, ProductId, Subscription,
    Variation, VariationId,
  },
  job::JobRecord,
  month::Month,
  snapshot::{RetentionSnapshot, SnapshotFilter, SnapshotStats},
  store::RetentionStore,
};

#[derive(Default)]
struct Inner {
  products:      Vec<Product>,
  variations:    Vec<Variation>,
  subscriptions: Vec<Subscription>,
  orders:        Vec<Order>,
  snapshots:     BTreeMap<(Month, Month, Option<ProductId>), RetentionSnapshot>,
  jobs:          BTreeMap<String, JobRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  /// Every snapshot row in key order.
  pub fn all_snapshots(&self) -> Vec<RetentionSnapshot> {
    self.inner.lock().unwrap().snapshots.values().cloned().collect()
  }
}

impl RetentionStore for MemoryStore {
  type Error = Infallible;

  async fn add_product(&self, name: String) -> Result<Product, Infallible> {
    let mut inner = self.inner.lock().unwrap();
    let product = Product { product_id: inner.products.len() as i64 + 1, name };
    inner.products.push(product.clone());
    Ok(product)
  }

  async fn add_variation(&self, product_id: ProductId, name: String) -> Result<Variation, Infallible> {
    let mut inner = self.inner.lock().unwrap();
    let variation = Variation {
      variation_id: inner.variations.len() as i64 + 1,
      product_id,
      name,
    };
    inner.variations.push(variation.clone());
    Ok(variation)
  }

  async fn record_subscription(&self, input: NewSubscription) -> Result<Subscription, Infallible> {
    let mut inner = self.inner.lock().unwrap();
    let sub = Subscription {
      subscription_id:  inner.subscriptions.len() as i64 + 1,
      customer_id:      input.customer_id,
      product_id:       input.product_id,
      variation_id:     input.variation_id,
      started_at:       input.started_at,
      ended_at:         input.ended_at,
      recurring_amount: input.recurring_amount,
      billing_interval: input.billing_interval,
    };
    inner.subscriptions.push(sub.clone());
    Ok(sub)
  }

  async fn record_order(&self, input: NewOrder) -> Result<Order, Infallible> {
    let mut inner = self.inner.lock().unwrap();
    let order = Order {
      order_id:     inner.orders.len() as i64 + 1,
      customer_id:  input.customer_id,
      product_id:   input.product_id,
      variation_id: input.variation_id,
      paid_at:      input.paid_at,
      total:        input.total,
    };
    inner.orders.push(order.clone());
    Ok(order)
  }

  async fn active_product_ids(&self) -> Result<Vec<ProductId>, Infallible> {
    let inner = self.inner.lock().unwrap();
    let mut ids: Vec<_> = inner
      .subscriptions
      .iter()
      .map(|s| s.product_id)
      .chain(inner.orders.iter().map(|o| o.product_id))
      .collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
  }

  async fn product_ids_for_variations(&self, variation_ids: &[VariationId]) -> Result<Vec<ProductId>, Infallible> {
    let inner = self.inner.lock().unwrap();
    let mut ids: Vec<_> = inner
      .variations
      .iter()
      .filter(|v| variation_ids.contains(&v.variation_id))
      .map(|v| v.product_id)
      .collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
  }

  async fn load_history(&self, product_id: Option<ProductId>) -> Result<History, Infallible> {
    let inner = self.inner.lock().unwrap();
    let keep = |p: ProductId| product_id.is_none_or(|id| id == p);
    Ok(History {
      subscriptions: inner.subscriptions.iter().filter(|s| keep(s.product_id)).cloned().collect(),
      orders:        inner.orders.iter().filter(|o| keep(o.product_id)).cloned().collect(),
    })
  }

  async fn upsert_snapshots(&self, rows: Vec<RetentionSnapshot>) -> Result<usize, Infallible> {
    let mut inner = self.inner.lock().unwrap();
    let n = rows.len();
    for row in rows {
      inner.snapshots.insert(row.key(), row);
    }
    Ok(n)
  }

  async fn query_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<RetentionSnapshot>, Infallible> {
    let inner = self.inner.lock().unwrap();
    Ok(
      inner
        .snapshots
        .values()
        .filter(|r| match r.product_id {
          None => filter.product_ids.is_empty(),
          Some(p) => filter.product_ids.contains(&p),
        })
        .filter(|r| filter.cohort_from.is_none_or(|from| r.cohort >= from))
        .filter(|r| filter.cohort_to.is_none_or(|to| r.cohort <= to))
        .cloned()
        .collect(),
    )
  }

  async fn snapshot_stats(&self) -> Result<SnapshotStats, Infallible> {
    let inner = self.inner.lock().unwrap();
    let rows = inner.snapshots.values();
    let mut cohorts: Vec<_> = rows.clone().map(|r| r.cohort).collect();
    let mut periods: Vec<_> = rows.clone().map(|r| r.period).collect();
    let mut products: Vec<_> = rows.filter_map(|r| r.product_id).collect();
    for v in [&mut cohorts, &mut periods] {
      v.sort_unstable();
      v.dedup();
    }
    products.sort_unstable();
    products.dedup();
    Ok(SnapshotStats {
      total_records:   inner.snapshots.len() as u64,
      unique_cohorts:  cohorts.len() as u64,
      unique_periods:  periods.len() as u64,
      unique_products: products.len() as u64,
    })
  }

  async fn put_job(&self, record: &JobRecord) -> Result<(), Infallible> {
    self
      .inner
      .lock()
      .unwrap()
      .jobs
      .insert(record.job_id.clone(), record.clone());
    Ok(())
  }

  async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, Infallible> {
    Ok(self.inner.lock().unwrap().jobs.get(job_id).cloned())
  }
}
