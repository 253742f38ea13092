//! The SQLite implementation of [`RetentionStore`].

use std::path::Path;

use chrono::Utc;
use rusqlite::OptionalExtension as _;

use cohort_core::{
  history::{
    History, NewOrder, NewSubscription, Order, Product, ProductId, Subscription, Variation,
    VariationId,
  },
  job::JobRecord,
  snapshot::{RetentionSnapshot, SnapshotFilter, SnapshotStats},
  store::RetentionStore,
};

use crate::{
  Error, Result,
  encode::{
    RawOrder, RawSnapshot, RawSubscription, decode_job, encode_date, encode_dt, encode_job,
    encode_product_key,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A retention store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn ensure_product(&self, product_id: ProductId) -> Result<()> {
    let exists: bool = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM products WHERE product_id = ?1",
              rusqlite::params![product_id],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await?;

    if exists { Ok(()) } else { Err(Error::ProductNotFound(product_id)) }
  }

  /// A history row's variation must belong to the row's product.
  async fn ensure_variation(
    &self,
    product_id: ProductId,
    variation_id: Option<VariationId>,
  ) -> Result<()> {
    let Some(variation_id) = variation_id else { return Ok(()) };
    let exists: bool = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM variations WHERE variation_id = ?1 AND product_id = ?2",
              rusqlite::params![variation_id, product_id],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await?;

    if exists {
      Ok(())
    } else {
      Err(Error::VariationNotInProduct { variation_id, product_id })
    }
  }
}

/// `?, ?, ?` with `n` placeholders.
fn placeholders(n: usize) -> String { vec!["?"; n].join(", ") }

// ─── RetentionStore impl ─────────────────────────────────────────────────────

impl RetentionStore for SqliteStore {
  type Error = Error;

  // ── History ───────────────────────────────────────────────────────────────

  async fn add_product(&self, name: String) -> Result<Product> {
    let at_str = encode_dt(Utc::now());
    let product_name = name.clone();

    let product_id: i64 = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO products (name, created_at) VALUES (?1, ?2)",
          rusqlite::params![product_name, at_str],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Product { product_id, name })
  }

  async fn add_variation(&self, product_id: ProductId, name: String) -> Result<Variation> {
    self.ensure_product(product_id).await?;
    let variation_name = name.clone();

    let variation_id: i64 = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO variations (product_id, name) VALUES (?1, ?2)",
          rusqlite::params![product_id, variation_name],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Variation { variation_id, product_id, name })
  }

  async fn record_subscription(&self, input: NewSubscription) -> Result<Subscription> {
    self.ensure_product(input.product_id).await?;
    self.ensure_variation(input.product_id, input.variation_id).await?;

    let started_str  = encode_date(input.started_at);
    let ended_str    = input.ended_at.map(encode_date);
    let interval_str = input.billing_interval.as_str();
    let customer_id  = input.customer_id;
    let product_id   = input.product_id;
    let variation_id = input.variation_id;
    let amount       = input.recurring_amount;

    let subscription_id: i64 = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO subscriptions (
             customer_id, product_id, variation_id, started_at, ended_at,
             recurring_amount, billing_interval
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![
            customer_id,
            product_id,
            variation_id,
            started_str,
            ended_str,
            amount,
            interval_str,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Subscription {
      subscription_id,
      customer_id:      input.customer_id,
      product_id:       input.product_id,
      variation_id:     input.variation_id,
      started_at:       input.started_at,
      ended_at:         input.ended_at,
      recurring_amount: input.recurring_amount,
      billing_interval: input.billing_interval,
    })
  }

  async fn record_order(&self, input: NewOrder) -> Result<Order> {
    self.ensure_product(input.product_id).await?;
    self.ensure_variation(input.product_id, input.variation_id).await?;

    let paid_str     = encode_date(input.paid_at);
    let customer_id  = input.customer_id;
    let product_id   = input.product_id;
    let variation_id = input.variation_id;
    let total        = input.total;

    let order_id: i64 = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO orders (customer_id, product_id, variation_id, paid_at, total)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![customer_id, product_id, variation_id, paid_str, total],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(Order {
      order_id,
      customer_id:  input.customer_id,
      product_id:   input.product_id,
      variation_id: input.variation_id,
      paid_at:      input.paid_at,
      total:        input.total,
    })
  }

  async fn active_product_ids(&self) -> Result<Vec<ProductId>> {
    let ids: Vec<i64> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT product_id FROM subscriptions
           UNION
           SELECT product_id FROM orders
           ORDER BY product_id",
        )?;
        let rows = stmt
          .query_map([], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(ids)
  }

  async fn product_ids_for_variations(
    &self,
    variation_ids: &[VariationId],
  ) -> Result<Vec<ProductId>> {
    if variation_ids.is_empty() {
      return Ok(Vec::new());
    }
    let ids_vec = variation_ids.to_vec();

    let ids: Vec<i64> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT DISTINCT product_id FROM variations
           WHERE variation_id IN ({})
           ORDER BY product_id",
          placeholders(ids_vec.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(ids_vec.iter()), |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(ids)
  }

  async fn load_history(&self, product_id: Option<ProductId>) -> Result<History> {
    let (raw_subs, raw_orders): (Vec<RawSubscription>, Vec<RawOrder>) = self
      .conn
      .call(move |conn| {
        // `?1 IS NULL` short-circuits the product filter for the all-products scope.
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM subscriptions
           WHERE ?1 IS NULL OR product_id = ?1
           ORDER BY subscription_id",
          RawSubscription::COLUMNS
        ))?;
        let subs = stmt
          .query_map(rusqlite::params![product_id], RawSubscription::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM orders
           WHERE ?1 IS NULL OR product_id = ?1
           ORDER BY order_id",
          RawOrder::COLUMNS
        ))?;
        let orders = stmt
          .query_map(rusqlite::params![product_id], RawOrder::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((subs, orders))
      })
      .await?;

    Ok(History {
      subscriptions: raw_subs
        .into_iter()
        .map(RawSubscription::into_subscription)
        .collect::<Result<_>>()?,
      orders:        raw_orders.into_iter().map(RawOrder::into_order).collect::<Result<_>>()?,
    })
  }

  // ── Snapshots ─────────────────────────────────────────────────────────────

  async fn upsert_snapshots(&self, rows: Vec<RetentionSnapshot>) -> Result<usize> {
    if rows.is_empty() {
      return Ok(0);
    }
    let now_str = encode_dt(Utc::now());

    let written: usize = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut written = 0;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO retention_snapshots (
               cohort, period, product_id, product_key,
               cohort_customers, cohort_mrr, retained_customers, retained_mrr,
               new_customers, churned_customers,
               retention_rate_customers, retention_rate_mrr, period_offset,
               created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
             ON CONFLICT (cohort, period, product_key) DO UPDATE SET
               cohort_customers         = excluded.cohort_customers,
               cohort_mrr               = excluded.cohort_mrr,
               retained_customers       = excluded.retained_customers,
               retained_mrr             = excluded.retained_mrr,
               new_customers            = excluded.new_customers,
               churned_customers        = excluded.churned_customers,
               retention_rate_customers = excluded.retention_rate_customers,
               retention_rate_mrr       = excluded.retention_rate_mrr,
               period_offset            = excluded.period_offset,
               updated_at               = excluded.updated_at",
          )?;
          for row in &rows {
            written += stmt.execute(rusqlite::params![
              row.cohort.to_string(),
              row.period.to_string(),
              row.product_id,
              encode_product_key(row.product_id),
              row.cohort_customers,
              row.cohort_mrr,
              row.retained_customers,
              row.retained_mrr,
              row.new_customers,
              row.churned_customers,
              row.retention_rate_customers,
              row.retention_rate_mrr,
              row.period_offset,
              now_str,
            ])?;
          }
        }
        tx.commit()?;
        Ok(written)
      })
      .await?;

    tracing::debug!(rows = written, "upserted retention snapshots");
    Ok(written)
  }

  async fn query_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<RetentionSnapshot>> {
    let product_ids = filter.product_ids.clone();
    let from_str    = filter.cohort_from.map(|m| m.to_string());
    let to_str      = filter.cohort_to.map(|m| m.to_string());

    let raws: Vec<RawSnapshot> = self
      .conn
      .call(move |conn| {
        let mut conds: Vec<String> = vec![];
        let mut params: Vec<rusqlite::types::Value> = vec![];

        if product_ids.is_empty() {
          conds.push("product_key = 0".to_owned());
        } else {
          conds.push(format!("product_key IN ({})", placeholders(product_ids.len())));
          params.extend(product_ids.iter().map(|&id| id.into()));
        }
        if let Some(from) = from_str {
          conds.push("cohort >= ?".to_owned());
          params.push(from.into());
        }
        if let Some(to) = to_str {
          conds.push("cohort <= ?".to_owned());
          params.push(to.into());
        }

        let sql = format!(
          "SELECT {} FROM retention_snapshots
           WHERE {}
           ORDER BY cohort, period, product_key",
          RawSnapshot::COLUMNS,
          conds.join(" AND ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawSnapshot::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSnapshot::into_snapshot).collect()
  }

  async fn snapshot_stats(&self) -> Result<SnapshotStats> {
    let stats = self
      .conn
      .call(|conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*),
                  COUNT(DISTINCT cohort),
                  COUNT(DISTINCT period),
                  COUNT(DISTINCT product_id)
           FROM retention_snapshots",
          [],
          |row| {
            Ok(SnapshotStats {
              total_records:   row.get::<_, i64>(0)? as u64,
              unique_cohorts:  row.get::<_, i64>(1)? as u64,
              unique_periods:  row.get::<_, i64>(2)? as u64,
              unique_products: row.get::<_, i64>(3)? as u64,
            })
          },
        )?)
      })
      .await?;
    Ok(stats)
  }

  // ── Job status ────────────────────────────────────────────────────────────

  async fn put_job(&self, record: &JobRecord) -> Result<()> {
    let job_id     = record.job_id.clone();
    let status_str = record.status.as_str();
    let json_str   = encode_job(record)?;
    let at_str     = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO job_status (job_id, status, record_json, updated_at)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT (job_id) DO UPDATE SET
             status      = excluded.status,
             record_json = excluded.record_json,
             updated_at  = excluded.updated_at",
          rusqlite::params![job_id, status_str, json_str, at_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
    let id_str = job_id.to_owned();

    let json: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT record_json FROM job_status WHERE job_id = ?1",
              rusqlite::params![id_str],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;

    json.as_deref().map(decode_job).transpose()
  }
}
