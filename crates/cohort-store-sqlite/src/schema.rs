//! SQL schema for the cohort SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS products (
    product_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS variations (
    variation_id INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id   INTEGER NOT NULL REFERENCES products(product_id),
    name         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    subscription_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_id      INTEGER NOT NULL,
    product_id       INTEGER NOT NULL REFERENCES products(product_id),
    variation_id     INTEGER REFERENCES variations(variation_id),
    started_at       TEXT NOT NULL,   -- YYYY-MM-DD
    ended_at         TEXT,            -- YYYY-MM-DD or NULL while live
    recurring_amount INTEGER NOT NULL, -- minor units per billing interval
    billing_interval TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    order_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_id  INTEGER NOT NULL,
    product_id   INTEGER NOT NULL REFERENCES products(product_id),
    variation_id INTEGER REFERENCES variations(variation_id),
    paid_at      TEXT NOT NULL,       -- YYYY-MM-DD
    total        INTEGER NOT NULL     -- minor units
);

-- Written only by the snapshot builder, always via upsert.
-- `product_key` is product_id with NULL (all products) mapped to 0, because
-- SQLite treats NULLs as distinct in UNIQUE constraints.
CREATE TABLE IF NOT EXISTS retention_snapshots (
    snapshot_id              INTEGER PRIMARY KEY AUTOINCREMENT,
    cohort                   TEXT NOT NULL,    -- YYYY-MM
    period                   TEXT NOT NULL,    -- YYYY-MM
    product_id               INTEGER,
    product_key              INTEGER NOT NULL,
    cohort_customers         INTEGER NOT NULL,
    cohort_mrr               INTEGER NOT NULL,
    retained_customers       INTEGER NOT NULL,
    retained_mrr             INTEGER NOT NULL,
    new_customers            INTEGER NOT NULL,
    churned_customers        INTEGER NOT NULL,
    retention_rate_customers REAL,
    retention_rate_mrr       REAL,
    period_offset            INTEGER NOT NULL,
    created_at               TEXT NOT NULL,
    updated_at               TEXT NOT NULL,
    UNIQUE (cohort, period, product_key)
);

-- Key-value status records for background jobs.
CREATE TABLE IF NOT EXISTS job_status (
    job_id      TEXT PRIMARY KEY,
    status      TEXT NOT NULL,   -- 'pending' | 'completed' | 'failed'
    record_json TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS subscriptions_product_idx ON subscriptions(product_id);
CREATE INDEX IF NOT EXISTS orders_product_idx        ON orders(product_id);
CREATE INDEX IF NOT EXISTS variations_product_idx    ON variations(product_id);
CREATE INDEX IF NOT EXISTS snapshots_product_idx     ON retention_snapshots(product_key, cohort);

PRAGMA user_version = 1;
";
