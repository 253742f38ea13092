//! Core types and algorithms for cohort retention analytics.
//!
//! This crate is deliberately free of HTTP and database dependencies. Storage
//! backends implement [`store::RetentionStore`]; the snapshot builder, the
//! cohort matrix query and the job trigger are written against that trait.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod builder;
pub mod error;
pub mod events;
pub mod history;
pub mod job;
pub mod month;
pub mod query;
pub mod snapshot;
pub mod store;

pub use error::{Error, Result};

#[cfg(test)]
pub(crate) mod testing;
