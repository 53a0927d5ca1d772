//! # Cadence Core
//!
//! Lease-based governor that pulls activity from rate-limited platforms into
//! local storage and keeps per-user engagement scores up to date.
//!
//! ## Overview
//!
//! A governor tick is stateless: every run coordinates with concurrent runs
//! through conditional updates on the queue store alone.
//!
//! - [`lease`]: reaps expired leases, bounds in-flight work, claims items
//! - [`backfill`]: plans the next window so coverage stays contiguous
//! - [`executor`]: fetches one bounded batch per claimed item
//! - [`scoring`]: decides when a score recompute is due and persists it
//! - [`governor`]: the tick entrypoint tying the above together
//! - [`store`]: storage traits plus Postgres and in-memory backends
//! - [`adapter`]: platform adapters (Discord, Discourse)
//!
//! ## Feature Flags
//!
//! - `database`: Postgres store via SQLx (enabled by default)
//! - `postgres-tests`: runs the Postgres integration suite

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod adapter;
pub mod backfill;
pub mod config;
pub mod error;
pub mod executor;
pub mod governor;
pub mod lease;
pub mod scoring;
pub mod store;
pub mod types;

pub use error::{CadenceError, Result};
pub use governor::{Governor, TickReport};

/// Schema migrations for the queue, activity, and score tables.
#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
