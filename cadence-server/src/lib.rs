//! # Cadence Server
//!
//! Runs the cadence governor on a schedule or behind an HTTP trigger.

pub mod infra;
pub mod routes;

pub use routes::{AppState, create_app};
