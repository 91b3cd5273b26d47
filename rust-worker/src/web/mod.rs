//! Health server module.
//!
//! A small HTTP surface for orchestrators and operators:
//! - `GET /health` reports broker connectivity and per-binding counters

pub mod handlers;

pub use handlers::{health, router, AppState, HealthResponse};
