//! State store queries: configuration catalog, backup results, and
//! dispatch markers.
//!
//! All access goes through plain `sqlx::query` with explicit row mapping;
//! the schema lives in `migrations/`.

pub mod catalog;
pub mod markers;
pub mod results;
