//! Database module for healthtrail.
//!
//! Provides the storage interfaces used by the probe engine and analyzer,
//! and their SQLite implementation.

mod models;
mod repo;
mod seed;
mod store;

pub use models::*;
pub use repo::*;
pub use seed::*;
pub use store::*;
