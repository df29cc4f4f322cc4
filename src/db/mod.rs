//! Database module.
//!
//! SQLite storage for targets, raw checks, incidents and history buckets.

mod checks;
mod history;
mod incidents;
mod models;
pub(crate) mod store;

pub use models::*;
pub use store::*;
