//! Database module for probetrail.
//!
//! SQLite persistence for probe reports: schema, ingest, history queries
//! and derived client status.

mod cancel;
mod models;
mod query;
mod status;
mod store;

pub use cancel::CancelToken;
pub use models::*;
pub use status::{is_online, SUCCESS_RATE_WINDOW};
pub use store::{DbError, Store, DEFAULT_READ_CONNECTIONS};

#[cfg(test)]
pub(crate) use store::tests as test_support;
