//! Durable state: SQLite-backed persistence for positions and orders.
//!
//! The store is the single source of truth; in-memory engine state is a
//! derived view rebuilt from here at startup. One store file per process,
//! single writer.

mod error;
mod migrations;
#[allow(clippy::module_inception)]
mod store;

pub use error::StoreError;
pub use migrations::{current_version, LATEST_VERSION};
pub use store::{Store, StoreTxn};
