//! # Connections Module
//!
//! Everything between a handler and the backing store.

/// Driver-facing traits and value types.
pub mod store;

/// Named statement registry.
pub mod statements;

/// The four-state connection manager and cache-aware lookups.
pub mod manager;

/// tokio-postgres implementation of the driver traits.
#[cfg(feature = "postgres")]
pub mod db_postgres;

pub use manager::{ConnectionManager, StoreState, StoreTimings};
pub use statements::{Statement, StatementCatalog, StatementKind};
pub use store::{StoreDriver, StoreError, StoreErrorKind, StoreHandle, StoreOutcome, StoreRow, StoreValue};
