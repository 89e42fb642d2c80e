pub mod accounts;
pub mod admin;
pub mod config;
pub mod logger;
pub mod storage;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use lib_board::BoardError;
use lib_board::connections::StatementCatalog;
use lib_board::core::{AccessPolicy, Dispatcher, DispatcherBuilder, Registry};

/// Every named statement the handlers run.
pub fn statement_catalog() -> Result<StatementCatalog, BoardError> {
    StatementCatalog::from_statements(accounts::statements())
}

/// Registers all handlers and the public-request allow-list.
pub fn build_dispatcher(
    registry: Arc<Registry>,
    resource_dir: PathBuf,
) -> Result<Dispatcher, BoardError> {
    let mut builder = DispatcherBuilder::new();
    accounts::register(&mut builder);
    storage::register(&mut builder, resource_dir);
    builder.policy(storage::policy(accounts::policy(AccessPolicy::new()))?);
    builder.build(registry)
}
