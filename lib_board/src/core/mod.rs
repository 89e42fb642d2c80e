//! # Core Module
//!
//! Request-level state shared by every transport.
//!
//! - **`account`**: the account entity and its row mapping.
//! - **`cache`**: process-wide entity cache indexed by primary and secondary key.
//! - **`session`**: session tokens, identities and their bound connections.
//! - **`responder`**: delivery of replies and errors over HTTP or an upgraded connection.
//! - **`registry`**: the service container handed to handlers.
//! - **`dispatcher`**: access policy, handler routing and the failure boundary.

pub mod account;
pub mod cache;
pub mod dispatcher;
pub mod registry;
pub mod responder;
pub mod session;

pub use account::Account;
pub use cache::{CacheKeys, EntityCache, Shared};
pub use dispatcher::{AccessPolicy, Dispatcher, DispatcherBuilder, HandlerRequest, Params};
pub use registry::{BoardSettings, Registry, ShutdownReason};
pub use responder::{Reply, ReplyBody, Responder};
pub use session::{Session, SessionTable, session_token};
