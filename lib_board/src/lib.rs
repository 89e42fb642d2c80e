//! # lib_board
//!
//! Networking core of the board server: WebSocket framing over raw upgraded
//! streams, a single self-healing connection to the backing store, the
//! process-wide entity cache and session table, and the request dispatcher
//! that turns handler failures into protocol-correct responses.

#![forbid(unsafe_code)]

pub mod connections;
pub mod core;
pub mod error;
pub mod server;
pub mod websocket;

pub use error::{BoardError, Disposition, ProtocolError};
