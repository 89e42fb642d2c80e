//! # Server Module
//!
//! The transport front the binary mounts: HTTP request routing and the
//! WebSocket upgrade handshake.

pub mod front_http;

pub use front_http::{router, serve_upgraded};
