//! # WebSocket Module
//!
//! Framing for connections that completed the HTTP upgrade.
//!
//! - **`codec`**: handshake accept derivation and frame encode/decode.
//! - **`connection`**: a wrapper over one upgraded byte stream with a single
//!   ordered writer and a frame read loop.
//! - **`message`**: the JSON envelope exchanged inside text frames.

pub mod codec;
pub mod connection;
pub mod message;

pub use codec::{Decoded, Frame, FrameCodec, Opcode, compute_handshake_accept};
pub use connection::{Connection, ConnectionHandle};
pub use message::{ControlAction, Message};
