//! # Backing-Store Driver Boundary
//!
//! The connection manager talks to the store only through these traits. A
//! driver produces handles; a handle runs one named statement at a time with
//! positional [`StoreValue`] parameters and returns rows as JSON objects.
//! Identifiers cross this boundary as canonical UUID strings; the driver
//! converts them to and from its native representation.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};
use thiserror::Error;

use super::statements::Statement;

/// A positional statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    /// Canonical external form of an identifier, e.g. `"5f0e…-…"`.
    Id(String),
}

impl From<&str> for StoreValue {
    fn from(value: &str) -> Self {
        StoreValue::Text(value.to_string())
    }
}

impl From<String> for StoreValue {
    fn from(value: String) -> Self {
        StoreValue::Text(value)
    }
}

impl From<bool> for StoreValue {
    fn from(value: bool) -> Self {
        StoreValue::Bool(value)
    }
}

impl From<i64> for StoreValue {
    fn from(value: i64) -> Self {
        StoreValue::Int(value)
    }
}

pub type StoreRow = Map<String, Value>;

/// What a statement produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreOutcome {
    pub rows: Vec<StoreRow>,
    pub affected_rows: u64,
}

impl StoreOutcome {
    pub fn with_rows(rows: Vec<StoreRow>) -> Self {
        Self {
            rows,
            affected_rows: 0,
        }
    }

    pub fn affected(affected_rows: u64) -> Self {
        Self {
            rows: Vec::new(),
            affected_rows,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// A unique constraint rejected the write.
    UniqueViolation,
    /// The physical connection is gone.
    ConnectionLost,
    /// The server refused the transport security of the connection.
    InsecureTransport,
    /// A parameter could not be bound; the caller sent something malformed.
    InvalidParameter,
    Timeout,
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One physical connection.
pub trait StoreHandle: Send + Sync {
    fn run<'a>(
        &'a self,
        statement: &'a Statement,
        params: &'a [StoreValue],
    ) -> BoxFuture<'a, Result<StoreOutcome, StoreError>>;

    /// Trivial liveness round-trip.
    fn probe(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Graceful close; waits for the server to acknowledge.
    fn close(&self) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Immediate teardown. In-flight statements fail.
    fn destroy(&self);
}

pub trait StoreDriver: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn StoreHandle>, StoreError>>;
}
