//! # Error Taxonomy
//!
//! Every failure that can reach the dispatch boundary is a [`BoardError`].
//! The boundary never inspects error text: it asks [`BoardError::disposition`]
//! what to do and performs the single response write itself.

use http::StatusCode;
use thiserror::Error;

use crate::connections::manager::StoreState;

/// Frame-level failures. Always local to one connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message of {size} bytes exceeds maximum length of {max} bytes")]
    PayloadTooLarge { size: u64, max: usize },
    #[error("Invalid handshake: {0}")]
    Handshake(String),
    #[error("Connection is closed")]
    Closed,
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Store faults that justify abandoning the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientFault {
    ConnectionLost,
    InsecureTransport,
}

/// What the dispatch boundary does with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Write the error to the response target with this status.
    Report(StatusCode),
    /// Ask the connection manager for a reset; the caller gets a retriable status.
    ResetStore,
    /// Log and bring the whole process down.
    Terminate,
}

#[derive(Debug, Error)]
pub enum BoardError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Unauthorized request")]
    Unauthorized,

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Unknown action: {action} for entity: {entity}")]
    UnknownAction { entity: String, action: String },

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Server failure: Database is not connected, in state: {0}")]
    NotConnected(StoreState),

    #[error("Server failure: no database connection present while connected")]
    MissingHandle,

    #[error("Database reports: {message}")]
    BackingStoreUnavailable {
        message: String,
        fault: Option<TransientFault>,
    },

    #[error("The identifier {0} already exists!")]
    DuplicateIdentifier(String),

    #[error("Database integrity error: {0}")]
    Integrity(String),

    /// A handler-chosen failure aimed at the caller, with its own status.
    #[error("{message}")]
    Rejected { message: String, status: StatusCode },

    #[error("Unrecoverable failure: {0}")]
    Unrecoverable(String),
}

impl BoardError {
    pub fn rejected(message: impl Into<String>, status: StatusCode) -> Self {
        BoardError::Rejected {
            message: message.into(),
            status,
        }
    }

    /// Rejection with the default status for caller mistakes.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::rejected(message, StatusCode::BAD_REQUEST)
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            BoardError::Protocol(ProtocolError::PayloadTooLarge { .. }) => {
                Disposition::Report(StatusCode::PAYLOAD_TOO_LARGE)
            }
            BoardError::Protocol(_) => Disposition::Report(StatusCode::BAD_REQUEST),
            BoardError::Unauthorized => Disposition::Report(StatusCode::UNAUTHORIZED),
            BoardError::UnknownEntity(_)
            | BoardError::UnknownAction { .. }
            | BoardError::MissingParameter(_) => Disposition::Report(StatusCode::BAD_REQUEST),
            BoardError::NotConnected(_) => Disposition::Report(StatusCode::SERVICE_UNAVAILABLE),
            BoardError::MissingHandle | BoardError::Integrity(_) => {
                Disposition::Report(StatusCode::INTERNAL_SERVER_ERROR)
            }
            BoardError::BackingStoreUnavailable { fault: Some(_), .. } => Disposition::ResetStore,
            BoardError::BackingStoreUnavailable { fault: None, .. } => {
                Disposition::Report(StatusCode::SERVICE_UNAVAILABLE)
            }
            BoardError::DuplicateIdentifier(_) => Disposition::Report(StatusCode::CONFLICT),
            BoardError::Rejected { status, .. } => Disposition::Report(*status),
            BoardError::Unrecoverable(_) => Disposition::Terminate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_store_faults_request_reset() {
        let err = BoardError::BackingStoreUnavailable {
            message: "Connection lost: The server closed the connection.".into(),
            fault: Some(TransientFault::ConnectionLost),
        };
        assert_eq!(err.disposition(), Disposition::ResetStore);

        let err = BoardError::BackingStoreUnavailable {
            message: "syntax error".into(),
            fault: None,
        };
        assert_eq!(
            err.disposition(),
            Disposition::Report(StatusCode::SERVICE_UNAVAILABLE)
        );
    }

    #[test]
    fn test_rejected_carries_its_status() {
        let err = BoardError::rejected("Incorrect password", StatusCode::FORBIDDEN);
        assert_eq!(err.disposition(), Disposition::Report(StatusCode::FORBIDDEN));
        assert_eq!(err.to_string(), "Incorrect password");
        assert_eq!(
            BoardError::bad_request("nope").disposition(),
            Disposition::Report(StatusCode::BAD_REQUEST)
        );
    }

    #[test]
    fn test_only_unrecoverable_terminates() {
        assert_eq!(
            BoardError::Unrecoverable("bad state".into()).disposition(),
            Disposition::Terminate
        );
        assert_eq!(
            BoardError::DuplicateIdentifier("abc".into()).to_string(),
            "The identifier abc already exists!"
        );
        assert_eq!(
            BoardError::UnknownAction {
                entity: "Account".into(),
                action: "Fly".into()
            }
            .to_string(),
            "Unknown action: Fly for entity: Account"
        );
    }
}
