//! Error classes for the conversation layer
//!
//! A transport failure may be retried after a full teardown. An
//! authentication failure may not.

use thiserror::Error;

/// Failures of the duplex channel to the speech model
#[derive(Error, Debug)]
pub enum TransportError {
    /// The channel could not be opened
    #[error("connect failed: {0}")]
    Connect(String),

    /// The remote rejected our credentials during the handshake
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The channel dropped or a frame could not be written
    #[error("channel closed: {0}")]
    Closed(String),

    /// An event could not be encoded for the wire
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The connection has not been configured yet; the frame was not sent
    #[error("connection not configured yet")]
    NotConfigured,
}

impl TransportError {
    /// Authentication failures are terminal for a session
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::Auth(_))
    }

    /// Failures that leave the connection usable
    pub fn is_refusal(&self) -> bool {
        matches!(self, TransportError::NotConfigured)
    }
}

/// Authentication failures (model credentials or control-channel tokens)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("credentials rejected: {0}")]
    Rejected(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// Violations of the event protocol. Logged and scoped to one call; the
/// session itself stays alive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("duplicate call_id {0} while the first call is unresolved")]
    DuplicateCallId(String),

    #[error("result for unknown call_id {0}")]
    UnknownCallId(String),

    #[error("session configuration already sent for this connection")]
    DuplicateConfiguration,

    #[error("function call for unregistered tool '{0}'")]
    UnknownTool(String),

    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Failures starting a conversation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A live conversation under this id belongs to someone else
    #[error("conversation '{0}' belongs to another owner")]
    Forbidden(String),
}

/// Failures inside a tool handler
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler timed out after {0} ms")]
    Timeout(u64),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failures of the external credit ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("unknown owner '{0}'")]
    UnknownOwner(String),

    #[error("insufficient balance: need {needed}, have {available}")]
    Insufficient { needed: u64, available: i64 },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_transport_error_is_terminal() {
        let err = TransportError::from(AuthError::Rejected("401".into()));
        assert!(err.is_terminal());
        assert!(!TransportError::Closed("eof".into()).is_terminal());
    }

    #[test]
    fn display_protocol_errors() {
        assert_eq!(
            ProtocolError::DuplicateCallId("c1".into()).to_string(),
            "duplicate call_id c1 while the first call is unresolved"
        );
        assert_eq!(
            ProtocolError::UnknownTool("fly".into()).to_string(),
            "function call for unregistered tool 'fly'"
        );
    }

    #[test]
    fn display_insufficient() {
        let err = LedgerError::Insufficient { needed: 5, available: 3 };
        assert_eq!(err.to_string(), "insufficient balance: need 5, have 3");
    }
}
