//! Error types for the client engine
//!
//! Transport, protocol and programming errors, plus the result codes
//! stored in completed async events.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::types::EventId;

/// Server return code meaning the session was invalidated
pub const RETCODE_SESSION_INVALIDATED: i64 = 121;

/// Server return code meaning messages are being sent too fast
pub const RETCODE_SEND_TOO_FAST: i64 = 108;

/// HTTP-level failures (retried by the poller, surfaced elsewhere)
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The server answered with an unexpected status
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// The request never produced a response
    #[error("connection failed: {0}")]
    Connection(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => TransportError::Status(status.as_u16()),
            None => TransportError::Connection(err.to_string()),
        }
    }
}

/// Malformed server data (the offending unit is dropped)
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Body was not valid JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field is absent
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    /// Unrecognized poll_type tag
    #[error("unknown poll type '{0}'")]
    UnknownPollType(String),

    /// A chat message decoded to zero content runs
    #[error("message has no content")]
    EmptyContent,
}

/// Misuse of the event framework. Not recoverable by retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProgrammingError {
    /// complete() called on an event that already has a result
    #[error("event {0} completed twice")]
    AlreadyCompleted(EventId),

    /// add() called on a set that was already satisfied
    #[error("event set already satisfied")]
    SetSatisfied,

    /// wait() called from inside an event listener
    #[error("wait() called while dispatching event listeners")]
    WaitInsideListener,
}

/// Login failures reported by an authenticator
#[derive(Debug, Clone, Error)]
pub enum LoginError {
    /// The server wants a verification image answered first
    #[error("verification required")]
    NeedVerification,

    /// Network failure during login
    #[error("network error: {0}")]
    Network(#[from] TransportError),

    /// Credentials rejected
    #[error("login rejected: {0}")]
    Rejected(String),
}

/// Application-level errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Server returned a non-zero retcode
    #[error("server returned retcode {0}")]
    Server(i64),

    /// Server invalidated the session (retcode 121)
    #[error("session invalidated by server")]
    SessionInvalidated,

    #[error(transparent)]
    Programming(#[from] ProgrammingError),

    #[error(transparent)]
    Login(#[from] LoginError),

    /// IO error (avatar cache, config file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker runtime could not be built
    #[error("worker runtime error: {0}")]
    Runtime(String),
}

impl ClientError {
    /// Map a server retcode to an error, treating 121 as fatal
    pub fn from_retcode(code: i64) -> Self {
        if code == RETCODE_SESSION_INVALIDATED {
            ClientError::SessionInvalidated
        } else {
            ClientError::Server(code)
        }
    }
}

/// Result code stored in a completed AsyncEvent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    /// Transport failure; carries the HTTP status when there was one
    Transport(Option<u16>),
    /// Response could not be understood
    Protocol,
    /// Server-side retcode other than 0 and 121
    Server(i64),
    SessionInvalidated,
    /// Completed synthetically (timer gate, cancelled poll)
    Cancelled,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    /// Map a server retcode, 0 being success
    pub fn from_retcode(code: i64) -> Self {
        match code {
            0 => ResultCode::Success,
            RETCODE_SESSION_INVALIDATED => ResultCode::SessionInvalidated,
            other => ResultCode::Server(other),
        }
    }
}

impl From<&TransportError> for ResultCode {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Status(status) => ResultCode::Transport(Some(*status)),
            TransportError::Connection(_) => ResultCode::Transport(None),
        }
    }
}

impl From<&ClientError> for ResultCode {
    fn from(err: &ClientError) -> Self {
        match err {
            ClientError::Transport(e) => e.into(),
            ClientError::Server(code) => ResultCode::Server(*code),
            ClientError::SessionInvalidated => ResultCode::SessionInvalidated,
            _ => ResultCode::Protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retcode_mapping() {
        assert_eq!(ResultCode::from_retcode(0), ResultCode::Success);
        assert_eq!(ResultCode::from_retcode(121), ResultCode::SessionInvalidated);
        assert_eq!(ResultCode::from_retcode(108), ResultCode::Server(108));
        assert!(matches!(ClientError::from_retcode(121), ClientError::SessionInvalidated));
    }

    #[test]
    fn test_transport_error_to_result_code() {
        let code: ResultCode = (&TransportError::Status(502)).into();
        assert_eq!(code, ResultCode::Transport(Some(502)));
        let code: ResultCode = (&TransportError::Connection("reset".into())).into();
        assert_eq!(code, ResultCode::Transport(None));
    }
}
