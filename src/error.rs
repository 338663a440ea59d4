use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by probes, detection and sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Timeout,
    NetworkFailure,
    HttpError,
    MalformedResponse,
    SessionStateError,
    PermissionDenied,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::NetworkFailure => "NETWORK_FAILURE",
            ErrorKind::HttpError => "HTTP_ERROR",
            ErrorKind::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorKind::SessionStateError => "SESSION_STATE_ERROR",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("a session is already active")]
    SessionAlreadyActive,
    #[error("no session is active")]
    NoActiveSession,
    #[error("session manager has been torn down")]
    TornDown,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SessionStateError
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectError {
    #[error("required network permissions are not granted")]
    PermissionDenied,
}

impl DetectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DetectError::PermissionDenied => ErrorKind::PermissionDenied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_display_like_their_wire_names() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::NetworkFailure,
            ErrorKind::HttpError,
            ErrorKind::MalformedResponse,
            ErrorKind::SessionStateError,
            ErrorKind::PermissionDenied,
        ] {
            let wire = serde_json::to_value(kind).unwrap();
            assert_eq!(wire, serde_json::Value::String(kind.to_string()));
        }
    }

    #[test]
    fn session_errors_are_state_errors() {
        assert_eq!(SessionError::NoActiveSession.kind(), ErrorKind::SessionStateError);
        assert_eq!(DetectError::PermissionDenied.kind(), ErrorKind::PermissionDenied);
    }
}
