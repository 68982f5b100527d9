//! Error types for the call service.
//!
//! Errors fall into the categories the call subsystem distinguishes on the
//! wire: authorization failures (reported without leaking session state),
//! unknown calls (distinct from authorization), invalid state-machine
//! transitions (no-op failures, never server faults), and internal
//! storage/delivery errors.

use thiserror::Error;

/// Main error type for the call service.
#[derive(Error, Debug)]
pub enum Error {
    /// The acting user is not a participant of the call.
    #[error("Unauthorized")]
    Unauthorized,

    /// No session exists for the given call id.
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// The requested transition is not valid from the session's current
    /// status. Also covers lost compare-and-swap races (someone else
    /// already handled it).
    #[error("Cannot perform action in current state")]
    InvalidTransition,

    /// A caller/callee identity could not be resolved.
    #[error("Invalid user: {0}")]
    InvalidUser(String),

    /// A request field failed validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Push submission to the provider failed.
    #[error("Push delivery failed: {0}")]
    PushFailed(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Unauthorized.to_string(), "Unauthorized");
        assert_eq!(
            Error::CallNotFound("call_abc".to_string()).to_string(),
            "Call not found: call_abc"
        );
        assert_eq!(
            Error::InvalidTransition.to_string(),
            "Cannot perform action in current state"
        );
    }

    #[test]
    fn test_database_error_wraps_message() {
        let err = Error::DatabaseError("Failed to open database: disk full".to_string());
        assert!(err.to_string().contains("disk full"));
    }
}
