//! Error taxonomy for the interception engine
//!
//! "Object is not watched" is deliberately absent: it is a normal negative
//! answer and is reported through [`crate::instrumentor::ForgetOutcome`].
//! Broken internal invariants are not errors either; they panic.

use thiserror::Error;

/// Errors returned by engine operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterceptError {
    /// Allocation failed; the operation was aborted and state is unchanged
    #[error("Out of memory")]
    NoMemory,

    /// Address already claimed by another instrumentor, or the payload
    /// container is in use
    #[error("Resource busy")]
    Busy,

    /// Duplicate payload or key registration
    #[error("Already exists")]
    AlreadyExists,

    /// Operation requires a started interceptor
    #[error("Interceptor is not started")]
    PermissionDenied,

    /// The original operation at this offset can no longer be recovered
    #[error("Original operation at offset {offset} is lost")]
    Unrecoverable { offset: usize },

    /// Schema rejected at construction
    #[error("Invalid operations schema: {0}")]
    InvalidSchema(String),

    /// Offset is not among the intercepted operations
    #[error("Operation at offset {offset} is not intercepted")]
    UnknownOperation { offset: usize },

    /// External handler requested for an operation which forbids them
    #[error("Operation at offset {offset} accepts internal handlers only")]
    InternalOnly { offset: usize },

    /// Payload was never registered with this interceptor
    #[error("Payload is not registered")]
    NotRegistered,

    /// Engine configuration is inconsistent
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, InterceptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_mention_offset() {
        let err = InterceptError::Unrecoverable { offset: 16 };
        assert_eq!(err.to_string(), "Original operation at offset 16 is lost");

        let err = InterceptError::InternalOnly { offset: 8 };
        assert!(err.to_string().contains("offset 8"));
    }

    #[test]
    fn test_errors_compare_by_value() {
        assert_eq!(InterceptError::Busy, InterceptError::Busy);
        assert_ne!(InterceptError::Busy, InterceptError::AlreadyExists);
    }
}
