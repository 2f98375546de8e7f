//! Typed errors for the relay components
//!
//! Worker loops wrap these in `eyre` reports; the component boundaries keep
//! them typed so callers can tell retryable failures from permanent ones.

use thiserror::Error;

use crate::types::{EventKind, Fingerprint, Status};

/// Errors returned by a [`crate::chain::ChainClient`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Network failure, timeout, rate limiting or 5xx; safe to retry
    #[error("RPC unavailable: {0}")]
    Unavailable(String),
    /// The node answered with a JSON-RPC error object
    #[error("RPC rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },
    /// The node answered, but not with something we can parse
    #[error("invalid RPC response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Unavailable(_))
    }
}

/// Errors decoding a log into a relay payload
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("log topic {topic} is not a {expected} event")]
    UnknownEvent { expected: EventKind, topic: String },
    #[error("log is missing {0}")]
    MissingField(&'static str),
    #[error("malformed {kind} log: {reason}")]
    Malformed { kind: EventKind, reason: String },
}

/// Errors from a [`crate::store::TaskStore`]
#[derive(Debug, Error)]
pub enum StoreError {
    /// Serialization failure or deadlock; the whole operation can be retried
    #[error("persistence conflict: {0}")]
    PersistenceConflict(String),
    #[error("task {fingerprint} cannot move from {from} to {to}")]
    InvalidTransition {
        fingerprint: Fingerprint,
        from: Status,
        to: Status,
    },
    #[error("task {0} not found")]
    NotFound(Fingerprint),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::PersistenceConflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        // 40001 serialization_failure, 40P01 deadlock_detected
        if let sqlx::Error::Database(ref db) = err {
            if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
                return StoreError::PersistenceConflict(db.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

/// Errors producing or checking validator signatures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("{0} tasks carry no relay message to sign")]
    Unsignable(EventKind),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("invalid signature from {validator}: {reason}")]
    Invalid { validator: String, reason: String },
    #[error("{0} is not in the validator set")]
    UnknownValidator(String),
    #[error("cannot pack {0} signatures")]
    TooManySignatures(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(RpcError::Unavailable("timeout".into()).is_retryable());
        assert!(!RpcError::Rejected {
            code: -32000,
            message: "nonce too low".into()
        }
        .is_retryable());
        assert!(!RpcError::InvalidResponse("null".into()).is_retryable());
    }

    #[test]
    fn test_row_not_found_is_not_a_conflict() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_conflict());
        assert!(matches!(err, StoreError::Database(_)));
    }
}
