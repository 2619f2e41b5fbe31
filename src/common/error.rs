//! Error types for rangeshift

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Change log error: {0}")]
    ChangeLog(String),

    #[error("Duplicate key on index {index}: {key}")]
    DuplicateKey { index: String, key: String },

    #[error("Document failed validation: {0}")]
    SchemaValidation(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    // === Request Validation ===
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Invalid key pattern: {0}")]
    InvalidKeyPattern(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Conflicting operation {operation_id} already running on {namespace}")]
    ConflictingOperation {
        namespace: String,
        operation_id: String,
    },

    #[error("Unsatisfiable commit quorum: {0}")]
    UnsatisfiableCommitQuorum(String),

    // === Operation Lifecycle ===
    #[error("Operation {0} is already committing and can no longer be aborted")]
    OperationAlreadyCommitting(String),

    #[error("Operation aborted: {0}")]
    OperationAborted(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // === Critical Section / Routing ===
    #[error("Migration in progress on {namespace} (fence token {fence_token}), retry")]
    MigrationInProgress { namespace: String, fence_token: u64 },

    #[error("Critical section on {namespace} is held by operation {holder}")]
    CriticalSectionBusy { namespace: String, holder: String },

    #[error("Stale fence token {token}: latest issued on {namespace} is {latest}")]
    StaleFenceToken {
        namespace: String,
        token: u64,
        latest: u64,
    },

    #[error("Stale routing epoch for {namespace}: expected {expected}, found {actual}")]
    StaleRoutingEpoch {
        namespace: String,
        expected: u64,
        actual: u64,
    },

    #[error("Shard {shard} does not own the requested range of {namespace}")]
    StaleRoute { namespace: String, shard: String },

    // === Participants ===
    #[error("Participant {shard} failed: {reason}")]
    ParticipantFailed { shard: String, reason: String },

    #[error("Participant {0} unreachable")]
    ParticipantUnreachable(String),

    #[error("Participant {shard} not ready: {reason}")]
    NotReady { shard: String, reason: String },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Metadata Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::ParticipantUnreachable(_)
                | Error::NotReady { .. }
                | Error::MigrationInProgress { .. }
                | Error::CriticalSectionBusy { .. }
                | Error::StaleRoutingEpoch { .. }
                | Error::StaleRoute { .. }
        )
    }

    /// Errors that mean "the callee could not be contacted", as opposed to an
    /// answer from a live participant.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::ParticipantUnreachable(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::ChangeLog(_) | Error::RocksDb(_) => ErrorKind::Storage,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Corrupted(_) | Error::MetadataCorrupted(_) => ErrorKind::Corrupted,
            Error::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            Error::SchemaValidation(_) | Error::InvalidDocument(_) => ErrorKind::SchemaValidation,
            Error::InvalidOptions(_)
            | Error::InvalidConfig(_)
            | Error::ConflictingOperation { .. } => ErrorKind::InvalidOptions,
            Error::InvalidKeyPattern(_) => ErrorKind::InvalidKeyPattern,
            Error::NamespaceNotFound(_) => ErrorKind::NamespaceNotFound,
            Error::UnsatisfiableCommitQuorum(_) => ErrorKind::UnsatisfiableCommitQuorum,
            Error::OperationAlreadyCommitting(_) => ErrorKind::OperationAlreadyCommitting,
            Error::OperationAborted(_) => ErrorKind::OperationAborted,
            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Error::MigrationInProgress { .. } | Error::CriticalSectionBusy { .. } => {
                ErrorKind::RetryableMigrationInProgress
            }
            Error::StaleFenceToken { .. } => ErrorKind::StaleFenceToken,
            Error::StaleRoutingEpoch { .. } | Error::StaleRoute { .. } => ErrorKind::StaleRouting,
            Error::ParticipantFailed { .. } => ErrorKind::ParticipantFailed,
            Error::ParticipantUnreachable(_)
            | Error::ConnectionFailed(_)
            | Error::Http(_)
            | Error::NotReady { .. } => ErrorKind::ParticipantUnreachable,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Internal(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Structured form stored in `abort_reason` and participant documents
    pub fn to_operation_error(&self) -> OperationError {
        OperationError {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) | Error::NamespaceNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidOptions(_)
            | Error::InvalidKeyPattern(_)
            | Error::InvalidDocument(_)
            | Error::SchemaValidation(_)
            | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::ConflictingOperation { .. }
            | Error::OperationAlreadyCommitting(_)
            | Error::DuplicateKey { .. } => StatusCode::CONFLICT,
            Error::MigrationInProgress { .. }
            | Error::CriticalSectionBusy { .. }
            | Error::UnsatisfiableCommitQuorum(_)
            | Error::ParticipantUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::StaleRoutingEpoch { .. } | Error::StaleRoute { .. } => {
                StatusCode::MISDIRECTED_REQUEST
            }
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error classification persisted alongside operation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Storage,
    NotFound,
    Corrupted,
    DuplicateKey,
    SchemaValidation,
    InvalidOptions,
    InvalidKeyPattern,
    NamespaceNotFound,
    UnsatisfiableCommitQuorum,
    OperationAlreadyCommitting,
    OperationAborted,
    InvariantViolation,
    RetryableMigrationInProgress,
    StaleFenceToken,
    StaleRouting,
    ParticipantFailed,
    ParticipantUnreachable,
    Timeout,
    Internal,
}

/// Structured error: kind + message + retryable flag.
///
/// Stored verbatim as `abort_reason` so status queries and logs agree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl OperationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    /// Reason recorded for an operator-requested abort
    pub fn user_abort(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::OperationAborted, reason)
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<OperationError> for Error {
    fn from(e: OperationError) -> Self {
        match e.kind {
            ErrorKind::OperationAborted => Error::OperationAborted(e.message),
            ErrorKind::InvariantViolation => Error::InvariantViolation(e.message),
            ErrorKind::SchemaValidation => Error::SchemaValidation(e.message),
            _ => Error::Other(e.message),
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::MigrationInProgress {
            namespace: "db.c".into(),
            fence_token: 3
        }
        .is_retryable());
        assert!(Error::ConnectionFailed("shard-a".into()).is_retryable());
        assert!(!Error::SchemaValidation("missing field".into()).is_retryable());
        assert!(!Error::OperationAlreadyCommitting("op".into()).is_retryable());
    }

    #[test]
    fn test_operation_error_roundtrip_kind() {
        let err = Error::DuplicateKey {
            index: "email_1".into(),
            key: "a@b".into(),
        };
        let structured = err.to_operation_error();
        assert_eq!(structured.kind, ErrorKind::DuplicateKey);
        assert!(!structured.retryable);
        assert!(structured.message.contains("email_1"));
    }

    #[test]
    fn test_http_status() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::OperationAlreadyCommitting("x".into()).to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::NamespaceNotFound("db.c".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
    }
}
