use serde_derive::{Deserialize, Serialize};

/// A convenience alias used throughout the engine.
pub type CResult<T> = std::result::Result<T, Error>;

/// Engine errors. Every variant carries a human-readable message; the kind
/// maps 1:1 onto the structured status codes surfaced at the RPC boundary.
///
/// `DataCorruption` is special: it is never retried, and a path that raised
/// it must not be read again until an operator intervenes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Referenced entity is absent, or invisible under strong causality.
    NotFound(String),

    /// Malformed ID, wrong embedding dimension, unsupported asset kind,
    /// codec decode failure.
    InvalidArgument(String),

    /// Duplicate tag, duplicate namespace name.
    AlreadyExists(String),

    /// Commit with unsatisfied dependencies, delete of a snapshot-referenced
    /// asset, branch update against a missing snapshot.
    FailedPrecondition(String),

    /// Token lacks a required permission or namespace scope.
    PermissionDenied(String),

    /// Token missing, malformed, expired or forged.
    Unauthenticated(String),

    /// Quota on namespace, total storage, or message size.
    ResourceExhausted(String),

    /// Chunk digest mismatch, decryption tag failure, invalid snapshot
    /// signature on a read path.
    DataCorruption(String),

    /// Everything else.
    Internal(String),
}

impl Error {
    /// The status-code name this error maps to on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::FailedPrecondition(_) => "FAILED_PRECONDITION",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::Unauthenticated(_) => "UNAUTHENTICATED",
            Error::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Error::DataCorruption(_) => "DATA_CORRUPTION",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound(msg)
            | Error::InvalidArgument(msg)
            | Error::AlreadyExists(msg)
            | Error::FailedPrecondition(msg)
            | Error::PermissionDenied(msg)
            | Error::Unauthenticated(msg)
            | Error::ResourceExhausted(msg)
            | Error::DataCorruption(msg)
            | Error::Internal(msg) => write!(f, "{}: {}", self.code(), msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound("row not found".to_string()),
            err => Error::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Internal(err.to_string())
    }
}

/// A poisoned lock means another thread panicked while holding engine state;
/// surface it rather than propagating the panic.
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(format!("lock poisoned: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_mapping() {
        assert_eq!(Error::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(Error::DataCorruption("x".into()).code(), "DATA_CORRUPTION");
        assert_eq!(
            Error::FailedPrecondition("x".into()).code(),
            "FAILED_PRECONDITION"
        );
    }

    #[test]
    fn display_carries_message() {
        let err = Error::InvalidArgument("bad dimension".to_string());
        assert_eq!(err.to_string(), "INVALID_ARGUMENT: bad dimension");
    }
}
