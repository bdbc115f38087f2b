//! Error taxonomy shared by every HyperKV crate.
//!
//! The engine and server never propagate `anyhow::Error` across their public
//! boundary — callers match on [`ErrorKind`] to decide how to react (retry,
//! surface to a client, log and continue). `anyhow` stays at the binary edge.

use std::fmt;

/// Stable classification of everything that can go wrong in the core.
///
/// Mirrors the taxonomy a caller needs to branch on: `NotFound` is not a
/// failure (callers treat it as an empty result), the rest are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    TypeMismatch,
    InvalidArgument,
    NotLeader,
    StorageIO,
    OutOfMemory,
    Shutdown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotLeader => "not_leader",
            ErrorKind::StorageIO => "storage_io",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// The concrete error type returned across crate boundaries.
#[derive(Debug, thiserror::Error)]
pub enum HkvError {
    #[error("key not found")]
    NotFound,

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not leader")]
    NotLeader,

    #[error("storage I/O error: {0}")]
    StorageIO(#[source] std::io::Error),

    #[error("out of memory: budget {max_memory} bytes exceeded")]
    OutOfMemory { max_memory: u64 },

    #[error("operation attempted after shutdown")]
    Shutdown,
}

impl HkvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HkvError::NotFound => ErrorKind::NotFound,
            HkvError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            HkvError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            HkvError::NotLeader => ErrorKind::NotLeader,
            HkvError::StorageIO(_) => ErrorKind::StorageIO,
            HkvError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            HkvError::Shutdown => ErrorKind::Shutdown,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        HkvError::InvalidArgument(msg.into())
    }

    pub fn type_mismatch(expected: &'static str, found: &'static str) -> Self {
        HkvError::TypeMismatch { expected, found }
    }
}

impl From<std::io::Error> for HkvError {
    fn from(e: std::io::Error) -> Self {
        HkvError::StorageIO(e)
    }
}

pub type HkvResult<T> = Result<T, HkvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(HkvError::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            HkvError::invalid_argument("bad ttl").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            HkvError::type_mismatch("lww", "or_set").kind(),
            ErrorKind::TypeMismatch
        );
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: HkvError = io.into();
        assert_eq!(err.kind(), ErrorKind::StorageIO);
    }
}
