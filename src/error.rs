use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Malformed or out-of-sequence wire data. Always fatal to the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("stream closed in the middle of a line or file payload")]
    Truncated,

    #[error("Root request received twice")]
    DuplicateRoot,

    #[error("request '{request}' is not valid before {expected}")]
    OutOfOrder {
        request: String,
        expected: &'static str,
    },

    #[error("MT scope mismatch: expected -{expected}, got -{got}")]
    ScopeMismatch { expected: String, got: String },

    #[error("malformed {what}: {line}")]
    Malformed { what: &'static str, line: String },

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("server reported: {0}")]
    Remote(String),
}

/// Lock acquisition or release failures.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockError {
    #[error("no repository node at {0}")]
    NoSuchNode(String),

    #[error("lock on {path} not held by {owner}")]
    NotHeld { path: String, owner: String },

    #[error("timed out waiting for lock on {0}")]
    Timeout(String),

    #[error("lock service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum CvsError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("I/O error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no repository root configured (set CVSROOT or use -d)")]
    NoRoot,

    #[error("configuration error: {0}")]
    Config(String),
}

impl CvsError {
    pub fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CvsError::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Whether the error must terminate the session (or process).
    ///
    /// Protocol framing errors and permission failures are fatal; lock, file
    /// I/O and checksum failures are reported per file and the batch goes on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CvsError::Protocol(_) | CvsError::Permission(_))
    }
}

pub type Result<T> = std::result::Result<T, CvsError>;

/// Whether an `anyhow` error chain carries a fatal `CvsError`.
///
/// Errors that did not originate in this crate (bare I/O on the socket, for
/// instance) are treated as fatal: the stream is in an unknown state.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<CvsError>() {
        Some(e) => e.is_fatal(),
        None => err.downcast_ref::<ProtocolError>().is_some() || err.downcast_ref::<io::Error>().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(CvsError::from(ProtocolError::Truncated).is_fatal());
        assert!(CvsError::Permission("setuid".into()).is_fatal());
        assert!(!CvsError::from(LockError::Timeout("mod".into())).is_fatal());
        assert!(!CvsError::Checksum {
            path: "foo".into(),
            expected: "a".into(),
            actual: "b".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_anyhow_classification() {
        let err = anyhow::Error::from(CvsError::NotFound("x".into()));
        assert!(!is_fatal(&err));
        let err = anyhow::Error::from(ProtocolError::DuplicateRoot);
        assert!(is_fatal(&err));
        let err = anyhow::Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(is_fatal(&err));
    }
}
