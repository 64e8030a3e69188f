//! Error types for repository operations
//!
//! All fallible repository operations return [`DataError`]. Evaluation
//! failures inside compiled functions are not errors at this level: they are
//! logged and the cell becomes undefined (see [`crate::script::EvalError`]).

use std::path::PathBuf;

use thiserror::Error;

/// Repository error types with enough context to locate the failure
#[derive(Debug, Clone, Error)]
pub enum DataError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", path_suffix(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A datafile line could not be understood
    #[error("invalid datafile{} at line {line}: {reason}", path_suffix(.path))]
    InvalidDatafile {
        /// The datafile being parsed, if it came from disk
        path: Option<PathBuf>,
        /// 1-based line number
        line: usize,
        /// What was wrong with it
        reason: String,
    },

    /// An `#include <name>` could not be found in any template directory
    #[error("include file <{name}> not found in any template directory")]
    IncludeNotFound {
        /// The bare include name, without angle brackets
        name: String,
    },

    /// A textual value encoding could not be decoded
    #[error("malformed value {text:?}: {reason}")]
    MalformedValue {
        /// The offending text
        text: String,
        /// Why it failed to decode
        reason: String,
    },

    /// No datafile is mounted under the given prefix
    #[error("no datafile is open for prefix {prefix}")]
    DatafileNotOpen {
        /// The requested prefix
        prefix: String,
    },

    /// A datafile is already mounted under the given prefix
    #[error("a datafile is already open for prefix {prefix}")]
    DatafileAlreadyOpen {
        /// The requested prefix
        prefix: String,
    },

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The repository has been shut down
    #[error("repository has been shut down")]
    Shutdown,
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl DataError {
    /// Build an `Io` error tagged with the file it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: &std::io::Error, what: &str) -> Self {
        DataError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// Build a `MalformedValue` error.
    pub fn malformed(text: &str, reason: impl Into<String>) -> Self {
        DataError::MalformedValue {
            text: text.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors worth retrying (transient I/O), false for format errors.
    pub fn is_transient(&self) -> bool {
        matches!(self, DataError::Io { kind, .. } if *kind != std::io::ErrorKind::NotFound)
    }
}

/// Convert std::io::Error to DataError::Io
impl From<std::io::Error> for DataError {
    fn from(err: std::io::Error) -> Self {
        DataError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for repository operations
pub type DataResult<T> = Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DataError::InvalidDatafile {
            path: Some(PathBuf::from("/tmp/proj.dat")),
            line: 7,
            reason: "missing '='".into(),
        };

        let display = format!("{}", err);
        assert!(display.contains("/tmp/proj.dat"));
        assert!(display.contains("line 7"));
        assert!(display.contains("missing '='"));
    }

    #[test]
    fn test_io_error_display_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = DataError::io_at("/data/x.dat", &io_err, "Failed to save datafile");
        let display = format!("{}", err);
        assert!(display.contains("in /data/x.dat"));
        assert!(display.contains("Failed to save datafile"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DataError = io_err.into();

        match err {
            DataError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_transient_classification() {
        let busy = DataError::from(std::io::Error::new(std::io::ErrorKind::Interrupted, "busy"));
        let missing = DataError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(busy.is_transient());
        assert!(!missing.is_transient());
        assert!(!DataError::malformed("x", "bad").is_transient());
    }
}
