//! Error types for the pebble tool core.
//!
//! Every failure in this crate is raised as a typed [`ToolError`]; the CLI
//! layer turns it into a printed message and a non-zero exit code. The core
//! itself never terminates the process.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for pebble tool operations.
#[derive(Debug, Error)]
pub enum ToolError {
    // SDK errors
    #[error("{0}")]
    MissingSdk(String),

    #[error("{0}")]
    SdkInstall(String),

    // Emulator errors
    #[error("{0}")]
    MissingEmulator(String),

    // Transport errors
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Multiple emulators are running ({running}); you must specify which to use.")]
    AmbiguousEmulators { running: String },

    #[error("No pebble connection specified.")]
    NoConnection,

    // Network errors
    #[error("Network error: {message}")]
    Network { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for pebble tool operations.
pub type Result<T> = std::result::Result<T, ToolError>;

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(err: reqwest::Error) -> Self {
        ToolError::Network {
            message: err.to_string(),
        }
    }
}

impl ToolError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ToolError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ToolError::MissingSdk("SDK 4.3 is not installed.".into());
        assert_eq!(err.to_string(), "SDK 4.3 is not installed.");

        let err = ToolError::AmbiguousEmulators {
            running: "aplite, basalt".into(),
        };
        assert!(err.to_string().contains("aplite, basalt"));
    }

    #[test]
    fn test_io_error_carries_path() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = ToolError::io_with_path(inner, "/tmp/x");
        match err {
            ToolError::Io { path, .. } => assert_eq!(path, Some(PathBuf::from("/tmp/x"))),
            _ => panic!("expected Io variant"),
        }
    }
}
