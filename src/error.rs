//! Error handling module for planharness
//!
//! Provides the error taxonomy of the validation engine using thiserror.
//! Engine-internal errors never escape a test case: the engine folds each of
//! them into a single [`Outcome`](crate::engine::Outcome).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::engine::TransitionError;

/// A variable set entry that has no invocation-argument form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    /// The value type has no defined serialization (mapping, null, float, ...)
    #[error("variable '{key}' has unsupported type {kind} (only string, bool, integer and string lists are allowed)")]
    UnsupportedValue { key: String, kind: &'static str },

    /// The key cannot be expressed as `-var key=value`
    #[error("variable key '{key}' is invalid: {reason}")]
    InvalidKey { key: String, reason: &'static str },
}

/// Main error type for planharness
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Variable set could not be turned into arguments
    #[error("Marshal error: {0}")]
    Marshal(#[from] MarshalError),

    /// The external binary could not be started
    #[error("Failed to launch '{binary}' in {}: {source}", .cwd.display())]
    Launch {
        binary: String,
        cwd: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external process exceeded the per-attempt time limit
    #[error("'{binary}' timed out after {}s", .after.as_secs_f64())]
    TimedOut { binary: String, after: Duration },

    /// The caller aborted the run
    #[error("Run cancelled")]
    Cancelled,

    /// Engine state machine was driven along an illegal edge
    #[error("State error: {0}")]
    Transition(#[from] TransitionError),

    /// Configuration errors (suite loading, retry policy, patterns)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors while talking to a running process
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for planharness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a launch error for `binary` started in `cwd`
    pub fn launch(binary: impl Into<String>, cwd: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Launch {
            binary: binary.into(),
            cwd: cwd.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarnessError::config("max_attempts must be at least 1");
        assert_eq!(
            err.to_string(),
            "Configuration error: max_attempts must be at least 1"
        );

        let err = HarnessError::TimedOut {
            binary: "terraform".into(),
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "'terraform' timed out after 1.5s");
    }

    #[test]
    fn test_marshal_error_conversion() {
        let err: HarnessError = MarshalError::UnsupportedValue {
            key: "settings".into(),
            kind: "mapping",
        }
        .into();
        assert!(matches!(err, HarnessError::Marshal(_)));
        assert!(err.to_string().contains("settings"));
    }

    #[test]
    fn test_launch_error_keeps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "No such file");
        let err = HarnessError::launch("terragrunt", "/tmp/mod", io_err);
        assert!(err.to_string().contains("terragrunt"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
