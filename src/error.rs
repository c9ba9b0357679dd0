//! Error taxonomy shared by the detector, reporter and orchestrator.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};

/// Errors raised while configuring, watching, or validating a source tree.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Malformed configuration. Blocks `start()` entirely.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A stat/read failure, a missing root, or a per-path processing failure.
    #[error("filesystem error during {operation} of {}: {source}", path.display())]
    Filesystem {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failure attributable to the validator, for a whole batch or a single file.
    #[error("validation engine error{}: {message}", file_suffix(file_path.as_deref()))]
    ValidationEngine {
        file_path: Option<PathBuf>,
        message: String,
    },

    /// The filesystem event source reported a failure.
    #[error("event source error: {0}")]
    Source(String),

    /// An unhandled fault observed by the orchestrator (e.g. a panicking validator task).
    #[error("unhandled fault: {0}")]
    Fault(String),

    /// A lifecycle transition the state machine does not allow.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

/// Result alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;

fn file_suffix(path: Option<&Path>) -> String {
    path.map(|p| format!(" for {}", p.display()))
        .unwrap_or_default()
}

impl WatchError {
    /// Build a [`WatchError::Filesystem`] for `operation` on `path`.
    pub fn filesystem(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Build a [`WatchError::ValidationEngine`] scoped to a whole batch.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::ValidationEngine {
            file_path: None,
            message: message.into(),
        }
    }

    /// Build a [`WatchError::ValidationEngine`] scoped to one file.
    pub fn engine_for(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ValidationEngine {
            file_path: Some(path.into()),
            message: message.into(),
        }
    }

    /// Taxonomy name used in the `error` field of emitted error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Filesystem { .. } => "FilesystemError",
            Self::ValidationEngine { .. } => "ValidationEngineError",
            Self::Source(_) => "SourceError",
            Self::Fault(_) => "UnhandledFault",
            Self::InvalidTransition { .. } => "InvalidTransition",
        }
    }

    /// Structured context attached to the emitted error event, if any.
    pub fn context(&self) -> Option<Value> {
        match self {
            Self::Filesystem { operation, path, .. } => Some(json!({
                "operation": operation,
                "filePath": path.display().to_string(),
            })),
            Self::ValidationEngine {
                file_path: Some(path),
                ..
            } => Some(json!({ "filePath": path.display().to_string() })),
            Self::InvalidTransition { from, to } => Some(json!({ "from": from, "to": to })),
            _ => None,
        }
    }
}

impl From<notify::Error> for WatchError {
    fn from(err: notify::Error) -> Self {
        Self::Source(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_error_carries_operation_and_path() {
        let err = WatchError::filesystem(
            "read",
            "/tmp/a.cue",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.kind(), "FilesystemError");
        let ctx = err.context().expect("filesystem errors carry context");
        assert_eq!(ctx["operation"], "read");
        assert_eq!(ctx["filePath"], "/tmp/a.cue");
        assert!(err.to_string().contains("/tmp/a.cue"));
    }

    #[cfg(unix)]
    #[test]
    fn test_context_survives_non_utf8_path() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new("/tmp").join(OsStr::from_bytes(b"\xffgone.cue"));
        let err = WatchError::filesystem(
            "stat",
            &path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let ctx = err.context().expect("filesystem errors carry context");
        assert_eq!(ctx["filePath"], "/tmp/\u{FFFD}gone.cue");

        let engine = WatchError::engine_for(&path, "no result returned");
        assert_eq!(engine.context().unwrap()["filePath"], "/tmp/\u{FFFD}gone.cue");
    }

    #[test]
    fn test_engine_error_message_mentions_file() {
        let err = WatchError::engine_for("/x/b.cue", "no result returned");
        assert_eq!(
            err.to_string(),
            "validation engine error for /x/b.cue: no result returned"
        );
        let batch = WatchError::engine("timed out");
        assert_eq!(batch.to_string(), "validation engine error: timed out");
        assert!(batch.context().is_none());
    }

    #[test]
    fn test_configuration_error_kind() {
        let err = WatchError::Configuration("watch_paths must not be empty".into());
        assert_eq!(err.kind(), "ConfigurationError");
    }
}
