//! Error types for Kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

/// Result type alias for Kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in Kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing required setting: {0}")]
    ConfigMissing(String),

    // Manifest errors
    #[error("Run manifest pointer not ready: {0}")]
    ManifestPointerNotReady(PathBuf),

    #[error("CONTAINER_RUN_META_JSON not found in pointer file {0}")]
    ManifestPointerIncomplete(PathBuf),

    #[error("Run manifest missing: {0}")]
    ManifestMissing(PathBuf),

    #[error("Invalid run manifest at {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    // Model errors
    #[error("No model given and model.default_path is not set")]
    ModelUnresolved,

    // Cache errors
    #[error("Cache directory not writable: {0}")]
    CacheUnwritable(PathBuf),

    // Server errors
    #[error("Warm-up server failed to start: {0}")]
    ServerStart(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ModelUnresolved => Some("Pass --model or set model.default_path in the config"),
            Self::ManifestPointerNotReady(_) => {
                Some("Start the serving container first; its lifecycle tool writes the pointer file")
            }
            Self::CacheUnwritable(_) => Some("Check ownership of the cache root directory"),
            Self::ConfigNotFound(_) => Some("Run: kiln config init"),
            _ => None,
        }
    }
}

/// Run a best-effort side operation, logging and swallowing any failure.
///
/// Side operations (marker writes, lock release, manifest annotation,
/// telemetry probes) must never affect the primary-path outcome. Returns
/// `None` on failure so callers can still branch on success if they care.
pub fn best_effort<T>(context: &str, result: KilnResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{}: {}", context, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KilnError::ModelUnresolved;
        assert!(err.to_string().contains("No model given"));
    }

    #[test]
    fn error_hint() {
        let err = KilnError::ModelUnresolved;
        assert_eq!(
            err.hint(),
            Some("Pass --model or set model.default_path in the config")
        );
        assert!(KilnError::Internal("x".into()).hint().is_none());
    }

    #[test]
    fn best_effort_swallows_errors() {
        let ok: KilnResult<u32> = Ok(7);
        assert_eq!(best_effort("ok path", ok), Some(7));

        let err: KilnResult<u32> = Err(KilnError::Internal("boom".into()));
        assert_eq!(best_effort("failing path", err), None);
    }
}
