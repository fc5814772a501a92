//! Error types for RVM Core
//!
//! Configuration and history errors are programmer/operator mistakes and are
//! returned as `Err`. Expected runtime failures (probe timeouts, missing
//! backups) are never represented here; they become records instead.

use std::path::PathBuf;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File parsed but did not match the schema (includes missing keys)
    #[error("invalid config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// Extension is not one of toml / yaml / yml / json
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    /// Semantically invalid value
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// History log errors
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Hash chain does not verify
    #[error("history integrity violation at entry {index}")]
    IntegrityViolation { index: usize },
}

/// Service control errors
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{verb} {service} exited with {code:?}: {stderr}")]
    CommandFailed {
        verb: String,
        service: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unknown service: {0}")]
    UnknownService(String),
}
