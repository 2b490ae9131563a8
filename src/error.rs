//! Error types
//!
//! User-code failures (rejections, compile errors, runtime errors, timeouts)
//! are never errors: they come back as an `ExecutionResult`. Only faults of
//! the execution environment itself are represented here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Message handed to callers for any environment fault. Internal detail
/// goes to the log only.
pub const SYSTEM_UNAVAILABLE: &str = "System unavailable, please try again later";

/// Environment-level failure of the execution sandbox
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to prepare staging directory {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("failed to launch container {container}: {detail}")]
    Launch { container: String, detail: String },
    #[error("sandbox i/o failure: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// The only text a caller ever sees for an environment fault
    pub fn public_message(&self) -> &'static str {
        SYSTEM_UNAVAILABLE
    }
}

/// Startup configuration problem (language profiles, gate patterns, env)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid pattern `{name}` for {language}: {source}")]
    Pattern {
        language: String,
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid profile `{language}`: {reason}")]
    Profile { language: String, reason: String },
    #[error("invalid security configuration: {0}")]
    Security(String),
}
