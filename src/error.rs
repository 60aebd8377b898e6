use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the attack engine itself (not by the external toolchain).
#[derive(Debug, Error)]
pub enum ApgError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Path does not exist: {path}")]
    PathNotFound { path: PathBuf },

    #[error("Feature {feature} is not a benign feature of the loaded model")]
    UnknownFeature { feature: String },

    #[error("Unsupported {kind} schema version {found} (expected {expected})")]
    SchemaVersion {
        kind: &'static str,
        found: u32,
        expected: u32,
    },

    #[error("Model file is inconsistent: {message}")]
    InvalidModel { message: String },

    #[error(transparent)]
    Oracle(#[from] OracleError),
}

pub type Result<T> = std::result::Result<T, ApgError>;

impl ApgError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_model<S: Into<String>>(message: S) -> Self {
        Self::InvalidModel {
            message: message.into(),
        }
    }

    pub fn path_not_found<P: Into<PathBuf>>(path: P) -> Self {
        Self::PathNotFound { path: path.into() }
    }
}

/// Failures of an external tool invocation.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("{tool} exited with code {code:?}: {stderr}")]
    NonZeroExit {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} produced an unparseable report: {detail}")]
    Malformed { tool: String, detail: String },
}

impl OracleError {
    pub fn malformed<T: Into<String>, D: Into<String>>(tool: T, detail: D) -> Self {
        Self::Malformed {
            tool: tool.into(),
            detail: detail.into(),
        }
    }

    /// True for the toolchain failures that are known to be non-deterministic
    /// and therefore worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NonZeroExit { .. })
    }
}
