//! Error types for the extension sandbox.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the extension sandbox.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Manifest not found in extension: {0}")]
    ManifestNotFound(PathBuf),

    #[error("Invalid manifest in {path}: {message}")]
    ManifestInvalid { path: PathBuf, message: String },

    #[error("Extension '{0}' not found")]
    ExtensionNotFound(String),

    #[error("Failed to load extension '{extension}': {message}")]
    LoadFailed { extension: String, message: String },

    #[error("Function '{function}' not found in extension '{extension}'")]
    FunctionNotFound { extension: String, function: String },

    #[error("Extension '{extension}' failed in '{function}': {message}")]
    InvocationFailed {
        extension: String,
        function: String,
        message: String,
        stack: Option<String>,
    },

    #[error("Sandbox for extension '{0}' was destroyed")]
    SandboxDestroyed(String),

    #[error("Network access to '{domain}' not allowed")]
    DomainNotAllowed { domain: String },

    #[error("Bridge request '{request_id}' timed out after {timeout_ms}ms")]
    BridgeTimeout { request_id: String, timeout_ms: u64 },

    #[error("Challenge not resolved: {0}")]
    ChallengeUnresolved(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rendering surface error: {0}")]
    Surface(String),

    #[error("JavaScript error: {0}")]
    JavaScript(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExtensionError {
    /// Whether the failure is expected during normal operation and worth retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DomainNotAllowed { .. }
                | Self::BridgeTimeout { .. }
                | Self::ChallengeUnresolved(_)
                | Self::Network(_)
        )
    }
}

impl From<reqwest::Error> for ExtensionError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Result type for extension operations.
pub type ExtensionResult<T> = Result<T, ExtensionError>;
