// ABOUTME: Error types for sandbox orchestration
// ABOUTME: Caller-facing taxonomy wrapping runtime control-plane failures with their operation name

use thiserror::Error;

use crate::runtime::RuntimeError;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Malformed sandbox spec, rejected before any runtime call
    #[error("Validation error: {0}")]
    Validation(String),

    /// A runtime control-plane call failed
    #[error("Runtime operation '{operation}' failed: {source}")]
    RuntimeOperation {
        operation: &'static str,
        #[source]
        source: RuntimeError,
    },

    /// Referenced sandbox, volume or network does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Volume path resolves outside of the volume root
    #[error("Path traversal not allowed: {0}")]
    PathTraversal(String),

    /// Interactive operation exceeded the caller's wait
    #[error("Operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// Operation requires a running sandbox
    #[error("Sandbox is not running: {0}")]
    NotRunning(String),

    /// Image could be neither pulled nor built
    #[error("Image unavailable: {0}")]
    ImageUnavailable(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Wrap a runtime failure, surfacing missing objects as `NotFound`
    pub fn runtime(operation: &'static str, kind: &'static str, id: &str, source: RuntimeError) -> Self {
        match source {
            RuntimeError::NotFound(_) => SandboxError::NotFound {
                kind,
                id: id.to_string(),
            },
            source => SandboxError::RuntimeOperation { operation, source },
        }
    }

    pub fn sandbox_not_found(id: &str) -> Self {
        SandboxError::NotFound {
            kind: "Sandbox",
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SandboxError::NotFound { .. })
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
