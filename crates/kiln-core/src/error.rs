//! Error types for kiln-core.

use thiserror::Error;

use crate::backend::BackendKind;
use crate::types::ErrorKind;

/// Result type for kiln-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kiln-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Submission failed validation (empty code, bad timeout, unknown backend).
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// No template is registered for the requested language.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Building the sandbox artifact failed.
    #[error("build failed: {0}")]
    Build(String),

    /// The submitted code did not finish before its deadline.
    #[error("execution timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The sandbox runtime itself failed (container could not start, OOM kill).
    #[error("runtime crashed: {0}")]
    RuntimeCrash(String),

    /// Worker pool and queue are full, or the queue wait expired.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// Tearing down sandbox state failed. Never fatal for a request.
    #[error("cleanup failed: {0}")]
    Cleanup(String),

    /// The isolation backend cannot be reached.
    #[error("backend {backend} unavailable: {message}")]
    BackendUnavailable {
        backend: BackendKind,
        message: String,
    },

    /// The caller cancelled the request.
    #[error("execution cancelled")]
    Cancelled,

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The wire-level kind reported in an `ExecutionOutcome`.
    ///
    /// IO and JSON failures surface while talking to the sandbox runtime,
    /// so they are reported as runtime crashes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidSubmission(_) | Error::Config(_) => ErrorKind::InvalidSubmission,
            Error::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            Error::Build(_) => ErrorKind::BuildFailure,
            Error::Timeout { .. } => ErrorKind::ExecutionTimeout,
            Error::RuntimeCrash(_) | Error::Io(_) | Error::Json(_) => ErrorKind::RuntimeCrash,
            Error::ResourceExhaustion(_) => ErrorKind::ResourceExhaustion,
            Error::Cleanup(_) => ErrorKind::CleanupFailure,
            Error::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether this error should put the backend into its health cooldown.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Error::BackendUnavailable { .. })
    }
}
