//! Request, outcome and record types shared by the engine and its collaborators.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::{Error, Result};
use crate::language::{Language, LanguageRegistry};

/// Submission as received from a caller.
///
/// `language` and `backend` are kept as strings so that unknown values can be
/// reported with the right error kind instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub language: String,
    pub code: String,
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

impl SubmissionRequest {
    pub fn new(
        language: impl Into<String>,
        code: impl Into<String>,
        timeout_seconds: u64,
        backend: BackendKind,
    ) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            timeout_seconds,
            backend: Some(backend.to_string()),
        }
    }
}

/// A validated, immutable submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub language: Language,
    pub code: String,
    pub timeout: Duration,
    pub backend: BackendKind,
}

impl Submission {
    /// Validate a request against the registry and the administrative timeout bound.
    ///
    /// Language is checked first so that an unknown language is always reported
    /// as `UnsupportedLanguage`, whatever else is wrong with the request.
    pub fn validate(
        request: &SubmissionRequest,
        registry: &LanguageRegistry,
        max_timeout: Duration,
    ) -> Result<Self> {
        let language = registry.language(&request.language)?;

        if request.code.trim().is_empty() {
            return Err(Error::InvalidSubmission("code must not be empty".to_string()));
        }

        if request.timeout_seconds == 0 {
            return Err(Error::InvalidSubmission(
                "timeout_seconds must be greater than zero".to_string(),
            ));
        }
        let timeout = Duration::from_secs(request.timeout_seconds);
        if timeout > max_timeout {
            return Err(Error::InvalidSubmission(format!(
                "timeout_seconds {} exceeds the maximum of {}",
                request.timeout_seconds,
                max_timeout.as_secs()
            )));
        }

        let backend = match request.backend.as_deref() {
            None => BackendKind::default(),
            Some(raw) => raw.parse()?,
        };

        Ok(Self {
            language,
            code: request.code.clone(),
            timeout,
            backend,
        })
    }
}

/// Wire-level error kind carried by an `ExecutionOutcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnsupportedLanguage,
    InvalidSubmission,
    BuildFailure,
    ExecutionTimeout,
    RuntimeCrash,
    ResourceExhaustion,
    BackendUnavailable,
    Cancelled,
    CleanupFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::UnsupportedLanguage => "UnsupportedLanguage",
            ErrorKind::InvalidSubmission => "InvalidSubmission",
            ErrorKind::BuildFailure => "BuildFailure",
            ErrorKind::ExecutionTimeout => "ExecutionTimeout",
            ErrorKind::RuntimeCrash => "RuntimeCrash",
            ErrorKind::ResourceExhaustion => "ResourceExhaustion",
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::CleanupFailure => "CleanupFailure",
        };
        f.write_str(s)
    }
}

/// Structured error attached to an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for OutcomeError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result of one execution request. Produced exactly once per request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub init_time_ms: u64,
    pub exec_time_ms: u64,
    pub total_time_ms: u64,
    pub warm_start: bool,
    pub error: Option<OutcomeError>,
}

impl ExecutionOutcome {
    /// Outcome for a request that failed before producing output.
    pub fn failed(err: &Error) -> Self {
        Self {
            error: Some(err.into()),
            ..Self::default()
        }
    }

    /// True when execution completed as billed.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Persisted form of an outcome, as handed to the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub function_name: Option<String>,
    pub backend: BackendKind,
    pub language: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
}

impl ExecutionRecord {
    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// A named function definition kept by the function store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub language: String,
    pub code: String,
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl FunctionDef {
    /// Build a submission for this function, optionally overriding its backend.
    pub fn to_request(&self, backend: Option<BackendKind>) -> SubmissionRequest {
        SubmissionRequest {
            language: self.language.clone(),
            code: self.code.clone(),
            timeout_seconds: self.timeout_seconds,
            backend: backend.or(self.backend).map(|b| b.to_string()),
        }
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or(0)
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn millis(d: Duration) -> u64 {
    d.as_millis().try_into().unwrap_or(u64::MAX)
}
