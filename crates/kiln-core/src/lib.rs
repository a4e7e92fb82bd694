//! Core engine for Kiln sandboxed function execution.
//!
//! This crate provides:
//! - Language registry mapping languages to runtime templates
//! - Content-addressed fingerprints and a coalescing build cache
//! - Isolation backends (Docker container, gVisor sandbox)
//! - The execution supervisor (`Engine`) with deadline enforcement and cleanup
//! - Execution records, stores and statistics for the surrounding services

pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod health;
pub mod language;
pub mod metrics;
pub mod paths;
pub mod pool;
pub mod stats;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{
    BackendKind, BuildSpec, CancelHandle, ContainerBackend, IsolationBackend, RunOutput,
    SandboxHandle, SandboxedBackend,
};
pub use cache::{ArtifactLease, BuildCache, CacheConfig};
pub use config::{EngineConfig, ServerConfig};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use language::{Language, LanguageRegistry, Template};
pub use metrics::MetricsEmitter;
pub use paths::KilnDirs;
pub use stats::{FunctionStats, RuntimeStats, SystemStats};
pub use store::{
    FunctionStore, JsonFunctionStore, JsonlRecordStore, MemoryFunctionStore, MemoryRecordStore,
    RecordQuery, RecordStore, StoreError,
};
pub use types::{
    ErrorKind, ExecutionOutcome, ExecutionRecord, FunctionDef, OutcomeError, Submission,
    SubmissionRequest,
};
