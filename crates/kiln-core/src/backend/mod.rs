//! Isolation backends.
//!
//! A backend turns a `BuildSpec` into a runnable `SandboxHandle`, runs a
//! handle under a deadline and destroys it again. The supervisor only talks
//! to the `IsolationBackend` trait, so backends are interchangeable and can be
//! compared directly.
//!
//! # Backends
//!
//! - **`ContainerBackend`** - Docker with the default runtime. Network
//!   disabled, memory/CPU/pids bounded.
//! - **`SandboxedBackend`** - Docker with the gVisor `runsc` runtime, which
//!   intercepts syscalls in a user-space kernel. Adds a hardened profile
//!   (no capabilities, read-only root). Slower to start, stronger isolation.
//!
//! # Architecture
//!
//! ```text
//! IsolationBackend
//!     │
//!     ├── ContainerBackend ──┐
//!     │                      ├── DockerDriver (docker CLI)
//!     └── SandboxedBackend ──┘        │
//!                                     ├── build: scratch context → docker build
//!                                     ├── run:   docker run (one container per run)
//!                                     │          └── deadline / cancel → kill client, docker rm -f
//!                                     └── destroy: docker rmi
//! ```

mod cancel;
mod container;
mod docker;
mod sandboxed;

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::language::{Language, Template};

pub use cancel::CancelHandle;
pub use container::ContainerBackend;
pub use docker::{DockerDriver, RunLimits, SandboxProfile};
pub use sandboxed::SandboxedBackend;

/// Identifies an isolation technology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// General-purpose container runtime.
    #[default]
    Container,
    /// Syscall-filtering sandbox runtime.
    Sandboxed,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Container, BackendKind::Sandboxed];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Container => "container",
            BackendKind::Sandboxed => "sandboxed",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container" | "docker" => Ok(BackendKind::Container),
            "sandboxed" | "gvisor" | "runsc" => Ok(BackendKind::Sandboxed),
            other => Err(Error::InvalidSubmission(format!(
                "unknown backend {other:?} (expected one of: container, sandboxed)"
            ))),
        }
    }
}

/// Everything a backend needs to build an artifact.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub fingerprint: Fingerprint,
    pub language: Language,
    pub template: Template,
    pub code: String,
}

/// Reference to a built, runnable artifact inside a backend.
///
/// Handles are owned by the build cache. A run never mutates the handle; every
/// run gets its own sandbox instance started from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle {
    /// Backend-specific artifact id (image tag for Docker backends).
    pub id: String,
    pub backend: BackendKind,
    pub fingerprint: Fingerprint,
}

/// Captured output of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Capability set shared by all isolation technologies.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Which technology this backend implements.
    fn kind(&self) -> BackendKind;

    /// Build a runnable artifact.
    ///
    /// Fails with `Error::Build`, or `Error::BackendUnavailable` when the
    /// runtime cannot be reached.
    async fn build(&self, spec: &BuildSpec) -> Result<SandboxHandle>;

    /// Run the artifact until it exits, `deadline` passes or `cancel` fires.
    ///
    /// Backends enforce the deadline themselves and on expiry terminate the
    /// whole process tree of the sandbox, returning `Error::Timeout`.
    /// Cancellation takes the same termination path and returns
    /// `Error::Cancelled`.
    async fn run(
        &self,
        handle: &SandboxHandle,
        deadline: Instant,
        cancel: &CancelHandle,
    ) -> Result<RunOutput>;

    /// Destroy an artifact. Idempotent: destroying a missing artifact succeeds.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<()>;

    /// Check that the backend is reachable and usable.
    async fn health_check(&self) -> Result<()>;
}

/// Create the Docker-based backends described by `config`.
pub fn docker_backends(
    config: &EngineConfig,
    scratch_dir: PathBuf,
) -> (ContainerBackend, SandboxedBackend) {
    let limits = RunLimits::from_config(config);
    (
        ContainerBackend::new(&config.docker_bin, scratch_dir.clone(), limits.clone()),
        SandboxedBackend::new(
            &config.docker_bin,
            &config.sandbox_runtime,
            scratch_dir,
            limits,
        ),
    )
}
