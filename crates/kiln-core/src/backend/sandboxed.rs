//! Sandboxed backend: Docker with a syscall-intercepting runtime (gVisor).
//!
//! Every run uses the configured OCI runtime and a hardened profile: all
//! capabilities dropped, no privilege escalation, read-only root with a small
//! tmpfs at `/tmp`. The health check fails unless the runtime is registered
//! with the daemon, so a misconfigured host reports `BackendUnavailable`
//! instead of silently falling back to the default runtime.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::Result;

use super::docker::{DockerDriver, RunLimits, SandboxProfile};
use super::{BackendKind, BuildSpec, CancelHandle, IsolationBackend, RunOutput, SandboxHandle};

#[derive(Debug, Clone)]
pub struct SandboxedBackend {
    driver: DockerDriver,
    runtime: String,
}

impl SandboxedBackend {
    pub fn new(docker_bin: &str, runtime: &str, scratch_dir: PathBuf, limits: RunLimits) -> Self {
        Self {
            driver: DockerDriver::new(
                BackendKind::Sandboxed,
                docker_bin,
                scratch_dir,
                limits,
                SandboxProfile {
                    runtime: Some(runtime.to_string()),
                    hardened: true,
                },
            ),
            runtime: runtime.to_string(),
        }
    }

    /// Name of the OCI runtime used for runs.
    pub fn runtime(&self) -> &str {
        &self.runtime
    }
}

#[async_trait]
impl IsolationBackend for SandboxedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sandboxed
    }

    async fn build(&self, spec: &BuildSpec) -> Result<SandboxHandle> {
        self.driver.build(spec).await
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        deadline: Instant,
        cancel: &CancelHandle,
    ) -> Result<RunOutput> {
        self.driver.run(handle, deadline, cancel).await
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        self.driver.destroy(handle).await
    }

    async fn health_check(&self) -> Result<()> {
        self.driver.health_check().await
    }
}
