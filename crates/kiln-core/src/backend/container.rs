//! Container backend: Docker with the daemon's default runtime.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::Result;

use super::docker::{DockerDriver, RunLimits, SandboxProfile};
use super::{BackendKind, BuildSpec, CancelHandle, IsolationBackend, RunOutput, SandboxHandle};

/// General-purpose container isolation.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    driver: DockerDriver,
}

impl ContainerBackend {
    pub fn new(docker_bin: &str, scratch_dir: PathBuf, limits: RunLimits) -> Self {
        Self {
            driver: DockerDriver::new(
                BackendKind::Container,
                docker_bin,
                scratch_dir,
                limits,
                SandboxProfile::default(),
            ),
        }
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
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
