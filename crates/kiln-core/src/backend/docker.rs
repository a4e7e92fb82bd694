//! Docker CLI driver shared by the container and sandboxed backends.
//!
//! Talks to the daemon through the `docker` binary. Each run starts a fresh,
//! uniquely named container from the artifact image; a `ContainerGuard`
//! guarantees the container is removed exactly once on every exit path.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::language::{Template, APP_DIR};
use crate::types::millis;

use super::{BackendKind, BuildSpec, CancelHandle, RunOutput, SandboxHandle};

/// Label attached to every image and container created by Kiln.
pub const LABEL_FINGERPRINT: &str = "io.kiln.fingerprint";
pub const LABEL_BACKEND: &str = "io.kiln.backend";

/// Timeout for short control commands (rm, rmi, info).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a timed-out or cancelled run waits for its container to be
/// removed before leaving the removal to a background thread. Kept below the
/// minimum supervisor grace.
const TERMINATE_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for image builds. Base image pulls dominate.
const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// `docker run` exit code when the daemon itself failed.
const EXIT_DOCKER_ERROR: i32 = 125;
/// Contained command could not be invoked.
const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Contained command not found.
const EXIT_NOT_FOUND: i32 = 127;
/// Process killed with SIGKILL (OOM killer when we did not kill it).
const EXIT_SIGKILL: i32 = 137;

/// Resource limits applied to every run.
#[derive(Debug, Clone)]
pub struct RunLimits {
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    pub max_output_bytes: usize,
}

impl RunLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            memory_mb: config.memory_mb,
            cpus: config.cpus,
            pids_limit: config.pids_limit,
            max_output_bytes: config.max_output_bytes,
        }
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Isolation profile layered on top of the base container flags.
#[derive(Debug, Clone, Default)]
pub struct SandboxProfile {
    /// OCI runtime registered with the daemon (`runsc` for gVisor).
    pub runtime: Option<String>,
    /// Drop all capabilities, forbid privilege escalation, read-only root.
    pub hardened: bool,
}

/// Driver for the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerDriver {
    kind: BackendKind,
    bin: String,
    scratch_dir: PathBuf,
    limits: RunLimits,
    profile: SandboxProfile,
}

impl DockerDriver {
    pub fn new(
        kind: BackendKind,
        bin: impl Into<String>,
        scratch_dir: PathBuf,
        limits: RunLimits,
        profile: SandboxProfile,
    ) -> Self {
        Self {
            kind,
            bin: bin.into(),
            scratch_dir,
            limits,
            profile,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Image tag for a new artifact.
    ///
    /// Unique per build: a rebuild of the same fingerprint, or a build by
    /// another engine sharing the daemon, never reuses a tag, so destroying
    /// one artifact cannot remove another's image. The full fingerprint is
    /// kept in the image label.
    pub fn image_tag(&self, spec: &BuildSpec) -> String {
        let build_id = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "kiln-{}-{}-{}",
            self.kind,
            spec.fingerprint.short(),
            &build_id[..8]
        )
    }

    fn unavailable(&self, message: impl Into<String>) -> Error {
        Error::BackendUnavailable {
            backend: self.kind,
            message: message.into(),
        }
    }

    /// Build the artifact image from a scratch build context.
    ///
    /// The context directory lives only for the duration of this call.
    pub async fn build(&self, spec: &BuildSpec) -> Result<SandboxHandle> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let context = tempfile::Builder::new()
            .prefix("kiln-build-")
            .tempdir_in(&self.scratch_dir)?;
        write_build_context(context.path(), &spec.template, &spec.code).await?;

        let tag = self.image_tag(spec);
        tracing::debug!(backend = %self.kind, image = %tag, "building image");

        let output = self
            .control(
                &[
                    "build".to_string(),
                    "--quiet".to_string(),
                    "--label".to_string(),
                    format!("{LABEL_FINGERPRINT}={}", spec.fingerprint),
                    "--label".to_string(),
                    format!("{LABEL_BACKEND}={}", self.kind),
                    "--tag".to_string(),
                    tag.clone(),
                    context.path().display().to_string(),
                ],
                BUILD_TIMEOUT,
            )
            .await?;

        if let Err(e) = context.close() {
            tracing::warn!("Failed to remove build context: {}", e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_daemon_unreachable(&stderr) {
                return Err(self.unavailable(tail(&stderr, 512)));
            }
            return Err(Error::Build(tail(&stderr, 2048)));
        }

        Ok(SandboxHandle {
            id: tag,
            backend: self.kind,
            fingerprint: spec.fingerprint.clone(),
        })
    }

    /// Arguments for `docker run`, excluding the image.
    fn run_args(&self, container: &str, handle: &SandboxHandle) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container.to_string(),
            "--label".to_string(),
            format!("{LABEL_FINGERPRINT}={}", handle.fingerprint),
            "--network".to_string(),
            "none".to_string(),
            "--memory".to_string(),
            format!("{}m", self.limits.memory_mb),
            "--memory-swap".to_string(),
            format!("{}m", self.limits.memory_mb),
            "--cpus".to_string(),
            self.limits.cpus.to_string(),
            "--pids-limit".to_string(),
            self.limits.pids_limit.to_string(),
            "--workdir".to_string(),
            APP_DIR.to_string(),
        ];

        if let Some(runtime) = &self.profile.runtime {
            args.push("--runtime".to_string());
            args.push(runtime.clone());
        }

        if self.profile.hardened {
            args.extend(
                [
                    "--cap-drop",
                    "ALL",
                    "--security-opt",
                    "no-new-privileges",
                    "--read-only",
                    "--tmpfs",
                    "/tmp:rw,noexec,nosuid,size=16m",
                ]
                .map(String::from),
            );
        }

        args.push(handle.id.clone());
        args
    }

    /// Run one container from the artifact image.
    pub async fn run(
        &self,
        handle: &SandboxHandle,
        deadline: Instant,
        cancel: &CancelHandle,
    ) -> Result<RunOutput> {
        let bin = self.resolve_bin()?;
        let container = format!("kiln-run-{}", uuid::Uuid::new_v4().simple());
        let started = Instant::now();

        let mut cmd = Command::new(&bin);
        cmd.args(self.run_args(&container, handle))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so the whole client tree can be killed at once.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut guard = ContainerGuard::new(bin.clone(), container.clone());
        let mut child = cmd
            .spawn()
            .map_err(|e| self.unavailable(format!("failed to spawn {}: {}", bin.display(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::RuntimeCrash("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::RuntimeCrash("failed to capture stderr".to_string()))?;
        let cap = self.limits.max_output_bytes;
        let stdout_task = tokio::spawn(read_capped(stdout, cap));
        let stderr_task = tokio::spawn(read_capped(stderr, cap));

        let status = tokio::select! {
            status = child.wait() => status,
            _ = tokio::time::sleep_until(deadline) => {
                let elapsed_ms = millis(started.elapsed());
                terminate(&mut child, &mut guard).await;
                tracing::info!(backend = %self.kind, container = %container, elapsed_ms, "run hit its deadline");
                return Err(Error::Timeout { elapsed_ms });
            }
            _ = cancel.cancelled() => {
                terminate(&mut child, &mut guard).await;
                tracing::info!(backend = %self.kind, container = %container, "run cancelled");
                return Err(Error::Cancelled);
            }
        };

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();
        guard.cleanup(CONTROL_TIMEOUT).await;

        let status = status.map_err(|e| Error::RuntimeCrash(format!("wait for docker: {e}")))?;
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        match status.code() {
            Some(EXIT_DOCKER_ERROR) if is_daemon_unreachable(&stderr) => {
                Err(self.unavailable(tail(&stderr, 512)))
            }
            Some(code @ (EXIT_DOCKER_ERROR | EXIT_NOT_EXECUTABLE | EXIT_NOT_FOUND)) => Err(
                Error::RuntimeCrash(format!("container failed to start ({code}): {}", tail(&stderr, 1024))),
            ),
            Some(EXIT_SIGKILL) => Err(Error::RuntimeCrash(
                "container was killed (memory limit exceeded?)".to_string(),
            )),
            Some(code) => Ok(RunOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr,
                exit_code: Some(code),
                stdout_truncated,
                stderr_truncated,
            }),
            None => Err(Error::RuntimeCrash(
                "docker client terminated by signal".to_string(),
            )),
        }
    }

    /// Remove an artifact image. Missing images count as removed.
    pub async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        let output = self
            .control(
                &["rmi".to_string(), "--force".to_string(), handle.id.clone()],
                CONTROL_TIMEOUT,
            )
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such image") {
            return Ok(());
        }
        Err(Error::Cleanup(format!(
            "docker rmi {}: {}",
            handle.id,
            tail(&stderr, 512)
        )))
    }

    /// Check the daemon answers, and that the configured runtime is registered.
    pub async fn health_check(&self) -> Result<()> {
        let output = self
            .control(
                &[
                    "info".to_string(),
                    "--format".to_string(),
                    "{{json .Runtimes}}".to_string(),
                ],
                CONTROL_TIMEOUT,
            )
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.unavailable(tail(&stderr, 512)));
        }

        if let Some(runtime) = &self.profile.runtime {
            let runtimes: serde_json::Value = serde_json::from_slice(&output.stdout)
                .map_err(|e| self.unavailable(format!("unreadable docker info: {e}")))?;
            if runtimes.get(runtime).is_none() {
                return Err(self.unavailable(format!(
                    "runtime {runtime:?} is not registered with the docker daemon"
                )));
            }
        }
        Ok(())
    }

    fn resolve_bin(&self) -> Result<PathBuf> {
        which::which(&self.bin)
            .map_err(|e| self.unavailable(format!("docker binary {:?} not found: {}", self.bin, e)))
    }

    /// Run a short docker command to completion with a timeout.
    async fn control(&self, args: &[String], timeout: Duration) -> Result<Output> {
        let bin = self.resolve_bin()?;
        let mut cmd = Command::new(&bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(self.unavailable(format!("failed to run {}: {}", bin.display(), e))),
            Err(_) => Err(self.unavailable(format!(
                "docker {} did not finish within {}s",
                args.first().map(String::as_str).unwrap_or_default(),
                timeout.as_secs()
            ))),
        }
    }
}

/// Force-stop a run: kill the docker client's process group, then remove the
/// container. `docker rm --force` SIGKILLs every process in the container.
async fn terminate(child: &mut Child, guard: &mut ContainerGuard) {
    if let Some(pid) = child.id() {
        kill_process_group(pid);
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
    guard.cleanup(TERMINATE_TIMEOUT).await;
}

/// Removes a run's container exactly once.
///
/// `cleanup` is awaited on every exit path. If it does not finish in time, or
/// the run future is dropped first (caller went away), `Drop` removes the
/// container from a background thread instead.
struct ContainerGuard {
    bin: PathBuf,
    container: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(bin: PathBuf, container: String) -> Self {
        Self {
            bin,
            container,
            armed: true,
        }
    }

    async fn cleanup(&mut self, timeout: Duration) {
        if !self.armed {
            return;
        }
        let removed = tokio::time::timeout(timeout, self.remove()).await;
        match removed {
            Ok(()) => self.armed = false,
            Err(_) => {
                tracing::debug!(container = %self.container, "docker rm still running, finishing in background");
            }
        }
    }

    async fn remove(&self) {
        let result = Command::new(&self.bin)
            .args(["rm", "--force", &self.container])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(CONTROL_TIMEOUT, result).await {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("No such container") {
                    tracing::warn!(container = %self.container, "docker rm failed: {}", stderr.trim());
                }
            }
            Ok(Err(e)) => tracing::warn!(container = %self.container, "docker rm failed: {}", e),
            Err(_) => tracing::warn!(container = %self.container, "docker rm timed out"),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        let bin = self.bin.clone();
        let container = std::mem::take(&mut self.container);
        std::thread::spawn(move || {
            let _ = std::process::Command::new(&bin)
                .args(["rm", "--force", &container])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        });
    }
}

/// Write the Dockerfile and the source file into a build context.
async fn write_build_context(dir: &Path, template: &Template, code: &str) -> Result<()> {
    tokio::fs::write(dir.join("Dockerfile"), template.dockerfile()).await?;
    tokio::fs::write(dir.join(template.source_file_name()), code).await?;
    Ok(())
}

/// Read a stream to the end, keeping at most `cap` bytes.
///
/// Reading continues past the cap so the writer never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buf.len());
                if n > room {
                    buf.extend_from_slice(&chunk[..room]);
                    truncated = true;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }

    (buf, truncated)
}

/// SIGKILL a process and its process group.
fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
            let _ = libc::kill(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Whether docker stderr says the daemon or runtime cannot be used at all.
fn is_daemon_unreachable(stderr: &str) -> bool {
    const MARKERS: [&str; 4] = [
        "Cannot connect to the Docker daemon",
        "error during connect",
        "unknown or invalid runtime name",
        "permission denied while trying to connect",
    ];
    MARKERS.iter().any(|m| stderr.contains(m))
}

/// Last `max` bytes of a message, trimmed, on a char boundary.
fn tail(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}
