//! Built artifacts, run leases and the reaper that destroys them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::backend::{BackendKind, IsolationBackend, SandboxHandle};
use crate::fingerprint::Fingerprint;

/// A runnable artifact owned by the build cache.
///
/// The artifact is destroyed when the last reference to it is dropped: the
/// cache entry and every in-flight `ArtifactLease`. Destruction is handed to
/// the reaper task so it never runs in a caller's critical path.
pub struct BuildArtifact {
    pub(crate) fingerprint: Fingerprint,
    pub(crate) handle: SandboxHandle,
    pub(crate) built_at: Instant,
    pub(crate) ttl: Duration,
    owner: Arc<dyn IsolationBackend>,
    reaper: mpsc::UnboundedSender<ReapJob>,
}

impl BuildArtifact {
    pub(crate) fn new(
        fingerprint: Fingerprint,
        handle: SandboxHandle,
        ttl: Duration,
        owner: Arc<dyn IsolationBackend>,
        reaper: mpsc::UnboundedSender<ReapJob>,
    ) -> Self {
        Self {
            fingerprint,
            handle,
            built_at: Instant::now(),
            ttl,
            owner,
            reaper,
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.built_at) >= self.ttl
    }
}

impl Drop for BuildArtifact {
    fn drop(&mut self) {
        let job = ReapJob {
            backend: Arc::clone(&self.owner),
            handle: self.handle.clone(),
        };
        if self.reaper.send(job).is_err() {
            tracing::warn!(
                fingerprint = %self.fingerprint.short(),
                artifact = %self.handle.id,
                "reaper is gone, artifact not destroyed"
            );
        }
    }
}

impl std::fmt::Debug for BuildArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildArtifact")
            .field("fingerprint", &self.fingerprint.short())
            .field("handle", &self.handle.id)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Shared reference held by a run while it executes.
///
/// A lease keeps the artifact alive even if the cache evicts it meanwhile.
#[derive(Debug, Clone)]
pub struct ArtifactLease(pub(crate) Arc<BuildArtifact>);

impl ArtifactLease {
    pub fn handle(&self) -> &SandboxHandle {
        &self.0.handle
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.0.fingerprint
    }

    pub fn backend(&self) -> BackendKind {
        self.0.handle.backend
    }

    pub fn built_at(&self) -> Instant {
        self.0.built_at
    }
}

/// A destruction request for the reaper.
pub(crate) struct ReapJob {
    backend: Arc<dyn IsolationBackend>,
    handle: SandboxHandle,
}

/// Destroy artifacts until every sender (cache and artifacts) is gone.
///
/// Failures are retried with exponential backoff and then logged as cleanup
/// failures; they never reach a caller.
pub(crate) async fn run_reaper(mut jobs: mpsc::UnboundedReceiver<ReapJob>, retries: u32) {
    while let Some(job) = jobs.recv().await {
        destroy_with_retries(&job, retries).await;
    }
    tracing::debug!("reaper finished");
}

async fn destroy_with_retries(job: &ReapJob, retries: u32) {
    let mut backoff = Duration::from_millis(100);
    let mut attempt = 0;

    loop {
        match job.backend.destroy(&job.handle).await {
            Ok(()) => {
                tracing::debug!(backend = %job.handle.backend, artifact = %job.handle.id, "artifact destroyed");
                return;
            }
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::debug!(artifact = %job.handle.id, attempt, "destroy failed, retrying: {}", e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
            Err(e) => {
                tracing::warn!(
                    backend = %job.handle.backend,
                    artifact = %job.handle.id,
                    "CleanupFailure: giving up after {} attempts: {}",
                    attempt + 1,
                    e
                );
                return;
            }
        }
    }
}
