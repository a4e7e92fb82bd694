//! Backend health tracking.
//!
//! A backend reported unavailable is put into a cooldown. During the cooldown
//! requests for it fail fast; once it has elapsed the next request must pass a
//! health probe before it is admitted.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::backend::{BackendKind, IsolationBackend};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Unhealthy {
    until: Instant,
    reason: String,
}

/// Per-backend cooldown state.
#[derive(Debug)]
pub struct HealthTracker {
    cooldown: Duration,
    unhealthy: Mutex<FxHashMap<BackendKind, Unhealthy>>,
}

impl HealthTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            unhealthy: Mutex::new(FxHashMap::default()),
        }
    }

    /// Gate a request on the health of `backend`.
    pub async fn ensure_healthy(&self, backend: &dyn IsolationBackend) -> Result<()> {
        let kind = backend.kind();
        let state = self.state(kind);

        let Some(state) = state else {
            return Ok(());
        };

        if Instant::now() < state.until {
            return Err(Error::BackendUnavailable {
                backend: kind,
                message: format!("in cooldown after failure: {}", state.reason),
            });
        }

        match backend.health_check().await {
            Ok(()) => {
                self.mark_healthy(kind);
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    err @ Error::BackendUnavailable { .. } => err,
                    other => Error::BackendUnavailable {
                        backend: kind,
                        message: other.to_string(),
                    },
                };
                self.mark_unhealthy(kind, &err.to_string());
                Err(err)
            }
        }
    }

    /// Start (or restart) the cooldown for `kind`.
    pub fn mark_unhealthy(&self, kind: BackendKind, reason: &str) {
        tracing::warn!(backend = %kind, cooldown_secs = self.cooldown.as_secs(), "backend unavailable: {}", reason);
        self.lock().insert(
            kind,
            Unhealthy {
                until: Instant::now() + self.cooldown,
                reason: reason.to_string(),
            },
        );
    }

    pub fn mark_healthy(&self, kind: BackendKind) {
        if self.lock().remove(&kind).is_some() {
            tracing::info!(backend = %kind, "backend healthy again");
        }
    }

    /// Whether `kind` is currently believed healthy (not in cooldown).
    pub fn is_healthy(&self, kind: BackendKind) -> bool {
        self.state(kind).is_none_or(|s| Instant::now() >= s.until)
    }

    fn state(&self, kind: BackendKind) -> Option<Unhealthy> {
        self.lock().get(&kind).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<BackendKind, Unhealthy>> {
        self.unhealthy.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
