//! Content-addressed build cache.
//!
//! Maps a `Fingerprint` to a built artifact so identical submissions reuse one
//! build. The cache coalesces concurrent builds: exactly one caller per
//! fingerprint triggers a build, every other caller waits for that build and
//! shares its success or failure.
//!
//! # Lifecycle
//!
//! ```text
//! Vacant ──get_or_build──► Building ──ok──► Ready ──ttl / lru / invalidate──► dropped
//!                             │                                                  │
//!                             └──err──► Failed (negative ttl)          reaper: destroy
//! ```
//!
//! Builds run in a detached task, so a caller that goes away while waiting
//! never aborts a build other callers depend on. Dropped artifacts are
//! destroyed by the reaper once the last running lease is released.
//!
//! # Locking
//!
//! A global map lock guards slot lookup, insertion and eviction scans. Each
//! slot has its own lock guarding its state. Locks are always taken in
//! map → slot order and never held across an await.

mod artifact;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::{BackendKind, BuildSpec, IsolationBackend};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::types::{millis, ErrorKind};

pub use artifact::{ArtifactLease, BuildArtifact};
use artifact::{run_reaper, ReapJob};

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of ready artifacts before LRU eviction.
    pub capacity: usize,
    /// Lifetime of a ready artifact.
    pub ttl: Duration,
    /// How long a failed build is remembered.
    pub negative_ttl: Duration,
    /// Extra destroy attempts made by the reaper.
    pub destroy_retries: u32,
}

impl CacheConfig {
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            capacity: config.cache_capacity.max(1),
            ttl: config.artifact_ttl(),
            negative_ttl: config.negative_ttl(),
            destroy_retries: config.destroy_retries,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from_engine_config(&EngineConfig::default())
    }
}

/// Build failure shared between coalesced waiters.
#[derive(Debug, Clone)]
struct SharedFailure {
    kind: ErrorKind,
    message: String,
}

impl SharedFailure {
    fn from_error(err: &Error) -> Self {
        let message = match err {
            Error::Build(m) | Error::RuntimeCrash(m) => m.clone(),
            Error::BackendUnavailable { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            kind: err.kind(),
            message,
        }
    }

    fn to_error(&self, backend: BackendKind) -> Error {
        match self.kind {
            ErrorKind::BackendUnavailable => Error::BackendUnavailable {
                backend,
                message: self.message.clone(),
            },
            ErrorKind::Cancelled => Error::Cancelled,
            ErrorKind::RuntimeCrash => Error::RuntimeCrash(self.message.clone()),
            _ => Error::Build(self.message.clone()),
        }
    }

    /// Unavailable backends are covered by the health cooldown instead.
    fn is_negative_cacheable(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::BackendUnavailable | ErrorKind::Cancelled
        )
    }
}

type BuildResult = std::result::Result<Arc<BuildArtifact>, SharedFailure>;

enum SlotState {
    Vacant,
    Building(watch::Receiver<Option<BuildResult>>),
    Ready {
        artifact: Arc<BuildArtifact>,
        last_used: Instant,
    },
    Failed {
        failure: SharedFailure,
        until: Instant,
    },
}

struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Vacant),
        }
    }
}

struct CacheInner {
    config: CacheConfig,
    slots: Mutex<FxHashMap<Fingerprint, Arc<Slot>>>,
    reaper_tx: Mutex<Option<mpsc::UnboundedSender<ReapJob>>>,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
}

/// What a lookup decided while holding the slot lock.
enum Lookup {
    Hit(Arc<BuildArtifact>),
    Wait(watch::Receiver<Option<BuildResult>>),
    Failed(SharedFailure),
}

/// Coalescing, TTL + LRU bounded artifact cache.
///
/// Cheap to clone; clones share the same entries. Must be created inside a
/// tokio runtime (it spawns the reaper).
#[derive(Clone)]
pub struct BuildCache {
    inner: Arc<CacheInner>,
}

impl BuildCache {
    pub fn new(config: CacheConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let reaper = tokio::spawn(run_reaper(rx, config.destroy_retries));

        Self {
            inner: Arc::new(CacheInner {
                config,
                slots: Mutex::new(FxHashMap::default()),
                reaper_tx: Mutex::new(Some(tx)),
                reaper_task: Mutex::new(Some(reaper)),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Return a lease on the artifact for `spec.fingerprint`, building it with
    /// `backend` when needed.
    ///
    /// The boolean is `true` only when the artifact was already built before
    /// this call looked it up. Callers that joined an in-flight build get
    /// `false`.
    pub async fn get_or_build(
        &self,
        backend: Arc<dyn IsolationBackend>,
        spec: BuildSpec,
    ) -> Result<(ArtifactLease, bool)> {
        let kind = backend.kind();
        let fingerprint = spec.fingerprint.clone();

        let lookup = {
            // The slot state is locked before the map lock is released, so a
            // slot is never removed between lookup and the decision below.
            let mut slots = lock(&self.inner.slots);
            let slot = Arc::clone(
                slots
                    .entry(fingerprint.clone())
                    .or_insert_with(|| Arc::new(Slot::new())),
            );
            let mut state = lock(&slot.state);
            drop(slots);
            let now = Instant::now();

            match &mut *state {
                SlotState::Ready {
                    artifact,
                    last_used,
                } if !artifact.is_expired(now) => {
                    *last_used = now;
                    Lookup::Hit(Arc::clone(artifact))
                }
                SlotState::Failed { failure, until } if now < *until => {
                    Lookup::Failed(failure.clone())
                }
                SlotState::Building(rx) if !build_abandoned(rx) => Lookup::Wait(rx.clone()),
                _ => {
                    let rx = self.start_build(Arc::clone(&slot), backend, spec)?;
                    *state = SlotState::Building(rx.clone());
                    Lookup::Wait(rx)
                }
            }
        };

        match lookup {
            Lookup::Hit(artifact) => {
                tracing::debug!(fingerprint = %fingerprint.short(), backend = %kind, "cache hit");
                Ok((ArtifactLease(artifact), true))
            }
            Lookup::Failed(failure) => {
                tracing::debug!(fingerprint = %fingerprint.short(), backend = %kind, "cached build failure");
                Err(failure.to_error(kind))
            }
            Lookup::Wait(mut rx) => {
                let result = match rx.wait_for(Option::is_some).await {
                    Ok(value) => value.clone(),
                    Err(_) => None,
                };
                match result {
                    Some(Ok(artifact)) => Ok((ArtifactLease(artifact), false)),
                    Some(Err(failure)) => Err(failure.to_error(kind)),
                    None => Err(Error::Build("build task ended unexpectedly".to_string())),
                }
            }
        }
    }

    /// Spawn the detached build task for a slot.
    fn start_build(
        &self,
        slot: Arc<Slot>,
        backend: Arc<dyn IsolationBackend>,
        spec: BuildSpec,
    ) -> Result<watch::Receiver<Option<BuildResult>>> {
        let reaper = lock(&self.inner.reaper_tx)
            .clone()
            .ok_or(Error::Cancelled)?;
        let (tx, rx) = watch::channel(None);
        let cache = self.clone();

        tracing::debug!(fingerprint = %spec.fingerprint.short(), backend = %backend.kind(), "building artifact");

        tokio::spawn(async move {
            let started = Instant::now();
            let result = match backend.build(&spec).await {
                Ok(handle) => Ok(Arc::new(BuildArtifact::new(
                    spec.fingerprint.clone(),
                    handle,
                    cache.inner.config.ttl,
                    Arc::clone(&backend),
                    reaper,
                ))),
                Err(e) => {
                    tracing::info!(
                        fingerprint = %spec.fingerprint.short(),
                        backend = %backend.kind(),
                        "build failed: {}",
                        e
                    );
                    Err(SharedFailure::from_error(&e))
                }
            };

            let ready = {
                let mut state = lock(&slot.state);
                let now = Instant::now();
                *state = match &result {
                    Ok(artifact) => SlotState::Ready {
                        artifact: Arc::clone(artifact),
                        last_used: now,
                    },
                    Err(failure) if failure.is_negative_cacheable() => SlotState::Failed {
                        failure: failure.clone(),
                        until: now + cache.inner.config.negative_ttl,
                    },
                    Err(_) => SlotState::Vacant,
                };
                result.is_ok()
            };

            if ready {
                tracing::info!(
                    fingerprint = %spec.fingerprint.short(),
                    backend = %backend.kind(),
                    build_ms = millis(started.elapsed()),
                    "artifact built"
                );
            }

            let _ = tx.send(Some(result));

            if ready {
                cache.enforce_capacity();
            }
        });

        Ok(rx)
    }

    /// Evict least recently used ready artifacts beyond capacity.
    fn enforce_capacity(&self) {
        let mut slots = lock(&self.inner.slots);

        let mut ready: Vec<(Fingerprint, Instant)> = slots
            .iter()
            .filter_map(|(fp, slot)| match &*lock(&slot.state) {
                SlotState::Ready { last_used, .. } => Some((fp.clone(), *last_used)),
                _ => None,
            })
            .collect();

        let capacity = self.inner.config.capacity;
        if ready.len() <= capacity {
            return;
        }

        ready.sort_by_key(|(_, last_used)| *last_used);
        let excess = ready.len() - capacity;
        for (fp, _) in ready.into_iter().take(excess) {
            tracing::debug!(fingerprint = %fp.short(), "evicting least recently used artifact");
            slots.remove(&fp);
        }
    }

    /// Drop the ready or failed entry for `fingerprint`. Returns whether an
    /// entry was removed.
    ///
    /// A build in flight is left alone, so its waiters and later callers
    /// still share that one build.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.remove_if(fingerprint, |state| {
            matches!(state, SlotState::Ready { .. } | SlotState::Failed { .. })
        })
    }

    /// Drop the entry only if it still holds the leased artifact.
    ///
    /// Used when a run of that artifact crashed: a newer generation built
    /// since the lease was taken is kept.
    pub fn invalidate_lease(&self, lease: &ArtifactLease) -> bool {
        self.remove_if(lease.fingerprint(), |state| match state {
            SlotState::Ready { artifact, .. } => Arc::ptr_eq(artifact, &lease.0),
            _ => false,
        })
    }

    fn remove_if(&self, fingerprint: &Fingerprint, pred: impl Fn(&SlotState) -> bool) -> bool {
        let mut slots = lock(&self.inner.slots);
        let removable = slots
            .get(fingerprint)
            .is_some_and(|slot| pred(&lock(&slot.state)));
        if removable {
            slots.remove(fingerprint);
            tracing::info!(fingerprint = %fingerprint.short(), "cache entry invalidated");
        }
        removable
    }

    /// Remove expired artifacts and expired negative entries.
    ///
    /// Returns the number of artifacts released for destruction.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;

        lock(&self.inner.slots).retain(|_, slot| match &*lock(&slot.state) {
            SlotState::Ready { artifact, .. } if artifact.is_expired(now) => {
                evicted += 1;
                false
            }
            SlotState::Failed { until, .. } => now < *until,
            SlotState::Vacant => false,
            _ => true,
        });

        if evicted > 0 {
            tracing::debug!(evicted, "expired artifacts evicted");
        }
        evicted
    }

    /// Spawn a task calling `evict_expired` every `interval`.
    ///
    /// The task stops on its own once the cache has been shut down.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if cache.is_shut_down() {
                    break;
                }
                cache.evict_expired();
            }
        })
    }

    /// Number of ready artifacts.
    pub fn len(&self) -> usize {
        lock(&self.inner.slots)
            .values()
            .filter(|slot| matches!(&*lock(&slot.state), SlotState::Ready { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a ready, unexpired artifact exists for `fingerprint`.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let now = Instant::now();
        lock(&self.inner.slots)
            .get(fingerprint)
            .is_some_and(|slot| match &*lock(&slot.state) {
                SlotState::Ready { artifact, .. } => !artifact.is_expired(now),
                _ => false,
            })
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.inner.reaper_tx).is_none()
    }

    /// Drop every entry and wait (up to `timeout`) for all artifacts to be
    /// destroyed.
    ///
    /// Artifacts still leased by running requests are destroyed when those
    /// requests finish. Returns `false` if the reaper did not finish in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let drained: Vec<Arc<Slot>> = lock(&self.inner.slots).drain().map(|(_, s)| s).collect();
        for slot in &drained {
            let mut state = lock(&slot.state);
            if !matches!(&*state, SlotState::Building(_)) {
                *state = SlotState::Vacant;
            }
        }
        drop(drained);
        lock(&self.inner.reaper_tx).take();

        let task = lock(&self.inner.reaper_task).take();
        match task {
            Some(task) => match tokio::time::timeout(timeout, task).await {
                Ok(_) => {
                    tracing::debug!("build cache shut down");
                    true
                }
                Err(_) => {
                    tracing::warn!("artifacts still alive after {:?}", timeout);
                    false
                }
            },
            None => true,
        }
    }
}

impl std::fmt::Debug for BuildCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCache")
            .field("config", &self.inner.config)
            .field("ready", &self.len())
            .finish()
    }
}

/// A build whose task went away without publishing a result.
fn build_abandoned(rx: &watch::Receiver<Option<BuildResult>>) -> bool {
    rx.borrow().is_none() && rx.has_changed().is_err()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::Language;
    use crate::testing::ScriptedBackend;

    fn spec(code: &str) -> BuildSpec {
        BuildSpec {
            fingerprint: Fingerprint::compute(Language::Python, code, BackendKind::Container),
            language: Language::Python,
            template: Language::Python.default_template(),
            code: code.to_string(),
        }
    }

    fn cache(capacity: usize) -> BuildCache {
        BuildCache::new(CacheConfig {
            capacity,
            ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_millis(200),
            destroy_retries: 0,
        })
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let backend = Arc::new(ScriptedBackend::new(BackendKind::Container));
        let cache = cache(4);

        let (lease, hit) = cache.get_or_build(backend.clone(), spec("print('a')")).await.unwrap();
        assert!(!hit);
        drop(lease);

        let (_lease, hit) = cache.get_or_build(backend.clone(), spec("print('a')")).await.unwrap();
        assert!(hit);
        assert_eq!(backend.build_calls(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_build() {
        let backend = Arc::new(
            ScriptedBackend::new(BackendKind::Container).with_build_delay(Duration::from_millis(100)),
        );
        let cache = cache(4);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let backend = backend.clone();
                tokio::spawn(async move { cache.get_or_build(backend, spec("print('x')")).await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            let (lease, hit) = task.await.unwrap().unwrap();
            assert!(!hit);
            ids.push(lease.handle().id.clone());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(backend.build_calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_negatively_cached() {
        let backend = Arc::new(ScriptedBackend::new(BackendKind::Container).failing_builds());
        let cache = cache(4);

        let err = cache.get_or_build(backend.clone(), spec("print(")).await.unwrap_err();
        assert!(matches!(err, Error::Build(_)));
        let err = cache.get_or_build(backend.clone(), spec("print(")).await.unwrap_err();
        assert!(matches!(err, Error::Build(_)));
        assert_eq!(backend.build_calls(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let _ = cache.get_or_build(backend.clone(), spec("print(")).await;
        assert_eq!(backend.build_calls(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_negatively_cached() {
        let backend = Arc::new(ScriptedBackend::new(BackendKind::Sandboxed));
        backend.set_unavailable(true);
        let cache = cache(4);

        let err = cache.get_or_build(backend.clone(), spec("print(1)")).await.unwrap_err();
        assert!(err.is_backend_unavailable());

        backend.set_unavailable(false);
        let (_lease, hit) = cache.get_or_build(backend.clone(), spec("print(1)")).await.unwrap();
        assert!(!hit);
    }

    #[tokio::test]
    async fn test_lru_eviction_destroys_after_lease_release() {
        let backend = Arc::new(ScriptedBackend::new(BackendKind::Container));
        let cache = cache(1);

        let (first, _) = cache.get_or_build(backend.clone(), spec("print(1)")).await.unwrap();
        let (_second, _) = cache.get_or_build(backend.clone(), spec("print(2)")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.len(), 1);
        assert!(!cache.contains(first.fingerprint()));
        // Still leased, so not destroyed yet.
        assert_eq!(backend.live_handles(), 2);

        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.live_handles(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_rebuild() {
        let backend = Arc::new(ScriptedBackend::new(BackendKind::Container));
        let cache = cache(4);

        let (lease, _) = cache.get_or_build(backend.clone(), spec("print(1)")).await.unwrap();
        assert!(cache.invalidate(lease.fingerprint()));
        assert!(!cache.invalidate(lease.fingerprint()));
        drop(lease);

        let (_lease, hit) = cache.get_or_build(backend.clone(), spec("print(1)")).await.unwrap();
        assert!(!hit);
        assert_eq!(backend.build_calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_leaves_inflight_build() {
        let backend = Arc::new(
            ScriptedBackend::new(BackendKind::Container).with_build_delay(Duration::from_millis(300)),
        );
        let cache = cache(4);

        let first = tokio::spawn({
            let (cache, backend) = (cache.clone(), backend.clone());
            async move { cache.get_or_build(backend, spec("print(1)")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fingerprint = spec("print(1)").fingerprint;
        assert!(!cache.invalidate(&fingerprint));

        let (second, second_hit) = cache.get_or_build(backend.clone(), spec("print(1)")).await.unwrap();
        let (first, first_hit) = first.await.unwrap().unwrap();
        assert!(!first_hit && !second_hit);
        assert_eq!(first.handle().id, second.handle().id);
        assert_eq!(backend.build_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_lease_only_drops_its_generation() {
        let backend = Arc::new(ScriptedBackend::new(BackendKind::Container));
        let cache = cache(4);

        let (old, _) = cache.get_or_build(backend.clone(), spec("print(1)")).await.unwrap();
        assert!(cache.invalidate(old.fingerprint()));
        let (new, _) = cache.get_or_build(backend.clone(), spec("print(1)")).await.unwrap();
        assert_ne!(old.handle().id, new.handle().id);

        // A crash reported against the stale lease keeps the rebuilt entry.
        assert!(!cache.invalidate_lease(&old));
        assert!(cache.contains(new.fingerprint()));

        assert!(cache.invalidate_lease(&new));
        assert!(!cache.contains(new.fingerprint()));
        assert_eq!(backend.build_calls(), 2);
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let backend = Arc::new(ScriptedBackend::new(BackendKind::Container));
        let cache = BuildCache::new(CacheConfig {
            capacity: 4,
            ttl: Duration::from_millis(50),
            negative_ttl: Duration::from_millis(50),
            destroy_retries: 0,
        });

        let (lease, _) = cache.get_or_build(backend.clone(), spec("print(1)")).await.unwrap();
        drop(lease);
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let backend = Arc::new(ScriptedBackend::new(BackendKind::Container));
        let cache = cache(8);

        for i in 0..3 {
            let code = format!("print({i})");
            cache.get_or_build(backend.clone(), spec(&code)).await.unwrap();
        }
        assert_eq!(backend.live_handles(), 3);

        assert!(cache.shutdown(Duration::from_secs(2)).await);
        assert_eq!(backend.live_handles(), 0);
        assert!(cache.is_shut_down());

        let err = cache.get_or_build(backend.clone(), spec("print(9)")).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
