//! In-process test doubles.
//!
//! `ScriptedBackend` implements `IsolationBackend` without Docker. It
//! interprets a tiny subset of the submitted code so engine behavior can be
//! asserted end to end, and it keeps an audit of live artifacts and active
//! runs so resource leaks show up in tests.
//!
//! Run semantics:
//! - `print('x')` / `console.log('x')` write `x\n` to stdout (in order)
//! - `exit(N)` / `process.exit(N)` set the exit code
//! - code containing `while` never finishes: the run ends at its deadline
//!   with `Error::Timeout`, or with `Error::Cancelled`
//! - code containing `crash` fails with `Error::RuntimeCrash`

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::backend::{
    BackendKind, BuildSpec, CancelHandle, IsolationBackend, RunOutput, SandboxHandle,
};
use crate::error::{Error, Result};
use crate::types::millis;

/// Fake isolation backend with a resource audit.
#[derive(Debug)]
pub struct ScriptedBackend {
    kind: BackendKind,
    build_delay: Duration,
    run_delay: Duration,
    fail_builds: bool,
    ignore_deadline: bool,
    unavailable: AtomicBool,
    build_calls: AtomicUsize,
    run_calls: AtomicUsize,
    health_checks: AtomicUsize,
    destroyed: AtomicUsize,
    next_id: AtomicU64,
    live: Mutex<FxHashMap<String, String>>,
    active_runs: AtomicUsize,
    max_active_runs: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            build_delay: Duration::ZERO,
            run_delay: Duration::ZERO,
            fail_builds: false,
            ignore_deadline: false,
            unavailable: AtomicBool::new(false),
            build_calls: AtomicUsize::new(0),
            run_calls: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            live: Mutex::new(FxHashMap::default()),
            active_runs: AtomicUsize::new(0),
            max_active_runs: AtomicUsize::new(0),
        }
    }

    /// Every build takes at least `delay`.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    /// Every finite run takes at least `delay`.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Every build fails with `Error::Build`.
    pub fn failing_builds(mut self) -> Self {
        self.fail_builds = true;
        self
    }

    /// Looping runs ignore their deadline and only stop when cancelled.
    pub fn ignoring_deadlines(mut self) -> Self {
        self.ignore_deadline = true;
        self
    }

    /// Make every operation fail with `Error::BackendUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn build_calls(&self) -> usize {
        self.build_calls.load(Ordering::SeqCst)
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Artifacts built and not yet destroyed.
    pub fn live_handles(&self) -> usize {
        self.live().len()
    }

    /// Runs currently executing.
    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    /// Highest number of runs observed executing at once.
    pub fn max_active_runs(&self) -> usize {
        self.max_active_runs.load(Ordering::SeqCst)
    }

    fn live(&self) -> MutexGuard<'_, FxHashMap<String, String>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable {
                backend: self.kind,
                message: "scripted backend is down".to_string(),
            });
        }
        Ok(())
    }
}

/// Decrements the active run counter when a run ends, however it ends.
struct ActiveRun<'a>(&'a AtomicUsize);

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IsolationBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn build(&self, spec: &BuildSpec) -> Result<SandboxHandle> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if !self.build_delay.is_zero() {
            tokio::time::sleep(self.build_delay).await;
        }
        if self.fail_builds {
            return Err(Error::Build(format!(
                "scripted build failure for {}",
                spec.fingerprint.short()
            )));
        }

        let id = format!(
            "scripted-{}-{}",
            self.kind,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        self.live().insert(id.clone(), spec.code.clone());

        Ok(SandboxHandle {
            id,
            backend: self.kind,
            fingerprint: spec.fingerprint.clone(),
        })
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        deadline: Instant,
        cancel: &CancelHandle,
    ) -> Result<RunOutput> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let code = self
            .live()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::RuntimeCrash(format!("artifact {} was destroyed", handle.id)))?;

        let active = self.active_runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_runs.fetch_max(active, Ordering::SeqCst);
        let _active = ActiveRun(&self.active_runs);
        let started = Instant::now();

        if code.contains("crash") {
            return Err(Error::RuntimeCrash("scripted sandbox crash".to_string()));
        }

        if code.contains("while") {
            if self.ignore_deadline {
                cancel.cancelled().await;
                return Err(Error::Cancelled);
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout {
                        elapsed_ms: millis(started.elapsed()),
                    });
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        if !self.run_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.run_delay) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }

        Ok(RunOutput {
            stdout: scripted_stdout(&code),
            exit_code: Some(scripted_exit_code(&code)),
            ..RunOutput::default()
        })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        if self.live().remove(&handle.id).is_some() {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }
}

/// Collect the string literals passed to `print(...)` / `console.log(...)`.
fn scripted_stdout(code: &str) -> String {
    let mut out = String::new();
    let mut rest = code;

    loop {
        let next = ["print(", "console.log("]
            .iter()
            .filter_map(|call| rest.find(call).map(|i| (i, call.len())))
            .min_by_key(|(i, _)| *i);
        let Some((start, len)) = next else {
            break;
        };
        rest = &rest[start + len..];

        let Some(quote) = rest.chars().next().filter(|c| *c == '\'' || *c == '"') else {
            continue;
        };
        let body = &rest[1..];
        if let Some(end) = body.find(quote) {
            out.push_str(&body[..end]);
            out.push('\n');
            rest = &body[end + 1..];
        }
    }

    out
}

fn scripted_exit_code(code: &str) -> i32 {
    let Some(start) = code.find("exit(") else {
        return 0;
    };
    code[start + 5..]
        .split(')')
        .next()
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(1)
}
