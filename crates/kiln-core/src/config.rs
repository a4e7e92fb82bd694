//! Engine and server configuration.
//!
//! Configuration is read from an optional JSON file and then overridden by
//! `KILN_*` environment variables. Every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ENV_CONFIG_FILE: &str = "KILN_CONFIG";
pub const ENV_STATE_DIR: &str = "KILN_STATE_DIR";
pub const ENV_DOCKER_BIN: &str = "KILN_DOCKER_BIN";
pub const ENV_SANDBOX_RUNTIME: &str = "KILN_SANDBOX_RUNTIME";
pub const ENV_POOL_SIZE: &str = "KILN_POOL_SIZE";
pub const ENV_MAX_QUEUE_DEPTH: &str = "KILN_MAX_QUEUE_DEPTH";
pub const ENV_MAX_TIMEOUT_SECS: &str = "KILN_MAX_TIMEOUT_SECS";
pub const ENV_CACHE_CAPACITY: &str = "KILN_CACHE_CAPACITY";
pub const ENV_ARTIFACT_TTL_SECS: &str = "KILN_ARTIFACT_TTL_SECS";

/// Upper bound on the grace period between a deadline and forced termination.
pub const MAX_GRACE_MS: u64 = 2_000;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest timeout a submission may ask for.
    pub max_timeout_secs: u64,
    /// Extra time tolerated between a deadline and forced termination.
    pub grace_ms: u64,
    /// Number of requests allowed to build/run concurrently.
    pub pool_size: usize,
    /// Requests allowed to wait for a pool slot before new ones are rejected.
    pub max_queue_depth: usize,
    /// How long a queued request waits for a pool slot.
    pub queue_wait_ms: u64,
    /// Maximum number of cached artifacts before LRU eviction.
    pub cache_capacity: usize,
    pub artifact_ttl_secs: u64,
    /// How long a failed build is remembered before a retry is allowed.
    pub negative_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long a backend stays marked unhealthy after it was unreachable.
    pub backend_cooldown_secs: u64,
    pub destroy_retries: u32,
    /// Cap on captured stdout and stderr, each.
    pub max_output_bytes: usize,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    pub docker_bin: String,
    /// Docker runtime name used by the sandboxed backend.
    pub sandbox_runtime: String,
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let pool_size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            max_timeout_secs: 900,
            grace_ms: 1_000,
            pool_size,
            max_queue_depth: 64,
            queue_wait_ms: 30_000,
            cache_capacity: 64,
            artifact_ttl_secs: 900,
            negative_ttl_secs: 10,
            sweep_interval_secs: 30,
            backend_cooldown_secs: 30,
            destroy_retries: 3,
            max_output_bytes: 1024 * 1024,
            memory_mb: 256,
            cpus: 1.0,
            pids_limit: 128,
            docker_bin: "docker".to_string(),
            sandbox_runtime: "runsc".to_string(),
            state_dir: default_state_dir(),
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then the JSON file (explicit path or
    /// `KILN_CONFIG`), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(ENV_CONFIG_FILE).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.normalize();
        Ok(config)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = std::env::var_os(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(dir);
        }
        if let Ok(bin) = std::env::var(ENV_DOCKER_BIN) {
            self.docker_bin = bin;
        }
        if let Ok(runtime) = std::env::var(ENV_SANDBOX_RUNTIME) {
            self.sandbox_runtime = runtime;
        }
        if let Some(v) = env_number(ENV_POOL_SIZE)? {
            self.pool_size = v as usize;
        }
        if let Some(v) = env_number(ENV_MAX_QUEUE_DEPTH)? {
            self.max_queue_depth = v as usize;
        }
        if let Some(v) = env_number(ENV_MAX_TIMEOUT_SECS)? {
            self.max_timeout_secs = v;
        }
        if let Some(v) = env_number(ENV_CACHE_CAPACITY)? {
            self.cache_capacity = v as usize;
        }
        if let Some(v) = env_number(ENV_ARTIFACT_TTL_SECS)? {
            self.artifact_ttl_secs = v;
        }
        Ok(())
    }

    /// Clamp values that would break engine invariants.
    pub fn normalize(&mut self) {
        self.grace_ms = self.grace_ms.min(MAX_GRACE_MS);
        self.pool_size = self.pool_size.max(1);
        self.cache_capacity = self.cache_capacity.max(1);
        self.max_timeout_secs = self.max_timeout_secs.max(1);
        self.sweep_interval_secs = self.sweep_interval_secs.max(1);
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn backend_cooldown(&self) -> Duration {
        Duration::from_secs(self.backend_cooldown_secs)
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid {name}={raw:?} (expected an integer)"))),
        Err(_) => Ok(None),
    }
}

/// Default state directory: `<data dir>/kiln`, falling back to the temp dir.
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kiln")
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}
