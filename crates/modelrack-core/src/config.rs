//! Orchestrator configuration.
//!
//! Defaults layered under `MODELRACK_*` environment overrides via the
//! `config` crate, e.g. `MODELRACK_HUB_OVERRIDE=modelscope` or
//! `MODELRACK_SAFETY_MARGIN=0.1`. Consumed once at orchestrator start.

use crate::error::{LaunchError, LaunchResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment-derived settings for the launch engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RackConfig {
    /// Select one registered hub for all model fetches instead of trying
    /// hubs in registration order. Per-spec overrides still win.
    pub hub_override: Option<String>,

    /// Directory holding fetched model artifacts.
    pub cache_dir: PathBuf,

    /// Override detected device capacity with a fixed number of resource
    /// units per device. If None, capacity derives from detected device
    /// memory (1 unit = 1 MiB).
    pub capacity_units: Option<u64>,

    /// Fraction of device capacity held back from allocation. Requests
    /// landing in the margin band are rejected proactively instead of
    /// discovered via a worker crash.
    pub safety_margin: f64,

    /// Upper bound on waiting for a worker to reach ready, in milliseconds.
    pub launch_timeout_ms: u64,

    /// Total launch attempts for transient starting-phase failures
    /// (1 = no retry).
    pub retry_attempts: usize,

    /// Base delay for exponential backoff between retries, in milliseconds.
    pub retry_base_ms: u64,

    /// Shared-memory size granted to each worker, in bytes.
    pub shm_size_bytes: u64,

    /// Largest shared-memory size this deployment may raise to. A worker
    /// crash from shared-memory exhaustion is only classified transient
    /// while `shm_size_bytes` is below this value.
    pub shm_max_bytes: u64,

    /// External bind address for the serving endpoint. Validated here,
    /// consumed by the network listener outside this crate.
    pub bind_address: String,
}

impl Default for RackConfig {
    fn default() -> Self {
        Self {
            hub_override: None,
            cache_dir: PathBuf::from("/var/cache/modelrack"),
            capacity_units: None,
            safety_margin: 0.05,
            launch_timeout_ms: 120_000,
            retry_attempts: 3,
            retry_base_ms: 500,
            shm_size_bytes: 64 * 1024 * 1024,
            shm_max_bytes: 2 * 1024 * 1024 * 1024,
            bind_address: "0.0.0.0:9997".to_string(),
        }
    }
}

impl RackConfig {
    /// Load defaults with `MODELRACK_*` environment overrides applied.
    pub fn from_env() -> LaunchResult<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Config::try_from(&RackConfig::default()).map_err(to_config_err)?)
            .add_source(config::Environment::with_prefix("MODELRACK"))
            .build()
            .map_err(to_config_err)?;

        let loaded: RackConfig = cfg.try_deserialize().map_err(to_config_err)?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject inconsistent settings before any launch runs with them.
    pub fn validate(&self) -> LaunchResult<()> {
        if !(0.0..1.0).contains(&self.safety_margin) {
            return Err(LaunchError::Config(format!(
                "safety_margin must be in [0.0, 1.0), got {}",
                self.safety_margin
            )));
        }
        if self.launch_timeout_ms == 0 {
            return Err(LaunchError::Config(
                "launch_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(LaunchError::Config(
                "retry_attempts must be >= 1".to_string(),
            ));
        }
        if self.shm_size_bytes > self.shm_max_bytes {
            return Err(LaunchError::Config(format!(
                "shm_size_bytes ({}) exceeds shm_max_bytes ({})",
                self.shm_size_bytes, self.shm_max_bytes
            )));
        }
        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(LaunchError::Config(format!(
                "bind_address '{}' is not a valid socket address",
                self.bind_address
            )));
        }
        Ok(())
    }
}

fn to_config_err(e: config::ConfigError) -> LaunchError {
    LaunchError::Config(e.to_string())
}

// ============================================================================
// Tests
// ============================================================================
