//! Runtime configuration, loaded the way the teacher's own `Config`
//! loads (`examples/benjaminabbitt-angzarr/src/config/mod.rs`):
//! defaults, then an optional YAML file, then environment variables,
//! each layer overriding the last.

use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Environment variable prefix for overriding `RuntimeConfig` fields,
/// e.g. `SAGA_RUNTIME_ORCHESTRATOR_MAX_RETRIES=5`.
pub const CONFIG_ENV_PREFIX: &str = "SAGA_RUNTIME";
/// Environment variable naming an explicit config file path.
pub const CONFIG_ENV_VAR: &str = "SAGA_RUNTIME_CONFIG";
/// Default config file name looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "saga-runtime.yaml";

/// Orchestrator-tunable settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum concurrency-conflict retries (spec §4.D Step 6, default 3).
    pub max_retries: u32,
    /// Base retry delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Maximum retry delay in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Retry jitter factor in `[0.0, 1.0]`.
    pub retry_jitter: f64,
    /// How often stale per-key lock entries are swept from the lock
    /// table (§5: "entries ... may be reference-counted or swept lazily").
    pub lock_sweep_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 500,
            retry_jitter: 0.25,
            lock_sweep_interval_ms: 60_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_retries: self.max_retries,
            jitter: self.retry_jitter,
        }
    }
}

/// Timeout Scheduler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// On startup, the process-local scheduler sweeps the store for
    /// active sagas with `timeoutAt <= now + horizon` (§4.E).
    pub sweep_horizon_ms: u64,
    /// Poll interval for the process-local consumer task.
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_horizon_ms: 3_600_000,
            poll_interval_ms: 100,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
}

impl RuntimeConfig {
    /// Load configuration from an optional file path, `SAGA_RUNTIME_CONFIG`,
    /// and `SAGA_RUNTIME_*` environment variables, in that order of
    /// increasing precedence — mirroring the teacher's `Config::load`.
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("_")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
