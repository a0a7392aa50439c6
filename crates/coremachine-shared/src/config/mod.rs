//! # Configuration (spec.md §6 configuration table)
//!
//! Loaded via the `config` crate's layered sources: a base file, an
//! optional environment-specific override file, then environment
//! variables (`COREMACHINE_*`) taking final precedence.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::CoreResult;
use crate::resilience::CircuitBreakerConfig;

/// Queue names and worker concurrency knobs (spec.md §6 configuration
/// table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub job_queue_name: String,
    pub task_queue_name: String,
    pub max_concurrent_jobs: usize,
    pub max_concurrent_tasks: usize,
    pub lease_duration_seconds: u64,
    pub lease_renewal_interval_seconds: u64,
    pub lease_max_total_seconds: u64,
    pub bus_max_delivery_count: u32,
    pub advisory_lock_namespace: u32,
    pub database_url: Option<String>,
    /// Opt-in fault isolation for store/bus calls (SPEC_FULL.md §4.3/4.4).
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
    pub success_threshold: u32,
}

impl From<CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(s: CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: s.failure_threshold,
            timeout: Duration::from_secs(s.recovery_timeout_seconds),
            success_threshold: s.success_threshold,
        }
    }
}

/// Periodic sweeper config (spec.md §7 "Reconciler"; Open Question 4:
/// implemented, disabled by default).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    /// Epsilon added to `lease_max_total_seconds` before a PROCESSING task
    /// with no corresponding in-flight message is considered stuck.
    pub grace_period_seconds: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_seconds: 60,
            grace_period_seconds: 30,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            job_queue_name: "coremachine-jobs".to_string(),
            task_queue_name: "coremachine-tasks".to_string(),
            max_concurrent_jobs: 2,
            max_concurrent_tasks: 8,
            lease_duration_seconds: 300,
            lease_renewal_interval_seconds: 120,
            lease_max_total_seconds: 1800,
            bus_max_delivery_count: 1,
            advisory_lock_namespace: 0x434F_5245,
            database_url: None,
            circuit_breaker: None,
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }

    pub fn lease_renewal_interval(&self) -> Duration {
        Duration::from_secs(self.lease_renewal_interval_seconds)
    }

    pub fn lease_max_total(&self) -> Duration {
        Duration::from_secs(self.lease_max_total_seconds)
    }

    /// Layered load: `config/base.toml`, then `config/environments/{env}.toml`
    /// if present, then `COREMACHINE_*` environment variable overrides.
    /// `env` defaults to the `COREMACHINE_ENV` variable, falling back to
    /// `"development"`.
    pub fn load(config_dir: &str) -> CoreResult<Self> {
        let env = std::env::var("COREMACHINE_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::from(
                std::path::Path::new(config_dir).join("base.toml"),
            ).required(false))
            .add_source(
                config::File::from(
                    std::path::Path::new(config_dir)
                        .join("environments")
                        .join(format!("{env}.toml")),
                )
                .required(false),
            )
            .add_source(config::Environment::with_prefix("COREMACHINE").separator("__"));

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }
}
