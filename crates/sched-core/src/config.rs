//! Configuration for the scheduler
//!
//! Supports YAML files, environment variables, and defaults with the usual
//! precedence: environment over file over defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables recognized by the scheduling engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the scheduling cycle in milliseconds
    pub scheduling_interval_ms: u64,

    /// Queue capacity; enqueue fails beyond this
    pub max_queue_size: usize,

    /// When false the cycle never consults the preemptor
    pub enable_preemption: bool,

    /// When false jobs carrying the gang flag are rejected at submit
    pub enable_gang_scheduling: bool,

    /// When false GPU availability ignores throttle state and cooling windows
    pub enable_thermal_aware: bool,

    /// Temperature in Celsius above which a GPU counts as throttled
    pub thermal_threshold: f32,

    /// Priority boost added per aging pass to jobs past the threshold
    pub aging_boost: i32,

    /// Wait time in milliseconds before a queued job starts aging
    pub aging_threshold_ms: u64,

    /// Saturation point for the accumulated aging boost; None is unbounded
    pub max_aging_boost: Option<i32>,

    /// Priority assigned when a submission omits one
    pub default_priority: i32,

    /// Largest GPU ask a single job may declare
    pub max_gpus_per_job: u32,

    /// Coarse per-queue-position wait estimate in milliseconds
    pub wait_estimate_ms_per_job: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduling_interval_ms: 1000,
            max_queue_size: 10_000,
            enable_preemption: true,
            enable_gang_scheduling: true,
            enable_thermal_aware: true,
            thermal_threshold: 75.0,
            aging_boost: 10,
            aging_threshold_ms: 300_000,
            max_aging_boost: None,
            default_priority: 100,
            max_gpus_per_job: 8,
            wait_estimate_ms_per_job: 300_000,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables with a `GPU_SCHEDULER_` prefix (highest)
    /// 2. Configuration file (`GPU_SCHEDULER_CONFIG` or common locations)
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var("GPU_SCHEDULER_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            for path in &["./scheduler.yaml", "/etc/gpu-scheduler/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("GPU_SCHEDULER").try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.scheduling_interval_ms == 0 {
            return Err(Error::config("scheduling_interval_ms must be positive"));
        }
        if self.max_queue_size == 0 {
            return Err(Error::config("max_queue_size must be positive"));
        }
        if self.max_gpus_per_job == 0 {
            return Err(Error::config("max_gpus_per_job must be at least 1"));
        }
        if self.aging_boost < 0 {
            return Err(Error::config("aging_boost must not be negative"));
        }
        if !(0.0..=120.0).contains(&self.thermal_threshold) {
            return Err(Error::config(
                "thermal_threshold must be between 0 and 120 Celsius",
            ));
        }
        Ok(())
    }

    /// Cycle period as a [`Duration`]
    pub fn scheduling_interval(&self) -> Duration {
        Duration::from_millis(self.scheduling_interval_ms)
    }

    /// Aging threshold as a [`Duration`]
    pub fn aging_threshold(&self) -> Duration {
        Duration::from_millis(self.aging_threshold_ms)
    }

    /// Advisory wait estimate for a queue position
    pub fn wait_estimate(&self, position: usize) -> Duration {
        Duration::from_millis(position.saturating_sub(1) as u64 * self.wait_estimate_ms_per_job)
    }
}
