//! Configuration for a GPU application master
//!
//! All knobs have defaults matching the reference simulation runs: 4 GPUs per
//! container, 100 GiB of memory per GPU, back-off disabled, restart disabled.

use am_core::{AmError, Resource, Result};
use serde::{Deserialize, Serialize};

/// Platform maximum GPUs per worker container
pub const DEFAULT_MAX_GPUS_PER_CONTAINER: u32 = 4;

/// Memory granted per GPU (100 GiB)
pub const DEFAULT_GPU_MEMORY_MB: u64 = 100 * 1024;

/// AM container memory
pub const AM_CONTAINER_MEMORY_MB: u64 = 1024;

/// AM container vcores
pub const AM_CONTAINER_VCORES: u32 = 1;

/// Allocating / yielding timeout settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Arm the allocating timeout when a worker batch is scheduled
    pub enabled: bool,

    /// How long a cycle may wait for a full gang before releasing everything
    pub allocate_timeout_ms: u64,

    /// Cool-down after a release before demand is re-armed
    pub yield_timeout_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allocate_timeout_ms: 300_000,
            yield_timeout_ms: 60_000,
        }
    }
}

/// What to do when the AM container dies while work remains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// Restarts allowed before the job is reported as failed
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
        }
    }
}

/// Configuration for one AM instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmConfig {
    /// Total GPUs the job needs
    pub job_gpus: u32,

    /// Platform cap on GPUs per worker container
    pub max_gpus_per_container: u32,

    /// Interval at which the surrounding simulator calls `advance`
    pub heartbeat_interval_ms: u64,

    /// Memory requested per GPU
    pub gpu_memory_mb: u64,

    /// Shape of the AM's own container
    pub am_resource: Resource,

    /// How long each worker runs once the gang is launched
    pub job_duration_ms: u64,

    /// Take the container size from the locality hint (still capped)
    pub use_locality_container_size: bool,

    /// Re-request killed workers instead of leaving them parked
    pub resubmit_failed_workers: bool,

    pub backoff: BackoffConfig,

    pub restart: RestartPolicy,
}

impl Default for AmConfig {
    fn default() -> Self {
        Self {
            job_gpus: 4,
            max_gpus_per_container: DEFAULT_MAX_GPUS_PER_CONTAINER,
            heartbeat_interval_ms: 1000,
            gpu_memory_mb: DEFAULT_GPU_MEMORY_MB,
            am_resource: Resource::new(AM_CONTAINER_MEMORY_MB, AM_CONTAINER_VCORES, 0),
            job_duration_ms: 60_000,
            use_locality_container_size: true,
            resubmit_failed_workers: true,
            backoff: BackoffConfig::default(),
            restart: RestartPolicy::default(),
        }
    }
}

impl AmConfig {
    /// Config for a job of the given GPU demand, everything else default
    pub fn for_job(job_gpus: u32) -> Self {
        Self {
            job_gpus,
            ..Default::default()
        }
    }

    /// Set the platform cap on GPUs per container
    pub fn with_max_gpus_per_container(mut self, gpus: u32) -> Self {
        self.max_gpus_per_container = gpus;
        self
    }

    /// Set the worker run time
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.job_duration_ms = duration_ms;
        self
    }

    /// Enable back-off with the given timeouts
    pub fn with_backoff(mut self, allocate_timeout_ms: u64, yield_timeout_ms: u64) -> Self {
        self.backoff = BackoffConfig {
            enabled: true,
            allocate_timeout_ms,
            yield_timeout_ms,
        };
        self
    }

    /// Enable restart-on-AM-failure with a bounded number of attempts
    pub fn with_restart(mut self, max_attempts: u32) -> Self {
        self.restart = RestartPolicy {
            enabled: true,
            max_attempts,
        };
        self
    }

    /// Toggle resubmission of killed workers
    pub fn with_resubmit_failed(mut self, enabled: bool) -> Self {
        self.resubmit_failed_workers = enabled;
        self
    }

    /// Ignore the locality hint's container size and use the platform cap
    pub fn with_fixed_container_size(mut self) -> Self {
        self.use_locality_container_size = false;
        self
    }

    /// Reject configurations the AM cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.job_gpus == 0 {
            return Err(AmError::config("job_gpus must be greater than zero"));
        }
        if self.max_gpus_per_container == 0 {
            return Err(AmError::config(
                "max_gpus_per_container must be greater than zero",
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(AmError::config("heartbeat_interval_ms must be greater than zero"));
        }
        if self.restart.enabled && self.restart.max_attempts == 0 {
            return Err(AmError::config(
                "restart.max_attempts must be at least 1 when restart is enabled",
            ));
        }
        Ok(())
    }
}
