//! Job demand: splitting a job's GPU count into fixed-size work units

use am_core::{NodeGroup, Priority, Resource, WorkUnit};

use crate::config::AmConfig;

/// GPU demand of a job and the container granularity it is split at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDemand {
    pub total_gpus: u32,
    pub gpus_per_container: u32,
}

impl JobDemand {
    /// Container size is capped by both the platform maximum and the job itself
    pub fn new(total_gpus: u32, requested_per_container: u32, platform_max: u32) -> Self {
        let gpus_per_container = requested_per_container.min(platform_max).min(total_gpus).max(1);
        Self {
            total_gpus,
            gpus_per_container,
        }
    }

    /// Demand for `config`, optionally sized by the locality hint
    pub fn from_config(config: &AmConfig, hint: Option<&NodeGroup>) -> Self {
        let requested = match hint {
            Some(group) if config.use_locality_container_size && group.gpus_per_container > 0 => {
                group.gpus_per_container
            }
            _ => config.max_gpus_per_container,
        };
        Self::new(config.job_gpus, requested, config.max_gpus_per_container)
    }

    /// `ceil(total / per_container)`
    pub fn container_count(&self) -> usize {
        self.total_gpus.div_ceil(self.gpus_per_container) as usize
    }

    /// Build the work units of one allocation cycle, all targeting `locality`
    pub fn partition(&self, gpu_memory_mb: u64, locality: &str, duration_ms: u64) -> Vec<WorkUnit> {
        let gpus = self.gpus_per_container;
        (0..self.container_count())
            .map(|index| WorkUnit {
                index,
                resource: Resource::new(gpus as u64 * gpu_memory_mb, gpus, gpus),
                priority: Priority::GPU_WORKER,
                locality: locality.to_string(),
                duration_ms,
            })
            .collect()
    }
}
