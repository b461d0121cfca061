//! Tick-driven simulation runner
//!
//! Admits jobs at their submit time, drives every live AM on its heartbeat, then
//! lets the cluster run one scheduling round. Stops once every job has left or the
//! tick budget is spent.

use std::collections::VecDeque;

use am_core::{AmSimulator, ApplicationId, JobTimeline, Result, WorkloadKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterConfig, ClusterStats, InMemoryCluster};
use crate::config::AmConfig;
use crate::driver::build_am_simulator;

fn default_kind() -> WorkloadKind {
    WorkloadKind::Gpu
}

/// A job waiting to be submitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: WorkloadKind,
    pub submit_ms: u64,
    pub config: AmConfig,
}

impl JobSpec {
    pub fn gpu(name: impl Into<String>, submit_ms: u64, config: AmConfig) -> Self {
        Self {
            name: name.into(),
            kind: WorkloadKind::Gpu,
            submit_ms,
            config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Finished,
    /// AM stopped on a fatal error
    Failed,
    /// No AM implementation for the workload, or invalid config
    Rejected,
    /// Still running when the tick budget ran out
    Incomplete,
}

/// Outcome of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub app_id: ApplicationId,
    pub name: String,
    pub kind: WorkloadKind,
    pub gpus: u32,
    pub status: JobStatus,
    pub submit_ms: u64,
    pub progress: f32,
    /// Submit to gang launch
    pub queue_delay_ms: Option<u64>,
    /// Submit to finish
    pub turnaround_ms: Option<u64>,
    pub timeline: JobTimeline,
    pub error: Option<String>,
}

/// Result of a simulation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub ticks: u64,
    pub end_ms: u64,
    pub jobs: Vec<JobReport>,
    pub cluster: ClusterStats,
}

impl SimulationReport {
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

struct ActiveJob {
    app_id: ApplicationId,
    spec: JobSpec,
    am: Box<dyn AmSimulator>,
    next_heartbeat_ms: u64,
    error: Option<String>,
}

impl ActiveJob {
    fn report(&self, status: JobStatus) -> JobReport {
        let timeline = self.am.timeline();
        let since_submit = |t: Option<u64>| t.map(|t| t.saturating_sub(self.spec.submit_ms));
        JobReport {
            app_id: self.app_id,
            name: self.spec.name.clone(),
            kind: self.spec.kind,
            gpus: self.spec.config.job_gpus,
            status,
            submit_ms: self.spec.submit_ms,
            progress: self.am.progress(),
            queue_delay_ms: since_submit(timeline.workers_started_ms),
            turnaround_ms: since_submit(timeline.finished_ms),
            timeline,
            error: self.error.clone(),
        }
    }
}

/// Drives AMs against an in-memory cluster
pub struct SimulationRunner {
    cluster: InMemoryCluster,
    tick_ms: u64,
    max_ticks: u64,
}

impl SimulationRunner {
    pub fn new(cluster: ClusterConfig) -> Result<Self> {
        Ok(Self {
            cluster: InMemoryCluster::new(cluster)?,
            tick_ms: 1000,
            max_ticks: 100_000,
        })
    }

    pub fn with_tick_ms(mut self, tick_ms: u64) -> Self {
        self.tick_ms = tick_ms.max(1);
        self
    }

    pub fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = max_ticks;
        self
    }

    pub fn cluster(&self) -> &InMemoryCluster {
        &self.cluster
    }

    /// Run `jobs` to completion or until the tick budget is spent
    pub fn run(&mut self, mut jobs: Vec<JobSpec>) -> SimulationReport {
        jobs.sort_by_key(|j| j.submit_ms);
        let mut queue: VecDeque<JobSpec> = jobs.into();
        let mut active: Vec<ActiveJob> = Vec::new();
        let mut reports: Vec<JobReport> = Vec::new();
        let mut next_app_id = 1;
        let mut ticks = 0;
        let mut now_ms = 0;

        info!(jobs = queue.len(), tick_ms = self.tick_ms, "Starting simulation");

        while ticks <= self.max_ticks {
            now_ms = ticks * self.tick_ms;
            ticks += 1;

            while queue.front().is_some_and(|j| j.submit_ms <= now_ms) {
                let Some(spec) = queue.pop_front() else { break };
                let app_id = ApplicationId(next_app_id);
                next_app_id += 1;
                self.admit(app_id, spec, now_ms, &mut active, &mut reports);
            }

            for job in active.iter_mut() {
                if now_ms < job.next_heartbeat_ms {
                    continue;
                }
                job.next_heartbeat_ms = now_ms + job.spec.config.heartbeat_interval_ms;
                match job.am.advance(now_ms) {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        debug!(app_id = %job.app_id, error = %e, "Retrying on next heartbeat");
                    }
                    Err(e) => {
                        error!(app_id = %job.app_id, error = %e, "AM stopped");
                        job.error = Some(e.to_string());
                    }
                }
            }

            let (done, running): (Vec<ActiveJob>, Vec<ActiveJob>) = active
                .into_iter()
                .partition(|j| j.am.is_done() || j.error.is_some());
            active = running;
            for job in done {
                let status = if job.am.timeline().finished_ms.is_some() {
                    JobStatus::Finished
                } else {
                    JobStatus::Failed
                };
                reports.push(self.retire(job, status));
            }

            self.cluster.tick(now_ms);

            if queue.is_empty() && active.is_empty() {
                break;
            }
        }

        for job in active {
            warn!(app_id = %job.app_id, progress = job.am.progress(), "Job still running at end of simulation");
            reports.push(self.retire(job, JobStatus::Incomplete));
        }
        for spec in queue {
            warn!(job = %spec.name, submit_ms = spec.submit_ms, "Job never submitted");
        }

        reports.sort_by_key(|r| r.app_id);
        let report = SimulationReport {
            ticks,
            end_ms: now_ms,
            jobs: reports,
            cluster: self.cluster.stats().clone(),
        };
        info!(
            finished = report.count(JobStatus::Finished),
            failed = report.count(JobStatus::Failed),
            incomplete = report.count(JobStatus::Incomplete),
            end_ms = report.end_ms,
            "Simulation complete"
        );
        report
    }

    fn admit(
        &mut self,
        app_id: ApplicationId,
        spec: JobSpec,
        now_ms: u64,
        active: &mut Vec<ActiveJob>,
        reports: &mut Vec<JobReport>,
    ) {
        let collaborators = self.cluster.register(app_id);
        match build_am_simulator(spec.kind, app_id, spec.config.clone(), collaborators) {
            Ok(am) => {
                info!(app_id = %app_id, job = %spec.name, gpus = spec.config.job_gpus, "Submitted job");
                active.push(ActiveJob {
                    app_id,
                    spec,
                    am,
                    next_heartbeat_ms: now_ms,
                    error: None,
                });
            }
            Err(e) => {
                warn!(app_id = %app_id, job = %spec.name, error = %e, "Rejected job");
                self.cluster.deregister(&app_id);
                reports.push(JobReport {
                    app_id,
                    name: spec.name,
                    kind: spec.kind,
                    gpus: spec.config.job_gpus,
                    status: JobStatus::Rejected,
                    submit_ms: spec.submit_ms,
                    progress: 0.0,
                    queue_delay_ms: None,
                    turnaround_ms: None,
                    timeline: JobTimeline::default(),
                    error: Some(e.to_string()),
                });
            }
        }
    }

    fn retire(&mut self, mut job: ActiveJob, status: JobStatus) -> JobReport {
        let report = job.report(status);
        job.am.cleanup();
        self.cluster.deregister(&job.app_id);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> SimulationRunner {
        SimulationRunner::new(ClusterConfig::default())
            .unwrap()
            .with_max_ticks(200)
    }

    #[test]
    fn test_single_job_runs_to_completion() {
        let mut runner = runner();
        let report = runner.run(vec![JobSpec::gpu(
            "resnet",
            0,
            AmConfig::for_job(16).with_duration_ms(5_000),
        )]);

        assert_eq!(report.jobs.len(), 1);
        let job = &report.jobs[0];
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.progress, 1.0);
        assert!(job.timeline.am_started_ms.is_some());
        assert_eq!(job.queue_delay_ms, Some(3_000));
        assert!(job.turnaround_ms.unwrap() >= 8_000);

        assert_eq!(report.cluster.granted, 5);
        assert_eq!(runner.cluster().running_containers(), 0);
        assert_eq!(runner.cluster().free_gpus(), 64);
    }

    #[test]
    fn test_job_mix_shares_cluster() {
        let mut runner = runner();
        let report = runner.run(vec![
            JobSpec::gpu("a", 0, AmConfig::for_job(16).with_duration_ms(4_000)),
            JobSpec::gpu("b", 0, AmConfig::for_job(8).with_duration_ms(6_000)),
            JobSpec::gpu("c", 2_000, AmConfig::for_job(32).with_duration_ms(3_000)),
            JobSpec::gpu("d", 5_000, AmConfig::for_job(2).with_duration_ms(1_000)),
        ]);

        assert_eq!(report.count(JobStatus::Finished), 4);
        assert!(report.jobs.iter().all(|j| j.timeline.finished_ms.is_some()));
        let d = report.jobs.iter().find(|j| j.name == "d").unwrap();
        assert_eq!(d.submit_ms, 5_000);
        assert_eq!(runner.cluster().free_gpus(), 64);
    }

    #[test]
    fn test_map_reduce_job_is_rejected() {
        let mut runner = runner();
        let report = runner.run(vec![
            JobSpec {
                name: "wordcount".to_string(),
                kind: WorkloadKind::MapReduce,
                submit_ms: 0,
                config: AmConfig::for_job(4),
            },
            JobSpec::gpu("bert", 0, AmConfig::for_job(4).with_duration_ms(1_000)),
        ]);

        assert_eq!(report.count(JobStatus::Rejected), 1);
        assert_eq!(report.count(JobStatus::Finished), 1);
        let rejected = &report.jobs[0];
        assert_eq!(rejected.name, "wordcount");
        assert!(rejected.error.as_deref().unwrap().contains("mapreduce"));
    }

    #[test]
    fn test_unsatisfiable_gang_backs_off() {
        let mut runner = SimulationRunner::new(ClusterConfig::default().with_topology(1, 2))
            .unwrap()
            .with_max_ticks(30);
        let report = runner.run(vec![JobSpec::gpu(
            "too-big",
            0,
            AmConfig::for_job(24).with_backoff(3_000, 2_000),
        )]);

        let job = &report.jobs[0];
        assert_eq!(job.status, JobStatus::Incomplete);
        assert!(job.timeline.backoffs >= 2);
        assert!(job.timeline.workers_started_ms.is_none());
        assert!(report.cluster.released >= 4);
        assert_eq!(runner.cluster().running_containers(), 0);
    }

    #[test]
    fn test_report_serializes_to_json() {
        let mut runner = runner();
        let report = runner.run(vec![JobSpec::gpu("tiny", 0, AmConfig::for_job(1).with_duration_ms(1_000))]);

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"finished\""));
        assert!(json.contains("\"name\":\"tiny\""));
    }

    #[test]
    fn test_job_spec_from_json_defaults_to_gpu() {
        let json = r#"{ "name": "llm", "submit_ms": 10, "config": { "job_gpus": 8 } }"#;
        let spec: JobSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.kind, WorkloadKind::Gpu);
        assert_eq!(spec.config.job_gpus, 8);
        assert_eq!(spec.config.max_gpus_per_container, 4);
    }
}
