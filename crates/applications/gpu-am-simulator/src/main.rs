//! GPU AM simulator CLI
//!
//! Runs a job mix against the in-memory cluster and prints one JSON report.
//!
//! ```bash
//! # 20 synthetic jobs, default cluster
//! gpu-am-sim
//!
//! # Reproducible mix with back-off enabled, report written to a file
//! gpu-am-sim --jobs 50 --seed 7 --backoff --output report.json
//!
//! # Explicit job list, shared AM settings from a file
//! gpu-am-sim --trace jobs.json --config am.json
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use gpu_am_simulator::{AmConfig, ClusterConfig, JobSpec, JobStatus, SimulationRunner};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// GPU sizes drawn for synthetic jobs, small jobs dominate
const JOB_GPU_CHOICES: &[u32] = &[1, 1, 2, 2, 4, 4, 4, 8, 8, 16, 32];

#[derive(Parser, Debug)]
#[command(name = "gpu-am-sim")]
#[command(about = "Simulate GPU gang jobs against an in-memory cluster", long_about = None)]
struct Args {
    /// Number of synthetic jobs (ignored with --trace)
    #[arg(short, long, default_value_t = 20)]
    jobs: usize,

    /// Seed for the synthetic job mix
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// JSON file with a list of jobs to run instead of a synthetic mix
    #[arg(long)]
    trace: Option<PathBuf>,

    /// JSON file with the AM configuration shared by synthetic jobs
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Racks in the cluster
    #[arg(long, default_value_t = 2)]
    racks: usize,

    /// Nodes per rack
    #[arg(long, default_value_t = 4)]
    nodes_per_rack: usize,

    /// GPUs per node
    #[arg(long, default_value_t = 8)]
    gpus_per_node: u32,

    /// Containers the cluster grants per tick
    #[arg(long, default_value_t = 16)]
    grants_per_tick: usize,

    /// Release held containers when a gang cannot be completed in time
    #[arg(long)]
    backoff: bool,

    /// Allocating timeout (ms) when --backoff is set
    #[arg(long, default_value_t = 300_000)]
    allocate_timeout_ms: u64,

    /// Yield interval (ms) when --backoff is set
    #[arg(long, default_value_t = 60_000)]
    yield_timeout_ms: u64,

    /// Restart a lost AM up to this many times
    #[arg(long)]
    restart_attempts: Option<u32>,

    /// Simulation tick (ms)
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// Upper bound on simulated ticks
    #[arg(long, default_value_t = 500_000)]
    max_ticks: u64,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn load_am_config(args: &Args) -> Result<AmConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read AM config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid AM config {}", path.display()))?
        }
        None => AmConfig::default(),
    };
    if args.backoff {
        config = config.with_backoff(args.allocate_timeout_ms, args.yield_timeout_ms);
    }
    if let Some(attempts) = args.restart_attempts {
        config = config.with_restart(attempts);
    }
    Ok(config)
}

fn synthetic_jobs(count: usize, seed: u64, base: &AmConfig) -> Vec<JobSpec> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut submit_ms = 0;

    (0..count)
        .map(|i| {
            let gpus = JOB_GPU_CHOICES.choose(&mut rng).copied().unwrap_or(1);
            let duration_ms = rng.gen_range(30_000..=600_000);
            let job = JobSpec::gpu(
                format!("job-{:03}", i),
                submit_ms,
                AmConfig {
                    job_gpus: gpus,
                    job_duration_ms: duration_ms,
                    ..base.clone()
                },
            );
            submit_ms += rng.gen_range(0..=30_000);
            job
        })
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gpu_am=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let base = load_am_config(&args)?;
    base.validate().context("AM config rejected")?;

    let jobs = match &args.trace {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read trace {}", path.display()))?;
            serde_json::from_str::<Vec<JobSpec>>(&raw)
                .with_context(|| format!("Invalid trace {}", path.display()))?
        }
        None => synthetic_jobs(args.jobs, args.seed, &base),
    };
    if jobs.is_empty() {
        bail!("No jobs to simulate");
    }

    let cluster = ClusterConfig {
        racks: args.racks,
        nodes_per_rack: args.nodes_per_rack,
        gpus_per_node: args.gpus_per_node,
        grants_per_tick: args.grants_per_tick,
        ..ClusterConfig::default()
    };
    info!(
        jobs = jobs.len(),
        cluster_gpus = cluster.total_gpus(),
        backoff = base.backoff.enabled,
        "Simulating job mix"
    );

    let mut runner = SimulationRunner::new(cluster)
        .context("Cluster config rejected")?
        .with_tick_ms(args.tick_ms)
        .with_max_ticks(args.max_ticks);
    let report = runner.run(jobs);

    let json = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Report written");
        }
        None => println!("{}", json),
    }

    info!(
        finished = report.count(JobStatus::Finished),
        failed = report.count(JobStatus::Failed),
        rejected = report.count(JobStatus::Rejected),
        incomplete = report.count(JobStatus::Incomplete),
        "Done"
    );
    Ok(())
}
