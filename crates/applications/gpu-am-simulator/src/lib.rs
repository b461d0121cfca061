//! # GPU Application Master Simulator
//!
//! Simulated application master for homogeneous GPU gang jobs, driven tick by tick
//! against a resource scheduler.
//!
//! ## Architecture
//!
//! ```text
//! GpuAmSimulator (driver)
//! ├── ContainerLedger      pending → scheduled → assigned → finished / failed
//! ├── AllocationClient     outbox, releases, response routing
//! ├── BackoffController    allocating / yielding timeouts
//! └── collaborators        SchedulerChannel, LocalityProvider,
//!                          HostPlacementSink, CredentialProvider
//! ```
//!
//! A job first acquires its own AM container, then asks for all of its worker
//! containers at once. Workers only start when the whole gang is held. The job
//! finishes when every worker has exited successfully and the AM container has
//! been torn down.
//!
//! ## Harness
//!
//! [`cluster`] is an in-memory stand-in for the resource manager and node
//! managers; [`runner`] drives many AMs against it and produces JSON reports.

#![warn(clippy::all)]

pub mod backoff;
pub mod cluster;
pub mod config;
pub mod demand;
pub mod driver;
pub mod ledger;
pub mod protocol;
pub mod runner;

// ============================================================================
// Public exports
// ============================================================================

pub use backoff::{BackoffAction, BackoffController, BackoffState};
pub use cluster::{ClusterConfig, ClusterStats, InMemoryCluster};
pub use config::{AmConfig, BackoffConfig, RestartPolicy};
pub use demand::JobDemand;
pub use driver::{build_am_simulator, AmCollaborators, AmContainerState, GpuAmSimulator, LifecyclePhase};
pub use ledger::ContainerLedger;
pub use protocol::{AllocationClient, ProtocolEvent};
pub use runner::{JobReport, JobSpec, JobStatus, SimulationReport, SimulationRunner};
