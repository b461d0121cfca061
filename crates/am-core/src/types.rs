//! Core types shared between the AM and the scheduler it talks to

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Resource name matching any node
pub const ANY: &str = "*";

/// Exit status reported for a container that ran to completion
pub const EXIT_SUCCESS: i32 = 0;

/// Exit status reported for a container released or killed by the framework
pub const EXIT_ABORTED: i32 = -100;

/// Exit status reported for a container preempted by the scheduler
pub const EXIT_PREEMPTED: i32 = -102;

/// Unique identifier for an application (one AM instance per application)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApplicationId(pub u32);

impl std::fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "application_{:04}", self.0)
    }
}

/// Scheduler-assigned container identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u64);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "container_{:06}", self.0)
    }
}

/// Identifier of a node hosting containers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request priority. Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u32);

impl Priority {
    /// Priority of the AM's own container
    pub const AM: Priority = Priority(1);
    /// Priority of GPU worker containers
    pub const GPU_WORKER: Priority = Priority(20);
}

/// Resource capability of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub memory_mb: u64,
    pub vcores: u32,
    pub gpus: u32,
}

impl Resource {
    pub fn new(memory_mb: u64, vcores: u32, gpus: u32) -> Self {
        Self {
            memory_mb,
            vcores,
            gpus,
        }
    }
}

/// One ask line of an allocate request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub capability: Resource,
    /// `ANY` or a locality string such as `/rack-0/node-0,node-1`
    pub resource_name: String,
    pub priority: Priority,
    /// Absolute number of outstanding containers wanted; zero cancels the ask
    pub num_containers: u32,
}

/// Message sent from the AM to the scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub ask: Vec<ResourceRequest>,
    pub release: Vec<ContainerId>,
    pub progress: f32,
}

/// A container granted by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub node_id: NodeId,
    pub resource: Resource,
    pub priority: Priority,
}

/// Completion report for a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub exit_status: i32,
}

impl ContainerStatus {
    pub fn new(container_id: ContainerId, exit_status: i32) -> Self {
        Self {
            container_id,
            exit_status,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_status == EXIT_SUCCESS
    }
}

/// Message delivered from the scheduler to the AM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub allocated_containers: Vec<Container>,
    pub completed_container_statuses: Vec<ContainerStatus>,
}

impl AllocateResponse {
    pub fn is_empty(&self) -> bool {
        self.allocated_containers.is_empty() && self.completed_container_statuses.is_empty()
    }
}

/// Shape handed to the locality provider when picking a node group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDescriptor {
    /// Affinity class, e.g. `anyConnected`
    pub affinity: String,
    pub gpus_per_container: u32,
}

impl ShapeDescriptor {
    /// Any connected group of nodes able to host containers of the given size
    pub fn any_connected(gpus_per_container: u32) -> Self {
        Self {
            affinity: "anyConnected".to_string(),
            gpus_per_container,
        }
    }
}

/// Locality hint returned by the locality provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub connectivity_domain: String,
    pub nodes: Vec<String>,
    pub gpus_per_container: u32,
}

impl NodeGroup {
    /// Locality string carried on worker asks: `/<domain>/<node,node,...>`
    pub fn locality(&self) -> String {
        format!("/{}/{}", self.connectivity_domain, self.nodes.join(","))
    }
}

/// How long a container placed on a host is leased for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lease {
    /// Lives until the AM asks for it to be cleaned up
    AmLifetime,
    /// Held idle until a relaunch gives it a real lifetime
    Reserved,
}

/// Opaque token attached to every scheduler submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AmToken(pub String);

impl AmToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

/// One schedulable chunk of GPU work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Position within its allocation cycle
    pub index: usize,
    pub resource: Resource,
    pub priority: Priority,
    pub locality: String,
    pub duration_ms: u64,
}

/// Timestamps and counters of one AM run, for reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTimeline {
    pub am_requested_ms: Option<u64>,
    pub am_started_ms: Option<u64>,
    pub workers_started_ms: Option<u64>,
    pub finished_ms: Option<u64>,
    pub backoffs: u32,
    pub restarts: u32,
    pub worker_failures: u32,
}

/// Workload family of a job, used to pick the AM implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// Homogeneous GPU gang job
    Gpu,
    /// Classic map/reduce task job
    MapReduce,
}

impl FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" | "philly" => Ok(Self::Gpu),
            "mapreduce" | "mr" => Ok(Self::MapReduce),
            other => Err(format!("unknown workload kind '{}'", other)),
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadKind::Gpu => write!(f, "gpu"),
            WorkloadKind::MapReduce => write!(f, "mapreduce"),
        }
    }
}
