//! Core traits for the application master
//!
//! The AM reaches every collaborator (scheduler, hosts, topology, credentials)
//! through these interfaces only - never concrete types. Each trait is `Send` so an
//! AM instance can be moved onto whichever thread drives it.

use crate::error::Result;
use crate::types::*;

/// Request/response channel to the resource scheduler
///
/// Neither side ever blocks: `submit` enqueues or fails, `poll` returns whatever
/// has already arrived.
pub trait SchedulerChannel: Send {
    /// Enqueue an allocate request. A full channel yields `AmError::ChannelFull`.
    fn submit(&mut self, token: &AmToken, request: AllocateRequest) -> Result<()>;

    /// Take the next available response, if any
    fn poll(&mut self) -> Option<AllocateResponse>;
}

/// Picks the node group worker containers should target
pub trait LocalityProvider: Send {
    fn best_nodes(&self, shape: &ShapeDescriptor) -> NodeGroup;
}

/// Fire-and-forget effects on the hosts running containers
pub trait HostPlacementSink: Send {
    /// Place a freshly allocated container on its node
    fn add_container(&mut self, container: &Container, lease: Lease);

    /// Start real work in an already placed container
    fn relaunch_container(&mut self, container: &Container, lifetime_ms: u64, start_ms: u64);

    /// Tear a container down
    fn cleanup_container(&mut self, container_id: &ContainerId);
}

/// Supplies the token attached to scheduler submissions
pub trait CredentialProvider: Send + Sync {
    fn token(&self, app_id: &ApplicationId) -> Option<AmToken>;
}

/// Capability set every AM variant implements
///
/// The surrounding simulator only ever calls `advance`, `is_done`, `progress`,
/// `timeline` and `cleanup`; the step methods are exposed so variants can be tested piecewise.
pub trait AmSimulator: Send {
    fn app_id(&self) -> ApplicationId;

    /// Whether `first_step` has already run
    fn is_started(&self) -> bool;

    /// One-time start: request the AM's own container
    fn first_step(&mut self, now_ms: u64) -> Result<()>;

    /// Back-off / yield timer evaluation
    fn check_timeout(&mut self, now_ms: u64) -> Result<()>;

    /// Emit new demand (if any) and flush queued requests
    fn send_request(&mut self, now_ms: u64) -> Result<()>;

    /// Drain and apply scheduler responses
    fn process_responses(&mut self, now_ms: u64) -> Result<()>;

    /// Record termination once the job is done
    fn check_stop(&mut self, now_ms: u64);

    /// Release all in-memory state. Must be idempotent.
    fn last_step(&mut self);

    fn is_done(&self) -> bool;

    /// Job progress in `[0.0, 1.0]`
    fn progress(&self) -> f32;

    /// Snapshot of lifecycle timestamps and counters
    fn timeline(&self) -> JobTimeline {
        JobTimeline::default()
    }

    /// Drive one simulation tick
    fn advance(&mut self, now_ms: u64) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        if !self.is_started() {
            return self.first_step(now_ms);
        }
        self.check_timeout(now_ms)?;
        self.send_request(now_ms)?;
        self.process_responses(now_ms)?;
        self.check_stop(now_ms);
        Ok(())
    }

    fn cleanup(&mut self) {
        self.last_step();
    }
}
