//! AM lifecycle driver for homogeneous GPU gang jobs
//!
//! ```text
//! AwaitingAmContainer ──first allocation──▶ Running ──AM completes after all work──▶ Finished
//!          ▲                                   │
//!          └──────── AM lost (restart) ────────┘──── restart budget spent ──▶ Failed
//! ```
//!
//! Every tick while running:
//!
//! 1. **Timeout**: evaluate the allocating / yielding timers
//! 2. **Request**: start a new cycle if demand is armed, or resubmit killed workers
//! 3. **Responses**: drain the scheduler channel and route events
//! 4. **Stop**: record the finish time once the AM container is gone
//!
//! The workers of a cycle only start once all of them are assigned; the launch
//! effect fires once per cycle.

use std::sync::Arc;

use am_core::{
    AmError, AmSimulator, ApplicationId, Container, ContainerStatus, CredentialProvider,
    HostPlacementSink, JobTimeline, Lease, LocalityProvider, Result, SchedulerChannel,
    ShapeDescriptor, WorkUnit, WorkloadKind,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffAction, BackoffController, BackoffState};
use crate::config::AmConfig;
use crate::demand::JobDemand;
use crate::ledger::ContainerLedger;
use crate::protocol::{AllocationClient, ProtocolEvent};

/// Coarse lifecycle of the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecyclePhase {
    AwaitingAmContainer,
    Running,
    Finished,
    /// AM kept failing and the restart budget is spent
    Failed,
}

/// State of the AM's own container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmContainerState {
    NotRequested,
    Requested,
    Running(Container),
    /// All work finished, cleanup sent, waiting for the completion report
    Releasing(Container),
    Completed(Container),
    /// Died while work remained and restart is disabled
    Lost,
}

/// Everything the AM talks to
pub struct AmCollaborators {
    pub channel: Box<dyn SchedulerChannel>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub locality: Box<dyn LocalityProvider>,
    pub hosts: Box<dyn HostPlacementSink>,
}

/// Application master for a homogeneous GPU job
pub struct GpuAmSimulator {
    app_id: ApplicationId,
    config: AmConfig,
    ledger: ContainerLedger,
    client: AllocationClient,
    backoff: BackoffController,
    locality: Box<dyn LocalityProvider>,
    hosts: Box<dyn HostPlacementSink>,
    phase: LifecyclePhase,
    am: AmContainerState,
    /// Units of the most recent cycle, replayed after a yield
    all_units: Vec<WorkUnit>,
    need_allocation: bool,
    /// Launch effect already fired in the current cycle
    launched: bool,
    started: bool,
    timeline: JobTimeline,
}

impl GpuAmSimulator {
    pub fn new(app_id: ApplicationId, config: AmConfig, collaborators: AmCollaborators) -> Result<Self> {
        config.validate()?;
        let AmCollaborators {
            channel,
            credentials,
            locality,
            hosts,
        } = collaborators;

        Ok(Self {
            app_id,
            backoff: BackoffController::new(config.backoff),
            client: AllocationClient::new(app_id, channel, credentials),
            config,
            ledger: ContainerLedger::new(),
            locality,
            hosts,
            phase: LifecyclePhase::AwaitingAmContainer,
            am: AmContainerState::NotRequested,
            all_units: Vec::new(),
            need_allocation: true,
            launched: false,
            started: false,
            timeline: JobTimeline::default(),
        })
    }

    pub fn config(&self) -> &AmConfig {
        &self.config
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn am_state(&self) -> &AmContainerState {
        &self.am
    }

    pub fn ledger(&self) -> &ContainerLedger {
        &self.ledger
    }

    pub fn client(&self) -> &AllocationClient {
        &self.client
    }

    pub fn backoff_state(&self) -> BackoffState {
        self.backoff.state()
    }

    pub fn needs_allocation(&self) -> bool {
        self.need_allocation
    }

    pub fn all_units(&self) -> &[WorkUnit] {
        &self.all_units
    }

    fn am_container(&self) -> Option<&Container> {
        match &self.am {
            AmContainerState::Running(c)
            | AmContainerState::Releasing(c)
            | AmContainerState::Completed(c) => Some(c),
            _ => None,
        }
    }

    /// Start a fresh allocation cycle from the current locality hint
    fn start_cycle(&mut self, now_ms: u64) -> Result<()> {
        self.client.authorize()?;
        self.need_allocation = false;

        let shape = ShapeDescriptor::any_connected(self.config.max_gpus_per_container);
        let hint = self.locality.best_nodes(&shape);
        let demand = JobDemand::from_config(&self.config, Some(&hint));
        let units = demand.partition(
            self.config.gpu_memory_mb,
            &hint.locality(),
            self.config.job_duration_ms,
        );

        info!(
            app_id = %self.app_id,
            containers = units.len(),
            gpus_per_container = demand.gpus_per_container,
            locality = %hint.locality(),
            "Starting allocation cycle"
        );

        self.all_units = units.clone();
        self.ledger.begin_cycle(units);
        self.launched = false;
        self.backoff.arm_allocating(now_ms);
        self.client.emit_worker_request(&mut self.ledger)?;
        Ok(())
    }

    /// Start every assigned worker at once
    fn launch_all(&mut self, now_ms: u64) {
        for (container, unit) in self.ledger.assigned() {
            self.hosts
                .relaunch_container(container, unit.duration_ms, now_ms);
        }
        self.launched = true;
        self.backoff.disarm();
        self.timeline.workers_started_ms.get_or_insert(now_ms);
        info!(
            app_id = %self.app_id,
            containers = self.ledger.assigned_len(),
            "All GPU containers available, starting work"
        );
    }

    /// Back-off: cancel outstanding asks, give back every held container
    fn release_all(&mut self) -> Result<()> {
        let released = self.ledger.assigned_ids();
        let cancelled: Vec<WorkUnit> = self.ledger.scheduled().cloned().collect();

        info!(
            app_id = %self.app_id,
            released = released.len(),
            cancelled = cancelled.len(),
            yield_timeout_ms = self.config.backoff.yield_timeout_ms,
            "Allocating timeout, releasing all resources and yielding"
        );

        self.ledger.reset();
        self.launched = false;
        self.timeline.backoffs += 1;
        self.client.emit_release(cancelled.iter(), released)
    }

    fn handle_event(&mut self, event: ProtocolEvent, now_ms: u64) -> Result<()> {
        match event {
            ProtocolEvent::AmAllocated(container) => {
                self.hosts.add_container(&container, Lease::AmLifetime);
                info!(app_id = %self.app_id, container_id = %container.id, "Started AM container");
                self.am = AmContainerState::Running(container);
                self.phase = LifecyclePhase::Running;
                self.timeline.am_started_ms = Some(now_ms);
            }
            ProtocolEvent::WorkerAssigned { container, unit } => {
                self.hosts.add_container(&container, Lease::Reserved);
                debug!(
                    app_id = %self.app_id,
                    container_id = %container.id,
                    assigned = self.ledger.assigned_len(),
                    total = self.ledger.total(),
                    "Reserved GPU worker"
                );
                // before launch the gang starts together once the response is applied
                if self.launched {
                    self.hosts
                        .relaunch_container(&container, unit.duration_ms, now_ms);
                }
            }
            ProtocolEvent::WorkerFailed(status) => {
                self.timeline.worker_failures += 1;
                if !self.config.resubmit_failed_workers {
                    warn!(
                        app_id = %self.app_id,
                        container_id = %status.container_id,
                        exit_status = status.exit_status,
                        "GPU worker killed; resubmission disabled, unit stays parked"
                    );
                }
            }
            ProtocolEvent::AmSignal(status) => return self.on_am_signal(status, now_ms),
            ProtocolEvent::UnexpectedAllocation(_)
            | ProtocolEvent::WorkerFinished(_)
            | ProtocolEvent::ReleaseAcknowledged(_) => {}
        }
        Ok(())
    }

    /// A completion that matched no worker: the AM itself, or an unknown id
    fn on_am_signal(&mut self, status: ContainerStatus, now_ms: u64) -> Result<()> {
        let is_am = self
            .am_container()
            .is_some_and(|c| c.id == status.container_id);

        match &self.am {
            AmContainerState::Releasing(c) => {
                if is_am || status.is_success() {
                    let c = c.clone();
                    self.finish(c);
                } else {
                    warn!(
                        app_id = %self.app_id,
                        container_id = %status.container_id,
                        "Ignoring unknown completion while AM is shutting down"
                    );
                }
                Ok(())
            }
            AmContainerState::Running(c) => {
                if status.is_success() && self.ledger.is_complete() {
                    let c = c.clone();
                    self.finish(c);
                    Ok(())
                } else {
                    self.on_am_failure(status, now_ms)
                }
            }
            _ => {
                warn!(
                    app_id = %self.app_id,
                    container_id = %status.container_id,
                    "Completion for unknown container while no AM is running"
                );
                Ok(())
            }
        }
    }

    fn finish(&mut self, am: Container) {
        info!(app_id = %self.app_id, container_id = %am.id, "Application goes to finish");
        self.am = AmContainerState::Completed(am);
        self.phase = LifecyclePhase::Finished;
    }

    fn on_am_failure(&mut self, status: ContainerStatus, now_ms: u64) -> Result<()> {
        warn!(
            app_id = %self.app_id,
            container_id = %status.container_id,
            exit_status = status.exit_status,
            finished = self.ledger.finished(),
            total = self.ledger.total(),
            "AM container lost while work remains"
        );

        if !self.config.restart.enabled {
            self.am = AmContainerState::Lost;
            return Ok(());
        }
        if self.timeline.restarts >= self.config.restart.max_attempts {
            error!(app_id = %self.app_id, attempts = self.timeline.restarts, "Restart limit reached");
            self.phase = LifecyclePhase::Failed;
            return Err(AmError::RestartLimitExceeded {
                app_id: self.app_id,
                attempts: self.timeline.restarts,
            });
        }
        self.restart(&status, now_ms)
    }

    /// Drop all worker state and ask for a new AM container
    ///
    /// An AM container that did not report the failure itself is released too.
    fn restart(&mut self, signal: &ContainerStatus, now_ms: u64) -> Result<()> {
        self.client.authorize()?;
        self.timeline.restarts += 1;
        info!(app_id = %self.app_id, attempt = self.timeline.restarts, "Restarting AM");

        let mut released = self.ledger.assigned_ids();
        if let Some(old) = self.am_container().filter(|c| c.id != signal.container_id) {
            debug!(app_id = %self.app_id, container_id = %old.id, "Releasing previous AM container");
            released.push(old.id);
        }
        let cancelled: Vec<WorkUnit> = self.ledger.scheduled().cloned().collect();

        self.ledger.reset();
        self.backoff.reset();
        self.launched = false;
        self.need_allocation = true;
        self.am = AmContainerState::Requested;
        self.phase = LifecyclePhase::AwaitingAmContainer;
        self.timeline.am_requested_ms = Some(now_ms);

        let released = if released.is_empty() && cancelled.is_empty() {
            Ok(())
        } else {
            self.client.emit_release(cancelled.iter(), released)
        };
        let requested = self.client.request_am_container(self.config.am_resource);
        released.and(requested)
    }
}

impl AmSimulator for GpuAmSimulator {
    fn app_id(&self) -> ApplicationId {
        self.app_id
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn first_step(&mut self, now_ms: u64) -> Result<()> {
        self.client.authorize()?;
        self.started = true;
        self.am = AmContainerState::Requested;
        self.timeline.am_requested_ms = Some(now_ms);
        debug!(app_id = %self.app_id, gpus = self.config.job_gpus, "Application started");
        self.client.request_am_container(self.config.am_resource)
    }

    fn check_timeout(&mut self, now_ms: u64) -> Result<()> {
        if self.phase != LifecyclePhase::Running {
            return Ok(());
        }
        if let BackoffState::Allocating { .. } = self.backoff.state() {
            self.client.authorize()?;
        }

        let action = self.backoff.evaluate(
            now_ms,
            self.ledger.assigned_len(),
            self.ledger.total(),
            self.is_done(),
        );
        match action {
            BackoffAction::None => Ok(()),
            BackoffAction::Release => self.release_all(),
            BackoffAction::Resume => {
                info!(app_id = %self.app_id, "Resuming from yield");
                self.ledger.enqueue_pending(self.all_units.iter().cloned());
                self.need_allocation = true;
                Ok(())
            }
        }
    }

    fn send_request(&mut self, now_ms: u64) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        self.client.flush()?;
        if !matches!(self.am, AmContainerState::Running(_)) {
            return Ok(());
        }

        if self.need_allocation {
            self.start_cycle(now_ms)
        } else if self.config.resubmit_failed_workers
            && self.ledger.failed_len() > 0
            && self.ledger.scheduled_len() == 0
        {
            self.client.emit_resubmission(&mut self.ledger).map(|_| ())
        } else {
            Ok(())
        }
    }

    fn process_responses(&mut self, now_ms: u64) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }

        // a full channel must not drop the rest of what was drained
        let mut deferred = None;
        for response in self.client.drain_responses() {
            let expect_am = self.am == AmContainerState::Requested;
            let events = self.client.apply_response(response, &mut self.ledger, expect_am);
            for event in events {
                match self.handle_event(event, now_ms) {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        deferred.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                }
            }

            if !self.launched && self.ledger.is_fully_assigned() {
                self.launch_all(now_ms);
            }
            if let AmContainerState::Running(am) = &self.am {
                if self.ledger.is_complete() {
                    let am = am.clone();
                    self.hosts.cleanup_container(&am.id);
                    info!(app_id = %self.app_id, container_id = %am.id, "All GPU work finished, cleaning up AM container");
                    self.am = AmContainerState::Releasing(am);
                }
            }
            if self.is_done() {
                break;
            }
        }
        deferred.map_or(Ok(()), Err)
    }

    fn check_stop(&mut self, now_ms: u64) {
        if self.phase == LifecyclePhase::Finished && self.timeline.finished_ms.is_none() {
            self.timeline.finished_ms = Some(now_ms);
            info!(app_id = %self.app_id, finished_ms = now_ms, "Application finished");
        }
    }

    fn last_step(&mut self) {
        self.ledger.reset();
        self.client.clear();
        self.all_units.clear();
        self.need_allocation = false;
    }

    fn is_done(&self) -> bool {
        matches!(self.phase, LifecyclePhase::Finished | LifecyclePhase::Failed)
    }

    fn progress(&self) -> f32 {
        if self.phase == LifecyclePhase::Finished {
            1.0
        } else if self.ledger.total() == 0 {
            0.0
        } else {
            self.ledger.finished() as f32 / self.ledger.total() as f32
        }
    }

    fn timeline(&self) -> JobTimeline {
        self.timeline.clone()
    }
}

/// Build the AM implementation matching a job's workload
pub fn build_am_simulator(
    kind: WorkloadKind,
    app_id: ApplicationId,
    config: AmConfig,
    collaborators: AmCollaborators,
) -> Result<Box<dyn AmSimulator>> {
    match kind {
        WorkloadKind::Gpu => Ok(Box::new(GpuAmSimulator::new(app_id, config, collaborators)?)),
        WorkloadKind::MapReduce => Err(AmError::UnsupportedWorkload(format!(
            "{} has no AM implementation in this simulator",
            kind
        ))),
    }
}
