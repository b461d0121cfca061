//! Allocation protocol client
//!
//! Turns ledger demand into allocate requests and scheduler responses back into
//! ledger transitions.
//!
//! ## Outbox
//!
//! Requests are never submitted directly. They are queued in an outbox and flushed
//! in order; a full channel stops the flush, keeps the remainder and surfaces
//! `AmError::ChannelFull` so the driver can try again on its next tick.
//!
//! ## Released set
//!
//! Containers the AM gives back (back-off, restart, stray allocations) are
//! remembered until the scheduler reports them completed, so their completion
//! statuses are not mistaken for AM events.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use am_core::{
    AllocateRequest, AllocateResponse, AmError, AmToken, ApplicationId, Container, ContainerId,
    ContainerStatus, CredentialProvider, Priority, Resource, ResourceRequest, Result,
    SchedulerChannel, WorkUnit, ANY,
};
use tracing::{debug, warn};

use crate::ledger::ContainerLedger;

/// Outcome of routing one element of a response
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// First allocation while the AM was waiting for its own container
    AmAllocated(Container),
    /// Allocation matched against the oldest scheduled unit
    WorkerAssigned { container: Container, unit: WorkUnit },
    /// Allocation with nothing scheduled; queued for release
    UnexpectedAllocation(ContainerId),
    WorkerFinished(ContainerId),
    WorkerFailed(ContainerStatus),
    /// Completion of a container this AM released earlier
    ReleaseAcknowledged(ContainerId),
    /// Completion not matching any worker: the AM container itself, or an unknown id
    AmSignal(ContainerStatus),
}

/// Client side of the AM <-> scheduler protocol for one application
pub struct AllocationClient {
    app_id: ApplicationId,
    channel: Box<dyn SchedulerChannel>,
    credentials: Arc<dyn CredentialProvider>,
    outbox: VecDeque<AllocateRequest>,
    release_queue: Vec<ContainerId>,
    releasing: BTreeSet<ContainerId>,
    last_progress: f32,
    submitted: usize,
}

impl AllocationClient {
    pub fn new(
        app_id: ApplicationId,
        channel: Box<dyn SchedulerChannel>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            app_id,
            channel,
            credentials,
            outbox: VecDeque::new(),
            release_queue: Vec::new(),
            releasing: BTreeSet::new(),
            last_progress: 0.0,
            submitted: 0,
        }
    }

    /// Resolve the token for this application. Missing tokens are fatal.
    pub fn authorize(&self) -> Result<AmToken> {
        self.credentials
            .token(&self.app_id)
            .ok_or(AmError::MissingCredential(self.app_id))
    }

    /// Ask for the AM's own container
    pub fn request_am_container(&mut self, resource: Resource) -> Result<()> {
        let token = self.authorize()?;
        let ask = vec![ResourceRequest {
            capability: resource,
            resource_name: ANY.to_string(),
            priority: Priority::AM,
            num_containers: 1,
        }];
        debug!(app_id = %self.app_id, "Sending allocate request for the AM container");
        self.outbox.push_back(AllocateRequest {
            ask,
            release: Vec::new(),
            progress: 0.0,
        });
        self.flush_with(&token)
    }

    /// Package every pending unit into one request and mark them scheduled
    pub fn emit_worker_request(&mut self, ledger: &mut ContainerLedger) -> Result<usize> {
        let token = self.authorize()?;
        let ask = package_requests(ledger.pending());
        let progress = progress_of(ledger);
        let count = ledger.promote_pending();

        debug!(app_id = %self.app_id, workers = count, "Sending request for GPU workers");
        self.enqueue(ask, progress);
        self.flush_with(&token)?;
        Ok(count)
    }

    /// Re-request units whose containers were killed
    pub fn emit_resubmission(&mut self, ledger: &mut ContainerLedger) -> Result<usize> {
        let token = self.authorize()?;
        let ask = package_requests(ledger.failed());
        let progress = progress_of(ledger);
        let count = ledger.promote_failed();

        debug!(app_id = %self.app_id, workers = count, "Resubmitting failed GPU workers");
        self.enqueue(ask, progress);
        self.flush_with(&token)?;
        Ok(count)
    }

    /// Cancel outstanding asks and give containers back to the scheduler
    ///
    /// Cancellation goes out first as zero-count asks; the release itself is a
    /// request with an empty ask list.
    pub fn emit_release<'a>(
        &mut self,
        cancel: impl IntoIterator<Item = &'a WorkUnit>,
        release: Vec<ContainerId>,
    ) -> Result<()> {
        let token = self.authorize()?;
        let mut cancel_ask = package_requests(cancel);
        for ask in &mut cancel_ask {
            ask.num_containers = 0;
        }
        if !cancel_ask.is_empty() {
            self.enqueue(cancel_ask, self.last_progress);
        }
        self.release_queue.extend(release);
        self.flush_with(&token)
    }

    /// Queue a container for release with the next flush
    pub fn queue_release(&mut self, id: ContainerId) {
        self.release_queue.push(id);
    }

    /// Whether anything is waiting to be submitted
    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty() || !self.release_queue.is_empty()
    }

    /// Submit queued requests in order
    pub fn flush(&mut self) -> Result<()> {
        if !self.has_outgoing() {
            return Ok(());
        }
        let token = self.authorize()?;
        self.flush_with(&token)
    }

    fn flush_with(&mut self, token: &AmToken) -> Result<()> {
        if !self.release_queue.is_empty() {
            let release: Vec<ContainerId> = self.release_queue.drain(..).collect();
            self.releasing.extend(release.iter().copied());
            self.outbox.push_back(AllocateRequest {
                ask: Vec::new(),
                release,
                progress: self.last_progress,
            });
        }

        while let Some(request) = self.outbox.front() {
            match self.channel.submit(token, request.clone()) {
                Ok(()) => {
                    self.outbox.pop_front();
                    self.submitted += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        debug!(app_id = %self.app_id, queued = self.outbox.len(), "Scheduler channel full, will retry");
                    } else {
                        warn!(app_id = %self.app_id, error = %e, "Failed to submit allocate request");
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, ask: Vec<ResourceRequest>, progress: f32) {
        self.last_progress = progress;
        self.outbox.push_back(AllocateRequest {
            ask,
            release: Vec::new(),
            progress,
        });
    }

    /// Take every response currently available, in arrival order
    pub fn drain_responses(&mut self) -> Vec<AllocateResponse> {
        let mut responses = Vec::new();
        while let Some(response) = self.channel.poll() {
            responses.push(response);
        }
        responses
    }

    /// Route one response into the ledger
    ///
    /// Allocations are handled before completions. With `expect_am` set the first
    /// AM-priority allocation is the AM container; anything else that matches no
    /// scheduled unit is released.
    pub fn apply_response(
        &mut self,
        response: AllocateResponse,
        ledger: &mut ContainerLedger,
        mut expect_am: bool,
    ) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();

        for container in response.allocated_containers {
            if expect_am && container.priority == Priority::AM {
                expect_am = false;
                events.push(ProtocolEvent::AmAllocated(container));
                continue;
            }
            let id = container.id;
            match ledger.assign(container.clone()) {
                Ok(unit) => {
                    let unit = unit.clone();
                    events.push(ProtocolEvent::WorkerAssigned { container, unit });
                }
                Err(e) => {
                    warn!(app_id = %self.app_id, container_id = %id, error = %e, "Releasing unmatched allocation");
                    self.queue_release(id);
                    events.push(ProtocolEvent::UnexpectedAllocation(id));
                }
            }
        }

        for status in response.completed_container_statuses {
            let id = status.container_id;
            if self.releasing.remove(&id) {
                debug!(app_id = %self.app_id, container_id = %id, "Released container acknowledged");
                events.push(ProtocolEvent::ReleaseAcknowledged(id));
            } else if status.is_success() {
                match ledger.complete_success(&id) {
                    Some(_) => {
                        debug!(app_id = %self.app_id, container_id = %id, "GPU worker finished");
                        events.push(ProtocolEvent::WorkerFinished(id));
                    }
                    None => events.push(ProtocolEvent::AmSignal(status)),
                }
            } else {
                match ledger.complete_failure(&id) {
                    Some(_) => {
                        debug!(app_id = %self.app_id, container_id = %id, exit_status = status.exit_status, "GPU worker killed");
                        events.push(ProtocolEvent::WorkerFailed(status));
                    }
                    None => events.push(ProtocolEvent::AmSignal(status)),
                }
            }
        }

        events
    }

    /// Ids released but not yet acknowledged
    pub fn releasing(&self) -> impl Iterator<Item = &ContainerId> {
        self.releasing.iter()
    }

    pub fn queued_requests(&self) -> usize {
        self.outbox.len()
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Drop queued requests and released-id tracking
    pub fn clear(&mut self) {
        self.outbox.clear();
        self.release_queue.clear();
        self.releasing.clear();
    }
}

/// `finished / total`, or `1.0` with no containers outstanding
pub fn progress_of(ledger: &ContainerLedger) -> f32 {
    if ledger.total() == 0 {
        1.0
    } else {
        ledger.finished() as f32 / ledger.total() as f32
    }
}

/// Aggregate units into asks, one per (locality, capability, priority)
pub fn package_requests<'a>(units: impl IntoIterator<Item = &'a WorkUnit>) -> Vec<ResourceRequest> {
    let mut asks: Vec<ResourceRequest> = Vec::new();
    for unit in units {
        match asks.iter_mut().find(|ask| {
            ask.resource_name == unit.locality
                && ask.capability == unit.resource
                && ask.priority == unit.priority
        }) {
            Some(ask) => ask.num_containers += 1,
            None => asks.push(ResourceRequest {
                capability: unit.resource,
                resource_name: unit.locality.clone(),
                priority: unit.priority,
                num_containers: 1,
            }),
        }
    }
    asks
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::demand::JobDemand;
    use am_core::{EXIT_ABORTED, EXIT_SUCCESS};

    fn client() -> (AllocationClient, ScriptedChannel, ToggleCredentials) {
        let channel = ScriptedChannel::default();
        let creds = ToggleCredentials::granted();
        let client = AllocationClient::new(
            ApplicationId(1),
            Box::new(channel.clone()),
            Arc::new(creds.clone()),
        );
        (client, channel, creds)
    }

    fn ledger_with(n_gpus: u32) -> ContainerLedger {
        let mut ledger = ContainerLedger::new();
        let units = JobDemand::new(n_gpus, 4, 4).partition(1024, "/rack-0/node-0,node-1", 1_000);
        ledger.begin_cycle(units);
        ledger
    }

    #[test]
    fn test_am_request_shape() {
        let (mut client, channel, _) = client();
        client.request_am_container(Resource::new(1024, 1, 0)).unwrap();

        let sent = channel.submitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ask.len(), 1);
        assert_eq!(sent[0].ask[0].priority, Priority::AM);
        assert_eq!(sent[0].ask[0].resource_name, ANY);
        assert_eq!(sent[0].ask[0].num_containers, 1);
        assert!(sent[0].release.is_empty());
    }

    #[test]
    fn test_worker_request_packages_and_promotes() {
        let (mut client, channel, _) = client();
        let mut ledger = ledger_with(16);

        assert_eq!(client.emit_worker_request(&mut ledger).unwrap(), 4);
        assert_eq!(ledger.pending_len(), 0);
        assert_eq!(ledger.scheduled_len(), 4);

        let sent = channel.submitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ask.len(), 1);
        assert_eq!(sent[0].ask[0].num_containers, 4);
        assert_eq!(sent[0].ask[0].priority, Priority::GPU_WORKER);
        assert_eq!(sent[0].progress, 0.0);
    }

    #[test]
    fn test_progress_is_one_without_containers() {
        let ledger = ContainerLedger::new();
        assert_eq!(progress_of(&ledger), 1.0);
    }

    #[test]
    fn test_missing_token_mutates_nothing() {
        let (mut client, channel, creds) = client();
        creds.revoke();
        let mut ledger = ledger_with(8);

        let err = client.emit_worker_request(&mut ledger).unwrap_err();
        assert_eq!(err, AmError::MissingCredential(ApplicationId(1)));
        assert_eq!(ledger.pending_len(), 2);
        assert_eq!(ledger.scheduled_len(), 0);
        assert!(channel.submitted().is_empty());
    }

    #[test]
    fn test_full_channel_keeps_request_queued() {
        let (mut client, channel, _) = client();
        channel.set_capacity(Some(0));
        let mut ledger = ledger_with(8);

        let err = client.emit_worker_request(&mut ledger).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(client.queued_requests(), 1);
        assert_eq!(ledger.scheduled_len(), 2);

        channel.set_capacity(None);
        client.flush().unwrap();
        assert_eq!(client.queued_requests(), 0);
        assert_eq!(channel.submitted().len(), 1);
    }

    #[test]
    fn test_allocations_match_oldest_scheduled() {
        let (mut client, _, _) = client();
        let mut ledger = ledger_with(8);
        client.emit_worker_request(&mut ledger).unwrap();

        let events = client.apply_response(allocated(&[7, 3]), &mut ledger, false);
        let indices: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                ProtocolEvent::WorkerAssigned { unit, .. } => Some(unit.index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(ledger.is_fully_assigned());
    }

    #[test]
    fn test_first_allocation_binds_am() {
        let (mut client, _, _) = client();
        let mut ledger = ContainerLedger::new();

        let response = AllocateResponse {
            allocated_containers: vec![container(1, Priority::AM), container(2, Priority::AM)],
            completed_container_statuses: Vec::new(),
        };
        let events = client.apply_response(response, &mut ledger, true);
        assert!(matches!(events[0], ProtocolEvent::AmAllocated(ref c) if c.id == ContainerId(1)));
        assert_eq!(events[1], ProtocolEvent::UnexpectedAllocation(ContainerId(2)));
        assert!(client.has_outgoing());
    }

    #[test]
    fn test_worker_grant_never_binds_am() {
        let (mut client, channel, _) = client();
        let mut ledger = ContainerLedger::new();

        let response = AllocateResponse {
            allocated_containers: vec![
                container(3, Priority::GPU_WORKER),
                container(4, Priority::AM),
            ],
            completed_container_statuses: Vec::new(),
        };
        let events = client.apply_response(response, &mut ledger, true);
        assert_eq!(events[0], ProtocolEvent::UnexpectedAllocation(ContainerId(3)));
        assert!(matches!(events[1], ProtocolEvent::AmAllocated(ref c) if c.id == ContainerId(4)));

        client.flush().unwrap();
        assert_eq!(channel.submitted()[0].release, vec![ContainerId(3)]);
    }

    #[test]
    fn test_unmatched_allocation_is_released() {
        let (mut client, channel, _) = client();
        let mut ledger = ContainerLedger::new();

        client.apply_response(allocated(&[9]), &mut ledger, false);
        client.flush().unwrap();

        let sent = channel.submitted();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].ask.is_empty());
        assert_eq!(sent[0].release, vec![ContainerId(9)]);
    }

    #[test]
    fn test_completions_route_by_exit_status() {
        let (mut client, _, _) = client();
        let mut ledger = ledger_with(8);
        client.emit_worker_request(&mut ledger).unwrap();
        client.apply_response(allocated(&[1, 2]), &mut ledger, false);

        let events = client.apply_response(
            completed(&[(1, EXIT_SUCCESS), (2, EXIT_ABORTED), (50, EXIT_SUCCESS)]),
            &mut ledger,
            false,
        );
        assert_eq!(events[0], ProtocolEvent::WorkerFinished(ContainerId(1)));
        assert!(matches!(events[1], ProtocolEvent::WorkerFailed(s) if s.container_id == ContainerId(2)));
        assert!(matches!(events[2], ProtocolEvent::AmSignal(s) if s.container_id == ContainerId(50)));
        assert_eq!(ledger.finished(), 1);
        assert_eq!(ledger.failed_len(), 1);
        assert!(!ledger.is_assigned(&ContainerId(2)));
    }

    #[test]
    fn test_release_sends_cancel_then_release() {
        let (mut client, channel, _) = client();
        let mut ledger = ledger_with(16);
        client.emit_worker_request(&mut ledger).unwrap();
        client.apply_response(allocated(&[1, 2]), &mut ledger, false);

        let ids = ledger.assigned_ids();
        let scheduled: Vec<WorkUnit> = ledger.scheduled().cloned().collect();
        client.emit_release(scheduled.iter(), ids).unwrap();

        let sent = channel.submitted();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].ask.len(), 1);
        assert_eq!(sent[1].ask[0].num_containers, 0);
        assert!(sent[1].release.is_empty());
        assert!(sent[2].ask.is_empty());
        assert_eq!(sent[2].release, vec![ContainerId(1), ContainerId(2)]);

        let events = client.apply_response(completed(&[(1, EXIT_ABORTED)]), &mut ledger, false);
        assert_eq!(events, vec![ProtocolEvent::ReleaseAcknowledged(ContainerId(1))]);
        assert_eq!(client.releasing().count(), 1);
    }

    #[test]
    fn test_package_requests_groups_by_locality() {
        let mut units = JobDemand::new(8, 4, 4).partition(1024, "/rack-0/node-0", 10);
        units.extend(JobDemand::new(4, 4, 4).partition(1024, "/rack-1/node-8", 10));

        let asks = package_requests(units.iter());
        assert_eq!(asks.len(), 2);
        assert_eq!(asks[0].num_containers, 2);
        assert_eq!(asks[1].resource_name, "/rack-1/node-8");
        assert_eq!(asks[1].num_containers, 1);
    }
}
