//! In-memory cluster standing in for the resource manager
//!
//! Racks of identical GPU nodes. AMs submit requests through one bounded intake
//! channel and read responses from a channel of their own; host effects arrive on
//! an unbounded channel. Nothing blocks and no runtime is needed.
//!
//! `tick` processes everything that arrived since the previous tick:
//!
//! 1. **Host effects**: placement, relaunch, cleanup
//! 2. **Submissions**: token check, ask bookkeeping, releases
//! 3. **Expiry**: workers whose lifetime ran out complete successfully
//! 4. **Grants**: outstanding asks in arrival order, at most `grants_per_tick`
//! 5. **Dispatch**: one response per application with news

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use am_core::{
    AllocateRequest, AllocateResponse, AmError, AmToken, ApplicationId, Container, ContainerId,
    ContainerStatus, CredentialProvider, HostPlacementSink, Lease, LocalityProvider, NodeGroup,
    NodeId, Resource, ResourceRequest, Result, SchedulerChannel, ShapeDescriptor, ANY,
    EXIT_ABORTED, EXIT_PREEMPTED, EXIT_SUCCESS,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_GPU_MEMORY_MB;
use crate::driver::AmCollaborators;

/// Shape and pacing of the in-memory cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub racks: usize,
    pub nodes_per_rack: usize,
    pub gpus_per_node: u32,
    pub memory_mb_per_node: u64,
    pub vcores_per_node: u32,

    /// Containers handed out per tick across all applications
    pub grants_per_tick: usize,

    /// Capacity of the shared request intake channel
    pub channel_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            racks: 2,
            nodes_per_rack: 4,
            gpus_per_node: 8,
            // every GPU at full memory, plus room for AM containers
            memory_mb_per_node: 8 * DEFAULT_GPU_MEMORY_MB + 8 * 1024,
            vcores_per_node: 64,
            grants_per_tick: 16,
            channel_capacity: 256,
        }
    }
}

impl ClusterConfig {
    pub fn with_topology(mut self, racks: usize, nodes_per_rack: usize) -> Self {
        self.racks = racks;
        self.nodes_per_rack = nodes_per_rack;
        self
    }

    pub fn with_grants_per_tick(mut self, grants: usize) -> Self {
        self.grants_per_tick = grants;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn total_gpus(&self) -> u32 {
        (self.racks * self.nodes_per_rack) as u32 * self.gpus_per_node
    }

    pub fn validate(&self) -> Result<()> {
        if self.racks == 0 || self.nodes_per_rack == 0 {
            return Err(AmError::config("cluster needs at least one rack and one node per rack"));
        }
        if self.gpus_per_node == 0 {
            return Err(AmError::config("gpus_per_node must be greater than zero"));
        }
        if self.grants_per_tick == 0 {
            return Err(AmError::config("grants_per_tick must be greater than zero"));
        }
        if self.channel_capacity == 0 {
            return Err(AmError::config("channel_capacity must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct NodeState {
    id: NodeId,
    rack: String,
    capacity: Resource,
    used: Resource,
}

impl NodeState {
    fn fits(&self, r: &Resource) -> bool {
        self.used.memory_mb + r.memory_mb <= self.capacity.memory_mb
            && self.used.vcores + r.vcores <= self.capacity.vcores
            && self.used.gpus + r.gpus <= self.capacity.gpus
    }

    fn reserve(&mut self, r: &Resource) {
        self.used.memory_mb += r.memory_mb;
        self.used.vcores += r.vcores;
        self.used.gpus += r.gpus;
    }

    fn free(&mut self, r: &Resource) {
        self.used.memory_mb = self.used.memory_mb.saturating_sub(r.memory_mb);
        self.used.vcores = self.used.vcores.saturating_sub(r.vcores);
        self.used.gpus = self.used.gpus.saturating_sub(r.gpus);
    }

    fn free_gpus(&self) -> u32 {
        self.capacity.gpus - self.used.gpus
    }
}

type Topology = Arc<RwLock<Vec<NodeState>>>;

fn read_nodes(topology: &Topology) -> RwLockReadGuard<'_, Vec<NodeState>> {
    topology.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_nodes(topology: &Topology) -> RwLockWriteGuard<'_, Vec<NodeState>> {
    topology.write().unwrap_or_else(PoisonError::into_inner)
}

/// Split `/<domain>/<n1,n2>` into its domain and node list
fn parse_locality(name: &str) -> Option<(&str, Vec<&str>)> {
    let rest = name.strip_prefix('/')?;
    let (domain, nodes) = rest.split_once('/').unwrap_or((rest, ""));
    Some((domain, nodes.split(',').filter(|n| !n.is_empty()).collect()))
}

/// Allocate request on its way through the intake channel
#[derive(Debug, Clone)]
pub struct Submission {
    pub app_id: ApplicationId,
    pub token: AmToken,
    pub request: AllocateRequest,
}

/// Effect an AM fires at the hosts
#[derive(Debug, Clone, PartialEq)]
pub enum HostEffect {
    Add { container_id: ContainerId, lease: Lease },
    Relaunch { container_id: ContainerId, lifetime_ms: u64, start_ms: u64 },
    Cleanup { container_id: ContainerId },
}

/// Scheduler channel of one application
pub struct ClusterChannel {
    app_id: ApplicationId,
    intake: mpsc::Sender<Submission>,
    responses: mpsc::UnboundedReceiver<AllocateResponse>,
}

impl SchedulerChannel for ClusterChannel {
    fn submit(&mut self, token: &AmToken, request: AllocateRequest) -> Result<()> {
        let submission = Submission {
            app_id: self.app_id,
            token: token.clone(),
            request,
        };
        self.intake.try_send(submission).map_err(|e| match e {
            TrySendError::Full(_) => AmError::ChannelFull,
            TrySendError::Closed(_) => AmError::ChannelClosed,
        })
    }

    fn poll(&mut self) -> Option<AllocateResponse> {
        self.responses.try_recv().ok()
    }
}

/// Host sink forwarding effects to the cluster
pub struct ClusterHosts {
    effects: mpsc::UnboundedSender<HostEffect>,
}

impl ClusterHosts {
    fn emit(&self, effect: HostEffect) {
        if self.effects.send(effect).is_err() {
            warn!("Cluster is gone, dropping host effect");
        }
    }
}

impl HostPlacementSink for ClusterHosts {
    fn add_container(&mut self, container: &Container, lease: Lease) {
        self.emit(HostEffect::Add {
            container_id: container.id,
            lease,
        });
    }

    fn relaunch_container(&mut self, container: &Container, lifetime_ms: u64, start_ms: u64) {
        self.emit(HostEffect::Relaunch {
            container_id: container.id,
            lifetime_ms,
            start_ms,
        });
    }

    fn cleanup_container(&mut self, container_id: &ContainerId) {
        self.emit(HostEffect::Cleanup {
            container_id: *container_id,
        });
    }
}

/// Picks the rack with the most free GPUs
pub struct TopologyLocality {
    topology: Topology,
    gpus_per_node: u32,
}

impl LocalityProvider for TopologyLocality {
    fn best_nodes(&self, shape: &ShapeDescriptor) -> NodeGroup {
        let nodes = read_nodes(&self.topology);
        let per_container = shape.gpus_per_container.min(self.gpus_per_node).max(1);

        let mut free_by_rack: BTreeMap<&str, u32> = BTreeMap::new();
        for node in nodes.iter() {
            *free_by_rack.entry(node.rack.as_str()).or_default() += node.free_gpus();
        }
        // ties go to the lowest rack name
        let rack = free_by_rack
            .iter()
            .max_by_key(|(name, free)| (**free, Reverse(**name)))
            .map(|(name, _)| name.to_string())
            .unwrap_or_default();

        // whole rack; grants inside it are first-fit
        let chosen: Vec<String> = nodes
            .iter()
            .filter(|n| n.rack == rack)
            .map(|n| n.id.0.clone())
            .collect();

        NodeGroup {
            connectivity_domain: rack,
            nodes: chosen,
            gpus_per_container: per_container,
        }
    }
}

/// Tokens issued by the cluster, one per registered application
#[derive(Debug, Default)]
pub struct StaticCredentials {
    tokens: RwLock<BTreeMap<ApplicationId, AmToken>>,
}

impl StaticCredentials {
    pub fn issue(&self, app_id: ApplicationId) -> AmToken {
        let token = AmToken::new(format!("am-token-{}", app_id));
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app_id, token.clone());
        token
    }

    pub fn revoke(&self, app_id: &ApplicationId) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(app_id);
    }
}

impl CredentialProvider for StaticCredentials {
    fn token(&self, app_id: &ApplicationId) -> Option<AmToken> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_id)
            .cloned()
    }
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub granted: u64,
    pub released: u64,
    pub completed: u64,
    pub preempted: u64,
    pub rejected_requests: u64,
}

struct AppState {
    responder: mpsc::UnboundedSender<AllocateResponse>,
    outgoing: AllocateResponse,
}

#[derive(Debug, Clone)]
struct OutstandingAsk {
    app_id: ApplicationId,
    request: ResourceRequest,
}

#[derive(Debug, Clone)]
struct LiveContainer {
    app_id: ApplicationId,
    container: Container,
    node: usize,
    lease: Option<Lease>,
    ends_at_ms: Option<u64>,
}

/// The resource manager, node managers and credential store in one place
pub struct InMemoryCluster {
    config: ClusterConfig,
    topology: Topology,
    credentials: Arc<StaticCredentials>,
    intake_tx: mpsc::Sender<Submission>,
    intake_rx: mpsc::Receiver<Submission>,
    effects_tx: mpsc::UnboundedSender<HostEffect>,
    effects_rx: mpsc::UnboundedReceiver<HostEffect>,
    apps: BTreeMap<ApplicationId, AppState>,
    asks: Vec<OutstandingAsk>,
    containers: BTreeMap<ContainerId, LiveContainer>,
    next_container_id: u64,
    stats: ClusterStats,
}

impl InMemoryCluster {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;

        let capacity = Resource::new(config.memory_mb_per_node, config.vcores_per_node, config.gpus_per_node);
        let per_rack = config.nodes_per_rack;
        let nodes: Vec<NodeState> = (0..config.racks)
            .flat_map(|rack| {
                (0..per_rack).map(move |n| NodeState {
                    id: NodeId::new(format!("node-{}", rack * per_rack + n)),
                    rack: format!("rack-{}", rack),
                    capacity,
                    used: Resource::new(0, 0, 0),
                })
            })
            .collect();

        info!(
            racks = config.racks,
            nodes = nodes.len(),
            gpus = config.total_gpus(),
            "Initialized in-memory cluster"
        );

        let (intake_tx, intake_rx) = mpsc::channel(config.channel_capacity);
        let (effects_tx, effects_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            topology: Arc::new(RwLock::new(nodes)),
            credentials: Arc::new(StaticCredentials::default()),
            intake_tx,
            intake_rx,
            effects_tx,
            effects_rx,
            apps: BTreeMap::new(),
            asks: Vec::new(),
            containers: BTreeMap::new(),
            next_container_id: 1,
            stats: ClusterStats::default(),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    pub fn credentials(&self) -> Arc<StaticCredentials> {
        Arc::clone(&self.credentials)
    }

    /// Admit an application and hand back everything its AM talks to
    pub fn register(&mut self, app_id: ApplicationId) -> AmCollaborators {
        self.credentials.issue(app_id);
        let (responder, responses) = mpsc::unbounded_channel();
        self.apps.insert(
            app_id,
            AppState {
                responder,
                outgoing: AllocateResponse::default(),
            },
        );
        debug!(app_id = %app_id, "Registered application");

        AmCollaborators {
            channel: Box::new(ClusterChannel {
                app_id,
                intake: self.intake_tx.clone(),
                responses,
            }),
            credentials: self.credentials(),
            locality: Box::new(TopologyLocality {
                topology: Arc::clone(&self.topology),
                gpus_per_node: self.config.gpus_per_node,
            }),
            hosts: Box::new(ClusterHosts {
                effects: self.effects_tx.clone(),
            }),
        }
    }

    /// Forget an application and free whatever it still holds
    pub fn deregister(&mut self, app_id: &ApplicationId) {
        let held: Vec<ContainerId> = self
            .containers
            .iter()
            .filter(|(_, c)| c.app_id == *app_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &held {
            if let Some(live) = self.containers.remove(id) {
                write_nodes(&self.topology)[live.node].free(&live.container.resource);
            }
        }
        self.asks.retain(|a| a.app_id != *app_id);
        self.apps.remove(app_id);
        self.credentials.revoke(app_id);
        debug!(app_id = %app_id, freed = held.len(), "Deregistered application");
    }

    /// Run one scheduling round
    pub fn tick(&mut self, now_ms: u64) {
        self.apply_host_effects(now_ms);
        self.apply_submissions();
        self.expire_workers(now_ms);
        self.grant();
        self.dispatch_responses();
    }

    /// Kill a running container and report it as preempted
    pub fn preempt(&mut self, container_id: &ContainerId) -> bool {
        let preempted = self.complete(container_id, EXIT_PREEMPTED);
        if preempted {
            self.stats.preempted += 1;
            info!(container_id = %container_id, "Preempted container");
        }
        preempted
    }

    pub fn free_gpus(&self) -> u32 {
        read_nodes(&self.topology).iter().map(NodeState::free_gpus).sum()
    }

    pub fn running_containers(&self) -> usize {
        self.containers.len()
    }

    /// Containers currently held by `app_id`, in id order
    pub fn containers_of(&self, app_id: &ApplicationId) -> Vec<ContainerId> {
        self.containers
            .iter()
            .filter(|(_, c)| c.app_id == *app_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Containers still wanted across all outstanding asks
    pub fn outstanding_asks(&self) -> u32 {
        self.asks.iter().map(|a| a.request.num_containers).sum()
    }

    fn apply_host_effects(&mut self, now_ms: u64) {
        while let Ok(effect) = self.effects_rx.try_recv() {
            match effect {
                HostEffect::Add { container_id, lease } => match self.containers.get_mut(&container_id) {
                    Some(live) => live.lease = Some(lease),
                    None => debug!(container_id = %container_id, "Placement for unknown container"),
                },
                HostEffect::Relaunch {
                    container_id,
                    lifetime_ms,
                    start_ms,
                } => match self.containers.get_mut(&container_id) {
                    Some(live) => live.ends_at_ms = Some(start_ms.max(now_ms) + lifetime_ms),
                    None => debug!(container_id = %container_id, "Relaunch for unknown container"),
                },
                HostEffect::Cleanup { container_id } => {
                    self.complete(&container_id, EXIT_SUCCESS);
                }
            }
        }
    }

    fn apply_submissions(&mut self) {
        while let Ok(submission) = self.intake_rx.try_recv() {
            let Submission {
                app_id,
                token,
                request,
            } = submission;

            if !self.apps.contains_key(&app_id) || self.credentials.token(&app_id) != Some(token) {
                warn!(app_id = %app_id, "Rejecting request with invalid token");
                self.stats.rejected_requests += 1;
                continue;
            }

            for ask in request.ask {
                self.upsert_ask(app_id, ask);
            }
            for id in request.release {
                match self.containers.get(&id) {
                    Some(live) if live.app_id == app_id => {
                        self.complete(&id, EXIT_ABORTED);
                        self.stats.released += 1;
                    }
                    _ => warn!(app_id = %app_id, container_id = %id, "Release of container not held"),
                }
            }
        }
    }

    /// An ask replaces the outstanding count for the same shape; zero cancels
    fn upsert_ask(&mut self, app_id: ApplicationId, ask: ResourceRequest) {
        let existing = self.asks.iter().position(|a| {
            a.app_id == app_id
                && a.request.priority == ask.priority
                && a.request.resource_name == ask.resource_name
                && a.request.capability == ask.capability
        });
        match (existing, ask.num_containers) {
            (Some(i), 0) => {
                self.asks.remove(i);
            }
            (Some(i), n) => self.asks[i].request.num_containers = n,
            (None, 0) => {}
            (None, _) => self.asks.push(OutstandingAsk { app_id, request: ask }),
        }
    }

    fn expire_workers(&mut self, now_ms: u64) {
        let expired: Vec<ContainerId> = self
            .containers
            .iter()
            .filter(|(_, c)| c.ends_at_ms.is_some_and(|end| end <= now_ms))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.complete(&id, EXIT_SUCCESS);
        }
    }

    fn grant(&mut self) {
        let mut budget = self.config.grants_per_tick;
        let mut i = 0;
        while budget > 0 && i < self.asks.len() {
            let Some(node) = self.find_node(&self.asks[i].request) else {
                i += 1;
                continue;
            };
            let app_id = self.asks[i].app_id;
            let request = self.asks[i].request.clone();
            self.allocate(app_id, &request, node);
            budget -= 1;

            self.asks[i].request.num_containers -= 1;
            if self.asks[i].request.num_containers == 0 {
                self.asks.remove(i);
            }
        }
    }

    fn find_node(&self, request: &ResourceRequest) -> Option<usize> {
        let nodes = read_nodes(&self.topology);
        let wanted = if request.resource_name == ANY {
            None
        } else {
            Some(parse_locality(&request.resource_name)?)
        };

        nodes.iter().position(|node| {
            let in_place = match &wanted {
                None => true,
                Some((domain, names)) => {
                    node.rack == *domain && (names.is_empty() || names.contains(&node.id.0.as_str()))
                }
            };
            in_place && node.fits(&request.capability)
        })
    }

    fn allocate(&mut self, app_id: ApplicationId, request: &ResourceRequest, node: usize) {
        let node_id = {
            let mut nodes = write_nodes(&self.topology);
            nodes[node].reserve(&request.capability);
            nodes[node].id.clone()
        };
        let container = Container {
            id: ContainerId(self.next_container_id),
            node_id,
            resource: request.capability,
            priority: request.priority,
        };
        self.next_container_id += 1;
        self.stats.granted += 1;

        debug!(app_id = %app_id, container_id = %container.id, node = %container.node_id.0, "Granted container");
        if let Some(app) = self.apps.get_mut(&app_id) {
            app.outgoing.allocated_containers.push(container.clone());
        }
        self.containers.insert(
            container.id,
            LiveContainer {
                app_id,
                container,
                node,
                lease: None,
                ends_at_ms: None,
            },
        );
    }

    /// Stop a container, free its node and queue its completion for the owner
    fn complete(&mut self, id: &ContainerId, exit_status: i32) -> bool {
        let Some(live) = self.containers.remove(id) else {
            return false;
        };
        write_nodes(&self.topology)[live.node].free(&live.container.resource);
        self.stats.completed += 1;
        debug!(
            app_id = %live.app_id,
            container_id = %id,
            exit_status,
            lease = ?live.lease,
            "Container completed"
        );
        if let Some(app) = self.apps.get_mut(&live.app_id) {
            app.outgoing
                .completed_container_statuses
                .push(ContainerStatus::new(*id, exit_status));
        }
        true
    }

    fn dispatch_responses(&mut self) {
        for (app_id, app) in self.apps.iter_mut() {
            if app.outgoing.is_empty() {
                continue;
            }
            let response = std::mem::take(&mut app.outgoing);
            if app.responder.send(response).is_err() {
                debug!(app_id = %app_id, "AM dropped its channel");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_core::Priority;

    fn gpu_ask(resource_name: &str, count: u32) -> ResourceRequest {
        ResourceRequest {
            capability: Resource::new(4 * DEFAULT_GPU_MEMORY_MB, 4, 4),
            resource_name: resource_name.to_string(),
            priority: Priority::GPU_WORKER,
            num_containers: count,
        }
    }

    fn ask_request(asks: Vec<ResourceRequest>) -> AllocateRequest {
        AllocateRequest {
            ask: asks,
            ..Default::default()
        }
    }

    fn submit(collab: &mut AmCollaborators, app_id: ApplicationId, request: AllocateRequest) {
        let token = collab.credentials.token(&app_id).unwrap();
        collab.channel.submit(&token, request).unwrap();
    }

    fn small_cluster(grants: usize) -> InMemoryCluster {
        InMemoryCluster::new(ClusterConfig::default().with_topology(1, 2).with_grants_per_tick(grants)).unwrap()
    }

    #[test]
    fn test_cluster_config_validation() {
        assert!(ClusterConfig::default().validate().is_ok());
        assert_eq!(ClusterConfig::default().total_gpus(), 64);
        assert!(ClusterConfig::default().with_channel_capacity(0).validate().is_err());
        assert!(InMemoryCluster::new(ClusterConfig::default().with_topology(0, 4)).is_err());
    }

    #[test]
    fn test_grants_are_fifo_and_bounded() {
        let mut cluster = small_cluster(2);
        let (a, b) = (ApplicationId(1), ApplicationId(2));
        let mut first = cluster.register(a);
        let mut second = cluster.register(b);

        submit(&mut first, a, ask_request(vec![gpu_ask(ANY, 3)]));
        submit(&mut second, b, ask_request(vec![gpu_ask(ANY, 1)]));

        cluster.tick(0);
        assert_eq!(first.channel.poll().unwrap().allocated_containers.len(), 2);
        assert!(second.channel.poll().is_none());

        cluster.tick(1);
        assert_eq!(first.channel.poll().unwrap().allocated_containers.len(), 1);
        assert_eq!(second.channel.poll().unwrap().allocated_containers.len(), 1);
        assert_eq!(cluster.outstanding_asks(), 0);
        assert_eq!(cluster.free_gpus(), 0);
    }

    #[test]
    fn test_invalid_token_is_rejected() {
        let mut cluster = small_cluster(4);
        let app = ApplicationId(1);
        let mut collab = cluster.register(app);

        collab
            .channel
            .submit(&AmToken::new("forged"), ask_request(vec![gpu_ask(ANY, 1)]))
            .unwrap();
        cluster.tick(0);

        assert_eq!(cluster.stats().rejected_requests, 1);
        assert_eq!(cluster.stats().granted, 0);
        assert!(collab.channel.poll().is_none());
    }

    #[test]
    fn test_full_intake_is_retryable() {
        let mut cluster =
            InMemoryCluster::new(ClusterConfig::default().with_channel_capacity(1)).unwrap();
        let app = ApplicationId(1);
        let mut collab = cluster.register(app);
        let token = collab.credentials.token(&app).unwrap();

        collab.channel.submit(&token, AllocateRequest::default()).unwrap();
        let err = collab.channel.submit(&token, AllocateRequest::default()).unwrap_err();
        assert_eq!(err, AmError::ChannelFull);
        assert!(err.is_retryable());

        cluster.tick(0);
        assert!(collab.channel.submit(&token, AllocateRequest::default()).is_ok());
    }

    #[test]
    fn test_release_reports_aborted_and_frees_capacity() {
        let mut cluster = small_cluster(4);
        let app = ApplicationId(1);
        let mut collab = cluster.register(app);

        submit(&mut collab, app, ask_request(vec![gpu_ask(ANY, 2)]));
        cluster.tick(0);
        let granted = collab.channel.poll().unwrap().allocated_containers;
        assert_eq!(cluster.free_gpus(), 8);

        submit(
            &mut collab,
            app,
            AllocateRequest {
                release: granted.iter().map(|c| c.id).collect(),
                ..Default::default()
            },
        );
        cluster.tick(1);

        let response = collab.channel.poll().unwrap();
        assert_eq!(response.completed_container_statuses.len(), 2);
        assert!(response
            .completed_container_statuses
            .iter()
            .all(|s| s.exit_status == EXIT_ABORTED));
        assert_eq!(cluster.free_gpus(), 16);
        assert_eq!(cluster.stats().released, 2);
    }

    #[test]
    fn test_relaunched_worker_expires_with_success() {
        let mut cluster = small_cluster(4);
        let app = ApplicationId(1);
        let mut collab = cluster.register(app);

        submit(&mut collab, app, ask_request(vec![gpu_ask(ANY, 1)]));
        cluster.tick(0);
        let container = collab.channel.poll().unwrap().allocated_containers.remove(0);

        collab.hosts.add_container(&container, Lease::Reserved);
        collab.hosts.relaunch_container(&container, 500, 10);
        cluster.tick(10);
        assert_eq!(cluster.running_containers(), 1);

        cluster.tick(509);
        assert!(collab.channel.poll().is_none());
        cluster.tick(510);
        let statuses = collab.channel.poll().unwrap().completed_container_statuses;
        assert_eq!(statuses, vec![ContainerStatus::new(container.id, EXIT_SUCCESS)]);
        assert_eq!(cluster.running_containers(), 0);
    }

    #[test]
    fn test_cleanup_reports_success() {
        let mut cluster = small_cluster(4);
        let app = ApplicationId(1);
        let mut collab = cluster.register(app);

        submit(&mut collab, app, ask_request(vec![gpu_ask(ANY, 1)]));
        cluster.tick(0);
        let container = collab.channel.poll().unwrap().allocated_containers.remove(0);

        collab.hosts.cleanup_container(&container.id);
        cluster.tick(1);
        let statuses = collab.channel.poll().unwrap().completed_container_statuses;
        assert!(statuses[0].is_success());
    }

    #[test]
    fn test_zero_count_ask_cancels() {
        let mut cluster = small_cluster(1);
        let app = ApplicationId(1);
        let mut collab = cluster.register(app);

        submit(&mut collab, app, ask_request(vec![gpu_ask(ANY, 3)]));
        cluster.tick(0);
        assert_eq!(cluster.outstanding_asks(), 2);

        submit(&mut collab, app, ask_request(vec![gpu_ask(ANY, 0)]));
        cluster.tick(1);
        assert_eq!(cluster.outstanding_asks(), 0);
        assert_eq!(cluster.stats().granted, 1);
    }

    #[test]
    fn test_locality_picks_freest_rack_and_grants_stay_there() {
        let mut cluster =
            InMemoryCluster::new(ClusterConfig::default().with_topology(2, 1)).unwrap();
        let (a, b) = (ApplicationId(1), ApplicationId(2));
        let mut first = cluster.register(a);
        let mut second = cluster.register(b);

        submit(&mut first, a, ask_request(vec![gpu_ask("/rack-0/node-0", 1)]));
        cluster.tick(0);
        assert_eq!(first.channel.poll().unwrap().allocated_containers[0].node_id, NodeId::new("node-0"));

        let hint = second.locality.best_nodes(&ShapeDescriptor::any_connected(4));
        assert_eq!(hint.connectivity_domain, "rack-1");
        assert_eq!(hint.nodes, vec!["node-1".to_string()]);
        assert_eq!(hint.locality(), "/rack-1/node-1");

        submit(&mut second, b, ask_request(vec![gpu_ask(&hint.locality(), 3)]));
        cluster.tick(1);
        let granted = second.channel.poll().unwrap().allocated_containers;
        assert_eq!(granted.len(), 2);
        assert!(granted.iter().all(|c| c.node_id == NodeId::new("node-1")));
        assert_eq!(cluster.outstanding_asks(), 1);
    }

    #[test]
    fn test_preempt_reports_preempted() {
        let mut cluster = small_cluster(4);
        let app = ApplicationId(1);
        let mut collab = cluster.register(app);

        submit(&mut collab, app, ask_request(vec![gpu_ask(ANY, 1)]));
        cluster.tick(0);
        let container = collab.channel.poll().unwrap().allocated_containers.remove(0);

        assert!(cluster.preempt(&container.id));
        assert!(!cluster.preempt(&container.id));
        cluster.tick(1);
        let statuses = collab.channel.poll().unwrap().completed_container_statuses;
        assert_eq!(statuses[0].exit_status, EXIT_PREEMPTED);
        assert_eq!(cluster.stats().preempted, 1);
    }

    #[test]
    fn test_deregister_frees_everything() {
        let mut cluster = small_cluster(4);
        let app = ApplicationId(1);
        let mut collab = cluster.register(app);

        submit(&mut collab, app, ask_request(vec![gpu_ask(ANY, 3)]));
        cluster.tick(0);
        assert_eq!(cluster.containers_of(&app).len(), 3);

        cluster.deregister(&app);
        assert_eq!(cluster.free_gpus(), 16);
        assert!(cluster.containers_of(&app).is_empty());
        assert!(collab.credentials.token(&app).is_none());
    }

    #[test]
    fn test_parse_locality() {
        assert_eq!(parse_locality("/rack-1/node-4,node-5"), Some(("rack-1", vec!["node-4", "node-5"])));
        assert_eq!(parse_locality("/rack-1"), Some(("rack-1", vec![])));
        assert_eq!(parse_locality("*"), None);
    }
}
