//! Container ledger
//!
//! Tracks every worker unit of the current allocation cycle through its stage:
//!
//! ```text
//! pending ──promote──▶ scheduled ──assign──▶ assigned ──success──▶ finished (counter)
//!                          ▲                     │
//!                          └──promote_failed── failed-pending ◀──failure──┘
//! ```
//!
//! A unit lives in exactly one structure at a time. Every transition happens inside
//! a single method call, so no caller can observe a unit in two places.

use std::collections::{BTreeMap, VecDeque};

use am_core::{AmError, Container, ContainerId, Result, WorkUnit};
use tracing::debug;

/// Bookkeeping of worker containers for one AM instance
#[derive(Debug, Default)]
pub struct ContainerLedger {
    pending: VecDeque<WorkUnit>,
    scheduled: VecDeque<WorkUnit>,
    assigned: BTreeMap<ContainerId, (Container, WorkUnit)>,
    failed_pending: VecDeque<WorkUnit>,
    total: usize,
    finished: usize,
}

impl ContainerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new allocation cycle with `units` as the whole demand
    pub fn begin_cycle(&mut self, units: Vec<WorkUnit>) {
        self.reset();
        self.total = units.len();
        self.pending.extend(units);
    }

    pub fn enqueue_pending(&mut self, units: impl IntoIterator<Item = WorkUnit>) {
        self.pending.extend(units);
    }

    /// Move every pending unit to the back of scheduled, keeping order
    pub fn promote_pending(&mut self) -> usize {
        let moved = self.pending.len();
        self.scheduled.extend(self.pending.drain(..));
        moved
    }

    /// Move every failed unit back to scheduled for resubmission
    pub fn promote_failed(&mut self) -> usize {
        let moved = self.failed_pending.len();
        self.scheduled.extend(self.failed_pending.drain(..));
        moved
    }

    /// Bind the oldest scheduled unit to `container`
    pub fn assign(&mut self, container: Container) -> Result<&WorkUnit> {
        let Some(unit) = self.scheduled.pop_front() else {
            return Err(AmError::protocol(format!(
                "{} allocated with no scheduled request outstanding",
                container.id
            )));
        };
        let id = container.id;
        if self.assigned.contains_key(&id) {
            self.scheduled.push_front(unit);
            return Err(AmError::protocol(format!("{} allocated twice", id)));
        }
        debug!(container_id = %id, unit = unit.index, "Assigned work unit");
        Ok(&self.assigned.entry(id).or_insert((container, unit)).1)
    }

    /// Record a successful exit. `None` when `id` is not a worker of this cycle.
    pub fn complete_success(&mut self, id: &ContainerId) -> Option<WorkUnit> {
        let (_, unit) = self.assigned.remove(id)?;
        self.finished += 1;
        Some(unit)
    }

    /// Record a killed worker and park its unit in failed-pending.
    /// `None` when `id` is not a worker of this cycle.
    pub fn complete_failure(&mut self, id: &ContainerId) -> Option<WorkUnit> {
        let (_, unit) = self.assigned.remove(id)?;
        self.failed_pending.push_back(unit.clone());
        Some(unit)
    }

    /// Drop every unit and zero the counters
    pub fn reset(&mut self) {
        self.pending.clear();
        self.scheduled.clear();
        self.assigned.clear();
        self.failed_pending.clear();
        self.total = 0;
        self.finished = 0;
    }

    pub fn pending(&self) -> impl Iterator<Item = &WorkUnit> {
        self.pending.iter()
    }

    pub fn scheduled(&self) -> impl Iterator<Item = &WorkUnit> {
        self.scheduled.iter()
    }

    pub fn failed(&self) -> impl Iterator<Item = &WorkUnit> {
        self.failed_pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn assigned_len(&self) -> usize {
        self.assigned.len()
    }

    pub fn failed_len(&self) -> usize {
        self.failed_pending.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn finished(&self) -> usize {
        self.finished
    }

    pub fn is_assigned(&self, id: &ContainerId) -> bool {
        self.assigned.contains_key(id)
    }

    /// Assigned containers in container-id order
    pub fn assigned(&self) -> impl Iterator<Item = (&Container, &WorkUnit)> {
        self.assigned.values().map(|(c, u)| (c, u))
    }

    pub fn assigned_ids(&self) -> Vec<ContainerId> {
        self.assigned.keys().copied().collect()
    }

    /// Gang condition: every container of the cycle is held at once
    pub fn is_fully_assigned(&self) -> bool {
        self.total > 0 && self.assigned.len() == self.total
    }

    /// Every unit of the cycle has finished successfully
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.finished == self.total
    }

    /// Units still somewhere in the pipeline plus finished ones
    pub fn accounted(&self) -> usize {
        self.pending.len()
            + self.scheduled.len()
            + self.assigned.len()
            + self.failed_pending.len()
            + self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_core::{NodeId, Priority, Resource};

    fn unit(index: usize) -> WorkUnit {
        WorkUnit {
            index,
            resource: Resource::new(4096, 4, 4),
            priority: Priority::GPU_WORKER,
            locality: "/rack-0/node-0".to_string(),
            duration_ms: 1_000,
        }
    }

    fn container(id: u64) -> Container {
        Container {
            id: ContainerId(id),
            node_id: NodeId::new("node-0"),
            resource: Resource::new(4096, 4, 4),
            priority: Priority::GPU_WORKER,
        }
    }

    fn scheduled_ledger(n: usize) -> ContainerLedger {
        let mut ledger = ContainerLedger::new();
        ledger.begin_cycle((0..n).map(unit).collect());
        ledger.promote_pending();
        ledger
    }

    #[test]
    fn test_promote_preserves_fifo_order() {
        let mut ledger = scheduled_ledger(3);
        assert_eq!(ledger.pending_len(), 0);
        assert_eq!(ledger.scheduled_len(), 3);

        assert_eq!(ledger.assign(container(10)).unwrap().index, 0);
        assert_eq!(ledger.assign(container(11)).unwrap().index, 1);
        assert_eq!(ledger.assign(container(12)).unwrap().index, 2);
    }

    #[test]
    fn test_assign_with_nothing_scheduled_is_violation() {
        let mut ledger = ContainerLedger::new();
        let err = ledger.assign(container(1)).unwrap_err();
        assert!(matches!(err, AmError::ProtocolViolation(_)));
        assert_eq!(ledger.assigned_len(), 0);
    }

    #[test]
    fn test_duplicate_assignment_keeps_unit_scheduled() {
        let mut ledger = scheduled_ledger(2);
        ledger.assign(container(1)).unwrap();

        assert!(ledger.assign(container(1)).is_err());
        assert_eq!(ledger.scheduled_len(), 1);
        assert_eq!(ledger.assigned_len(), 1);
    }

    #[test]
    fn test_conservation_through_lifecycle() {
        let mut ledger = scheduled_ledger(4);
        let check = |l: &ContainerLedger| assert_eq!(l.accounted(), l.total());

        check(&ledger);
        for id in 0..4 {
            ledger.assign(container(id)).unwrap();
            check(&ledger);
        }
        assert!(ledger.is_fully_assigned());

        let mut last_finished = 0;
        for id in 0..4 {
            assert!(ledger.complete_success(&ContainerId(id)).is_some());
            check(&ledger);
            assert!(ledger.finished() > last_finished);
            last_finished = ledger.finished();
        }
        assert!(ledger.is_complete());
        assert_eq!(ledger.assigned_len(), 0);
    }

    #[test]
    fn test_unknown_completion_returns_none() {
        let mut ledger = scheduled_ledger(1);
        ledger.assign(container(5)).unwrap();

        assert!(ledger.complete_success(&ContainerId(99)).is_none());
        assert!(ledger.complete_failure(&ContainerId(99)).is_none());
        assert_eq!(ledger.finished(), 0);
        assert_eq!(ledger.assigned_len(), 1);
    }

    #[test]
    fn test_failure_moves_unit_to_failed_pending() {
        let mut ledger = scheduled_ledger(2);
        ledger.assign(container(1)).unwrap();
        ledger.assign(container(2)).unwrap();

        let failed = ledger.complete_failure(&ContainerId(1)).unwrap();
        assert_eq!(failed.index, 0);
        assert_eq!(ledger.failed_len(), 1);
        assert!(!ledger.is_assigned(&ContainerId(1)));
        assert_eq!(ledger.accounted(), ledger.total());

        assert_eq!(ledger.promote_failed(), 1);
        assert_eq!(ledger.failed_len(), 0);
        assert_eq!(ledger.assign(container(3)).unwrap().index, 0);
        assert!(ledger.is_fully_assigned());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut ledger = scheduled_ledger(3);
        ledger.assign(container(1)).unwrap();
        ledger.complete_failure(&ContainerId(1));
        ledger.enqueue_pending(vec![unit(7)]);

        ledger.reset();
        assert_eq!(ledger.pending_len(), 0);
        assert_eq!(ledger.scheduled_len(), 0);
        assert_eq!(ledger.assigned_len(), 0);
        assert_eq!(ledger.failed_len(), 0);
        assert_eq!(ledger.total(), 0);
        assert_eq!(ledger.finished(), 0);
        assert!(!ledger.is_complete());
    }
}
