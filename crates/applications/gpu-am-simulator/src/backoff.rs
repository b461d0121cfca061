//! Allocating / yielding timeout state machine
//!
//! ```text
//!   Idle ──arm (first batch scheduled)──▶ Allocating(deadline)
//!    ▲                                       │  now > deadline && assigned != total
//!    │ now > deadline                        ▼
//!    └────────────────────────────── Yielding(deadline)
//! ```
//!
//! When the allocating timer fires the driver gives back every held container and
//! waits out the yield interval before asking again. Timers are cooperative: they
//! only move when `evaluate` is called.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BackoffConfig;

/// Current timer state. At most one timer is armed by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffState {
    Idle,
    Allocating { deadline_ms: u64 },
    Yielding { deadline_ms: u64 },
}

/// What the driver must do after an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    None,
    /// Cancel scheduled asks, release assigned containers, reset the ledger
    Release,
    /// Re-arm demand so the next tick starts a new cycle
    Resume,
}

/// Owns the allocating and yielding timeouts of one AM
#[derive(Debug, Clone)]
pub struct BackoffController {
    config: BackoffConfig,
    state: BackoffState,
    /// Allocating timer already armed during the current cycle
    armed_this_cycle: bool,
}

impl BackoffController {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: BackoffState::Idle,
            armed_this_cycle: false,
        }
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Arm the allocating timer. Only once per cycle, only from `Idle`.
    pub fn arm_allocating(&mut self, now_ms: u64) -> bool {
        if !self.config.enabled || self.armed_this_cycle || self.state != BackoffState::Idle {
            return false;
        }
        let deadline_ms = now_ms.saturating_add(self.config.allocate_timeout_ms);
        self.state = BackoffState::Allocating { deadline_ms };
        self.armed_this_cycle = true;
        debug!(deadline_ms, "Armed allocating timeout");
        true
    }

    /// Stop the allocating timer once the whole gang is held
    pub fn disarm(&mut self) {
        if let BackoffState::Allocating { .. } = self.state {
            self.state = BackoffState::Idle;
        }
    }

    /// Advance the state machine to `now_ms`
    pub fn evaluate(&mut self, now_ms: u64, assigned: usize, total: usize, finished: bool) -> BackoffAction {
        if finished {
            return BackoffAction::None;
        }
        match self.state {
            BackoffState::Allocating { deadline_ms } if now_ms > deadline_ms && assigned != total => {
                let deadline_ms = now_ms.saturating_add(self.config.yield_timeout_ms);
                self.state = BackoffState::Yielding { deadline_ms };
                BackoffAction::Release
            }
            BackoffState::Yielding { deadline_ms } if now_ms > deadline_ms => {
                self.state = BackoffState::Idle;
                self.armed_this_cycle = false;
                BackoffAction::Resume
            }
            _ => BackoffAction::None,
        }
    }

    pub fn reset(&mut self) {
        self.state = BackoffState::Idle;
        self.armed_this_cycle = false;
    }
}
