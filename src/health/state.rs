//! Backend health state machine.
//!
//! # States
//! - Up: backend receives traffic
//! - Down: backend excluded from load balancing (initial state)
//!
//! # State Transitions
//! ```text
//! Down → Up:   consecutive successes >= up threshold
//! Up   → Down: consecutive failures  >= down threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - Counters reset on state transition
//! - Owned by a single check task, so plain integers suffice

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Up,
    Down,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Up => write!(f, "UP"),
            HealthState::Down => write!(f, "DOWN"),
        }
    }
}

/// Consecutive-result counter for one backend.
#[derive(Debug, Clone)]
pub struct CheckState {
    state: HealthState,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl CheckState {
    pub fn new(initial: HealthState) -> Self {
        Self {
            state: initial,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Feed one probe result. Returns the new state when it changed.
    pub fn record(&mut self, success: bool, up: u32, down: u32) -> Option<HealthState> {
        if success {
            self.consecutive_failures = 0;
            if self.state == HealthState::Up {
                return None;
            }
            self.consecutive_successes += 1;
            if self.consecutive_successes >= up {
                self.consecutive_successes = 0;
                self.state = HealthState::Up;
                return Some(HealthState::Up);
            }
        } else {
            self.consecutive_successes = 0;
            if self.state == HealthState::Down {
                return None;
            }
            self.consecutive_failures += 1;
            if self.consecutive_failures >= down {
                self.consecutive_failures = 0;
                self.state = HealthState::Down;
                return Some(HealthState::Down);
            }
        }
        None
    }
}

impl Default for CheckState {
    fn default() -> Self {
        Self::new(HealthState::Down)
    }
}
