//! Instance lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle of one interpreter instance.
///
/// Transitions only move forward: `Live` → `Exiting` → `Dead`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    #[default]
    Live,
    Exiting,
    Dead,
}

impl InstanceState {
    fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Live, Self::Exiting) | (Self::Exiting, Self::Dead)
        )
    }
}

/// Tracks the lifecycle state of an instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceStateMachine {
    state: InstanceState,
}

impl InstanceStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Move to `new_state`. Returns false, leaving the state untouched, if the
    /// transition would go backwards or repeat.
    pub fn transition(&mut self, new_state: InstanceState) -> bool {
        if !self.state.can_transition(new_state) {
            tracing::trace!(from = ?self.state, to = ?new_state, "Rejected state transition");
            return false;
        }
        tracing::debug!(from = ?self.state, to = ?new_state, "State transition");
        self.state = new_state;
        true
    }
}
