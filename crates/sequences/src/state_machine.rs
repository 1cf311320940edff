use serde::{Deserialize, Serialize};
use studio_core::{StudioError, StudioResult};

use crate::types::EnrollmentStatus;

/// Describes a single valid state transition for an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: String,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// state transitions.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    pub state: EnrollmentStatus,
    pub transitions: Vec<StateTransition>,
}

impl EnrollmentStateMachine {
    /// Creates a state machine positioned at `state` with all valid
    /// transitions pre-configured.
    pub fn new(state: EnrollmentStatus) -> Self {
        let transitions = vec![
            // Active ->
            StateTransition {
                from: EnrollmentStatus::Active,
                to: EnrollmentStatus::Completed,
                trigger: "sequence_complete".to_string(),
            },
            StateTransition {
                from: EnrollmentStatus::Active,
                to: EnrollmentStatus::Unsubscribed,
                trigger: "unsubscribe".to_string(),
            },
            StateTransition {
                from: EnrollmentStatus::Active,
                to: EnrollmentStatus::NeedsAttention,
                trigger: "retries_exhausted".to_string(),
            },
            // NeedsAttention ->
            StateTransition {
                from: EnrollmentStatus::NeedsAttention,
                to: EnrollmentStatus::Active,
                trigger: "manual_resume".to_string(),
            },
            StateTransition {
                from: EnrollmentStatus::NeedsAttention,
                to: EnrollmentStatus::Unsubscribed,
                trigger: "unsubscribe".to_string(),
            },
        ];

        Self { state, transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &EnrollmentStatus, to: &EnrollmentStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Attempts to move the state machine to `to`.
    pub fn transition(&mut self, to: EnrollmentStatus) -> StudioResult<()> {
        if self.can_transition(&self.state, &to) {
            self.state = to;
            Ok(())
        } else {
            Err(StudioError::Conflict(format!(
                "invalid enrollment transition from {:?} to {:?}",
                self.state, to
            )))
        }
    }
}

/// Validate a single transition without keeping a machine around.
pub fn ensure_transition(from: EnrollmentStatus, to: EnrollmentStatus) -> StudioResult<()> {
    EnrollmentStateMachine::new(from).transition(to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        let machine = EnrollmentStateMachine::new(EnrollmentStatus::Completed);
        assert!(!machine.can_transition(&EnrollmentStatus::Completed, &EnrollmentStatus::Active));
        assert!(ensure_transition(EnrollmentStatus::Unsubscribed, EnrollmentStatus::Active).is_err());
        assert!(
            ensure_transition(EnrollmentStatus::Completed, EnrollmentStatus::Unsubscribed).is_err()
        );
    }

    #[test]
    fn test_needs_attention_round_trip() {
        let mut machine = EnrollmentStateMachine::new(EnrollmentStatus::Active);
        machine.transition(EnrollmentStatus::NeedsAttention).unwrap();
        machine.transition(EnrollmentStatus::Active).unwrap();
        machine.transition(EnrollmentStatus::Completed).unwrap();
        assert_eq!(machine.state, EnrollmentStatus::Completed);
    }
}
