//! Forward-only state machine over [`StoryStatus`], with the two
//! controlled back-edges from `Verifying`: `(verifying, coding) ->
//! iterate` and `(verifying, designing) -> restart`.
//! `StateMachine::transition` is a pure check — the caller performs the
//! actual status write.

use crate::error::OpdError;
use crate::model::StoryStatus;

/// The rollback action implied by a `Verifying -> {Coding, Designing}`
/// transition, surfaced so the orchestrator can record *why* a round was
/// reopened. `None` for every other transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutAction {
    None,
    Iterate,
    Restart,
}

fn successors(status: StoryStatus) -> &'static [StoryStatus] {
    use StoryStatus::*;
    match status {
        Preparing => &[Clarifying],
        Clarifying => &[Planning],
        Planning => &[Designing],
        Designing => &[Coding],
        Coding => &[Verifying],
        Verifying => &[Done, Coding, Designing],
        Done => &[],
    }
}

/// Validates Story status transitions. Stateless — safe to share behind
/// an `Arc` or construct fresh per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct StateMachine;

impl StateMachine {
    pub fn new() -> Self {
        StateMachine
    }

    pub fn can_transition(&self, from: StoryStatus, to: StoryStatus) -> bool {
        successors(from).contains(&to)
    }

    /// Returns the set of statuses reachable from `status` in one step.
    pub fn available_transitions(&self, status: StoryStatus) -> Vec<StoryStatus> {
        successors(status).to_vec()
    }

    /// Validate (but do not apply) a transition. Returns the implied
    /// rollback action on success, or `InvalidTransition` otherwise.
    pub fn transition(
        &self,
        from: StoryStatus,
        to: StoryStatus,
    ) -> Result<RolloutAction, OpdError> {
        if !self.can_transition(from, to) {
            return Err(OpdError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let action = match (from, to) {
            (StoryStatus::Verifying, StoryStatus::Coding) => RolloutAction::Iterate,
            (StoryStatus::Verifying, StoryStatus::Designing) => RolloutAction::Restart,
            _ => RolloutAction::None,
        };
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StoryStatus::*;

    #[test]
    fn happy_path_forward() {
        let sm = StateMachine::new();
        let path = [
            (Preparing, Clarifying),
            (Clarifying, Planning),
            (Planning, Designing),
            (Designing, Coding),
            (Coding, Verifying),
            (Verifying, Done),
        ];
        for (from, to) in path {
            assert!(sm.can_transition(from, to), "{from:?} -> {to:?}");
            assert_eq!(sm.transition(from, to).unwrap(), RolloutAction::None);
        }
    }

    #[test]
    fn iterate_and_restart_actions() {
        let sm = StateMachine::new();
        assert_eq!(
            sm.transition(Verifying, Coding).unwrap(),
            RolloutAction::Iterate
        );
        assert_eq!(
            sm.transition(Verifying, Designing).unwrap(),
            RolloutAction::Restart
        );
    }

    #[test]
    fn cannot_skip_ahead() {
        let sm = StateMachine::new();
        assert!(sm.transition(Preparing, Coding).is_err());
        assert!(sm.transition(Preparing, Done).is_err());
        assert!(sm.transition(Clarifying, Coding).is_err());
    }

    #[test]
    fn cannot_go_backwards_except_from_verifying() {
        let sm = StateMachine::new();
        assert!(sm.transition(Coding, Planning).is_err());
        assert!(sm.transition(Designing, Clarifying).is_err());
        assert!(sm.transition(Planning, Preparing).is_err());
    }

    #[test]
    fn done_is_terminal() {
        let sm = StateMachine::new();
        for target in [Preparing, Clarifying, Planning, Designing, Coding, Verifying, Done] {
            if target != Done {
                assert!(sm.transition(Done, target).is_err());
            }
        }
        assert!(sm.available_transitions(Done).is_empty());
    }

    #[test]
    fn self_transitions_are_invalid() {
        let sm = StateMachine::new();
        for s in [Preparing, Clarifying, Planning, Designing, Coding, Verifying, Done] {
            assert!(sm.transition(s, s).is_err());
        }
    }
}
