use neo_base::{err, Error};
use neo_proto::{allowed_transition, ClusterState};

/// The primary's view of cluster state (§4.1). Only the primary drives
/// transitions; secondaries and other roles just apply
/// `NotifyClusterInformation` broadcasts.
pub struct ClusterStateMachine {
    state: ClusterState,
}

impl ClusterStateMachine {
    pub fn new() -> ClusterStateMachine {
        ClusterStateMachine { state: ClusterState::Recovering }
    }

    pub fn current(&self) -> ClusterState {
        self.state
    }

    /// Applies a transition if it appears in the workflow table; any other
    /// request is a protocol error (§4.1: "Allowed transitions are
    /// enumerated in a workflow table; any other request returns a
    /// protocol error.").
    pub fn transition_to(&mut self, next: ClusterState) -> Result<(), Error> {
        if !allowed_transition(self.state, next) {
            return Err(err(format!("illegal cluster state transition {:?} -> {:?}", self.state, next)));
        }
        self.state = next;
        Ok(())
    }
}

impl Default for ClusterStateMachine {
    fn default() -> ClusterStateMachine {
        ClusterStateMachine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn normal_startup_sequence_is_accepted() {
        let mut csm = ClusterStateMachine::new();
        csm.transition_to(ClusterState::Verifying).unwrap();
        csm.transition_to(ClusterState::Running).unwrap();
        assert_eq!(csm.current(), ClusterState::Running);
    }

    #[test]
    fn skipping_straight_to_running_is_rejected() {
        let mut csm = ClusterStateMachine::new();
        assert!(csm.transition_to(ClusterState::Running).is_err());
        assert_eq!(csm.current(), ClusterState::Recovering);
    }
}
