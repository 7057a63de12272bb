use serde::{Deserialize, Serialize};

/// Cluster lifecycle state (§3, §4.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ClusterState {
    Recovering,
    Verifying,
    Running,
    StartingBackup,
    BackingUp,
    StoppingBackup,
    Stopping,
}

/// Whether `to` is a transition the primary is allowed to drive the cluster
/// through directly from `from`. Any other request is a protocol error
/// (§4.1: "Allowed transitions are enumerated in a workflow table; any other
/// request returns a protocol error").
pub fn allowed_transition(from: ClusterState, to: ClusterState) -> bool {
    use ClusterState::*;
    matches!(
        (from, to),
        (Recovering, Verifying)
            | (Verifying, Running)
            | (Verifying, Recovering) // a quorum check can fail and restart recovery
            | (Running, StartingBackup)
            | (StartingBackup, BackingUp)
            | (BackingUp, StoppingBackup)
            | (StoppingBackup, Running)
            | (Recovering, Stopping)
            | (Verifying, Stopping)
            | (Running, Stopping)
            | (StartingBackup, Stopping)
            | (BackingUp, Stopping)
            | (StoppingBackup, Stopping)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn normal_lifecycle_is_allowed() {
        assert!(allowed_transition(
            ClusterState::Recovering,
            ClusterState::Verifying
        ));
        assert!(allowed_transition(
            ClusterState::Verifying,
            ClusterState::Running
        ));
        assert!(allowed_transition(
            ClusterState::Running,
            ClusterState::Stopping
        ));
    }

    #[test]
    fn skipping_verification_is_rejected() {
        assert!(!allowed_transition(
            ClusterState::Recovering,
            ClusterState::Running
        ));
    }

    #[test]
    fn backup_round_trip_is_allowed() {
        assert!(allowed_transition(
            ClusterState::Running,
            ClusterState::StartingBackup
        ));
        assert!(allowed_transition(
            ClusterState::StartingBackup,
            ClusterState::BackingUp
        ));
        assert!(allowed_transition(
            ClusterState::BackingUp,
            ClusterState::StoppingBackup
        ));
        assert!(allowed_transition(
            ClusterState::StoppingBackup,
            ClusterState::Running
        ));
    }
}
