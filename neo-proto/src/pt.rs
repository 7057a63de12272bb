use crate::{Ptid, Uuid};
use serde::{Deserialize, Serialize};

/// State of one storage replica's copy of one partition (§3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum CellState {
    UpToDate,
    OutOfDate,
    Feeding,
    Discarded,
    Corrupted,
}

impl CellState {
    pub fn is_readable(self) -> bool {
        matches!(self, CellState::UpToDate | CellState::Feeding)
    }
}

/// One `(storage-node, cell-state)` pair within a partition's cell list.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub node: Uuid,
    pub state: CellState,
}

/// A full partition table snapshot, as sent to a node during identification
/// (`SendPartitionTable`) or reconstructed by the master during recovery.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartitionTable {
    pub ptid: Ptid,
    pub num_partitions: u32,
    pub num_replicas: u32,
    /// `cells[partition]` is the set of replicas for that partition.
    pub cells: Vec<Vec<Cell>>,
}

impl PartitionTable {
    pub fn new(num_partitions: u32, num_replicas: u32) -> PartitionTable {
        PartitionTable {
            ptid: Ptid::ZERO,
            num_partitions,
            num_replicas,
            cells: vec![Vec::new(); num_partitions as usize],
        }
    }

    /// A table is operational iff every partition has at least one
    /// `UP_TO_DATE` cell (§3).
    pub fn is_operational(&self) -> bool {
        self.cells
            .iter()
            .all(|row| row.iter().any(|c| c.state == CellState::UpToDate))
    }

    pub fn readable_cells(&self, partition: u32) -> impl Iterator<Item = &Cell> {
        self.cells[partition as usize]
            .iter()
            .filter(|c| c.state.is_readable())
    }

    /// Applies a delta in place, honoring the monotonicity invariant (§8.5):
    /// a strictly greater incoming PTID is applied; anything else (equal or
    /// stale) is ignored silently, never treated as an error.
    pub fn apply_delta(&mut self, delta: &PartitionTableDelta) -> bool {
        if delta.ptid <= self.ptid {
            return false;
        }
        for (partition, cells) in &delta.changes {
            self.cells[*partition as usize] = cells.clone();
        }
        self.ptid = delta.ptid;
        true
    }
}

/// The changed rows of a partition-table update, broadcast by the master via
/// `NotifyPartitionChanges` (§4.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionTableDelta {
    pub ptid: Ptid,
    pub changes: Vec<(u32, Vec<Cell>)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn cell(n: u8, s: CellState) -> Cell {
        Cell {
            node: Uuid::new(crate::NodeRole::Storage, [n; 15]),
            state: s,
        }
    }

    #[test]
    fn stale_ptid_is_ignored_without_error() {
        let mut pt = PartitionTable::new(4, 2);
        pt.apply_delta(&PartitionTableDelta {
            ptid: Ptid(5),
            changes: vec![(0, vec![cell(1, CellState::UpToDate)])],
        });
        assert_eq!(pt.ptid, Ptid(5));

        let applied = pt.apply_delta(&PartitionTableDelta {
            ptid: Ptid(5),
            changes: vec![(0, vec![cell(2, CellState::UpToDate)])],
        });
        assert!(!applied);
        assert_eq!(pt.cells[0][0].node, cell(1, CellState::UpToDate).node);
    }

    #[test]
    fn operational_requires_every_partition_covered() {
        let mut pt = PartitionTable::new(2, 1);
        assert!(!pt.is_operational());
        pt.apply_delta(&PartitionTableDelta {
            ptid: Ptid(1),
            changes: vec![
                (0, vec![cell(1, CellState::UpToDate)]),
                (1, vec![cell(1, CellState::OutOfDate)]),
            ],
        });
        assert!(!pt.is_operational());
        pt.apply_delta(&PartitionTableDelta {
            ptid: Ptid(2),
            changes: vec![(1, vec![cell(2, CellState::UpToDate)])],
        });
        assert!(pt.is_operational());
    }
}
