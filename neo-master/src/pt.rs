use neo_proto::{Cell, CellState, PartitionTable, PartitionTableDelta, Ptid, Uuid};

/// Computes partition-to-replica assignments for the master
/// (§4.1 "Partition-table changes"): "a deterministic algorithm that keeps
/// each partition covered by `R` cells, preferring minimal movement".
///
/// This assigner is deliberately simple: it round-robins eligible nodes
/// (ordered by UUID, for determinism) across partitions that are short a
/// cell, and only ever adds or removes the minimum number of cells needed
/// — existing cells for nodes that remain eligible are never touched.
pub struct Assigner<'a> {
    table: &'a PartitionTable,
}

impl<'a> Assigner<'a> {
    pub fn new(table: &'a PartitionTable) -> Assigner<'a> {
        Assigner { table }
    }

    /// Recomputes assignment for every partition using `eligible` as the
    /// pool of storage UUIDs to draw from (excludes nodes the caller has
    /// already decided to exclude, e.g. `AskTweakPartitionTable(excluded)`
    /// or a dropped node). Newly-added cells start `OUT_OF_DATE` — the
    /// replicator brings them current (§4.4 "Replication").
    pub fn tweak(&self, eligible: &[Uuid]) -> PartitionTableDelta {
        let mut eligible: Vec<Uuid> = eligible.to_vec();
        eligible.sort();
        let mut changes = Vec::new();
        let mut cursor = 0usize;
        for (partition, cells) in self.table.cells.iter().enumerate() {
            let mut kept: Vec<Cell> = cells
                .iter()
                .filter(|c| eligible.contains(&c.node))
                .cloned()
                .collect();
            let needed = self.table.num_replicas as usize;
            while kept.len() < needed && !eligible.is_empty() {
                let candidate = eligible[cursor % eligible.len()];
                cursor += 1;
                if kept.iter().any(|c| c.node == candidate) {
                    if cursor > eligible.len() * 2 {
                        break; // fewer eligible nodes than replicas needed
                    }
                    continue;
                }
                kept.push(Cell { node: candidate, state: CellState::OutOfDate });
            }
            if kept.len() != cells.len() || kept.iter().zip(cells.iter()).any(|(a, b)| a.node != b.node) {
                changes.push((partition as u32, kept));
            }
        }
        PartitionTableDelta { ptid: self.table.ptid.next(), changes }
    }

    /// Adds `node` as an extra `OUT_OF_DATE` replica wherever a partition
    /// has fewer than `R` cells, without disturbing existing assignments.
    pub fn add_node(&self, node: Uuid) -> PartitionTableDelta {
        let mut changes = Vec::new();
        for (partition, cells) in self.table.cells.iter().enumerate() {
            if cells.len() < self.table.num_replicas as usize && !cells.iter().any(|c| c.node == node) {
                let mut next = cells.clone();
                next.push(Cell { node, state: CellState::OutOfDate });
                changes.push((partition as u32, next));
            }
        }
        PartitionTableDelta { ptid: self.table.ptid.next(), changes }
    }

    /// Removes every cell belonging to `node` (§4.1 drop path). Does not
    /// backfill a replacement; a subsequent `tweak` call restores full
    /// replication from the remaining eligible pool.
    pub fn drop_node(&self, node: Uuid) -> PartitionTableDelta {
        let mut changes = Vec::new();
        for (partition, cells) in self.table.cells.iter().enumerate() {
            if cells.iter().any(|c| c.node == node) {
                let remaining: Vec<Cell> = cells.iter().filter(|c| c.node != node).cloned().collect();
                changes.push((partition as u32, remaining));
            }
        }
        PartitionTableDelta { ptid: self.table.ptid.next(), changes }
    }
}

/// Rebuilds a partition table from the per-storage rows reported during
/// `RECOVERING` (§4.1: "the primary picks the maximum PTID seen and
/// rebuilds the partition table from the storages that had it").
pub fn rebuild_from_reports(
    num_partitions: u32,
    num_replicas: u32,
    reports: &[(Ptid, Vec<(u32, Vec<Cell>)>)],
) -> PartitionTable {
    let mut table = PartitionTable::new(num_partitions, num_replicas);
    if let Some((ptid, rows)) = reports.iter().max_by_key(|(ptid, _)| *ptid) {
        table.ptid = *ptid;
        for (partition, cells) in rows {
            table.cells[*partition as usize] = cells.clone();
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use neo_proto::NodeRole;
    use test_log::test;

    fn uuid(n: u8) -> Uuid {
        Uuid::new(NodeRole::Storage, [n; 15])
    }

    #[test]
    fn tweak_fills_understaffed_partitions() {
        let table = PartitionTable::new(2, 2);
        let assigner = Assigner::new(&table);
        let delta = assigner.tweak(&[uuid(1), uuid(2)]);
        assert_eq!(delta.changes.len(), 2);
        for (_, cells) in &delta.changes {
            assert_eq!(cells.len(), 2);
        }
    }

    #[test]
    fn add_node_only_touches_understaffed_partitions() {
        let mut table = PartitionTable::new(1, 2);
        table.cells[0] = vec![Cell { node: uuid(1), state: CellState::UpToDate }];
        let assigner = Assigner::new(&table);
        let delta = assigner.add_node(uuid(2));
        assert_eq!(delta.changes.len(), 1);
        assert_eq!(delta.changes[0].1.len(), 2);
    }

    #[test]
    fn drop_node_removes_only_its_own_cells() {
        let mut table = PartitionTable::new(1, 2);
        table.cells[0] = vec![
            Cell { node: uuid(1), state: CellState::UpToDate },
            Cell { node: uuid(2), state: CellState::UpToDate },
        ];
        let assigner = Assigner::new(&table);
        let delta = assigner.drop_node(uuid(1));
        assert_eq!(delta.changes[0].1, vec![Cell { node: uuid(2), state: CellState::UpToDate }]);
    }

    #[test]
    fn rebuild_picks_the_highest_ptid_report() {
        let older = (Ptid(1), vec![(0u32, vec![Cell { node: uuid(1), state: CellState::UpToDate }])]);
        let newer = (Ptid(2), vec![(0u32, vec![Cell { node: uuid(2), state: CellState::UpToDate }])]);
        let table = rebuild_from_reports(1, 1, &[older, newer]);
        assert_eq!(table.ptid, Ptid(2));
        assert_eq!(table.cells[0][0].node, uuid(2));
    }
}
