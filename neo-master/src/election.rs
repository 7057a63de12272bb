use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use neo_base::{err, Error};
use neo_proto::Uuid;

/// Tracks the master-to-master election described in §4.1: every master
/// opens connections to every configured peer, classifying each address as
/// *unconnected* or *negotiating* until identification either promotes it
/// to a known master or demotes the connection.
pub struct Election {
    self_uuid: Uuid,
    unconnected: BTreeSet<SocketAddr>,
    negotiating: BTreeSet<SocketAddr>,
    /// Masters identified so far, excluding ourselves.
    known: BTreeMap<Uuid, SocketAddr>,
    /// The UUID this master currently believes to be primary, once an
    /// `AnnouncePrimaryMaster` has been accepted.
    announced_primary: Option<Uuid>,
}

impl Election {
    pub fn new(self_uuid: Uuid, peer_addresses: impl IntoIterator<Item = SocketAddr>) -> Election {
        Election {
            self_uuid,
            unconnected: peer_addresses.into_iter().collect(),
            negotiating: BTreeSet::new(),
            known: BTreeMap::new(),
            announced_primary: None,
        }
    }

    /// A TCP connection to `addr` came up; it becomes negotiating until
    /// identification resolves it one way or the other.
    pub fn on_connected(&mut self, addr: SocketAddr) {
        self.unconnected.remove(&addr);
        self.negotiating.insert(addr);
    }

    /// Identification against `addr` succeeded and named `uuid` as a
    /// master peer.
    pub fn on_identified(&mut self, addr: SocketAddr, uuid: Uuid) {
        self.negotiating.remove(&addr);
        self.known.insert(uuid, addr);
    }

    /// Identification against `addr` failed (alien cluster name, or the
    /// peer rejected us as broken); the address goes back to unconnected
    /// so a later retry can be attempted.
    pub fn on_rejected(&mut self, addr: SocketAddr) {
        self.negotiating.remove(&addr);
        self.unconnected.insert(addr);
    }

    pub fn is_negotiating(&self) -> bool {
        !self.negotiating.is_empty()
    }

    pub fn known_masters(&self) -> impl Iterator<Item = (Uuid, SocketAddr)> + '_ {
        self.known.iter().map(|(u, a)| (*u, *a))
    }

    /// Winner of the election among every peer heard from so far, plus
    /// ourselves: the numerically smallest UUID (§4.1, GLOSSARY "Primary
    /// master"). `None` until every configured peer has either answered or
    /// been given up on (no `unconnected`/`negotiating` remain).
    pub fn compute_winner(&self) -> Option<Uuid> {
        if !self.unconnected.is_empty() || !self.negotiating.is_empty() {
            return None;
        }
        let mut winner = self.self_uuid;
        for uuid in self.known.keys() {
            if *uuid < winner {
                winner = *uuid;
            }
        }
        Some(winner)
    }

    pub fn is_self_primary(&self) -> bool {
        self.compute_winner() == Some(self.self_uuid)
    }

    /// An `AnnouncePrimaryMaster(uuid)` arrived. §4.1: "When a peer
    /// announces itself as primary and another peer has already done so
    /// with a different UUID, the election fails and is restarted."
    /// Per §9's Open Question, equal UUIDs from distinct peers are treated
    /// as a configuration error rather than guessing a tie-break rule.
    pub fn on_announce(&mut self, uuid: Uuid) -> Result<(), Error> {
        match self.announced_primary {
            None => {
                self.announced_primary = Some(uuid);
                Ok(())
            }
            Some(existing) if existing == uuid => Ok(()),
            Some(_) => {
                self.restart();
                Err(err("conflicting AnnouncePrimaryMaster; election restarted"))
            }
        }
    }

    /// Closes every master connection and re-enters the election loop
    /// from scratch (§4.1).
    pub fn restart(&mut self) {
        self.unconnected.extend(self.negotiating.drain());
        self.unconnected.extend(self.known.values().copied());
        self.known.clear();
        self.announced_primary = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neo_proto::NodeRole;
    use test_log::test;

    fn uuid(n: u8) -> Uuid {
        Uuid::new(NodeRole::Master, [n; 15])
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn winner_is_none_until_all_peers_resolved() {
        let mut election = Election::new(uuid(5), vec![addr(1), addr(2)]);
        assert!(election.compute_winner().is_none());
        election.on_connected(addr(1));
        election.on_identified(addr(1), uuid(1));
        assert!(election.compute_winner().is_none());
        election.on_connected(addr(2));
        election.on_identified(addr(2), uuid(9));
        assert_eq!(election.compute_winner(), Some(uuid(1)));
    }

    #[test]
    fn self_wins_if_numerically_smallest() {
        let mut election = Election::new(uuid(1), vec![addr(1)]);
        election.on_connected(addr(1));
        election.on_identified(addr(1), uuid(9));
        assert!(election.is_self_primary());
    }

    #[test]
    fn conflicting_announce_restarts_election() {
        let mut election = Election::new(uuid(5), vec![addr(1), addr(2)]);
        election.on_connected(addr(1));
        election.on_identified(addr(1), uuid(1));
        election.on_connected(addr(2));
        election.on_identified(addr(2), uuid(2));
        election.on_announce(uuid(1)).unwrap();
        assert!(election.on_announce(uuid(2)).is_err());
        assert!(election.known.is_empty());
        assert!(election.compute_winner().is_none());
    }
}
