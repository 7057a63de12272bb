use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit object identifier. `0` is reserved and never names a live object.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Oid(pub u64);

impl Oid {
    pub const ZERO: Oid = Oid(0);

    pub fn partition(self, num_partitions: u32) -> u32 {
        (self.0 % num_partitions as u64) as u32
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:#018x})", self.0)
    }
}

/// 64-bit transaction identifier. Strictly increasing; see [`crate::tid`] for
/// the calendar encoding that keeps TIDs roughly ordered by wall-clock time.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Tid(pub u64);

impl Tid {
    pub const ZERO: Tid = Tid(0);
    /// The largest representable TID; used as a sentinel meaning "latest".
    pub const MAX: Tid = Tid(u64::MAX);

    pub fn partition(self, num_partitions: u32) -> u32 {
        (self.0 % num_partitions as u64) as u32
    }

    pub fn next(self) -> Tid {
        Tid(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({:#018x})", self.0)
    }
}

/// 64-bit partition-table version. Bumped on every committed PT change.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Ptid(pub u64);

impl Ptid {
    pub const ZERO: Ptid = Ptid(0);

    pub fn next(self) -> Ptid {
        Ptid(self.0 + 1)
    }
}

impl fmt::Debug for Ptid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ptid({})", self.0)
    }
}

/// Role encoded in the first byte of every [`Uuid`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeRole {
    Master = 0,
    Storage = 1,
    Client = 2,
    Admin = 3,
}

impl NodeRole {
    pub fn from_byte(b: u8) -> Option<NodeRole> {
        match b {
            0 => Some(NodeRole::Master),
            1 => Some(NodeRole::Storage),
            2 => Some(NodeRole::Client),
            3 => Some(NodeRole::Admin),
            _ => None,
        }
    }
}

/// 16-byte node identifier. The first byte names the role (see [`NodeRole`]);
/// the remaining 15 bytes are generated at first start and persisted.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    pub fn new(role: NodeRole, entropy: [u8; 15]) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes[0] = role as u8;
        bytes[1..].copy_from_slice(&entropy);
        Uuid(bytes)
    }

    pub fn role(&self) -> Option<NodeRole> {
        NodeRole::from_byte(self.0[0])
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}
