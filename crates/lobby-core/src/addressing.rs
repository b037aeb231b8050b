//! IPv4 block arithmetic for overlay networks.
//!
//! The overlay pool (e.g. `10.66.0.0/16`) is carved into fixed-size slots,
//! one per VPN session. Inside a block, offset 0 is the network address,
//! offset 1 the server, offsets 2.. the participants in order, and the last
//! two addresses are the spare and the broadcast.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CapacityFailure, LobbyError, LobbyResult};

/// Addresses in every block that are never handed to participants:
/// network, broadcast, server, and one spare.
pub const RESERVED_ADDRESSES: u32 = 4;

/// Smallest block the manager will allocate (prefix length).
pub const MAX_PREFIX: u8 = 29;

/// Usable participant capacity of a block with the given prefix length.
pub fn participant_capacity(prefix: u8) -> usize {
    let size = block_size(prefix);
    size.saturating_sub(u64::from(RESERVED_ADDRESSES)) as usize
}

fn block_size(prefix: u8) -> u64 {
    1u64 << (32 - u32::from(prefix.min(32)))
}

/// Default overlay pool, `10.66.0.0/16`.
pub const DEFAULT_POOL: Ipv4Block = Ipv4Block {
    base: Ipv4Addr::new(10, 66, 0, 0),
    prefix: 16,
};

/// An aligned IPv4 CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Block {
    base: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Block {
    pub fn new(base: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            bail!("prefix length {} is out of range", prefix);
        }
        let mask = Self::mask(prefix);
        if u32::from(base) & !mask != 0 {
            bail!("{}/{} is not aligned to its prefix", base, prefix);
        }
        Ok(Self { base, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.base
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn size(&self) -> u64 {
        block_size(self.prefix)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) | !Self::mask(self.prefix))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask(self.prefix) == u32::from(self.base)
    }

    /// Address at `offset` from the network address, if inside the block.
    pub fn nth(&self, offset: u64) -> Option<Ipv4Addr> {
        if offset >= self.size() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.base) + offset as u32))
    }

    /// Number of `slot_prefix`-sized sub-blocks in this block.
    pub fn slot_count(&self, slot_prefix: u8) -> u32 {
        if slot_prefix < self.prefix {
            return 0;
        }
        let n = block_size(self.prefix) / block_size(slot_prefix);
        n.min(u64::from(u32::MAX)) as u32
    }

    /// The `index`-th `slot_prefix`-sized sub-block.
    pub fn slot(&self, slot_prefix: u8, index: u32) -> Option<Ipv4Block> {
        if index >= self.slot_count(slot_prefix) {
            return None;
        }
        let offset = u64::from(index) * block_size(slot_prefix);
        Some(Ipv4Block {
            base: Ipv4Addr::from(u32::from(self.base) + offset as u32),
            prefix: slot_prefix,
        })
    }
}

impl fmt::Display for Ipv4Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

impl FromStr for Ipv4Block {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, prefix) = s
            .split_once('/')
            .with_context(|| format!("Expected <ip>/<prefix>, got {:?}", s))?;
        let base: Ipv4Addr = ip
            .parse()
            .with_context(|| format!("Invalid IPv4 address in {:?}", s))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("Invalid prefix length in {:?}", s))?;
        Self::new(base, prefix)
    }
}

impl Serialize for Ipv4Block {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Block {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Address assignment for one overlay network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPlan {
    pub cidr: Ipv4Block,
    pub server: Ipv4Addr,
    /// Participant addresses, in participant order.
    pub peers: Vec<Ipv4Addr>,
}

/// Plan addresses for `participants` inside an allocated slot.
///
/// The declared CIDR is the smallest block (no smaller than /29) that holds
/// everyone, anchored at the slot's network address, so it never spills
/// outside the slot. Peer `i` always receives offset `2 + i`.
pub fn plan_overlay(slot: Ipv4Block, participants: usize) -> LobbyResult<OverlayPlan> {
    let capacity = participant_capacity(slot.prefix());
    if participants > capacity {
        return Err(LobbyError::Capacity(CapacityFailure::TooManyParticipants {
            requested: participants,
            capacity,
        }));
    }

    let mut prefix = MAX_PREFIX.max(slot.prefix());
    while prefix > slot.prefix() && participant_capacity(prefix) < participants {
        prefix -= 1;
    }
    let cidr = Ipv4Block {
        base: slot.network(),
        prefix,
    };

    let server = Ipv4Addr::from(u32::from(cidr.network()) + 1);
    let peers = (0..participants)
        .map(|i| Ipv4Addr::from(u32::from(cidr.network()) + 2 + i as u32))
        .collect();

    Ok(OverlayPlan {
        cidr,
        server,
        peers,
    })
}
