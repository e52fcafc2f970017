//! Addressing constants, node capabilities and message importance levels
//! shared across the link, monitor and node layers.
//!
//! TIPC addresses are 32-bit values structured as zone.cluster.node
//! (8 + 12 + 12 bits). Address 0 is reserved and means "anonymous/self"
//! wherever a node field may be left blank.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

// =============================================================================
// MODULE IDENTIFICATION / TABLE SIZES
// =============================================================================

/// Protocol module version string (TIPC version 2 wire format only).
pub const TIPC_MOD_VER: &str = "2.0.0";

/// Nominal size of the node hash table in the reference implementation.
/// The node set here is an ordered map; the constant is kept for parity
/// with the protocol documentation.
pub const NODE_HTABLE_SIZE: usize = 512;

/// Maximum number of bearers (link-layer transports) per node.
pub const MAX_BEARERS: usize = 3;

/// Sentinel for an empty `active_links` slot.
pub const INVALID_BEARER_ID: i32 = -1;

/// Length of the 128-bit node identity.
pub const NODE_ID_LEN: usize = 16;

/// Length of the hex rendering of a node identity, incl. NUL in the
/// reference implementation.
pub const NODE_ID_STR_LEN: usize = NODE_ID_LEN * 2 + 1;

/// Default network identity assigned to newly created nodes.
pub const DEFAULT_NET_ID: u32 = 4711;

// =============================================================================
// ADDRESS STRUCTURE
// =============================================================================

pub const TIPC_NODE_BITS: u32 = 12;
pub const TIPC_CLUSTER_BITS: u32 = 12;
pub const TIPC_ZONE_BITS: u32 = 8;

pub const TIPC_NODE_OFFSET: u32 = 0;
pub const TIPC_CLUSTER_OFFSET: u32 = TIPC_NODE_BITS;
pub const TIPC_ZONE_OFFSET: u32 = TIPC_CLUSTER_OFFSET + TIPC_CLUSTER_BITS;

/// Largest node number within a cluster.
pub const TIPC_NODE_SIZE: u32 = (1 << TIPC_NODE_BITS) - 1;
/// Largest cluster number within a zone; also the upper bound accepted by
/// the monitor threshold setter.
pub const TIPC_CLUSTER_SIZE: u32 = (1 << TIPC_CLUSTER_BITS) - 1;
/// Largest zone number.
pub const TIPC_ZONE_SIZE: u32 = (1 << TIPC_ZONE_BITS) - 1;

pub const TIPC_NODE_MASK: u32 = TIPC_NODE_SIZE << TIPC_NODE_OFFSET;
pub const TIPC_CLUSTER_MASK: u32 = TIPC_CLUSTER_SIZE << TIPC_CLUSTER_OFFSET;
pub const TIPC_ZONE_MASK: u32 = TIPC_ZONE_SIZE << TIPC_ZONE_OFFSET;
pub const TIPC_ZONE_CLUSTER_MASK: u32 = TIPC_ZONE_MASK | TIPC_CLUSTER_MASK;

/// Visibility scope of a published name or link-state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Scope {
    Cluster = 2,
    Node = 3,
}

/// Strip the node bits, keeping the zone.cluster part of an address.
pub fn cluster_mask(addr: u32) -> u32 {
    addr & TIPC_ZONE_CLUSTER_MASK
}

/// Scope implied by a node field: 0 (anonymous) publishes cluster-wide.
pub fn node2scope(node: u32) -> Scope {
    if node != 0 { Scope::Node } else { Scope::Cluster }
}

/// Inverse of [`node2scope`] for a given own address.
pub fn scope2node(own_addr: u32, scope: Scope) -> u32 {
    match scope {
        Scope::Node => own_addr,
        Scope::Cluster => 0,
    }
}

/// An address designates the local node if it equals it or is anonymous.
pub fn in_own_node(own_addr: u32, addr: u32) -> bool {
    addr == own_addr || addr == 0
}

// =============================================================================
// NODE CAPABILITIES
// =============================================================================
// Optional capabilities supported by this code version, advertised to and
// recorded from peers during link establishment.

pub const TIPC_SYN_BIT: u16 = 1;
pub const TIPC_BCAST_SYNCH: u16 = 1 << 1;
pub const TIPC_BCAST_STATE_NACK: u16 = 1 << 2;
pub const TIPC_BLOCK_FLOWCTL: u16 = 1 << 3;
pub const TIPC_BCAST_RCAST: u16 = 1 << 4;
pub const TIPC_NODE_ID128: u16 = 1 << 5;
pub const TIPC_LINK_PROTO_SEQNO: u16 = 1 << 6;

/// Capability mask advertised by nodes created by this module.
pub const TIPC_NODE_CAPABILITIES: u16 = TIPC_SYN_BIT
    | TIPC_BCAST_SYNCH
    | TIPC_BCAST_STATE_NACK
    | TIPC_BCAST_RCAST
    | TIPC_BLOCK_FLOWCTL
    | TIPC_NODE_ID128
    | TIPC_LINK_PROTO_SEQNO;

// =============================================================================
// MESSAGE IMPORTANCE
// =============================================================================

/// User-visible message importance levels. Backlog queue limits are
/// derived per level at link creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Importance {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Importance {
    pub const ALL: [Importance; 4] = [
        Importance::Low,
        Importance::Medium,
        Importance::High,
        Importance::Critical,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Importance level reserved for internal (link signalling) traffic.
pub const TIPC_SYSTEM_IMPORTANCE: usize = 4;

// =============================================================================
// NODE ADDRESS ASSIGNMENT
// =============================================================================

static GLOBAL_NODE_ADDR: AddrCounter = AddrCounter::starting_at(1);

/// Monotone allocator for node addresses. Address 0 is reserved as an
/// error value, so allocation starts at 1.
///
/// The process-global instance backs ordinary node creation; tests inject
/// their own counter to get reproducible addresses.
#[derive(Debug)]
pub struct AddrCounter {
    next: AtomicU32,
}

impl AddrCounter {
    pub const fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// The process-global counter used when no counter is injected.
    pub fn global() -> &'static AddrCounter {
        &GLOBAL_NODE_ADDR
    }

    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for AddrCounter {
    fn default() -> Self {
        Self::new()
    }
}
