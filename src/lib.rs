//! Discrete-event simulation model of TIPC signalling.
//!
//! The crate models the two subsystems that make TIPC neighbor
//! supervision work between peer nodes:
//!
//! - the per-link finite state machine with its periodic probing and
//!   continuity supervision ([`link`]),
//! - the √N cluster neighbor monitor with its ring of peers and gossiped
//!   domain records ([`monitor`]),
//!
//! plus the fixed signalling header codec they exchange and the node
//! keepalive loop that ties links and monitors together ([`node`]).
//! Everything runs on virtual time provided by [`sim`].

pub mod link;
pub mod monitor;
pub mod node;
pub mod sim;
pub mod types;

// Re-exports
pub use link::{
    FsmError, HeaderError, Link, LinkConfig, LinkError, LinkEvent, LinkInfo, LinkState, LinkStats,
    LinkTimeout, ProtoMsg, SignalHeader, ACTIVATE_MSG, INT_H_SIZE, MAX_H_SIZE, MIN_H_SIZE,
    RESET_MSG, SIGNAL_H_SIZE, STATE_MSG, TIPC_LINK_DOWN_EVT, TIPC_LINK_SND_STATE,
    TIPC_LINK_UP_EVT, TIPC_VERSION,
};
pub use monitor::{
    dom_rec_len, dom_size, DomainRecord, MonState, Monitor, MonitorError, MonitorInfo, PeerInfo,
    DOM_REC_BASE_LEN, MAX_MON_DOMAIN, MAX_PEER_DOWN_EVENTS, MON_TIMEOUT, TIPC_DEF_MON_THRESHOLD,
};
pub use node::{
    Node, NodeConfig, NodeInfo, NodeState, TickOutcome, INVALID_NODE_SIG, NODE_CLEANUP_AFTER,
    TIPC_NOTIFY_LINK_DOWN, TIPC_NOTIFY_LINK_UP, TIPC_NOTIFY_NODE_DOWN, TIPC_NOTIFY_NODE_UP,
};
pub use sim::{Simulator, TimerHandle};
pub use types::{
    cluster_mask, in_own_node, node2scope, scope2node, AddrCounter, Importance, Scope,
    INVALID_BEARER_ID, MAX_BEARERS, NODE_HTABLE_SIZE, TIPC_CLUSTER_SIZE, TIPC_NODE_CAPABILITIES,
    TIPC_NODE_SIZE, TIPC_ZONE_SIZE,
};
