//! Link layer: signalling header codec, protocol messages, and the
//! per-link state machine.

pub mod header;
pub mod link;
pub mod msg;

pub use header::{
    HeaderError, SignalHeader, BASIC_H_SIZE, BCAST_PROTOCOL, CONN_MANAGER, FB_MTU, GROUP_H_SIZE,
    GROUP_PROTOCOL, INT_H_SIZE, LINK_CONFIG, LINK_PROTOCOL, MAX_H_SIZE, MAX_MSG_SIZE, MCAST_H_SIZE,
    MIN_H_SIZE, MSG_BUNDLER, MSG_FRAGMENTER, NAMED_H_SIZE, NAME_DISTRIBUTOR, SHORT_H_SIZE,
    SIGNAL_H_SIZE, TIPC_MAX_USER_MSG_SIZE, TIPC_VERSION, TUNNEL_PROTOCOL,
};
pub use link::{
    BacklogEntry, FsmError, Link, LinkConfig, LinkError, LinkEvent, LinkInfo, LinkState, LinkStats,
    LinkTimeout, StateObserver, TIPC_LINK_DOWN_EVT, TIPC_LINK_SND_STATE, TIPC_LINK_UP_EVT,
};
pub use msg::{ProtoMsg, ACTIVATE_MSG, RESET_MSG, STATE_MSG};
