//! Cluster neighbor monitoring: domain records and the ring monitor.

pub mod domain;
pub mod monitor;

pub use domain::{
    dom_rec_len, dom_size, map_get, map_set, DomainRecord, DOM_REC_BASE_LEN, MAX_MON_DOMAIN,
};
pub use monitor::{
    MonState, Monitor, MonitorError, MonitorInfo, PeerInfo, MAX_PEER_DOWN_EVENTS, MON_TIMEOUT,
    TIPC_DEF_MON_THRESHOLD,
};
