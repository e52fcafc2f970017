//! Per-link state machine and supervision.
//!
//! A link is one directional-pair association between the local node and
//! one peer over one bearer. Its state machine:
//!
//! ```text
//!                    PEER_RESET            RESET
//!   ┌───────────┐ ──────────────► PEER_RESET ─────┐
//!   │ RESETTING │                                 ▼
//!   └─────┬─────┘          RESET ┌──────────► ESTABLISHING
//!         │ RESET   ┌───────┐◄───┘PEER_RESET      │ ESTABLISH
//!         └────────►│ RESET │                     ▼
//!                   └───┬───┘  FAILURE ┌─────────────┐  SYNCH_BEGIN
//!        FAILOVER_BEGIN │    ┌─────────│ ESTABLISHED │◄──────────┐
//!                       ▼    ▼         └─────────────┘  SYNCH_END│
//!                  FAILINGOVER ──► RESET      ▲───────────► SYNCHING
//!                     FAILOVER_END            (peer/self resets drop back)
//! ```
//!
//! Events outside the legal table are bugs in the caller, not network
//! events, and are surfaced as [`FsmError`].

use super::header::{HeaderError, SignalHeader, INT_H_SIZE, LINK_PROTOCOL, SIGNAL_H_SIZE};
use super::msg::{ProtoMsg, ACTIVATE_MSG, RESET_MSG, STATE_MSG};
use crate::monitor::{MonState, Monitor, MonitorError};
use crate::types::Importance;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// Flags returned by FSM events and timeouts.
pub const TIPC_LINK_UP_EVT: u32 = 1;
pub const TIPC_LINK_DOWN_EVT: u32 = 1 << 1;
pub const TIPC_LINK_SND_STATE: u32 = 1 << 2;

/// The 7 states of a link endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Resetting,
    Reset,
    PeerReset,
    FailingOver,
    Establishing,
    Established,
    Synching,
}

/// The 8 events accepted by the link FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkEvent {
    Establish,
    PeerReset,
    Failure,
    Reset,
    FailoverBegin,
    FailoverEnd,
    SynchBegin,
    SynchEnd,
}

/// A state/event pair outside the legal transition table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal FSM event {event:?} in state {state:?} on link {link}")]
pub struct FsmError {
    pub state: LinkState,
    pub event: LinkEvent,
    pub link: String,
}

/// Errors surfaced by link operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    #[error(transparent)]
    Fsm(#[from] FsmError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// Observer invoked with `(old_state, new_state)` on every transition.
pub type StateObserver = Box<dyn FnMut(LinkState, LinkState)>;

/// Link activity counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LinkStats {
    pub sent_pkts: u32,
    pub recv_pkts: u32,
    pub sent_states: u32,
    pub recv_states: u32,
    pub sent_probes: u32,
    pub recv_probes: u32,
    pub deferred_recv: u32,
    pub duplicates: u32,
}

/// Backlog queue accounting for one importance level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BacklogEntry {
    pub len: u16,
    pub limit: u16,
}

/// Creation-time attributes of a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub peer_addr: u32,
    pub self_addr: u32,
    pub peer_id: String,
    pub self_id: String,
    pub if_name: String,
    pub session: u16,
    pub peer_caps: u16,
    pub in_session: bool,
    pub tolerance: Duration,
    pub net_plane: char,
    pub advertised_mtu: u16,
    pub mtu: u16,
    pub priority: u32,
    pub min_win: u16,
    pub max_win: u16,
    pub bearer_id: u32,
    pub peer_bearer_id: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            peer_addr: 0,
            self_addr: 0,
            peer_id: String::new(),
            self_id: String::new(),
            if_name: String::new(),
            session: 0,
            peer_caps: 0,
            in_session: false,
            tolerance: Duration::from_millis(1500),
            net_plane: 'A',
            advertised_mtu: super::header::FB_MTU,
            mtu: super::header::FB_MTU,
            priority: 10,
            min_win: 50,
            max_win: 8191,
            bearer_id: 0,
            peer_bearer_id: 0,
        }
    }
}

/// Link snapshot for external queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub name: String,
    pub peer_addr: u32,
    pub state: LinkState,
    pub session: u16,
    pub peer_session: u16,
    pub in_session: bool,
    pub bearer_id: u32,
    pub peer_bearer_id: u32,
    pub tolerance: Duration,
    pub abort_limit: u32,
    pub silent_intv_cnt: u32,
    pub priority: u32,
    pub net_plane: char,
    pub mtu: u16,
    pub advertised_mtu: u16,
    pub window: u16,
    pub stats: LinkStats,
}

/// One link endpoint.
pub struct Link {
    // Identity
    addr: u32,
    self_addr: u32,
    name: String,

    // Management and link supervision data
    peer_session: u16,
    session: u16,
    snd_nxt_state: u16,
    rcv_nxt_state: u16,
    peer_bearer_id: u32,
    bearer_id: u32,
    tolerance: Duration,
    abort_limit: u32,
    state: LinkState,
    peer_caps: u16,
    in_session: bool,
    active: bool,
    silent_intv_cnt: u32,
    priority: u32,
    net_plane: char,
    mon_state: MonState,
    rst_cnt: u16,

    // Max packet negotiation
    mtu: u16,
    advertised_mtu: u16,

    // Sending
    backlog: [BacklogEntry; 5],
    snd_nxt: u16,
    transmq: VecDeque<Bytes>,

    // Reception
    rcv_nxt: u16,
    rcv_unacked: u32,
    deferdq: VecDeque<Bytes>,

    // Congestion handling
    window: u16,
    min_win: u16,
    ssthresh: u16,
    max_win: u16,
    checkpoint: u16,

    stats: LinkStats,
    observer: Option<StateObserver>,
}

/// Result of one periodic link timeout.
#[derive(Debug)]
pub struct LinkTimeout {
    /// Flag bitset; `TIPC_LINK_DOWN_EVT` obliges the node to run its
    /// link-down path.
    pub flags: u32,
    /// Protocol message to transmit on the bearer, if any.
    pub msg: Option<ProtoMsg>,
}

impl Link {
    pub fn new(cfg: LinkConfig) -> Self {
        // Peer i/f name stays unknown until activation completes
        let mut self_str = cfg.self_id.clone();
        if self_str.is_empty() || self_str.len() > 16 {
            self_str = cfg.self_addr.to_string();
        }
        let mut peer_str = cfg.peer_id.clone();
        if peer_str.is_empty() || peer_str.len() > 16 {
            peer_str = cfg.peer_addr.to_string();
        }
        let name = format!("{}:{}-{}:unknown", self_str, cfg.if_name, peer_str);

        let mut link = Self {
            addr: cfg.peer_addr,
            self_addr: cfg.self_addr,
            name,
            peer_session: 0,
            session: cfg.session,
            snd_nxt_state: 1,
            rcv_nxt_state: 1,
            peer_bearer_id: cfg.peer_bearer_id,
            bearer_id: cfg.bearer_id,
            tolerance: cfg.tolerance,
            abort_limit: 1,
            state: LinkState::Resetting,
            peer_caps: cfg.peer_caps,
            in_session: cfg.in_session,
            active: false,
            silent_intv_cnt: 0,
            priority: cfg.priority,
            net_plane: cfg.net_plane,
            mon_state: MonState::default(),
            rst_cnt: 0,
            mtu: cfg.mtu,
            advertised_mtu: cfg.advertised_mtu,
            backlog: [BacklogEntry::default(); 5],
            snd_nxt: 1,
            transmq: VecDeque::new(),
            rcv_nxt: 1,
            rcv_unacked: 0,
            deferdq: VecDeque::new(),
            window: 0,
            min_win: 0,
            ssthresh: 0,
            max_win: 0,
            checkpoint: 0,
            stats: LinkStats::default(),
            observer: None,
        };
        link.set_queue_limits(cfg.min_win, cfg.max_win);
        link
    }

    // --- queries ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> u32 {
        self.addr
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    pub fn set_tolerance(&mut self, tolerance: Duration) {
        self.tolerance = tolerance;
    }

    pub fn abort_limit(&self) -> u32 {
        self.abort_limit
    }

    pub fn set_abort_limit(&mut self, limit: u32) {
        self.abort_limit = limit;
    }

    pub fn is_up(&self) -> bool {
        matches!(self.state, LinkState::Established | LinkState::Synching)
    }

    pub fn peer_is_down(&self) -> bool {
        self.state == LinkState::PeerReset
    }

    pub fn is_reset(&self) -> bool {
        matches!(
            self.state,
            LinkState::Reset | LinkState::FailingOver | LinkState::Establishing
        )
    }

    pub fn is_establishing(&self) -> bool {
        self.state == LinkState::Establishing
    }

    pub fn is_synching(&self) -> bool {
        self.state == LinkState::Synching
    }

    pub fn is_failingover(&self) -> bool {
        self.state == LinkState::FailingOver
    }

    pub fn is_blocked(&self) -> bool {
        matches!(
            self.state,
            LinkState::Resetting | LinkState::PeerReset | LinkState::FailingOver
        )
    }

    /// True when `silent_intv_cnt` is about to reach the abort limit.
    pub fn too_silent(&self) -> bool {
        self.silent_intv_cnt + 2 > self.abort_limit
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Combined local/peer bearer identity of this link.
    pub fn id(&self) -> u32 {
        self.peer_bearer_id << 16 | self.bearer_id
    }

    pub fn bearer_id(&self) -> u32 {
        self.bearer_id
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    pub fn ssthresh(&self) -> u16 {
        self.ssthresh
    }

    pub fn min_win(&self) -> u16 {
        self.min_win
    }

    pub fn max_win(&self) -> u16 {
        self.max_win
    }

    pub fn prio(&self) -> u32 {
        self.priority
    }

    pub fn set_prio(&mut self, prio: u32) {
        self.priority = prio;
    }

    pub fn net_plane(&self) -> char {
        self.net_plane
    }

    pub fn update_caps(&mut self, capabilities: u16) {
        self.peer_caps = capabilities;
    }

    pub fn peer_caps(&self) -> u16 {
        self.peer_caps
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    pub fn advertised_mtu(&self) -> u16 {
        self.advertised_mtu
    }

    pub fn rcv_nxt(&self) -> u16 {
        self.rcv_nxt
    }

    /// Next expected protocol-message sequence number.
    pub fn rcv_nxt_state(&self) -> u16 {
        self.rcv_nxt_state
    }

    pub fn checkpoint(&self) -> u16 {
        self.checkpoint
    }

    pub fn session(&self) -> u16 {
        self.session
    }

    pub fn peer_session(&self) -> u16 {
        self.peer_session
    }

    pub fn set_peer_session(&mut self, session: u16) {
        self.peer_session = session;
    }

    pub fn in_session(&self) -> bool {
        self.in_session
    }

    pub fn set_in_session(&mut self, in_session: bool) {
        self.in_session = in_session;
    }

    pub fn backlog_limit(&self, importance: Importance) -> u16 {
        self.backlog[importance.index()].limit
    }

    pub fn silent_intv_cnt(&self) -> u32 {
        self.silent_intv_cnt
    }

    pub fn mon_state(&self) -> MonState {
        self.mon_state
    }

    pub fn set_mon_state(&mut self, state: MonState) {
        self.mon_state = state;
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = LinkStats::default();
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            name: self.name.clone(),
            peer_addr: self.addr,
            state: self.state,
            session: self.session,
            peer_session: self.peer_session,
            in_session: self.in_session,
            bearer_id: self.bearer_id,
            peer_bearer_id: self.peer_bearer_id,
            tolerance: self.tolerance,
            abort_limit: self.abort_limit,
            silent_intv_cnt: self.silent_intv_cnt,
            priority: self.priority,
            net_plane: self.net_plane,
            mtu: self.mtu,
            advertised_mtu: self.advertised_mtu,
            window: self.window,
            stats: self.stats,
        }
    }

    /// Register the state trace observer.
    pub fn set_state_observer(&mut self, observer: impl FnMut(LinkState, LinkState) + 'static) {
        self.observer = Some(Box::new(observer));
    }

    // --- setup / reset ---

    /// Derive windowing and backlog limits from the window bounds.
    pub fn set_queue_limits(&mut self, min_win: u16, max_win: u16) {
        self.min_win = min_win;
        self.ssthresh = max_win;
        self.max_win = max_win;
        self.window = min_win;
        self.backlog[Importance::Low.index()].limit = min_win * 2;
        self.backlog[Importance::Medium.index()].limit = min_win * 4;
        self.backlog[Importance::High.index()].limit = min_win * 6;
        self.backlog[Importance::Critical.index()].limit = min_win * 8;
    }

    /// Abandon the current session: the next activation negotiates a
    /// fresh one, and stale protocol messages from the old session are
    /// rejected by their session number.
    pub fn reset(&mut self) {
        self.in_session = false;
        self.session = self.session.wrapping_add(1);
        self.silent_intv_cnt = 0;
        self.rst_cnt = 0;
        self.mon_state = MonState::default();
    }

    /// Account for any reception from the peer.
    pub fn on_reception(&mut self) {
        self.silent_intv_cnt = 0;
        self.stats.recv_pkts += 1;
    }

    /// Record the peer's protocol-message sequence number.
    pub fn note_proto_seqno(&mut self, seqno: u16) {
        self.rcv_nxt_state = seqno.wrapping_add(1);
    }

    /// Account one received STATE message.
    pub fn note_state_rcv(&mut self, probe: bool) {
        self.stats.recv_states += 1;
        if probe {
            self.stats.recv_probes += 1;
        }
    }

    fn set_state(&mut self, next: LinkState) {
        if next == self.state {
            return;
        }
        let old = self.state;
        self.state = next;
        debug!(link = %self.name, ?old, state = ?next, "link state change");
        if let Some(observer) = self.observer.as_mut() {
            observer(old, next);
        }
    }

    // --- finite state machine ---

    /// Apply one event to the link FSM. Returns the flag bitset for the
    /// caller to act on; events outside the legal table are fatal to the
    /// current connection.
    pub fn fsm_evt(&mut self, evt: LinkEvent) -> Result<u32, FsmError> {
        let mut rc = 0u32;
        let next = match (self.state, evt) {
            (LinkState::Resetting, LinkEvent::PeerReset) => Some(LinkState::PeerReset),
            (LinkState::Resetting, LinkEvent::Reset) => Some(LinkState::Reset),
            (LinkState::Resetting, _) => return Err(self.illegal(evt)),

            (LinkState::Reset, LinkEvent::PeerReset) => Some(LinkState::Establishing),
            (LinkState::Reset, LinkEvent::FailoverBegin) => Some(LinkState::FailingOver),
            (
                LinkState::Reset,
                LinkEvent::Failure
                | LinkEvent::Reset
                | LinkEvent::Establish
                | LinkEvent::FailoverEnd,
            ) => None,
            (LinkState::Reset, _) => return Err(self.illegal(evt)),

            (LinkState::PeerReset, LinkEvent::Reset) => Some(LinkState::Establishing),
            (
                LinkState::PeerReset,
                LinkEvent::PeerReset | LinkEvent::Establish | LinkEvent::Failure,
            ) => None,
            (LinkState::PeerReset, _) => return Err(self.illegal(evt)),

            (LinkState::FailingOver, LinkEvent::FailoverEnd) => Some(LinkState::Reset),
            (
                LinkState::FailingOver,
                LinkEvent::PeerReset
                | LinkEvent::Reset
                | LinkEvent::Establish
                | LinkEvent::Failure,
            ) => None,
            (LinkState::FailingOver, _) => return Err(self.illegal(evt)),

            (LinkState::Establishing, LinkEvent::Establish) => Some(LinkState::Established),
            (LinkState::Establishing, LinkEvent::FailoverBegin) => Some(LinkState::FailingOver),
            (LinkState::Establishing, LinkEvent::Reset) => Some(LinkState::Reset),
            (
                LinkState::Establishing,
                LinkEvent::Failure
                | LinkEvent::PeerReset
                | LinkEvent::SynchBegin
                | LinkEvent::FailoverEnd,
            ) => None,
            (LinkState::Establishing, _) => return Err(self.illegal(evt)),

            (LinkState::Established, LinkEvent::PeerReset) => {
                rc |= TIPC_LINK_DOWN_EVT;
                Some(LinkState::PeerReset)
            }
            (LinkState::Established, LinkEvent::Failure) => {
                rc |= TIPC_LINK_DOWN_EVT;
                Some(LinkState::Resetting)
            }
            (LinkState::Established, LinkEvent::Reset) => Some(LinkState::Reset),
            (LinkState::Established, LinkEvent::SynchBegin) => Some(LinkState::Synching),
            (LinkState::Established, LinkEvent::Establish | LinkEvent::SynchEnd) => None,
            (LinkState::Established, _) => return Err(self.illegal(evt)),

            (LinkState::Synching, LinkEvent::PeerReset) => {
                rc |= TIPC_LINK_DOWN_EVT;
                Some(LinkState::PeerReset)
            }
            (LinkState::Synching, LinkEvent::Failure) => {
                rc |= TIPC_LINK_DOWN_EVT;
                Some(LinkState::Resetting)
            }
            (LinkState::Synching, LinkEvent::Reset) => Some(LinkState::Reset),
            (LinkState::Synching, LinkEvent::SynchEnd) => Some(LinkState::Established),
            (LinkState::Synching, LinkEvent::Establish | LinkEvent::SynchBegin) => None,
            (LinkState::Synching, _) => return Err(self.illegal(evt)),
        };
        if let Some(next) = next {
            self.set_state(next);
        }
        Ok(rc)
    }

    fn illegal(&self, event: LinkEvent) -> FsmError {
        FsmError {
            state: self.state,
            event,
            link: self.name.clone(),
        }
    }

    // --- periodic supervision ---

    /// Perform the periodic work for this link, as driven by the node
    /// keepalive timer. Depending on the state this probes the peer,
    /// retries setup, or detects continuity loss via the monitor verdict.
    pub fn timeout(&mut self, mon: &Monitor) -> Result<LinkTimeout, LinkError> {
        let mut mtyp = STATE_MSG;
        let mut state_dirty = false;
        let mut probe = false;
        let mut setup = false;

        match self.state {
            LinkState::Established | LinkState::Synching => {
                mon.get_state(self.addr, &mut self.mon_state)?;
                if self.mon_state.reset || self.silent_intv_cnt > self.abort_limit {
                    let flags = self.fsm_evt(LinkEvent::Failure)?;
                    return Ok(LinkTimeout { flags, msg: None });
                }
                state_dirty = self.rcv_unacked != 0
                    || !self.transmq.is_empty()
                    || !self.deferdq.is_empty();
                probe = self.mon_state.probing || self.silent_intv_cnt > 0;
                if probe || self.mon_state.monitoring {
                    self.silent_intv_cnt += 1;
                }
            }
            LinkState::Reset => {
                setup = self.rst_cnt <= 4 || self.rst_cnt % 16 == 0;
                self.rst_cnt += 1;
                mtyp = RESET_MSG;
            }
            LinkState::Establishing => {
                setup = true;
                mtyp = ACTIVATE_MSG;
            }
            LinkState::PeerReset | LinkState::Resetting | LinkState::FailingOver => {}
        }

        let msg = if state_dirty || probe || setup {
            Some(self.build_proto_msg(mtyp, probe, mon))
        } else {
            None
        };
        Ok(LinkTimeout { flags: 0, msg })
    }

    /// Build a STATE/RESET/ACTIVATE message from the current link state.
    /// STATE messages carry the monitor's domain record as payload.
    pub fn build_proto_msg(&mut self, mtyp: u8, probe: bool, mon: &Monitor) -> ProtoMsg {
        let domain = if mtyp == STATE_MSG {
            mon.prep(&self.mon_state)
        } else {
            Bytes::new()
        };

        let mut header = SignalHeader::new(
            LINK_PROTOCOL,
            INT_H_SIZE,
            (SIGNAL_H_SIZE + domain.len()) as u16,
        );
        header.set_msg_type(mtyp);
        header.set_prev_node(self.self_addr);
        header.set_orig_node(self.self_addr);
        header.set_dest_node(self.addr);
        header.set_session(self.session);
        header.set_bearer_id(self.bearer_id as u8);
        header.set_link_prio(self.priority as u8);
        header.set_net_plane(self.net_plane);
        header.set_probe(probe);
        header.set_link_ack(self.rcv_nxt.wrapping_sub(1));
        header.set_link_seq(self.snd_nxt_state);
        header.set_next_sent_no(self.snd_nxt);
        header.set_max_pkt(self.advertised_mtu);
        header.set_link_tolerance(self.tolerance.as_millis().min(u16::MAX as u128) as u16);
        self.snd_nxt_state = self.snd_nxt_state.wrapping_add(1);

        self.stats.sent_pkts += 1;
        if mtyp == STATE_MSG {
            self.stats.sent_states += 1;
        }
        if probe {
            self.stats.sent_probes += 1;
        }
        ProtoMsg {
            header,
            domain,
        }
    }
}
