//! Node-level link ownership and keepalive supervision.
//!
//! A node owns up to [`MAX_BEARERS`] links and one monitor per bearer.
//! The keepalive timer drives every owned link's periodic work; link
//! up/down transitions are recorded as action flags and forwarded to the
//! monitors when the state-modifying section ends, mirroring the
//! write-unlock hook of the reference implementation.

use crate::link::{
    Link, LinkConfig, LinkError, LinkEvent, ProtoMsg, ACTIVATE_MSG, INT_H_SIZE, MAX_MSG_SIZE,
    RESET_MSG, STATE_MSG, TIPC_LINK_DOWN_EVT,
};
use crate::monitor::Monitor;
use crate::sim::{Simulator, TimerHandle};
use crate::types::{AddrCounter, DEFAULT_NET_ID, INVALID_BEARER_ID, MAX_BEARERS, NODE_ID_LEN};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// A node with no up links is torn down this long after losing contact.
pub const NODE_CLEANUP_AFTER: Duration = Duration::from_millis(300_000);

/// Signature value of a node instance that has not identified itself yet.
pub const INVALID_NODE_SIG: u32 = 0x10000;

// Flags used to take different actions on leaving a critical section.
pub const TIPC_NOTIFY_NODE_DOWN: u32 = 1 << 3;
pub const TIPC_NOTIFY_NODE_UP: u32 = 1 << 4;
pub const TIPC_NOTIFY_LINK_UP: u32 = 1 << 6;
pub const TIPC_NOTIFY_LINK_DOWN: u32 = 1 << 7;

/// Connectivity state versus the peer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum NodeState {
    SelfDownPeerDown = 0xdd,
    SelfUpPeerUp = 0xaa,
    SelfDownPeerLeaving = 0xd1,
    SelfUpPeerComing = 0xac,
    SelfComingPeerUp = 0xca,
    SelfLeavingPeerDown = 0x1d,
    FailingOver = 0xf0,
    Synching = 0xcc,
}

/// One bearer slot.
pub struct LinkEntry {
    pub link: Link,
    /// MTU offered to users of this entry, tunnel header already deducted.
    pub mtu: u32,
}

/// Creation-time attributes of a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Explicit address; allocated from the counter when absent.
    pub address: Option<u32>,
    pub peer_id: String,
    pub capabilities: u16,
}

/// Node snapshot for external queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub addr: u32,
    pub node_id_string: String,
    pub state: NodeState,
    pub is_up: bool,
    pub link_cnt: usize,
    pub working_links: u16,
    pub capabilities: u16,
    pub keepalive_intv: Duration,
}

/// Callback invoked for every protocol message a link emits; stands in
/// for the bearer transmit path.
pub type TransmitFn = Box<dyn FnMut(usize, &ProtoMsg)>;

/// Result of one keepalive tick.
pub struct TickOutcome {
    /// Delay until the next tick; None once the node cleaned itself up.
    pub next: Option<Duration>,
    /// Messages emitted by the links this tick, with their bearer ids.
    pub sent: Vec<(usize, ProtoMsg)>,
}

/// One simulated node.
pub struct Node {
    addr: u32,
    node_id: [u8; NODE_ID_LEN],
    node_id_string: String,
    net_id: u32,
    capabilities: u16,
    signature: u32,
    peer_id: String,

    active_links: [i32; 2],
    links: [Option<LinkEntry>; MAX_BEARERS],
    mons: BTreeMap<u32, Rc<RefCell<Monitor>>>,

    action_flags: u32,
    state: NodeState,
    failover_sent: bool,
    link_cnt: usize,
    working_links: u16,
    link_id: u32,

    keepalive_intv: Duration,
    delete_at: Duration,
    timer: Option<TimerHandle>,
    transmit: Option<TransmitFn>,
}

impl Node {
    /// Create a node, drawing an address from `counter` unless the
    /// config pins one.
    pub fn new(cfg: NodeConfig, counter: &AddrCounter, now: Duration) -> Self {
        let addr = cfg.address.unwrap_or_else(|| counter.next());
        let mut node_id = [0u8; NODE_ID_LEN];
        node_id[..4].copy_from_slice(&addr.to_be_bytes());
        let node_id_string = hex::encode(node_id);

        Self {
            addr,
            node_id,
            node_id_string,
            net_id: DEFAULT_NET_ID,
            capabilities: cfg.capabilities,
            signature: INVALID_NODE_SIG,
            peer_id: cfg.peer_id,
            active_links: [INVALID_BEARER_ID; 2],
            links: [None, None, None],
            mons: BTreeMap::new(),
            action_flags: 0,
            state: NodeState::SelfDownPeerLeaving,
            failover_sent: false,
            link_cnt: 0,
            working_links: 0,
            link_id: 0,
            keepalive_intv: Duration::from_millis(u32::MAX as u64),
            delete_at: now + NODE_CLEANUP_AFTER,
            timer: None,
            transmit: None,
        }
    }

    // --- queries ---

    pub fn addr(&self) -> u32 {
        self.addr
    }

    pub fn node_id(&self) -> &[u8; NODE_ID_LEN] {
        &self.node_id
    }

    /// Lowercase hex rendering of the 128-bit node id.
    pub fn node_id_string(&self) -> &str {
        &self.node_id_string
    }

    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    pub fn capabilities(&self) -> u16 {
        self.capabilities
    }

    pub fn signature(&self) -> u32 {
        self.signature
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn failover_sent(&self) -> bool {
        self.failover_sent
    }

    pub fn link_cnt(&self) -> usize {
        self.link_cnt
    }

    pub fn working_links(&self) -> u16 {
        self.working_links
    }

    pub fn keepalive_intv(&self) -> Duration {
        self.keepalive_intv
    }

    pub fn delete_at(&self) -> Duration {
        self.delete_at
    }

    /// A node is up while at least one active-link slot is occupied.
    pub fn is_up(&self) -> bool {
        self.active_links[0] != INVALID_BEARER_ID
    }

    /// An address designates this node if it matches or is anonymous.
    pub fn own_node(&self, addr: u32) -> bool {
        crate::types::in_own_node(self.addr, addr)
    }

    pub fn link(&self, bearer_id: usize) -> Option<&Link> {
        self.links.get(bearer_id)?.as_ref().map(|e| &e.link)
    }

    pub fn link_mut(&mut self, bearer_id: usize) -> Option<&mut Link> {
        self.links.get_mut(bearer_id)?.as_mut().map(|e| &mut e.link)
    }

    /// The link currently filling active slot `sel & 1`.
    pub fn active_link(&self, sel: usize) -> Option<&Link> {
        let bearer_id = self.active_links[sel & 1];
        if bearer_id == INVALID_BEARER_ID {
            return None;
        }
        self.link(bearer_id as usize)
    }

    /// MTU towards the peer over the active link selected by `sel`.
    pub fn mtu(&self, sel: usize) -> u32 {
        let bearer_id = self.active_links[sel & 1];
        if bearer_id == INVALID_BEARER_ID {
            return MAX_MSG_SIZE;
        }
        self.links[bearer_id as usize]
            .as_ref()
            .map(|e| e.mtu)
            .unwrap_or(MAX_MSG_SIZE)
    }

    pub fn monitor(&self, bearer_id: u32) -> Option<Rc<RefCell<Monitor>>> {
        self.mons.get(&bearer_id).cloned()
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            addr: self.addr,
            node_id_string: self.node_id_string.clone(),
            state: self.state,
            is_up: self.is_up(),
            link_cnt: self.link_cnt,
            working_links: self.working_links,
            capabilities: self.capabilities,
            keepalive_intv: self.keepalive_intv,
        }
    }

    /// Install the bearer transmit hook.
    pub fn set_transmit(&mut self, transmit: impl FnMut(usize, &ProtoMsg) + 'static) {
        self.transmit = Some(Box::new(transmit));
    }

    // --- link and monitor construction ---

    /// The per-bearer monitor, created lazily on first use.
    pub fn ensure_monitor(&mut self, bearer_id: u32) -> Rc<RefCell<Monitor>> {
        let addr = self.addr;
        self.mons
            .entry(bearer_id)
            .or_insert_with(|| Rc::new(RefCell::new(Monitor::new(addr, bearer_id))))
            .clone()
    }

    /// Create the link for `bearer_id`. The node fills in its own
    /// identity; the caller supplies the peer-facing attributes.
    pub fn create_link(&mut self, bearer_id: usize, mut cfg: LinkConfig) {
        cfg.self_addr = self.addr;
        if cfg.self_id.is_empty() {
            cfg.self_id = self.node_id_string.clone();
        }
        cfg.bearer_id = bearer_id as u32;
        let link = Link::new(cfg);
        self.ensure_monitor(bearer_id as u32);
        let mtu = link.mtu() as u32;
        if self.links[bearer_id].is_none() {
            self.link_cnt += 1;
        }
        self.links[bearer_id] = Some(LinkEntry { link, mtu });
        self.calculate_timer(bearer_id);
    }

    /// Fold one link's tolerance into the keepalive interval and set its
    /// abort limit accordingly. The link with the lowest tolerance
    /// determines the node timer interval.
    fn calculate_timer(&mut self, bearer_id: usize) {
        let Some(tol) = self.link(bearer_id).map(|l| l.tolerance()) else {
            return;
        };
        let intv = (tol / 4).min(Duration::from_millis(500));
        if intv < self.keepalive_intv {
            self.keepalive_intv = intv;
        }
        let intv_ms = self.keepalive_intv.as_millis().max(1) as u64;
        let limit = ((tol.as_millis() as u64) / intv_ms).max(1) as u32;
        if let Some(link) = self.link_mut(bearer_id) {
            link.set_abort_limit(limit);
        }
    }

    // --- link state changes ---

    /// Handle establishment of the link on `bearer_id`: the link becomes
    /// active (alone or shared) or standby, depending on its priority.
    pub fn link_up(&mut self, bearer_id: usize) -> Result<(), LinkError> {
        let old = self
            .active_link(0)
            .map(|l| (l.prio(), l.bearer_id() as usize));

        let (prio, link_id) = {
            let Some(entry) = self.links[bearer_id].as_mut() else {
                return Ok(());
            };
            let link = &mut entry.link;
            if link.is_up() {
                return Ok(());
            }
            link.fsm_evt(LinkEvent::Establish)?;
            if !link.is_up() {
                return Ok(());
            }
            debug!(link = %link.name(), plane = %link.net_plane(), "established link");
            let out = (link.prio(), link.id());
            // Leave room for the tunnel header in the user-visible MTU
            let mtu = link.mtu().saturating_sub(INT_H_SIZE) as u32;
            entry.mtu = mtu;
            out
        };

        self.working_links += 1;
        self.action_flags |= TIPC_NOTIFY_LINK_UP;
        self.link_id = link_id;

        match old {
            // First link: give it both slots
            None => {
                self.active_links = [bearer_id as i32; 2];
                self.state = NodeState::SelfUpPeerUp;
                self.failover_sent = false;
                self.action_flags |= TIPC_NOTIFY_NODE_UP;
                if let Some(link) = self.link_mut(bearer_id) {
                    link.set_active(true);
                }
            }
            // Second link: redistribute slots
            Some((old_prio, old_id)) if prio > old_prio => {
                debug!(standby = old_id, "old link becomes standby");
                self.active_links = [bearer_id as i32; 2];
                if let Some(link) = self.link_mut(bearer_id) {
                    link.set_active(true);
                }
                if let Some(link) = self.link_mut(old_id) {
                    link.set_active(false);
                }
            }
            Some((old_prio, _)) if prio == old_prio => {
                self.active_links[1] = bearer_id as i32;
                if let Some(link) = self.link_mut(bearer_id) {
                    link.set_active(true);
                }
            }
            Some(_) => {
                debug!(bearer_id, "new link is standby");
            }
        }
        Ok(())
    }

    /// Handle loss of the link on `bearer_id`: reset it, promote the best
    /// remaining up link, and flag the monitor notification. Links that
    /// already went through their reset are only deleted on request.
    pub fn link_down(&mut self, bearer_id: usize, delete: bool, now: Duration) {
        let already_reset = match self.link(bearer_id) {
            Some(link) => link.is_reset(),
            None => return,
        };
        if !already_reset {
            let mut link_id = 0;
            if let Some(link) = self.link_mut(bearer_id) {
                if let Err(e) = link.fsm_evt(LinkEvent::Reset) {
                    // Reset is accepted in every non-reset state
                    panic!("{e}");
                }
                link.set_active(false);
                link_id = link.id();
                link.reset();
            }
            self.working_links = self.working_links.saturating_sub(1);
            self.action_flags |= TIPC_NOTIFY_LINK_DOWN;
            self.link_id = link_id;

            // Promote the best remaining up link, if any
            let mut best: Option<(u32, usize)> = None;
            for (id, slot) in self.links.iter().enumerate() {
                if id == bearer_id {
                    continue;
                }
                if let Some(entry) = slot {
                    if entry.link.is_up() && best.map_or(true, |(p, _)| entry.link.prio() > p) {
                        best = Some((entry.link.prio(), id));
                    }
                }
            }
            self.active_links = match best {
                Some((_, id)) => [id as i32; 2],
                None => [INVALID_BEARER_ID; 2],
            };

            if !self.is_up() {
                self.state = NodeState::SelfDownPeerLeaving;
                self.delete_at = now + NODE_CLEANUP_AFTER;
                self.action_flags |= TIPC_NOTIFY_NODE_DOWN;
            }
        }
        if delete {
            self.links[bearer_id] = None;
            self.link_cnt = self.link_cnt.saturating_sub(1);
        }
    }

    /// Drain the action flags accumulated during a state-modifying
    /// section: link up/down notifications go to the bearer's monitor.
    /// Node up/down flags are reserved for name-table notification,
    /// which is outside this model.
    pub fn write_unlock(&mut self) {
        let flags = self.action_flags;
        if flags == 0 {
            return;
        }
        let bearer_id = self.link_id & 0xffff;
        let peer_addr = self
            .links
            .get(bearer_id as usize)
            .and_then(|e| e.as_ref())
            .map(|e| e.link.peer_addr());
        self.action_flags &= !(TIPC_NOTIFY_NODE_DOWN
            | TIPC_NOTIFY_NODE_UP
            | TIPC_NOTIFY_LINK_DOWN
            | TIPC_NOTIFY_LINK_UP);

        let Some(peer_addr) = peer_addr else {
            if flags & (TIPC_NOTIFY_LINK_UP | TIPC_NOTIFY_LINK_DOWN) != 0 {
                warn!(bearer_id, "link notification for a vanished link");
            }
            return;
        };
        let Some(mon) = self.mons.get(&bearer_id).cloned() else {
            return;
        };
        if flags & TIPC_NOTIFY_LINK_UP != 0 {
            mon.borrow_mut().peer_up(peer_addr);
        }
        if flags & TIPC_NOTIFY_LINK_DOWN != 0 {
            mon.borrow_mut().peer_down(peer_addr, bearer_id);
        }
    }

    // --- reception ---

    /// Process a bearer-delivered protocol message: validate the header,
    /// refresh link liveness, feed the domain record to the monitor and
    /// drive the FSM.
    pub fn on_proto_msg(
        &mut self,
        bearer_id: usize,
        buf: &[u8],
        now: Duration,
    ) -> Result<(), LinkError> {
        let msg = ProtoMsg::decode(buf)?;
        let hdr = msg.header;

        let peer_addr = {
            let Some(link) = self.link_mut(bearer_id) else {
                return Ok(());
            };
            // Stale session: the peer restarted the link after sending this
            if link.in_session() && hdr.session() != link.peer_session() {
                debug!(link = %link.name(), session = hdr.session(), "dropping stale protocol message");
                return Ok(());
            }
            link.on_reception();
            link.peer_addr()
        };

        let mut down = false;
        match hdr.msg_type() {
            RESET_MSG => {
                if let Some(link) = self.link_mut(bearer_id) {
                    link.set_peer_session(hdr.session());
                    let flags = link.fsm_evt(LinkEvent::PeerReset)?;
                    down = flags & TIPC_LINK_DOWN_EVT != 0;
                }
            }
            ACTIVATE_MSG => {
                if let Some(link) = self.link_mut(bearer_id) {
                    link.set_peer_session(hdr.session());
                    link.set_in_session(true);
                    let advertised = hdr.max_pkt();
                    if advertised != 0 {
                        let mtu = link.mtu().min(advertised);
                        link.set_mtu(mtu);
                    }
                }
                self.link_up(bearer_id)?;
            }
            STATE_MSG => {
                let mut mon_state = self
                    .link(bearer_id)
                    .map(|l| l.mon_state())
                    .unwrap_or_default();
                if let Some(mon) = self.mons.get(&(bearer_id as u32)).cloned() {
                    mon.borrow_mut().recv(&msg.domain, peer_addr, &mut mon_state);
                }
                if let Some(link) = self.link_mut(bearer_id) {
                    link.set_mon_state(mon_state);
                    link.note_proto_seqno(hdr.link_seq());
                    link.note_state_rcv(hdr.probe());
                }
            }
            other => {
                debug!(msg_type = other, "ignoring unknown protocol message type");
            }
        }
        if down {
            self.link_down(bearer_id, false, now);
        }
        self.write_unlock();
        Ok(())
    }

    // --- timer loop ---

    /// One keepalive tick. Recomputes the keepalive interval from the
    /// link tolerances, runs every owned link's periodic work, handles
    /// down events and drains the action flags.
    pub fn timer_tick(&mut self, now: Duration) -> Result<TickOutcome, LinkError> {
        if !self.is_up() && self.cleanup(now) {
            debug!(addr = self.addr, "node cleaned up, stopping timer");
            return Ok(TickOutcome {
                next: None,
                sent: Vec::new(),
            });
        }

        // Start high; the lowest link tolerance pulls it down
        self.keepalive_intv = Duration::from_millis(10_000);
        let mut sent = Vec::new();
        let mut down = Vec::new();
        let mut remains = self.link_cnt;

        for bearer_id in 0..MAX_BEARERS {
            if remains == 0 {
                break;
            }
            if self.links[bearer_id].is_none() {
                continue;
            }
            remains -= 1;
            // Link tolerance may change asynchronously
            self.calculate_timer(bearer_id);

            let Some(mon) = self.mons.get(&(bearer_id as u32)).cloned() else {
                continue;
            };
            let Some(entry) = self.links[bearer_id].as_mut() else {
                continue;
            };
            let outcome = entry.link.timeout(&mon.borrow())?;
            if let Some(msg) = outcome.msg {
                sent.push((bearer_id, msg));
            }
            if outcome.flags & TIPC_LINK_DOWN_EVT != 0 {
                down.push(bearer_id);
            }
        }

        for bearer_id in down {
            self.link_down(bearer_id, false, now);
        }
        self.write_unlock();

        if let Some(transmit) = self.transmit.as_mut() {
            for (bearer_id, msg) in &sent {
                transmit(*bearer_id, msg);
            }
        }
        Ok(TickOutcome {
            next: Some(self.keepalive_intv),
            sent,
        })
    }

    /// Tear the node down once it has been without up links past its
    /// deletion deadline.
    fn cleanup(&mut self, now: Duration) -> bool {
        if !self.is_up() && now > self.delete_at {
            self.clear_links();
            return true;
        }
        false
    }

    fn clear_links(&mut self) {
        for entry in self.links.iter_mut() {
            if entry.take().is_some() {
                self.link_cnt = self.link_cnt.saturating_sub(1);
            }
        }
    }

    // --- simulator wiring ---

    /// Arm the keepalive timer on a simulator.
    pub fn start(node: &Rc<RefCell<Node>>, sim: &mut Simulator) {
        let delay = node
            .borrow()
            .keepalive_intv
            .min(Duration::from_millis(10_000));
        Self::arm(node, sim, delay);
    }

    fn arm(node: &Rc<RefCell<Node>>, sim: &mut Simulator, delay: Duration) {
        let weak = Rc::downgrade(node);
        let handle = sim.schedule(delay, Box::new(move |sim| Node::tick_event(weak, sim)));
        node.borrow_mut().timer = Some(handle);
    }

    fn tick_event(weak: Weak<RefCell<Node>>, sim: &mut Simulator) {
        let Some(node) = weak.upgrade() else {
            return;
        };
        let now = sim.now();
        let outcome = node
            .borrow_mut()
            .timer_tick(now)
            .unwrap_or_else(|e| panic!("fatal signalling error: {e}"));
        match outcome.next {
            Some(next) => Self::arm(&node, sim, next),
            None => node.borrow_mut().timer = None,
        }
    }

    /// Cancel the keepalive timer and every monitor timer.
    pub fn stop(&mut self, sim: &mut Simulator) {
        if let Some(handle) = self.timer.take() {
            sim.cancel(handle);
        }
        for mon in self.mons.values() {
            mon.borrow_mut().stop(sim);
        }
    }
}
