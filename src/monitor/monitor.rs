//! Cluster neighbor monitor.
//!
//! Peers form a logical ring in ascending address order; the local node
//! occupies its own position on the ring but is not stored in the peer
//! map. Each node continuously monitors the ⌈√n⌉−1 successors in its own
//! domain and learns about the rest of the cluster from domain records
//! gossiped by the designated head peers. The monitor only probes at all
//! while the cluster is larger than the configured threshold; below it,
//! every link is monitored directly.

use super::domain::{
    dom_rec_len, dom_size, map_get, map_set, DomainRecord, DOM_REC_BASE_LEN,
};
use crate::sim::{Simulator, TimerHandle};
use crate::types::TIPC_CLUSTER_SIZE;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::{Rc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Base interval between local domain audits, in milliseconds. Each
/// monitor adds a random jitter of up to 0xffff ms on top.
pub const MON_TIMEOUT: u64 = 120_000;

/// Number of peer-down reports that confirm a peer as lost.
pub const MAX_PEER_DOWN_EVENTS: u8 = 4;

/// Cluster size above which domain-based monitoring activates.
pub const TIPC_DEF_MON_THRESHOLD: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// Lookup of an address that is not on the monitor ring where the
    /// caller is required to know better. Callers treat this as a bug,
    /// not a network event.
    #[error("no peer {0:#x} on the monitor ring")]
    UnknownPeer(u32),
    #[error("monitor threshold {0} exceeds cluster capacity {TIPC_CLUSTER_SIZE}")]
    ThresholdOutOfRange(u32),
}

/// Link endpoint's cache of monitor list and domain state. Owned by the
/// link, filled in by [`Monitor::get_state`] and consumed by the link
/// timeout logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonState {
    /// Generation of the monitor list this cookie has seen.
    pub list_gen: u16,
    /// Most recent domain generation received from the peer.
    pub peer_gen: u16,
    /// Most recent generation of our domain acked by the peer.
    pub acked_gen: u16,
    /// Peer endpoint must be continuously monitored.
    pub monitoring: bool,
    /// Peer endpoint should be probed for potential loss.
    pub probing: bool,
    /// Peer is confirmed lost; the link must be reset.
    pub reset: bool,
    /// Generations have been synched with the peer since link reset.
    pub synched: bool,
}

/// State of one peer node on the monitor ring.
#[derive(Debug, Clone, Default)]
pub(crate) struct Peer {
    pub(crate) addr: u32,
    /// Most recent domain record received from this peer.
    pub(crate) domain: Option<DomainRecord>,
    /// How many of the peer's reported domain members are matched against
    /// consecutive ring successors.
    pub(crate) applied: u8,
    /// Number of reports that consider this peer lost.
    pub(crate) down_cnt: u8,
    pub(crate) is_up: bool,
    pub(crate) is_head: bool,
    pub(crate) is_local: bool,
}

impl Peer {
    fn new(addr: u32) -> Self {
        Self {
            addr,
            ..Default::default()
        }
    }
}

/// Snapshot of one ring entry for external queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub addr: u32,
    pub applied: u8,
    pub down_cnt: u8,
    pub is_up: bool,
    pub is_head: bool,
    pub is_local: bool,
    pub dom_gen: Option<u16>,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            addr: peer.addr,
            applied: peer.applied,
            down_cnt: peer.down_cnt,
            is_up: peer.is_up,
            is_head: peer.is_head,
            is_local: peer.is_local,
            dom_gen: peer.domain.as_ref().map(|d| d.gen),
        }
    }
}

/// Monitor summary for external queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorInfo {
    pub bearer_id: u32,
    pub peer_cnt: usize,
    pub active: bool,
    pub list_gen: u16,
    pub dom_gen: u16,
    pub threshold: usize,
}

/// Wrapping u16 generation comparison: true iff `a` is newer than `b`.
fn more(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// Per-bearer neighbor monitor.
pub struct Monitor {
    /// The ring, ascending by address. The self position is virtual.
    peers: BTreeMap<u32, Peer>,
    self_peer: Peer,
    /// Encoded network-order copy of the own domain record, so that
    /// [`Monitor::prep`] is a copy plus an ack-generation patch.
    cache: Bytes,
    list_gen: u16,
    dom_gen: u16,
    threshold: usize,
    bearer_id: u32,
    timer_intv: Duration,
    timer: Option<TimerHandle>,
}

impl Monitor {
    pub fn new(self_addr: u32, bearer_id: u32) -> Self {
        let jitter = rand::thread_rng().gen_range(0..=0xffffu64);
        Self::with_interval(
            self_addr,
            bearer_id,
            Duration::from_millis(MON_TIMEOUT + jitter),
        )
    }

    /// Constructor with an explicit audit interval (no jitter), for
    /// deterministic setups.
    pub fn with_interval(self_addr: u32, bearer_id: u32, timer_intv: Duration) -> Self {
        let mut self_peer = Peer::new(self_addr);
        self_peer.is_up = true;
        self_peer.is_head = true;
        let dom = DomainRecord {
            len: DOM_REC_BASE_LEN as u16,
            ..Default::default()
        };
        let cache = dom.encode();
        self_peer.domain = Some(dom);
        Self {
            peers: BTreeMap::new(),
            self_peer,
            cache,
            list_gen: 0,
            dom_gen: 0,
            threshold: TIPC_DEF_MON_THRESHOLD,
            bearer_id,
            timer_intv,
            timer: None,
        }
    }

    // --- simple queries ---

    pub fn self_addr(&self) -> u32 {
        self.self_peer.addr
    }

    pub fn bearer_id(&self) -> u32 {
        self.bearer_id
    }

    pub fn peer_cnt(&self) -> usize {
        self.peers.len()
    }

    /// Domain-based monitoring is in effect only above the threshold.
    pub fn is_active(&self) -> bool {
        self.peers.len() > self.threshold
    }

    pub fn list_gen(&self) -> u16 {
        self.list_gen
    }

    pub fn dom_gen(&self) -> u16 {
        self.dom_gen
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn set_threshold(&mut self, cluster_size: u32) -> Result<(), MonitorError> {
        if cluster_size > TIPC_CLUSTER_SIZE {
            return Err(MonitorError::ThresholdOutOfRange(cluster_size));
        }
        self.threshold = cluster_size as usize;
        Ok(())
    }

    pub fn timer_intv(&self) -> Duration {
        self.timer_intv
    }

    /// Number of ring successors covered by the own domain.
    pub fn self_applied(&self) -> u8 {
        self.self_peer.applied
    }

    /// The own domain record (host order).
    pub fn own_domain(&self) -> Option<&DomainRecord> {
        self.self_peer.domain.as_ref()
    }

    /// Most recent domain record received from `addr`.
    pub fn peer_domain(&self, addr: u32) -> Option<&DomainRecord> {
        self.peers.get(&addr).and_then(|p| p.domain.as_ref())
    }

    pub fn peer_info(&self, addr: u32) -> Option<PeerInfo> {
        self.peer(addr).map(PeerInfo::from)
    }

    /// All ring entries except self, in ascending address order.
    pub fn peers_info(&self) -> Vec<PeerInfo> {
        self.peers.values().map(PeerInfo::from).collect()
    }

    pub fn info(&self) -> MonitorInfo {
        MonitorInfo {
            bearer_id: self.bearer_id,
            peer_cnt: self.peers.len(),
            active: self.is_active(),
            list_gen: self.list_gen,
            dom_gen: self.dom_gen,
            threshold: self.threshold,
        }
    }

    // --- ring navigation ---

    fn peer(&self, addr: u32) -> Option<&Peer> {
        if addr == self.self_peer.addr {
            Some(&self.self_peer)
        } else {
            self.peers.get(&addr)
        }
    }

    fn peer_mut(&mut self, addr: u32) -> Option<&mut Peer> {
        if addr == self.self_peer.addr {
            Some(&mut self.self_peer)
        } else {
            self.peers.get_mut(&addr)
        }
    }

    /// Successor of `addr` on the ring, wrapping at the top.
    pub fn ring_next(&self, addr: u32) -> u32 {
        let self_addr = self.self_peer.addr;
        let mut next = self
            .peers
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .map(|(&a, _)| a);
        if self_addr > addr {
            next = Some(next.map_or(self_addr, |n| n.min(self_addr)));
        }
        next.unwrap_or_else(|| {
            let first = self.peers.keys().next().copied().unwrap_or(self_addr);
            first.min(self_addr)
        })
    }

    /// Predecessor of `addr` on the ring, wrapping at the bottom.
    pub fn ring_prev(&self, addr: u32) -> u32 {
        let self_addr = self.self_peer.addr;
        let mut prev = self
            .peers
            .range((Bound::Unbounded, Bound::Excluded(addr)))
            .next_back()
            .map(|(&a, _)| a);
        if self_addr < addr {
            prev = Some(prev.map_or(self_addr, |p| p.max(self_addr)));
        }
        prev.unwrap_or_else(|| {
            let last = self.peers.keys().next_back().copied().unwrap_or(self_addr);
            last.max(self_addr)
        })
    }

    /// Walk backwards from `start` to the head responsible for it.
    ///
    /// A ring without any head peer means monitor invariants were already
    /// violated (the self position is a head from construction on), so
    /// this aborts rather than limping along.
    fn head_of(&self, start: u32) -> u32 {
        let mut addr = start;
        loop {
            if self.peer(addr).is_some_and(|p| p.is_head) {
                return addr;
            }
            addr = self.ring_prev(addr);
            if addr == start {
                panic!("monitor ring has no head peer");
            }
        }
    }

    // --- domain bookkeeping ---

    /// Match a peer's domain record against the monitor list: `applied`
    /// becomes the length of the prefix of reported members that are
    /// exactly the peer's consecutive ring successors.
    fn apply_domain(&mut self, peer_addr: u32) {
        let (is_up, members) = {
            let Some(peer) = self.peer(peer_addr) else { return };
            let Some(dom) = peer.domain.as_ref() else { return };
            (peer.is_up, dom.members.clone())
        };
        if !is_up {
            return;
        }
        let mut applied = 0u8;
        let mut member_addr = self.ring_next(peer_addr);
        for maddr in members {
            if maddr != member_addr {
                break;
            }
            applied += 1;
            member_addr = self.ring_next(member_addr);
        }
        if let Some(peer) = self.peer_mut(peer_addr) {
            peer.applied = applied;
        }
    }

    /// Recompute the own domain record after peer addition/removal/up/down.
    /// Bumps the domain generation and refreshes the wire cache only when
    /// the record actually changed.
    fn update_local_domain(&mut self) {
        let member_cnt = dom_size(self.peers.len()).saturating_sub(1);
        self.self_peer.applied = member_cnt as u8;

        let mut dom = self.self_peer.domain.take().unwrap_or_default();
        let prev_up_map = dom.up_map;
        dom.len = dom_rec_len(member_cnt as u16) as u16;
        let mut diff = dom.members.len() != member_cnt;
        dom.members.resize(member_cnt, 0);

        let mut cursor = self.self_peer.addr;
        for i in 0..member_cnt {
            cursor = self.ring_next(cursor);
            let Some(peer) = self.peers.get(&cursor) else {
                break;
            };
            diff |= dom.members[i] != peer.addr;
            dom.members[i] = peer.addr;
            map_set(&mut dom.up_map, i, peer.is_up);
        }
        diff |= dom.up_map != prev_up_map;
        if !diff {
            self.self_peer.domain = Some(dom);
            return;
        }
        self.dom_gen = self.dom_gen.wrapping_add(1);
        dom.gen = self.dom_gen;
        self.cache = dom.encode();
        self.self_peer.domain = Some(dom);
        self.apply_domain(self.self_peer.addr);
    }

    /// Re-match the domains of the preceding D(n) ring neighbors after a
    /// peer was added or removed next to them.
    fn update_neighbors(&mut self, addr: u32) {
        let dz = dom_size(self.peers.len());
        let mut cursor = addr;
        for _ in 0..dz {
            cursor = self.ring_prev(cursor);
            self.apply_domain(cursor);
        }
    }

    /// Mark members of a head's previous domain as potentially lost after
    /// the head went down or shrank its coverage.
    fn identify_lost_members(&mut self, peer_addr: u32, dom_bef: &DomainRecord, applied_bef: u8) {
        let (applied_aft, up_map_aft) = match self.peer(peer_addr) {
            Some(peer) => (
                peer.applied,
                peer.domain.as_ref().map(|d| d.up_map).unwrap_or(0),
            ),
            None => return,
        };
        let mut member_addr = peer_addr;
        for i in 0..applied_bef as usize {
            member_addr = self.ring_next(member_addr);
            let Some(member) = self.peer_mut(member_addr) else {
                continue;
            };
            // Nothing to do if self or the reporter already saw it down
            if !member.is_up || !map_get(dom_bef.up_map, i) {
                continue;
            }
            // Loss of a local-domain node is detected by active probing
            if member.is_local {
                continue;
            }
            // Start probing if the member fell out of the applied domain
            if applied_aft == 0 || (applied_aft as usize) < i {
                member.down_cnt = 1;
                continue;
            }
            // Loss is confirmed while it remains in the applied domain
            if !map_get(up_map_aft, i) {
                member.down_cnt = member.down_cnt.saturating_add(1);
            }
        }
    }

    /// Reassign head roles, walking the ring from `head` until the self
    /// position. Covered members lose head status (and become local when
    /// the head is self); past each head's coverage, the next up peer is
    /// promoted. Every call bumps the list generation.
    fn assign_roles(&mut self, mut head: u32) {
        let self_addr = self.self_peer.addr;
        let mut head_applied = self.peer(head).map(|p| p.applied).unwrap_or(0);
        let mut cursor = self.ring_next(head);
        let mut i: u32 = 0;
        while cursor != self_addr {
            let head_is_self = head == self_addr;
            let covered = i < head_applied as u32;
            i += 1;
            let Some(peer) = self.peers.get_mut(&cursor) else {
                break;
            };
            peer.is_local = false;
            if covered {
                peer.is_head = false;
                if head_is_self {
                    peer.is_local = true;
                }
            } else if peer.is_up {
                // From here on the previous assignment is still valid
                if peer.is_head {
                    break;
                }
                peer.is_head = true;
                head = cursor;
                head_applied = peer.applied;
                i = 0;
            }
            cursor = self.ring_next(cursor);
        }
        self.list_gen = self.list_gen.wrapping_add(1);
    }

    fn add_peer(&mut self, addr: u32) {
        debug!(bearer = self.bearer_id, addr, "monitor: adding peer");
        self.peers.insert(addr, Peer::new(addr));
        self.update_neighbors(addr);
    }

    // --- events from the node ---

    /// A link to `addr` came up. Unknown addresses are inserted into the
    /// ring first; the call is idempotent for known up peers.
    pub fn peer_up(&mut self, addr: u32) {
        if !self.peers.contains_key(&addr) {
            self.add_peer(addr);
        }
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.is_up = true;
        }
        let head = self.head_of(addr);
        if head == self.self_peer.addr {
            self.update_local_domain();
        }
        self.assign_roles(head);
    }

    /// The link to `addr` went down. The entry stays on the ring (node
    /// cleanup removes it much later); its domain and roles are dropped,
    /// and members only it vouched for start being probed.
    pub fn peer_down(&mut self, addr: u32, bearer_id: u32) {
        let Some(peer) = self.peers.get_mut(&addr) else {
            warn!(
                "monitor: unknown link {:#x}/{} down",
                addr, bearer_id
            );
            return;
        };
        let applied = peer.applied;
        let was_head = peer.is_head;
        let dom = peer.domain.take().unwrap_or_default();
        peer.applied = 0;
        peer.down_cnt = 0;
        peer.is_up = false;
        peer.is_head = false;
        peer.is_local = false;
        if was_head {
            self.identify_lost_members(addr, &dom, applied);
        }
        let head = self.head_of(self.ring_prev(addr));
        if head == self.self_peer.addr {
            self.update_local_domain();
        }
        self.assign_roles(head);
    }

    // --- wire exchange ---

    /// Prepare the outgoing domain record for one link.
    ///
    /// Inactive monitors emit a record with length 0, which no receiver
    /// accepts. When the peer has acked our current generation, a dummy
    /// record (header only) carries the ack back; otherwise the cached
    /// full record is copied and stamped with the peer's generation.
    pub fn prep(&self, state: &MonState) -> Bytes {
        if !self.is_active() {
            let invalid = DomainRecord {
                len: 0,
                ..Default::default()
            };
            return invalid.encode();
        }
        let gen = self.dom_gen;
        if state.acked_gen == gen {
            let dummy = DomainRecord {
                len: DOM_REC_BASE_LEN as u16,
                gen,
                ack_gen: state.peer_gen,
                up_map: 0,
                members: Vec::new(),
            };
            return dummy.encode();
        }
        let mut out = self.cache.to_vec();
        out[4..6].copy_from_slice(&state.peer_gen.to_be_bytes());
        Bytes::from(out)
    }

    /// Process a domain record received from `addr`. Malformed or stale
    /// records are dropped silently; the monitor recovers via the next
    /// valid generation.
    pub fn recv(&mut self, data: &[u8], addr: u32, state: &mut MonState) {
        let probing = state.probing;
        state.probing = false;

        let Some(arrv) = DomainRecord::decode(data) else {
            return;
        };
        let new_gen = arrv.gen;
        let new_acked = arrv.ack_gen;

        // Synch generation numbers with the peer if the link just came up
        if !state.synched {
            state.peer_gen = new_gen.wrapping_sub(1);
            state.acked_gen = new_acked;
            state.synched = true;
        }
        if !more(state.acked_gen, new_acked) {
            state.acked_gen = new_acked;
        }
        // Drop duplicate unless we are waiting for a probe response
        if !more(new_gen, state.peer_gen) && !probing {
            return;
        }

        let (applied_bef, dom_bef) = {
            let Some(peer) = self.peers.get_mut(&addr) else {
                return;
            };
            if !peer.is_up {
                return;
            }
            // Peer is confirmed, stop any ongoing probing
            peer.down_cnt = 0;
            // Task is done for a duplicate record
            if !more(new_gen, state.peer_gen) {
                return;
            }
            state.peer_gen = new_gen;
            let applied_bef = peer.applied;
            let dom_bef = peer.domain.replace(arrv).unwrap_or_default();
            (applied_bef, dom_bef)
        };
        self.apply_domain(addr);
        self.identify_lost_members(addr, &dom_bef, applied_bef);
        let head = self.head_of(addr);
        self.assign_roles(head);
    }

    /// Fill a link's monitor cookie with the current probing verdict.
    ///
    /// An unknown address here is a caller bug (links always register
    /// their peer before supervising it), surfaced as an error for the
    /// caller to abort on.
    pub fn get_state(&self, addr: u32, state: &mut MonState) -> Result<(), MonitorError> {
        if !self.is_active() {
            state.probing = false;
            state.monitoring = true;
            return Ok(());
        }
        // Use cached state if the table has not changed
        if !state.probing && state.list_gen == self.list_gen && state.acked_gen == self.dom_gen {
            return Ok(());
        }
        let peer = self
            .peers
            .get(&addr)
            .ok_or(MonitorError::UnknownPeer(addr))?;
        state.probing = state.acked_gen != self.dom_gen || peer.down_cnt > 0;
        state.reset |= peer.down_cnt >= MAX_PEER_DOWN_EVENTS;
        state.monitoring = peer.is_local || peer.is_head;
        state.list_gen = self.list_gen;
        Ok(())
    }

    // --- timer ---

    /// Periodic audit: when cluster growth or shrinkage has outdated the
    /// own domain size, recompute it and reassign roles from self.
    pub fn on_timeout(&mut self) {
        let best_member_cnt = dom_size(self.peers.len()).saturating_sub(1);
        if best_member_cnt != self.self_peer.applied as usize {
            self.update_local_domain();
            let self_addr = self.self_peer.addr;
            self.assign_roles(self_addr);
        }
    }

    /// Arm the recurring audit timer on a simulator.
    pub fn start(mon: &Rc<RefCell<Monitor>>, sim: &mut Simulator) {
        let intv = mon.borrow().timer_intv;
        let weak = Rc::downgrade(mon);
        let handle = sim.schedule(intv, Box::new(move |sim| Monitor::tick(weak, sim)));
        mon.borrow_mut().timer = Some(handle);
    }

    fn tick(weak: Weak<RefCell<Monitor>>, sim: &mut Simulator) {
        let Some(mon) = weak.upgrade() else {
            return;
        };
        mon.borrow_mut().on_timeout();
        let intv = mon.borrow().timer_intv;
        let next = Rc::downgrade(&mon);
        let handle = sim.schedule(intv, Box::new(move |sim| Monitor::tick(next, sim)));
        mon.borrow_mut().timer = Some(handle);
    }

    /// Cancel the audit timer. Must run before the monitor is dropped
    /// when a simulator still holds its events.
    pub fn stop(&mut self, sim: &mut Simulator) {
        if let Some(handle) = self.timer.take() {
            sim.cancel(handle);
        }
    }
}
