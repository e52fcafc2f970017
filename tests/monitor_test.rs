//! Monitor ring, domain gossip and peer-loss detection.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tipcsim::{
    dom_rec_len, dom_size, DomainRecord, MonState, Monitor, Simulator, MAX_PEER_DOWN_EVENTS,
    MON_TIMEOUT,
};

fn make_mon(self_addr: u32) -> Monitor {
    Monitor::with_interval(self_addr, 0, Duration::from_millis(MON_TIMEOUT))
}

fn mon_with_peers(self_addr: u32, peers: impl IntoIterator<Item = u32>) -> Monitor {
    let mut mon = make_mon(self_addr);
    for addr in peers {
        mon.peer_up(addr);
    }
    mon
}

/// Wire-encode a domain record as a reporting peer would send it.
fn record(gen: u16, ack_gen: u16, members: Vec<u32>, up_map: u64) -> Vec<u8> {
    DomainRecord {
        len: dom_rec_len(members.len() as u16) as u16,
        gen,
        ack_gen,
        up_map,
        members,
    }
    .encode()
    .to_vec()
}

fn all_up(n: usize) -> u64 {
    (1u64 << n) - 1
}

#[test]
fn s5_monitor_domain_size() {
    let mut mon = mon_with_peers(1, [2, 3, 5, 7, 11, 13, 17, 19, 23]);
    assert_eq!(mon.peer_cnt(), 9);
    assert_eq!(dom_size(9), 3);

    // The periodic audit resizes the own domain to the cluster size
    mon.on_timeout();

    assert_eq!(mon.self_applied(), 2);
    let dom = mon.own_domain().unwrap();
    assert_eq!(dom.member_cnt(), 2);
    assert_eq!(dom.members, vec![2, 3]);
    assert_eq!(mon.ring_next(1), 2);
    assert_eq!(mon.ring_next(2), 3);
}

#[test]
fn ring_next_prev_are_inverses() {
    let peers = [2u32, 3, 5, 7, 11, 13, 17, 19, 23];
    let mon = mon_with_peers(9, peers);
    let mut ring: Vec<u32> = peers.to_vec();
    ring.push(9);
    for &addr in &ring {
        assert_eq!(mon.ring_next(mon.ring_prev(addr)), addr);
        assert_eq!(mon.ring_prev(mon.ring_next(addr)), addr);
    }
}

#[test]
fn own_domain_always_covers_dom_size_minus_one() {
    for n in [1usize, 2, 3, 5, 9, 16, 17, 36] {
        let mut mon = mon_with_peers(1, (0..n as u32).map(|i| 100 + i));
        mon.on_timeout();
        let dom = mon.own_domain().unwrap();
        assert_eq!(
            dom.member_cnt() as usize,
            dom_size(n) - 1,
            "cluster size {n}"
        );
    }
}

#[test]
fn domain_record_round_trips_to_a_mirror_monitor() {
    let mut sender = mon_with_peers(1, (2..=10).collect::<Vec<_>>());
    sender.set_threshold(4).unwrap();
    sender.on_timeout();
    let sender_dom = sender.own_domain().unwrap().clone();

    // acked_gen 0 != dom_gen forces the full cached record out
    let state = MonState::default();
    let wire = sender.prep(&state);

    let mut mirror = make_mon(100);
    mirror.peer_up(1);
    let mut link_state = MonState::default();
    mirror.recv(&wire, 1, &mut link_state);

    let received = mirror.peer_domain(1).expect("record not stored");
    assert_eq!(received.members, sender_dom.members);
    assert_eq!(received.up_map, sender_dom.up_map);
    assert_eq!(received.gen, sender_dom.gen);
    assert!(link_state.synched);
    assert_eq!(link_state.peer_gen, sender_dom.gen);
}

#[test]
fn prep_emits_dummy_once_peer_acked_current_generation() {
    let mut mon = mon_with_peers(1, (2..40).collect::<Vec<_>>());
    mon.set_threshold(4).unwrap();
    mon.on_timeout();

    let mut state = MonState::default();
    state.acked_gen = mon.dom_gen();
    state.peer_gen = 77;
    let wire = mon.prep(&state);
    let rec = DomainRecord::decode(&wire).unwrap();
    assert_eq!(rec.member_cnt(), 0);
    assert_eq!(rec.gen, mon.dom_gen());
    assert_eq!(rec.ack_gen, 77);
}

#[test]
fn prep_stamps_peer_generation_into_cached_record() {
    let mut mon = mon_with_peers(1, (2..40).collect::<Vec<_>>());
    mon.set_threshold(4).unwrap();
    mon.on_timeout();

    let mut state = MonState::default();
    state.peer_gen = 1234;
    let wire = mon.prep(&state);
    let rec = DomainRecord::decode(&wire).unwrap();
    assert_eq!(rec.ack_gen, 1234);
    assert!(rec.member_cnt() > 0);
}

#[test]
fn generations_are_monotonic() {
    let mut mon = mon_with_peers(1, (2..=20).collect::<Vec<_>>());
    let mut last = mon.dom_gen();
    mon.on_timeout();
    assert!(mon.dom_gen() >= last);
    last = mon.dom_gen();

    mon.peer_down(5, 0);
    mon.on_timeout();
    assert!(mon.dom_gen() >= last);

    // acked_gen never decreases across recv
    let mut mirror = make_mon(100);
    mirror.peer_up(1);
    let mut state = MonState::default();
    mirror.recv(&record(1, 5, vec![], 0), 1, &mut state);
    assert_eq!(state.acked_gen, 5);
    mirror.recv(&record(2, 3, vec![], 0), 1, &mut state);
    assert_eq!(state.acked_gen, 5);
    mirror.recv(&record(3, 8, vec![], 0), 1, &mut state);
    assert_eq!(state.acked_gen, 8);
}

#[test]
fn stale_generation_is_discarded() {
    let mut mon = make_mon(100);
    mon.peer_up(1);
    let mut state = MonState::default();

    mon.recv(&record(5, 0, vec![101, 102], 0b11), 1, &mut state);
    assert_eq!(state.peer_gen, 5);

    // An older record must not replace the stored domain
    mon.recv(&record(4, 0, vec![101], 0b1), 1, &mut state);
    assert_eq!(state.peer_gen, 5);
    assert_eq!(mon.peer_domain(1).unwrap().gen, 5);
}

#[test]
fn peer_up_is_idempotent() {
    fn snapshot(mon: &Monitor) -> Vec<(u32, bool, bool, bool, u8, u8)> {
        mon.peers_info()
            .iter()
            .map(|p| (p.addr, p.is_up, p.is_head, p.is_local, p.applied, p.down_cnt))
            .collect()
    }

    let mut mon = mon_with_peers(1, [2, 3, 5, 7]);
    mon.on_timeout();
    mon.peer_up(5);
    let before = (snapshot(&mon), mon.self_applied(), mon.own_domain().cloned());
    mon.peer_up(5);
    let after = (snapshot(&mon), mon.self_applied(), mon.own_domain().cloned());
    assert_eq!(before, after);
    assert_eq!(mon.dom_gen(), {
        mon.peer_up(5);
        mon.dom_gen()
    });
}

#[test]
fn s6_peer_loss_detection() {
    // 40 peers with default threshold 32: the monitor is active
    let mut mon = mon_with_peers(1, 2..=41);
    assert!(mon.is_active());
    mon.on_timeout();
    assert_eq!(mon.self_applied(), dom_size(40) as u8 - 1); // 6

    // Head peer 8 starts reporting its six successors
    let mut state_8 = MonState::default();
    let members_8: Vec<u32> = (9..=14).collect();
    mon.recv(&record(1, 0, members_8.clone(), all_up(6)), 8, &mut state_8);
    assert_eq!(mon.peer_info(8).unwrap().applied, 6);
    assert_eq!(mon.peer_info(9).unwrap().down_cnt, 0);

    // Peer 8 now reports successor 9 as down
    let mut lost_map = all_up(6);
    lost_map &= !1; // bit 0 = member 9
    mon.recv(&record(2, 0, members_8, lost_map), 8, &mut state_8);
    assert!(mon.peer_info(9).unwrap().down_cnt >= 1);

    // Three more reporters covering 9 confirm the loss
    for (reporter, index) in [(7u32, 1usize), (6, 2), (5, 3)] {
        let members: Vec<u32> = (reporter + 1..=reporter + 6).collect();
        let mut state = MonState::default();
        mon.recv(&record(1, 0, members.clone(), all_up(6)), reporter, &mut state);
        let mut map = all_up(6);
        map &= !(1 << index);
        mon.recv(&record(2, 0, members, map), reporter, &mut state);
    }
    let down_cnt = mon.peer_info(9).unwrap().down_cnt;
    assert!(
        down_cnt >= MAX_PEER_DOWN_EVENTS,
        "down_cnt {down_cnt} after four reports"
    );

    // The link supervising peer 9 must now be told to reset
    let mut link_state = MonState::default();
    mon.get_state(9, &mut link_state).unwrap();
    assert!(link_state.reset);
    assert!(link_state.probing);
}

#[test]
fn peer_down_of_head_probes_its_members() {
    let mut mon = mon_with_peers(1, 2..=41);
    mon.on_timeout();

    // Establish peer 8 as a reporting head for 9..=14
    let mut state_8 = MonState::default();
    mon.recv(
        &record(1, 0, (9..=14).collect(), all_up(6)),
        8,
        &mut state_8,
    );
    assert!(mon.peer_info(8).unwrap().is_head);

    // Losing the head starts probing of everyone it vouched for
    mon.peer_down(8, 0);
    let info = mon.peer_info(8).unwrap();
    assert!(!info.is_up && !info.is_head && !info.is_local);
    assert_eq!(info.applied, 0);
    for member in 9..=14 {
        assert_eq!(
            mon.peer_info(member).unwrap().down_cnt,
            1,
            "member {member}"
        );
    }
    // The entry itself stays on the ring until node cleanup
    assert_eq!(mon.peer_cnt(), 40);
}

#[test]
fn recv_confirms_peer_and_clears_probing() {
    let mut mon = mon_with_peers(1, 2..=41);
    mon.on_timeout();

    let mut state_8 = MonState::default();
    mon.recv(&record(1, 0, (9..=14).collect(), all_up(6)), 8, &mut state_8);
    mon.peer_down(8, 0);
    mon.peer_up(8);

    // A fresh record from a probed member clears its down count
    let mut state_9 = MonState::default();
    mon.recv(&record(1, 0, (10..=15).collect(), all_up(6)), 9, &mut state_9);
    assert_eq!(mon.peer_info(9).unwrap().down_cnt, 0);
}

#[test]
fn recv_ignores_unknown_or_down_senders() {
    let mut mon = mon_with_peers(1, [2, 3]);
    let gen_before = mon.list_gen();

    let mut state = MonState::default();
    mon.recv(&record(1, 0, vec![3], 0b1), 999, &mut state);
    assert_eq!(mon.list_gen(), gen_before);

    mon.peer_down(2, 0);
    let gen_before = mon.list_gen();
    let mut state = MonState::default();
    mon.recv(&record(1, 0, vec![3], 0b1), 2, &mut state);
    assert_eq!(mon.list_gen(), gen_before);
    assert_eq!(mon.peer_domain(2), None);
}

#[test]
fn timer_resizes_domain_as_cluster_grows() {
    let mut sim = Simulator::new();
    let mon = Rc::new(RefCell::new(Monitor::with_interval(
        1,
        0,
        Duration::from_secs(1),
    )));
    Monitor::start(&mon, &mut sim);

    for addr in [10, 20, 30, 40, 50] {
        mon.borrow_mut().peer_up(addr);
    }
    assert_ne!(
        mon.borrow().self_applied() as usize,
        dom_size(5) - 1,
        "domain resize should wait for the audit timer"
    );

    sim.run_until(Duration::from_millis(1500));
    assert_eq!(mon.borrow().self_applied() as usize, dom_size(5) - 1);

    // The audit reschedules itself and follows further growth
    for addr in [60, 70, 80, 90, 95] {
        mon.borrow_mut().peer_up(addr);
    }
    sim.run_until(Duration::from_millis(2500));
    assert_eq!(mon.borrow().self_applied() as usize, dom_size(10) - 1);

    mon.borrow_mut().stop(&mut sim);
}
