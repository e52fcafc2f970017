//! Link FSM transition table and end-to-end link scenarios.

use std::time::Duration;
use tipcsim::{
    Importance, Link, LinkConfig, LinkEvent, LinkState, TIPC_LINK_DOWN_EVT,
};

fn make_link() -> Link {
    Link::new(LinkConfig {
        peer_addr: 2,
        self_addr: 1,
        if_name: "eth0".into(),
        tolerance: Duration::from_millis(1500),
        min_win: 16,
        max_win: 64,
        ..Default::default()
    })
}

/// Drive a fresh link into the requested state through legal events.
fn link_in(state: LinkState) -> Link {
    let mut link = make_link();
    let path: &[LinkEvent] = match state {
        LinkState::Resetting => &[],
        LinkState::Reset => &[LinkEvent::Reset],
        LinkState::PeerReset => &[LinkEvent::PeerReset],
        LinkState::FailingOver => &[LinkEvent::Reset, LinkEvent::FailoverBegin],
        LinkState::Establishing => &[LinkEvent::PeerReset, LinkEvent::Reset],
        LinkState::Established => &[
            LinkEvent::PeerReset,
            LinkEvent::Reset,
            LinkEvent::Establish,
        ],
        LinkState::Synching => &[
            LinkEvent::PeerReset,
            LinkEvent::Reset,
            LinkEvent::Establish,
            LinkEvent::SynchBegin,
        ],
    };
    for &evt in path {
        link.fsm_evt(evt).unwrap();
    }
    assert_eq!(link.state(), state);
    link
}

/// Expected outcome of one (state, event) pair: Some((next, flags)) for a
/// legal transition, None for an illegal one.
fn expected(state: LinkState, event: LinkEvent) -> Option<(LinkState, u32)> {
    use LinkEvent as E;
    use LinkState as S;
    let same = Some((state, 0));
    match (state, event) {
        (S::Resetting, E::PeerReset) => Some((S::PeerReset, 0)),
        (S::Resetting, E::Reset) => Some((S::Reset, 0)),
        (S::Resetting, _) => None,

        (S::Reset, E::PeerReset) => Some((S::Establishing, 0)),
        (S::Reset, E::FailoverBegin) => Some((S::FailingOver, 0)),
        (S::Reset, E::Reset | E::Failure | E::Establish | E::FailoverEnd) => same,
        (S::Reset, _) => None,

        (S::PeerReset, E::Reset) => Some((S::Establishing, 0)),
        (S::PeerReset, E::PeerReset | E::Establish | E::Failure) => same,
        (S::PeerReset, _) => None,

        (S::FailingOver, E::FailoverEnd) => Some((S::Reset, 0)),
        (S::FailingOver, E::PeerReset | E::Reset | E::Establish | E::Failure) => same,
        (S::FailingOver, _) => None,

        (S::Establishing, E::Establish) => Some((S::Established, 0)),
        (S::Establishing, E::FailoverBegin) => Some((S::FailingOver, 0)),
        (S::Establishing, E::Reset) => Some((S::Reset, 0)),
        (S::Establishing, E::Failure | E::PeerReset | E::SynchBegin | E::FailoverEnd) => same,
        (S::Establishing, _) => None,

        (S::Established, E::PeerReset) => Some((S::PeerReset, TIPC_LINK_DOWN_EVT)),
        (S::Established, E::Failure) => Some((S::Resetting, TIPC_LINK_DOWN_EVT)),
        (S::Established, E::Reset) => Some((S::Reset, 0)),
        (S::Established, E::SynchBegin) => Some((S::Synching, 0)),
        (S::Established, E::Establish | E::SynchEnd) => same,
        (S::Established, _) => None,

        (S::Synching, E::PeerReset) => Some((S::PeerReset, TIPC_LINK_DOWN_EVT)),
        (S::Synching, E::Failure) => Some((S::Resetting, TIPC_LINK_DOWN_EVT)),
        (S::Synching, E::Reset) => Some((S::Reset, 0)),
        (S::Synching, E::SynchEnd) => Some((S::Established, 0)),
        (S::Synching, E::Establish | E::SynchBegin) => same,
        (S::Synching, _) => None,
    }
}

const ALL_STATES: [LinkState; 7] = [
    LinkState::Resetting,
    LinkState::Reset,
    LinkState::PeerReset,
    LinkState::FailingOver,
    LinkState::Establishing,
    LinkState::Established,
    LinkState::Synching,
];

const ALL_EVENTS: [LinkEvent; 8] = [
    LinkEvent::Establish,
    LinkEvent::PeerReset,
    LinkEvent::Failure,
    LinkEvent::Reset,
    LinkEvent::FailoverBegin,
    LinkEvent::FailoverEnd,
    LinkEvent::SynchBegin,
    LinkEvent::SynchEnd,
];

#[test]
fn full_transition_table_sweep() {
    for state in ALL_STATES {
        for event in ALL_EVENTS {
            let mut link = link_in(state);
            match expected(state, event) {
                Some((next, flags)) => {
                    let rc = link
                        .fsm_evt(event)
                        .unwrap_or_else(|e| panic!("expected legal: {e}"));
                    assert_eq!(link.state(), next, "{state:?} + {event:?}");
                    assert_eq!(rc, flags, "{state:?} + {event:?}");
                }
                None => {
                    let err = link.fsm_evt(event).unwrap_err();
                    assert_eq!(err.state, state);
                    assert_eq!(err.event, event);
                    assert_eq!(link.state(), state, "illegal event must not move");
                }
            }
        }
    }
}

#[test]
fn every_state_is_classified() {
    for state in ALL_STATES {
        let link = link_in(state);
        assert!(
            link.is_up() || link.is_reset() || link.is_blocked() || link.peer_is_down(),
            "{state:?} unclassified"
        );
    }
}

#[test]
fn state_queries_match_definitions() {
    assert!(link_in(LinkState::Established).is_up());
    assert!(link_in(LinkState::Synching).is_up());
    for state in [LinkState::Reset, LinkState::FailingOver, LinkState::Establishing] {
        assert!(link_in(state).is_reset(), "{state:?}");
    }
    for state in [LinkState::Resetting, LinkState::PeerReset, LinkState::FailingOver] {
        assert!(link_in(state).is_blocked(), "{state:?}");
    }
    assert!(link_in(LinkState::PeerReset).peer_is_down());
}

#[test]
fn s1_cold_establish() {
    let mut link = make_link();
    assert_eq!(link.state(), LinkState::Resetting);

    assert_eq!(link.fsm_evt(LinkEvent::PeerReset).unwrap(), 0);
    assert_eq!(link.state(), LinkState::PeerReset);

    assert_eq!(link.fsm_evt(LinkEvent::Reset).unwrap(), 0);
    assert_eq!(link.state(), LinkState::Establishing);

    assert_eq!(link.fsm_evt(LinkEvent::Establish).unwrap(), 0);
    assert_eq!(link.state(), LinkState::Established);

    assert!(link.is_up());
    assert_eq!(link.backlog_limit(Importance::Low), 32);
    assert_eq!(link.backlog_limit(Importance::Critical), 128);
    assert_eq!(link.window(), 16);
    assert_eq!(link.ssthresh(), 64);
}

#[test]
fn s2_failure_from_established() {
    let mut link = link_in(LinkState::Established);
    let rc = link.fsm_evt(LinkEvent::Failure).unwrap();
    assert_eq!(link.state(), LinkState::Resetting);
    assert_ne!(rc & TIPC_LINK_DOWN_EVT, 0);
}

#[test]
fn s3_synch_round_trip() {
    let mut link = link_in(LinkState::Established);
    link.fsm_evt(LinkEvent::SynchBegin).unwrap();
    assert_eq!(link.state(), LinkState::Synching);
    link.fsm_evt(LinkEvent::SynchEnd).unwrap();
    assert_eq!(link.state(), LinkState::Established);
}

#[test]
fn s4_illegal_event_is_an_error() {
    let mut link = link_in(LinkState::Reset);
    let err = link.fsm_evt(LinkEvent::SynchBegin).unwrap_err();
    assert_eq!(err.state, LinkState::Reset);
    assert_eq!(err.event, LinkEvent::SynchBegin);
}
