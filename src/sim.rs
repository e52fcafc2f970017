//! Virtual-time event scheduling.
//!
//! The signalling core never reads a wall clock: nodes and monitors are
//! driven by timers posted on a [`Simulator`]. Events at the same virtual
//! time fire in posting order, and a scheduled event fires exactly once
//! unless cancelled through its [`TimerHandle`].

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

/// A scheduled callback. Events receive the simulator so they can post
/// follow-up events (the reset-cancel-reschedule idiom used by the node
/// keepalive timer).
pub type EventFn = Box<dyn FnOnce(&mut Simulator)>;

/// Identity of a pending event, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Scheduled {
    at: Duration,
    seq: u64,
    run: EventFn,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed: BinaryHeap is a max-heap, we want the earliest event
    // (FIFO among equals) on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Single-threaded discrete-event scheduler.
pub struct Simulator {
    now: Duration,
    next_seq: u64,
    queue: BinaryHeap<Scheduled>,
    cancelled: HashSet<u64>,
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_seq: 0,
            queue: BinaryHeap::new(),
            cancelled: HashSet::new(),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Number of pending (non-cancelled) events.
    pub fn pending(&self) -> usize {
        self.queue
            .iter()
            .filter(|e| !self.cancelled.contains(&e.seq))
            .count()
    }

    /// Post `run` to fire `delay` from now.
    pub fn schedule(&mut self, delay: Duration, run: EventFn) -> TimerHandle {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.queue.push(Scheduled {
            at: self.now + delay,
            seq,
            run,
        });
        TimerHandle(seq)
    }

    /// Cancel a pending event. Cancelling an event that has already fired
    /// is a no-op.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.cancelled.insert(handle.0);
    }

    /// Fire the next pending event, advancing virtual time to it.
    /// Returns false when the queue is empty.
    pub fn step(&mut self) -> bool {
        while let Some(entry) = self.queue.pop() {
            if self.cancelled.remove(&entry.seq) {
                continue;
            }
            self.now = entry.at;
            (entry.run)(self);
            return true;
        }
        false
    }

    /// Fire every event scheduled at or before `deadline`, then advance
    /// virtual time to `deadline`.
    pub fn run_until(&mut self, deadline: Duration) {
        while let Some(head) = self.queue.peek() {
            if head.at > deadline {
                break;
            }
            self.step();
        }
        if self.now < deadline {
            self.now = deadline;
        }
    }

    /// Fire events until the queue drains.
    pub fn run(&mut self) {
        while self.step() {}
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_events_fire_in_time_order() {
        let mut sim = Simulator::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for (tag, ms) in [("c", 30u64), ("a", 10), ("b", 20)] {
            let log = log.clone();
            sim.schedule(
                Duration::from_millis(ms),
                Box::new(move |_| log.borrow_mut().push(tag)),
            );
        }
        sim.run();

        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert_eq!(sim.now(), Duration::from_millis(30));
    }

    #[test]
    fn test_equal_deadline_is_fifo() {
        let mut sim = Simulator::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            sim.schedule(
                Duration::from_millis(5),
                Box::new(move |_| log.borrow_mut().push(tag)),
            );
        }
        sim.run();

        assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_cancelled_event_never_fires() {
        let mut sim = Simulator::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let log2 = log.clone();
        let handle = sim.schedule(
            Duration::from_millis(10),
            Box::new(move |_| log2.borrow_mut().push("cancelled")),
        );
        let log3 = log.clone();
        sim.schedule(
            Duration::from_millis(20),
            Box::new(move |_| log3.borrow_mut().push("kept")),
        );

        sim.cancel(handle);
        sim.run();

        assert_eq!(*log.borrow(), vec!["kept"]);
    }

    #[test]
    fn test_event_can_reschedule_itself() {
        let mut sim = Simulator::new();
        let count = Rc::new(RefCell::new(0u32));

        fn tick(count: Rc<RefCell<u32>>, sim: &mut Simulator) {
            *count.borrow_mut() += 1;
            if *count.borrow() < 3 {
                let next = count.clone();
                sim.schedule(
                    Duration::from_millis(100),
                    Box::new(move |sim| tick(next, sim)),
                );
            }
        }

        let c = count.clone();
        sim.schedule(
            Duration::from_millis(100),
            Box::new(move |sim| tick(c, sim)),
        );
        sim.run();

        assert_eq!(*count.borrow(), 3);
        assert_eq!(sim.now(), Duration::from_millis(300));
    }

    #[test]
    fn test_run_until_stops_at_deadline() {
        let mut sim = Simulator::new();
        let fired = Rc::new(RefCell::new(false));
        let f = fired.clone();
        sim.schedule(
            Duration::from_millis(50),
            Box::new(move |_| *f.borrow_mut() = true),
        );

        sim.run_until(Duration::from_millis(40));
        assert!(!*fired.borrow());
        assert_eq!(sim.now(), Duration::from_millis(40));

        sim.run_until(Duration::from_millis(60));
        assert!(*fired.borrow());
    }
}
