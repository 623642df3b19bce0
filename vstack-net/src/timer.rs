//! Deterministic one-shot timers with monotonic-clock semantics.
//!
//! The stack owns a single [`Timers`] instance; every layer that needs
//! delayed work (ARP resolution retries, reassembly expiry, all TCP timers)
//! schedules an event in it. `expire(now)` is called from `Stack::poll` and
//! returns the due events for dispatch. `stop` is O(1): cancelled ids are
//! simply forgotten and skipped when their heap entry surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use smoltcp::time::Instant;

use crate::tcp::{Flow, TcpTimer};

/// Handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

/// Events the stack dispatches when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// ARP resolver tick: retry or expire pending resolutions.
    ArpResolve,
    /// ARP cache flush sweep.
    ArpFlush,
    /// Reassembly table sweep.
    ReassemblyExpire,
    /// A per-connection TCP timer.
    Tcp { flow: Flow, kind: TcpTimer },
}

/// Min-heap timer store generic over the event type.
pub struct Timers<E> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    live: HashMap<u64, E>,
    next_id: u64,
}

impl<E> Timers<E> {
    pub fn new() -> Self {
        Timers {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule `event` to fire at `deadline`.
    pub fn start(&mut self, deadline: Instant, event: E) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.live.insert(id, event);
        TimerId(id)
    }

    /// Cancel a timer. Cancelling an already-fired or unknown id is a no-op.
    pub fn stop(&mut self, id: TimerId) {
        self.live.remove(&id.0);
    }

    /// Pop every event whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<E> {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(event) = self.live.remove(&id) {
                due.push(event);
            }
        }
        due
    }

    /// Earliest pending deadline, skipping cancelled entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if self.live.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub fn pending(&self) -> usize {
        self.live.len()
    }
}

impl<E> Default for Timers<E> {
    fn default() -> Self {
        Self::new()
    }
}
