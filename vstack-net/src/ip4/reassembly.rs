//! Bounded IPv4 fragment reassembly.
//!
//! Each in-progress datagram owns a scratch buffer that fragments are copied
//! into at their offset. The table is capped, entries expire after a fixed
//! TTL, and any overlapping or overflowing fragment discards the whole entry
//! rather than trying to repair it.

use std::collections::HashMap;

use smoltcp::time::{Duration, Instant};
use smoltcp::wire::{IpProtocol, Ipv4Address};
use tracing::{debug, trace};

use crate::timer::{TimerEvent, TimerId, Timers};

/// Upper bound on concurrently reassembling datagrams.
const MAX_ENTRIES: usize = 64;

/// Largest datagram we will reassemble (IPv4 total-length limit minus the
/// smallest header).
const MAX_DATAGRAM: usize = 65535 - 20;

/// How long a partial datagram may sit in the table.
pub(crate) const REASSEMBLY_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FragKey {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub proto: IpProtocol,
    pub ident: u16,
}

struct Entry {
    data: Vec<u8>,
    ranges: Vec<(usize, usize)>,
    received: usize,
    total: Option<usize>,
    created: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReassemblyCounters {
    pub reassembled: u64,
    pub aborted: u64,
    pub dropped_fragments: u64,
}

pub(crate) struct Reassembly {
    entries: HashMap<FragKey, Entry>,
    expire_timer: Option<TimerId>,
    counters: ReassemblyCounters,
}

impl Reassembly {
    pub fn new() -> Self {
        Reassembly {
            entries: HashMap::new(),
            expire_timer: None,
            counters: ReassemblyCounters::default(),
        }
    }

    pub fn counters(&self) -> ReassemblyCounters {
        self.counters
    }

    pub fn in_progress(&self) -> usize {
        self.entries.len()
    }

    /// Feed one fragment. Returns the completed datagram payload when this
    /// fragment was the last missing piece.
    pub fn process(
        &mut self,
        key: FragKey,
        frag_offset: usize,
        more_frags: bool,
        payload: &[u8],
        now: Instant,
        timers: &mut Timers<TimerEvent>,
    ) -> Option<Vec<u8>> {
        let end = frag_offset + payload.len();
        if end > MAX_DATAGRAM {
            debug!(?key, end, "fragment beyond datagram limit, aborting entry");
            self.abort(&key);
            return None;
        }

        if !self.entries.contains_key(&key) {
            if self.entries.len() >= MAX_ENTRIES {
                trace!(?key, "reassembly table full, dropping fragment");
                self.counters.dropped_fragments += 1;
                return None;
            }
            self.entries.insert(
                key,
                Entry {
                    data: Vec::new(),
                    ranges: Vec::new(),
                    received: 0,
                    total: None,
                    created: now,
                },
            );
            if self.expire_timer.is_none() {
                self.expire_timer =
                    Some(timers.start(now + REASSEMBLY_TTL, TimerEvent::ReassemblyExpire));
            }
        }

        let (aborted, complete) = {
            let entry = self.entries.get_mut(&key).expect("entry present");

            // Overlap with anything already received discards the entry, as
            // does a final fragment disagreeing with an earlier one or any
            // fragment past the known total.
            if entry.ranges.iter().any(|&(s, e)| frag_offset < e && end > s) {
                debug!(?key, frag_offset, end, "overlapping fragment, aborting entry");
                (true, false)
            } else if !more_frags && matches!(entry.total, Some(total) if total != end) {
                debug!(?key, "conflicting final fragment, aborting entry");
                (true, false)
            } else {
                if !more_frags {
                    entry.total = Some(end);
                }
                if matches!(entry.total, Some(total) if end > total) {
                    debug!(?key, end, "fragment past final length, aborting entry");
                    (true, false)
                } else {
                    if entry.data.len() < end {
                        entry.data.resize(end, 0);
                    }
                    entry.data[frag_offset..end].copy_from_slice(payload);
                    entry.ranges.push((frag_offset, end));
                    entry.received += payload.len();
                    (false, entry.total == Some(entry.received))
                }
            }
        };

        if aborted {
            self.abort(&key);
            return None;
        }
        if complete {
            let mut entry = self.entries.remove(&key).expect("entry present");
            entry.data.truncate(entry.received);
            self.counters.reassembled += 1;
            trace!(?key, len = entry.data.len(), "datagram reassembled");
            return Some(entry.data);
        }
        None
    }

    /// Timer sweep: drop entries older than the TTL.
    pub fn expire_tick(&mut self, now: Instant, timers: &mut Timers<TimerEvent>) {
        self.expire_timer = None;
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.created < REASSEMBLY_TTL);
        self.counters.aborted += (before - self.entries.len()) as u64;

        if !self.entries.is_empty() {
            self.expire_timer =
                Some(timers.start(now + REASSEMBLY_TTL, TimerEvent::ReassemblyExpire));
        }
    }

    fn abort(&mut self, key: &FragKey) {
        if self.entries.remove(key).is_some() {
            self.counters.aborted += 1;
        } else {
            self.counters.dropped_fragments += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ident: u16) -> FragKey {
        FragKey {
            src: Ipv4Address::new(10, 0, 0, 2),
            dst: Ipv4Address::new(10, 0, 0, 1),
            proto: IpProtocol::Udp,
            ident,
        }
    }

    fn setup() -> (Reassembly, Timers<TimerEvent>, Instant) {
        (Reassembly::new(), Timers::new(), Instant::from_millis(0))
    }

    #[test]
    fn test_three_fragments_in_order() {
        let (mut r, mut timers, now) = setup();
        let k = key(42);

        let a = vec![1u8; 1480];
        let b = vec![2u8; 1480];
        let c = vec![3u8; 40];

        assert!(r.process(k, 0, true, &a, now, &mut timers).is_none());
        assert!(r.process(k, 1480, true, &b, now, &mut timers).is_none());
        let out = r.process(k, 2960, false, &c, now, &mut timers).unwrap();

        assert_eq!(out.len(), 3000);
        assert_eq!(out[0], 1);
        assert_eq!(out[1480], 2);
        assert_eq!(out[2960], 3);
        assert_eq!(r.in_progress(), 0);
        assert_eq!(r.counters().reassembled, 1);
    }

    #[test]
    fn test_out_of_order_completion() {
        let (mut r, mut timers, now) = setup();
        let k = key(7);

        assert!(r.process(k, 8, false, &[2u8; 8], now, &mut timers).is_none());
        let out = r.process(k, 0, true, &[1u8; 8], now, &mut timers).unwrap();
        assert_eq!(out, [vec![1u8; 8], vec![2u8; 8]].concat());
    }

    #[test]
    fn test_overlap_aborts_entry() {
        let (mut r, mut timers, now) = setup();
        let k = key(1);

        assert!(r.process(k, 0, true, &[0u8; 16], now, &mut timers).is_none());
        assert!(r.process(k, 8, true, &[0u8; 16], now, &mut timers).is_none());
        assert_eq!(r.in_progress(), 0);
        assert_eq!(r.counters().aborted, 1);

        // A late sibling fragment no longer finds the entry and starts a new
        // one; it can never complete on its own.
        assert!(r.process(k, 32, false, &[0u8; 8], now, &mut timers).is_none());
        assert_eq!(r.in_progress(), 1);
    }

    #[test]
    fn test_overflow_aborts_entry() {
        let (mut r, mut timers, now) = setup();
        let k = key(2);

        assert!(r.process(k, 0, true, &[0u8; 8], now, &mut timers).is_none());
        assert!(r.process(k, 16, false, &[0u8; 8], now, &mut timers).is_none());
        // total is now 24; a fragment past it kills the entry
        assert!(r.process(k, 100, true, &[0u8; 8], now, &mut timers).is_none());
        assert_eq!(r.in_progress(), 0);
    }

    #[test]
    fn test_table_capacity_bounded() {
        let (mut r, mut timers, now) = setup();
        for ident in 0..MAX_ENTRIES as u16 {
            assert!(r.process(key(ident), 0, true, &[0u8; 8], now, &mut timers).is_none());
        }
        assert_eq!(r.in_progress(), MAX_ENTRIES);

        r.process(key(9999), 0, true, &[0u8; 8], now, &mut timers);
        assert_eq!(r.in_progress(), MAX_ENTRIES);
        assert_eq!(r.counters().dropped_fragments, 1);
    }

    #[test]
    fn test_stale_entries_expire() {
        let (mut r, mut timers, now) = setup();
        let k = key(3);
        r.process(k, 0, true, &[0u8; 8], now, &mut timers);
        assert_eq!(timers.pending(), 1);

        let later = now + REASSEMBLY_TTL + Duration::from_secs(1);
        r.expire_tick(later, &mut timers);
        assert_eq!(r.in_progress(), 0);
        assert_eq!(r.counters().aborted, 1);
        assert_eq!(timers.pending(), 0);
    }
}
