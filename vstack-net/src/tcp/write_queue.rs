//! The send-side write queue with partial-ACK accounting.
//!
//! User writes are queued as whole requests. Two cursors move through the
//! queue independently: the *send* cursor (`advance`) follows segments
//! pushed into the send window, and the *ack* cursor (`acknowledge`)
//! follows `SND.UNA`. A request completes, exactly once and in submission
//! order, when its last byte is cumulatively acknowledged; `acknowledge`
//! returns the completed request lengths so the engine can fire the user's
//! write callback.

use std::collections::VecDeque;

struct WriteRequest {
    buf: Vec<u8>,
    /// Bytes handed to the send window.
    sent: usize,
    /// Bytes at or below SND.UNA. Only ever nonzero on the front request.
    acked: usize,
}

impl WriteRequest {
    fn new(buf: Vec<u8>) -> Self {
        WriteRequest { buf, sent: 0, acked: 0 }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Default)]
pub struct WriteQueue {
    q: VecDeque<WriteRequest>,
    /// Index of the request the send cursor is inside.
    current: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        WriteQueue { q: VecDeque::new(), current: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Whether any byte is still waiting to be sent for the first time.
    pub fn has_remaining_requests(&self) -> bool {
        self.current < self.q.len()
    }

    pub fn bytes_total(&self) -> usize {
        self.q.iter().map(WriteRequest::len).sum()
    }

    /// Bytes not yet handed to the send window.
    pub fn bytes_remaining(&self) -> usize {
        self.q.iter().map(|r| r.len() - r.sent).sum()
    }

    /// Bytes not yet cumulatively acknowledged.
    pub fn bytes_unacknowledged(&self) -> usize {
        self.q.iter().map(|r| r.len() - r.acked).sum()
    }

    pub fn push_back(&mut self, buf: Vec<u8>) {
        debug_assert!(!buf.is_empty());
        self.q.push_back(WriteRequest::new(buf));
    }

    /// The next unsent bytes, bounded by the current request.
    pub fn nxt(&self) -> Option<&[u8]> {
        let req = self.q.get(self.current)?;
        Some(&req.buf[req.sent..])
    }

    /// Move the send cursor forward by `n` bytes within the current
    /// request.
    pub fn advance(&mut self, n: usize) {
        let req = self.q.get_mut(self.current).expect("advance past queue end");
        debug_assert!(req.sent + n <= req.len());
        req.sent += n;
        if req.sent == req.len() {
            self.current += 1;
        }
    }

    /// Apply a cumulative acknowledgment of `n` bytes. Returns the lengths
    /// of the requests this completed, oldest first.
    pub fn acknowledge(&mut self, mut n: usize) -> Vec<usize> {
        let mut completed = Vec::new();
        while n > 0 {
            let Some(front) = self.q.front_mut() else {
                debug_assert!(false, "acknowledged more bytes than queued");
                break;
            };
            let outstanding = front.len() - front.acked;
            if n >= outstanding {
                n -= outstanding;
                completed.push(front.len());
                self.q.pop_front();
                self.current = self.current.saturating_sub(1);
            } else {
                front.acked += n;
                n = 0;
            }
        }
        completed
    }

    /// Unacknowledged-but-sent bytes starting `offset` bytes past SND.UNA,
    /// capped at `max` and at the containing request's boundary. Used for
    /// retransmission.
    pub fn slice_from_una(&self, mut offset: usize, max: usize) -> Option<&[u8]> {
        for (i, req) in self.q.iter().enumerate() {
            let start = if i == 0 { req.acked } else { 0 };
            let span = req.sent.saturating_sub(start);
            if offset < span {
                let begin = start + offset;
                let end = req.sent.min(begin + max);
                return Some(&req.buf[begin..end]);
            }
            offset -= span;
        }
        None
    }

    /// Drop everything without reporting completions. Partial progress is
    /// intentionally not surfaced; connection teardown reports failure
    /// through its own channel.
    pub fn reset(&mut self) {
        self.q.clear();
        self.current = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_queue() {
        let wq = WriteQueue::new();
        assert!(wq.is_empty());
        assert_eq!(wq.len(), 0);
        assert_eq!(wq.current(), 0);
        assert!(wq.nxt().is_none());
        assert_eq!(wq.bytes_total(), 0);
        assert_eq!(wq.bytes_remaining(), 0);
        assert_eq!(wq.bytes_unacknowledged(), 0);
    }

    #[test]
    fn test_single_request_lifecycle() {
        let mut wq = WriteQueue::new();
        wq.push_back(vec![0; 1000]);

        assert!(!wq.is_empty());
        assert_eq!(wq.len(), 1);
        assert!(wq.has_remaining_requests());
        assert_eq!(wq.current(), 0);
        assert_eq!(wq.nxt().unwrap().len(), 1000);
        assert_eq!(wq.bytes_total(), 1000);
        assert_eq!(wq.bytes_remaining(), 1000);
        assert_eq!(wq.bytes_unacknowledged(), 1000);

        // Fully sent: no remaining requests, still unacknowledged.
        wq.advance(1000);
        assert!(!wq.has_remaining_requests());
        assert!(!wq.is_empty());
        assert_eq!(wq.current(), 1);
        assert!(wq.nxt().is_none());
        assert_eq!(wq.bytes_remaining(), 0);
        assert_eq!(wq.bytes_unacknowledged(), 1000);

        // Fully acknowledged: the request completes and the queue empties.
        assert_eq!(wq.acknowledge(1000), vec![1000]);
        assert!(wq.is_empty());
        assert_eq!(wq.current(), 0);
        assert_eq!(wq.bytes_total(), 0);
        assert_eq!(wq.bytes_unacknowledged(), 0);
    }

    #[test]
    fn test_partial_send_then_reset() {
        let mut wq = WriteQueue::new();
        wq.push_back(vec![0; 1000]);
        wq.advance(200);
        wq.reset();

        assert!(wq.is_empty());
        assert_eq!(wq.current(), 0);
        assert!(wq.nxt().is_none());

        // The queue is usable again after a reset.
        wq.push_back(vec![0; 500]);
        assert_eq!(wq.current(), 0);
        assert_eq!(wq.len(), 1);
        assert!(wq.nxt().is_some());
    }

    #[test]
    fn test_several_requests_partial_ack() {
        let mut wq = WriteQueue::new();
        for _ in 0..5 {
            wq.push_back(vec![0; 1000]);
        }
        assert_eq!(wq.len(), 5);
        assert_eq!(wq.bytes_total(), 5000);

        // Send cursor into the middle of the third request.
        wq.advance(1000);
        wq.advance(1000);
        wq.advance(500);
        assert_eq!(wq.current(), 2);
        assert_eq!(wq.nxt().unwrap().len(), 500);
        assert_eq!(wq.bytes_remaining(), 2500);
        assert_eq!(wq.bytes_unacknowledged(), 5000);

        // 2500 bytes acknowledged: two requests complete, the third is
        // half-acked and must not be reported.
        assert_eq!(wq.acknowledge(2500), vec![1000, 1000]);
        assert_eq!(wq.len(), 3);
        assert_eq!(wq.current(), 0);
        assert!(wq.has_remaining_requests());
        assert_eq!(wq.bytes_total(), 3000);
        assert_eq!(wq.bytes_remaining(), 2500);
        assert_eq!(wq.bytes_unacknowledged(), 2500);

        // The rest completes in order.
        wq.advance(500);
        wq.advance(1000);
        wq.advance(1000);
        assert_eq!(wq.acknowledge(2500), vec![1000, 1000, 1000]);
        assert!(wq.is_empty());
    }

    #[test]
    fn test_ack_within_first_request_reports_nothing() {
        let mut wq = WriteQueue::new();
        wq.push_back(vec![0; 3000]);
        wq.advance(3000);

        assert_eq!(wq.acknowledge(1500), Vec::<usize>::new());
        assert_eq!(wq.bytes_unacknowledged(), 1500);
        assert_eq!(wq.acknowledge(1500), vec![3000]);
        assert!(wq.is_empty());
    }

    #[test]
    fn test_slice_from_una_for_retransmission() {
        let mut wq = WriteQueue::new();
        wq.push_back((0u8..100).collect());
        wq.push_back((100u8..200).collect());
        wq.advance(100);
        wq.advance(50);

        // Nothing acked yet: offset 0 is the first byte of the first
        // request.
        assert_eq!(wq.slice_from_una(0, 10).unwrap(), &(0u8..10).collect::<Vec<_>>()[..]);
        // Crossing into the second request.
        assert_eq!(wq.slice_from_una(100, 10).unwrap(), &(100u8..110).collect::<Vec<_>>()[..]);
        // Only sent bytes are eligible.
        assert_eq!(wq.slice_from_una(100, 1000).unwrap().len(), 50);
        assert!(wq.slice_from_una(150, 10).is_none());

        // A partial ack rebases offset zero.
        wq.acknowledge(30);
        assert_eq!(wq.slice_from_una(0, 4).unwrap(), &[30, 31, 32, 33][..]);
    }
}
