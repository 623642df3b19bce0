//! Per-connection TCP state machine.
//!
//! One tagged state enum, one `segment_arrives` dispatcher. Processing of a
//! received segment runs the RFC 793 pipeline in order: acceptability check,
//! RST, SYN, ACK (write-queue progress, RTT, congestion), segment text, FIN.
//! Any step may short-circuit.
//!
//! The connection never calls user code directly: callbacks are collected
//! into a [`ConnOutput`] and fired by the engine after every internal borrow
//! is released. Re-entrant `close()` from inside a callback is downgraded to
//! a deferred close the engine applies when the callback returns.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::time::{Duration, Instant};
use smoltcp::wire::{
    IpProtocol, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber, TcpTimestampRepr,
};
use tracing::{debug, trace};

use crate::buffer::{BufferPool, Frame};
use crate::config::TcpConfig;
use crate::ip4::IpTx;
use crate::timer::{TimerEvent, TimerId, Timers};

use super::rtt::RttEstimator;
use super::types::{DisconnectReason, Flow, State, TcpError, TcpTimer};
use super::write_queue::WriteQueue;

pub type ConnectCallback = Box<dyn FnMut(&Connection)>;
pub type ReadCallback = Box<dyn FnMut(&[u8])>;
pub type DataCallback = Box<dyn FnMut(&Connection)>;
pub type WriteCallback = Box<dyn FnMut(usize)>;
pub type DisconnectCallback = Box<dyn FnMut(&Connection, DisconnectReason)>;
pub type CloseCallback = Box<dyn FnMut()>;

/// Queue of flows that have pending transmit work, shared between the
/// engine and every connection handle.
pub(crate) type ServiceHandle = Rc<RefCell<VecDeque<Flow>>>;

/// Delay before re-checking a congested (pool-exhausted) stream.
const CONGESTED_RETRY: Duration = Duration::from_millis(50);

/// Cap on out-of-order segments buffered per connection.
const MAX_OOO_SEGMENTS: usize = 16;

/// User deliverables collected during processing, fired by the engine once
/// no borrows are held.
pub(crate) enum DeferredCb {
    /// Active open completed.
    Connect,
    /// Passive open completed; the listener's callback fires.
    Accept,
    Read(Vec<u8>),
    Data,
    Write(usize),
    Disconnect(DisconnectReason),
    Close,
}

#[derive(Default)]
pub(crate) struct ConnOutput {
    pub tx: Vec<IpTx>,
    pub cbs: Vec<DeferredCb>,
    pub remove: bool,
    pub bytes_sacked: u64,
}

/// Everything a connection needs from its surroundings during one call.
pub(crate) struct TcpCtx<'a> {
    pub now: Instant,
    pub pool: &'a BufferPool,
    pub caps: &'a ChecksumCapabilities,
    pub timers: &'a mut Timers<TimerEvent>,
}

struct OooSegment {
    seq: TcpSeqNumber,
    data: Vec<u8>,
}

pub(crate) struct Conn {
    pub(crate) flow: Flow,
    pub(crate) state: State,
    cfg: Rc<TcpConfig>,
    /// Forked from a listener rather than actively opened.
    passive: bool,

    // Send sequence space (RFC 793 §3.2).
    iss: TcpSeqNumber,
    snd_una: TcpSeqNumber,
    snd_nxt: TcpSeqNumber,
    snd_wnd: u32,
    snd_wl1: TcpSeqNumber,
    snd_wl2: TcpSeqNumber,

    // Receive sequence space.
    irs: TcpSeqNumber,
    rcv_nxt: TcpSeqNumber,

    // Negotiated options.
    smss: u16,
    /// Shift applied to the peer's advertised window.
    wnd_shift_snd: u8,
    /// Shift the peer applies to ours.
    wnd_shift_rcv: u8,
    ws_negotiated: bool,
    sack_on: bool,
    ts_on: bool,
    ts_recent: u32,

    // Congestion control.
    cwnd: u32,
    ssthresh: u32,
    dup_acks: u32,
    in_recovery: bool,
    recover: TcpSeqNumber,

    // RTT estimation. The probe is the end sequence of one unretransmitted
    // segment and its send time (Karn's rule).
    rtt: RttEstimator,
    rtt_probe: Option<(TcpSeqNumber, Instant)>,
    rto_count: u32,

    // Queues.
    wq: WriteQueue,
    ooo: Vec<OooSegment>,
    recent_ooo: Option<(u32, u32)>,
    rx_buf: VecDeque<Vec<u8>>,
    rx_buffered: usize,
    read_chunk: usize,

    // Send-side SACK scoreboard: ranges the peer holds, sorted and merged.
    sacked: Vec<(TcpSeqNumber, TcpSeqNumber)>,

    // Pending work for the service pass.
    syn_pending: bool,
    fin_pending: bool,
    fin_sent: bool,
    fin_seq: Option<TcpSeqNumber>,
    rst_pending: bool,
    ack_now: bool,
    congested: bool,

    // Keepalive and persist bookkeeping.
    last_rx: Instant,
    keepalive_sent: u32,
    persist_backoff: u32,

    // Timers.
    timer_rto: Option<TimerId>,
    timer_delack: Option<TimerId>,
    timer_persist: Option<TimerId>,
    timer_keepalive: Option<TimerId>,
    timer_timewait: Option<TimerId>,
    timer_retry: Option<TimerId>,

    // Callback re-entrancy guard.
    pub(crate) busy: bool,
    pub(crate) deferred_close: bool,
    disconnect_fired: bool,
    close_fired: bool,

    // Callbacks.
    pub(crate) on_connect: Option<ConnectCallback>,
    pub(crate) on_read: Option<ReadCallback>,
    pub(crate) on_data: Option<DataCallback>,
    pub(crate) on_write: Option<WriteCallback>,
    pub(crate) on_disconnect: Option<DisconnectCallback>,
    pub(crate) on_close: Option<CloseCallback>,
}

impl Conn {
    pub(crate) fn new(flow: Flow, cfg: Rc<TcpConfig>, iss: TcpSeqNumber, passive: bool) -> Self {
        let mss = cfg.mss;
        Conn {
            flow,
            state: State::Closed,
            cfg,
            passive,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: TcpSeqNumber(0),
            snd_wl2: TcpSeqNumber(0),
            irs: TcpSeqNumber(0),
            rcv_nxt: TcpSeqNumber(0),
            smss: mss,
            wnd_shift_snd: 0,
            wnd_shift_rcv: 0,
            ws_negotiated: false,
            sack_on: false,
            ts_on: false,
            ts_recent: 0,
            cwnd: initial_window(mss),
            ssthresh: u32::MAX / 2,
            dup_acks: 0,
            in_recovery: false,
            recover: iss,
            rtt: RttEstimator::new(),
            rtt_probe: None,
            rto_count: 0,
            wq: WriteQueue::new(),
            ooo: Vec::new(),
            recent_ooo: None,
            rx_buf: VecDeque::new(),
            rx_buffered: 0,
            read_chunk: 0,
            sacked: Vec::new(),
            syn_pending: false,
            fin_pending: false,
            fin_sent: false,
            fin_seq: None,
            rst_pending: false,
            ack_now: false,
            congested: false,
            last_rx: Instant::from_millis(0),
            keepalive_sent: 0,
            persist_backoff: 0,
            timer_rto: None,
            timer_delack: None,
            timer_persist: None,
            timer_keepalive: None,
            timer_timewait: None,
            timer_retry: None,
            busy: false,
            deferred_close: false,
            disconnect_fired: false,
            close_fired: false,
            on_connect: None,
            on_read: None,
            on_data: None,
            on_write: None,
            on_disconnect: None,
            on_close: None,
        }
    }

    /// Active open: CLOSED -> SYN_SENT; the SYN goes out on the next
    /// service pass.
    pub(crate) fn open_active(&mut self) {
        debug_assert_eq!(self.state, State::Closed);
        self.state = State::SynSent;
        self.syn_pending = true;
    }

    /// Passive open: the forked connection starts in LISTEN and handles the
    /// triggering SYN through the normal dispatcher.
    pub(crate) fn open_passive(&mut self) {
        debug_assert_eq!(self.state, State::Closed);
        self.state = State::Listen;
    }

    // ---- segment arrival ------------------------------------------------

    pub(crate) fn segment_arrives(
        &mut self,
        repr: &TcpRepr<'_>,
        ctx: &mut TcpCtx<'_>,
        out: &mut ConnOutput,
    ) {
        self.last_rx = ctx.now;
        self.keepalive_sent = 0;
        match self.state {
            State::Closed => {
                // Shouldn't be reachable through the registry; be safe.
                self.send_reset_for(repr, ctx, out);
            }
            State::Listen => self.arrives_listen(repr, ctx, out),
            State::SynSent => self.arrives_syn_sent(repr, ctx, out),
            _ => self.arrives_synchronized(repr, ctx, out),
        }
    }

    fn arrives_listen(&mut self, repr: &TcpRepr<'_>, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        if repr.control == TcpControl::Rst {
            out.remove = true;
            return;
        }
        if repr.ack_number.is_some() {
            self.send_reset_for(repr, ctx, out);
            out.remove = true;
            return;
        }
        if repr.control != TcpControl::Syn {
            out.remove = true;
            return;
        }

        self.irs = repr.seq_number;
        self.rcv_nxt = repr.seq_number + 1;
        self.learn_options(repr);
        self.state = State::SynRcvd;
        self.syn_pending = true;
        // The SYN itself is an unscaled window advertisement.
        self.snd_wnd = repr.window_len as u32;
        self.snd_wl1 = repr.seq_number;
        self.snd_wl2 = self.snd_una;
        debug!(flow = %self.flow, "passive open: LISTEN -> SYN-RCVD");
    }

    fn arrives_syn_sent(&mut self, repr: &TcpRepr<'_>, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        // First the ACK, RFC 793 p.66.
        if let Some(ack) = repr.ack_number
            && (ack <= self.iss || ack > self.snd_nxt)
        {
            if repr.control != TcpControl::Rst {
                self.send_reset_for(repr, ctx, out);
            }
            return;
        }

        if repr.control == TcpControl::Rst {
            if repr.ack_number.is_some() {
                self.terminate(DisconnectReason::Reset, false, ctx, out);
            }
            return;
        }

        if repr.control != TcpControl::Syn {
            return;
        }

        self.irs = repr.seq_number;
        self.rcv_nxt = repr.seq_number + 1;
        self.learn_options(repr);
        if let Some(ack) = repr.ack_number {
            self.snd_una = ack;
        }

        if self.snd_una > self.iss {
            // Our SYN is acknowledged.
            self.state = State::Established;
            self.syn_pending = false;
            self.snd_wnd = repr.window_len as u32;
            self.snd_wl1 = repr.seq_number;
            self.snd_wl2 = self.snd_una;
            self.rto_count = 0;
            self.disarm(ctx, TcpTimer::Rto);
            self.ack_now = true;
            self.arm_keepalive(ctx);
            out.cbs.push(DeferredCb::Connect);
            debug!(flow = %self.flow, "active open complete: SYN-SENT -> ESTABLISHED");
        } else {
            // Simultaneous open.
            self.state = State::SynRcvd;
            self.syn_pending = true;
            debug!(flow = %self.flow, "simultaneous open: SYN-SENT -> SYN-RCVD");
        }
    }

    fn arrives_synchronized(
        &mut self,
        repr: &TcpRepr<'_>,
        ctx: &mut TcpCtx<'_>,
        out: &mut ConnOutput,
    ) {
        let seg_seq = repr.seq_number;
        let seg_len = repr.payload.len() + repr.control.len();

        // Step 1: sequence-number acceptability.
        if !self.seq_acceptable(seg_seq, seg_len) {
            if repr.control != TcpControl::Rst {
                self.ack_now = true;
                if self.state == State::TimeWait {
                    // A retransmitted FIN restarts the 2MSL clock.
                    self.arm_time_wait(ctx);
                }
            }
            return;
        }

        if self.ts_on
            && let Some(ts) = repr.timestamp
            && seg_seq <= self.rcv_nxt
        {
            self.ts_recent = ts.tsval;
        }

        // Step 2: RST.
        if repr.control == TcpControl::Rst {
            if self.state == State::SynRcvd && self.passive {
                // Fall silently back to nothing; the listener stays.
                self.abandon(ctx, out);
            } else {
                self.terminate(DisconnectReason::Reset, false, ctx, out);
            }
            return;
        }

        // Step 4: SYN in the window is fatal.
        if repr.control == TcpControl::Syn {
            self.terminate(DisconnectReason::Reset, true, ctx, out);
            return;
        }

        // Step 5: ACK processing. A segment without ACK is dropped.
        let Some(seg_ack) = repr.ack_number else {
            return;
        };

        if self.state == State::SynRcvd {
            if self.snd_una <= seg_ack && seg_ack <= self.snd_nxt {
                self.state = State::Established;
                self.snd_wnd = (repr.window_len as u32) << self.wnd_shift_snd;
                self.snd_wl1 = seg_seq;
                self.snd_wl2 = seg_ack;
                self.rto_count = 0;
                self.disarm(ctx, TcpTimer::Rto);
                self.arm_keepalive(ctx);
                out.cbs.push(if self.passive { DeferredCb::Accept } else { DeferredCb::Connect });
                debug!(flow = %self.flow, "handshake complete: SYN-RCVD -> ESTABLISHED");
            } else {
                self.send_reset_for(repr, ctx, out);
                return;
            }
        }

        if seg_ack > self.snd_nxt {
            // Ack for data we never sent.
            self.ack_now = true;
            return;
        }

        if self.sack_on {
            for range in repr.sack_ranges.iter().flatten() {
                out.bytes_sacked += self.register_sack(*range);
            }
        }

        if seg_ack == self.snd_una {
            let window_unchanged = (repr.window_len as u32) << self.wnd_shift_snd == self.snd_wnd;
            if self.snd_nxt != self.snd_una && repr.payload.is_empty() && window_unchanged {
                self.dup_acks += 1;
                trace!(flow = %self.flow, dup_acks = self.dup_acks, "duplicate ack");
                if self.dup_acks == 3 {
                    self.enter_fast_retransmit(ctx, out);
                } else if self.in_recovery && self.dup_acks > 3 {
                    self.cwnd = self.cwnd.saturating_add(self.smss as u32);
                }
            }
        } else if seg_ack > self.snd_una {
            self.ack_advances(seg_ack, ctx, out);
        }

        // Window update.
        if self.snd_wl1 < seg_seq || (self.snd_wl1 == seg_seq && self.snd_wl2 <= seg_ack) {
            self.snd_wnd = (repr.window_len as u32) << self.wnd_shift_snd;
            self.snd_wl1 = seg_seq;
            self.snd_wl2 = seg_ack;
            if self.snd_wnd == 0 && self.wq.has_remaining_requests() {
                self.arm_persist(ctx);
            } else if self.snd_wnd > 0 {
                self.persist_backoff = 0;
                self.disarm(ctx, TcpTimer::Persist);
            }
        }

        // Transitions driven by our FIN being acknowledged.
        if self.fin_sent
            && let Some(fin_seq) = self.fin_seq
            && seg_ack > fin_seq
        {
            match self.state {
                State::FinWait1 => {
                    self.state = State::FinWait2;
                    debug!(flow = %self.flow, "FIN acked: FIN-WAIT-1 -> FIN-WAIT-2");
                }
                State::Closing => {
                    debug!(flow = %self.flow, "FIN acked: CLOSING -> TIME-WAIT");
                    self.enter_time_wait(ctx, out);
                }
                State::LastAck => {
                    debug!(flow = %self.flow, "FIN acked: LAST-ACK -> CLOSED");
                    self.state = State::Closed;
                    self.disarm_all(ctx);
                    if !self.close_fired {
                        self.close_fired = true;
                        out.cbs.push(DeferredCb::Close);
                    }
                    out.remove = true;
                    return;
                }
                _ => {}
            }
        }

        // Step 7: segment text.
        if !repr.payload.is_empty() && self.state.is_readable() {
            self.process_text(seg_seq, repr.payload, ctx, out);
        }

        // Step 8: FIN.
        if repr.control == TcpControl::Fin && self.state.is_readable() {
            let fin_at = seg_seq + repr.payload.len();
            if fin_at == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt + 1;
                self.ack_now = true;
                match self.state {
                    State::Established => {
                        self.state = State::CloseWait;
                        debug!(flow = %self.flow, "peer FIN: ESTABLISHED -> CLOSE-WAIT");
                        // End-of-stream is observable through on_data /
                        // read_next; writing stays legal.
                        if self.on_data.is_some() {
                            out.cbs.push(DeferredCb::Data);
                        }
                    }
                    State::FinWait1 => {
                        // Our FIN is unacked (an acked FIN already moved us
                        // to FIN-WAIT-2 above).
                        self.state = State::Closing;
                        debug!(flow = %self.flow, "simultaneous close: FIN-WAIT-1 -> CLOSING");
                    }
                    State::FinWait2 => {
                        debug!(flow = %self.flow, "peer FIN: FIN-WAIT-2 -> TIME-WAIT");
                        self.enter_time_wait(ctx, out);
                    }
                    _ => {}
                }
            }
            // An out-of-order FIN is ignored; the peer retransmits it.
        }
    }

    /// A new cumulative ACK: advance the write queue, sample RTT, grow the
    /// congestion window, retune timers.
    fn ack_advances(&mut self, seg_ack: TcpSeqNumber, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        let total = seg_ack - self.snd_una;
        let mut data_acked = total;
        // Control bytes occupy sequence space but not the write queue.
        if self.snd_una == self.iss {
            data_acked -= 1; // our SYN
        }
        if let Some(fin_seq) = self.fin_seq
            && seg_ack > fin_seq
        {
            data_acked -= 1; // our FIN
        }

        for len in self.wq.acknowledge(data_acked) {
            out.cbs.push(DeferredCb::Write(len));
        }
        self.snd_una = seg_ack;
        self.dup_acks = 0;
        self.rto_count = 0;
        self.congested = false;

        if let Some((end, sent_at)) = self.rtt_probe
            && seg_ack >= end
        {
            self.rtt.sample(ctx.now - sent_at);
            self.rtt_probe = None;
        }

        // Congestion window.
        if self.in_recovery {
            if seg_ack >= self.recover {
                self.in_recovery = false;
                self.cwnd = self.ssthresh;
            } else {
                // Partial ack: the next hole is lost too, retransmit it
                // right away and stay in recovery.
                self.cwnd = self.ssthresh;
                self.retransmit_one(ctx, out);
            }
        } else if self.cwnd < self.ssthresh {
            self.cwnd = self.cwnd.saturating_add((total as u32).min(self.smss as u32));
        } else {
            let mss = self.smss as u32;
            self.cwnd = self.cwnd.saturating_add((mss * mss / self.cwnd).max(1));
        }

        self.sacked.retain(|&(_, end)| end > self.snd_una);
        for range in &mut self.sacked {
            if range.0 < self.snd_una {
                range.0 = self.snd_una;
            }
        }

        if self.all_acked() {
            self.disarm(ctx, TcpTimer::Rto);
        } else {
            self.arm(ctx, TcpTimer::Rto, self.rtt.rto());
        }
    }

    // ---- service: emit whatever is pending ------------------------------

    pub(crate) fn service(&mut self, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        if self.rst_pending {
            self.rst_pending = false;
            let seq = self.snd_nxt;
            self.emit(ctx, out, TcpControl::Rst, seq, &[], true);
            self.state = State::Closed;
        }
        if self.state == State::Closed {
            self.disarm_all(ctx);
            out.remove = true;
            return;
        }

        let mut sent_any = false;

        if self.syn_pending {
            let (control, with_ack) = match self.state {
                State::SynSent => (TcpControl::Syn, false),
                State::SynRcvd => (TcpControl::Syn, true),
                _ => (TcpControl::None, false),
            };
            if control == TcpControl::Syn {
                let seq = self.iss;
                if self.emit(ctx, out, control, seq, &[], with_ack) {
                    self.syn_pending = false;
                    self.snd_nxt = self.iss + 1;
                    self.arm(ctx, TcpTimer::Rto, self.rtt.rto());
                    sent_any = true;
                }
            }
        }

        // Drain the write queue into the usable window.
        if matches!(
            self.state,
            State::Established | State::CloseWait | State::FinWait1 | State::Closing | State::LastAck
        ) {
            sent_any |= self.send_data(ctx, out);
        }

        // FIN goes out once every queued byte has been sent.
        if self.fin_pending && !self.fin_sent && self.wq.bytes_remaining() == 0 && !self.congested {
            let seq = self.snd_nxt;
            if self.emit(ctx, out, TcpControl::Fin, seq, &[], true) {
                self.fin_seq = Some(seq);
                self.fin_sent = true;
                self.fin_pending = false;
                self.snd_nxt = self.snd_nxt + 1;
                self.arm(ctx, TcpTimer::Rto, self.rtt.rto());
                sent_any = true;
            }
        }

        if self.ack_now && !sent_any {
            let seq = self.snd_nxt;
            self.emit(ctx, out, TcpControl::None, seq, &[], true);
        }
    }

    fn send_data(&mut self, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) -> bool {
        let mut sent_any = false;
        while !self.congested {
            let flight = (self.snd_nxt - self.snd_una) as u32;
            let usable = self.snd_wnd.min(self.cwnd).saturating_sub(flight);
            if usable == 0 {
                if self.snd_wnd == 0 && self.wq.has_remaining_requests() {
                    self.arm_persist(ctx);
                }
                break;
            }
            let Some(chunk) = self.wq.nxt() else { break };
            let len = chunk.len().min(self.smss as usize).min(usable as usize);
            if len == 0 {
                break;
            }

            let seq = self.snd_nxt;
            let payload = &chunk[..len];
            let last = payload.len() == self.wq.bytes_remaining();
            let control = if last { TcpControl::Psh } else { TcpControl::None };
            let Some(tx) = self.build_segment(ctx, control, seq, payload, true) else {
                self.congest(ctx);
                break;
            };
            out.tx.push(tx);
            self.after_emit(ctx);

            self.snd_nxt = self.snd_nxt + len;
            self.wq.advance(len);
            if self.rtt_probe.is_none() {
                self.rtt_probe = Some((self.snd_nxt, ctx.now));
            }
            if self.timer_rto.is_none() {
                self.arm(ctx, TcpTimer::Rto, self.rtt.rto());
            }
            sent_any = true;
        }
        sent_any
    }

    // ---- timers ----------------------------------------------------------

    pub(crate) fn handle_timer(
        &mut self,
        kind: TcpTimer,
        ctx: &mut TcpCtx<'_>,
        out: &mut ConnOutput,
    ) {
        match kind {
            TcpTimer::Rto => {
                self.timer_rto = None;
                self.on_rto(ctx, out);
            }
            TcpTimer::DelayedAck => {
                self.timer_delack = None;
                let seq = self.snd_nxt;
                self.emit(ctx, out, TcpControl::None, seq, &[], true);
            }
            TcpTimer::Persist => {
                self.timer_persist = None;
                self.on_persist(ctx, out);
            }
            TcpTimer::Keepalive => {
                self.timer_keepalive = None;
                self.on_keepalive(ctx, out);
            }
            TcpTimer::TimeWait => {
                self.timer_timewait = None;
                debug!(flow = %self.flow, "TIME-WAIT elapsed, removing flow");
                self.state = State::Closed;
                out.remove = true;
            }
            TcpTimer::Retry => {
                self.timer_retry = None;
                self.congested = false;
                // The caller services us right after, which retries the
                // send.
            }
        }
    }

    fn on_rto(&mut self, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        if self.all_acked() && !self.syn_pending {
            return; // stale timer
        }
        self.rto_count += 1;
        if self.rto_count > self.cfg.max_retransmissions {
            debug!(flow = %self.flow, retries = self.rto_count, "retransmission budget exhausted");
            self.terminate(DisconnectReason::Timeout, true, ctx, out);
            return;
        }

        // Back off, collapse the congestion window, and forget the RTT
        // probe (Karn).
        self.rtt.backoff();
        self.rtt_probe = None;
        let flight = (self.snd_nxt - self.snd_una) as u32;
        self.ssthresh = (flight / 2).max(2 * self.smss as u32);
        self.cwnd = self.smss as u32;
        self.in_recovery = false;
        self.dup_acks = 0;

        trace!(flow = %self.flow, rto = %self.rtt.rto(), count = self.rto_count, "retransmit");
        self.retransmit_one(ctx, out);
        self.arm(ctx, TcpTimer::Rto, self.rtt.rto());
    }

    fn on_persist(&mut self, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        if self.snd_wnd > 0 || !self.wq.has_remaining_requests() {
            self.persist_backoff = 0;
            return;
        }
        // Probe with a single byte beyond the window.
        let seq = self.snd_nxt;
        if let Some(chunk) = self.wq.nxt() {
            let probe = [chunk[0]];
            if let Some(tx) = self.build_segment(ctx, TcpControl::None, seq, &probe, true) {
                out.tx.push(tx);
                self.after_emit(ctx);
                self.snd_nxt = self.snd_nxt + 1usize;
                self.wq.advance(1);
                if self.timer_rto.is_none() {
                    self.arm(ctx, TcpTimer::Rto, self.rtt.rto());
                }
            }
        }
        self.persist_backoff = (self.persist_backoff + 1).min(6);
        self.arm_persist(ctx);
    }

    fn on_keepalive(&mut self, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        let Some(interval) = self.cfg.keepalive_interval else { return };
        if self.state != State::Established {
            return;
        }
        if ctx.now - self.last_rx < interval {
            self.arm_keepalive(ctx);
            return;
        }
        if self.keepalive_sent >= self.cfg.keepalive_probes {
            debug!(flow = %self.flow, "keepalive probes exhausted");
            self.terminate(DisconnectReason::Timeout, true, ctx, out);
            return;
        }
        // A zero-length segment one byte below SND.NXT provokes an ACK.
        let seq = TcpSeqNumber(self.snd_nxt.0.wrapping_sub(1));
        self.emit(ctx, out, TcpControl::None, seq, &[], true);
        self.keepalive_sent += 1;
        self.arm_keepalive(ctx);
    }

    // ---- user operations -------------------------------------------------

    pub(crate) fn queue_write(&mut self, data: Vec<u8>) -> Result<(), TcpError> {
        if self.congested {
            return Err(TcpError::NoBuffer);
        }
        if !self.state.is_writable() {
            return Err(TcpError::InvalidState(self.state));
        }
        self.wq.push_back(data);
        Ok(())
    }

    /// State transition for `close()`. The FIN is emitted by the service
    /// pass once the write queue drains.
    pub(crate) fn close_requested(&mut self) -> Result<(), TcpError> {
        match self.state {
            State::Listen | State::SynSent => {
                self.state = State::Closed;
                Ok(())
            }
            State::SynRcvd | State::Established => {
                self.state = State::FinWait1;
                self.fin_pending = true;
                debug!(flow = %self.flow, "close: -> FIN-WAIT-1");
                Ok(())
            }
            State::CloseWait => {
                self.state = State::LastAck;
                self.fin_pending = true;
                debug!(flow = %self.flow, "close: CLOSE-WAIT -> LAST-ACK");
                Ok(())
            }
            state => Err(TcpError::InvalidState(state)),
        }
    }

    /// State transition for `abort()`: RST on the next service pass.
    pub(crate) fn abort_requested(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.wq.reset();
        self.rst_pending = self.state.is_synchronized();
        if !self.rst_pending {
            self.state = State::Closed;
        }
        self.disconnect_fired = true;
    }

    // ---- helpers ---------------------------------------------------------

    fn learn_options(&mut self, repr: &TcpRepr<'_>) {
        if let Some(mss) = repr.max_seg_size {
            self.smss = self.cfg.mss.min(mss);
        } else {
            self.smss = self.cfg.mss.min(536);
        }
        self.cwnd = initial_window(self.smss);
        match repr.window_scale {
            Some(shift) => {
                self.ws_negotiated = true;
                self.wnd_shift_snd = shift.min(14);
                self.wnd_shift_rcv = self.cfg.window_scale;
            }
            None => {
                self.ws_negotiated = false;
                self.wnd_shift_snd = 0;
                self.wnd_shift_rcv = 0;
            }
        }
        self.sack_on = self.cfg.sack_enabled && repr.sack_permitted;
        if self.cfg.timestamps_enabled
            && let Some(ts) = repr.timestamp
        {
            self.ts_on = true;
            self.ts_recent = ts.tsval;
        }
    }

    fn seq_acceptable(&self, seq: TcpSeqNumber, len: usize) -> bool {
        let wnd = self.rcv_window() as usize;
        let in_window = |s: TcpSeqNumber| self.rcv_nxt <= s && s < self.rcv_nxt + wnd;
        if len == 0 {
            if wnd == 0 { seq == self.rcv_nxt } else { in_window(seq) }
        } else if wnd == 0 {
            false
        } else {
            in_window(seq) || in_window(seq + (len - 1))
        }
    }

    /// Space from RCV.NXT. Out-of-order segments already sit inside the
    /// advertised window, so only contiguous undelivered data shrinks it.
    fn rcv_window(&self) -> u32 {
        self.cfg.window_size.saturating_sub(self.rx_buffered as u32)
    }

    fn process_text(
        &mut self,
        seg_seq: TcpSeqNumber,
        payload: &[u8],
        ctx: &mut TcpCtx<'_>,
        out: &mut ConnOutput,
    ) {
        // Trim to the portion we still need and can hold.
        let mut data = payload;
        let mut seq = seg_seq;
        if seq < self.rcv_nxt {
            let skip = self.rcv_nxt - seq;
            if skip >= data.len() {
                self.ack_now = true;
                return;
            }
            data = &data[skip..];
            seq = self.rcv_nxt;
        }
        let wnd = self.rcv_window() as usize;
        let room = wnd.saturating_sub(seq - self.rcv_nxt);
        if data.len() > room {
            data = &data[..room];
        }
        if data.is_empty() {
            self.ack_now = true;
            return;
        }

        if seq == self.rcv_nxt {
            let mut assembled = data.to_vec();
            self.rcv_nxt = self.rcv_nxt + data.len();
            self.merge_ooo(&mut assembled);
            self.deliver(assembled, out);
            // Delayed ACK: the second unacknowledged segment forces one
            // out immediately.
            if self.timer_delack.is_some() {
                self.ack_now = true;
                self.disarm(ctx, TcpTimer::DelayedAck);
            } else if !self.ack_now {
                self.arm(ctx, TcpTimer::DelayedAck, self.cfg.delayed_ack_timeout);
            }
        } else {
            // Out of order: hold it and duplicate-ACK immediately, with
            // SACK blocks when negotiated.
            self.insert_ooo(seq, data);
            self.ack_now = true;
        }
    }

    fn insert_ooo(&mut self, seq: TcpSeqNumber, data: &[u8]) {
        if self.ooo.len() >= MAX_OOO_SEGMENTS {
            return;
        }
        let end = seq + data.len();
        let overlaps = self.ooo.iter().any(|s| {
            let s_end = s.seq + s.data.len();
            seq < s_end && end > s.seq
        });
        if overlaps {
            return;
        }
        self.recent_ooo = Some((seq.0 as u32, end.0 as u32));
        self.ooo.push(OooSegment { seq, data: data.to_vec() });
        self.ooo.sort_by_key(|s| s.seq - self.rcv_nxt);
    }

    /// Pull now-contiguous out-of-order segments into `assembled`,
    /// advancing `rcv_nxt`.
    fn merge_ooo(&mut self, assembled: &mut Vec<u8>) {
        loop {
            let Some(pos) = self.ooo.iter().position(|s| s.seq <= self.rcv_nxt) else {
                break;
            };
            let seg = self.ooo.remove(pos);
            let seg_end = seg.seq + seg.data.len();
            if seg_end <= self.rcv_nxt {
                continue; // fully duplicate
            }
            let skip = self.rcv_nxt - seg.seq;
            assembled.extend_from_slice(&seg.data[skip..]);
            self.rcv_nxt = seg_end;
        }
        if self.ooo.is_empty() {
            self.recent_ooo = None;
        }
    }

    fn deliver(&mut self, data: Vec<u8>, out: &mut ConnOutput) {
        if self.on_read.is_some() {
            out.cbs.push(DeferredCb::Read(data));
        } else {
            self.rx_buffered += data.len();
            self.rx_buf.push_back(data);
            if self.on_data.is_some() {
                out.cbs.push(DeferredCb::Data);
            }
        }
    }

    pub(crate) fn pop_read_buffer(&mut self) -> Option<Vec<u8>> {
        let data = self.rx_buf.pop_front()?;
        self.rx_buffered -= data.len();
        Some(data)
    }

    pub(crate) fn push_read_buffer(&mut self, data: Vec<u8>) {
        self.rx_buffered += data.len();
        self.rx_buf.push_back(data);
    }

    pub(crate) fn read_chunk(&self) -> usize {
        self.read_chunk
    }

    pub(crate) fn set_read_chunk(&mut self, chunk: usize) {
        self.read_chunk = chunk;
    }

    fn register_sack(&mut self, range: (u32, u32)) -> u64 {
        let mut start = TcpSeqNumber(range.0 as i32);
        let mut end = TcpSeqNumber(range.1 as i32);
        if start < self.snd_una {
            start = self.snd_una;
        }
        if end > self.snd_nxt {
            end = self.snd_nxt;
        }
        if !(start < end) {
            return 0;
        }
        let before: usize = self.sacked.iter().map(|&(s, e)| e - s).sum();
        self.sacked.push((start, end));
        self.sacked.sort_by_key(|&(s, _)| s - self.snd_una);
        let mut merged: Vec<(TcpSeqNumber, TcpSeqNumber)> = Vec::new();
        for (s, e) in self.sacked.drain(..) {
            match merged.last_mut() {
                Some(last) if s <= last.1 => {
                    if e > last.1 {
                        last.1 = e;
                    }
                }
                _ => merged.push((s, e)),
            }
        }
        self.sacked = merged;
        let after: usize = self.sacked.iter().map(|&(s, e)| e - s).sum();
        (after - before) as u64
    }

    /// First sent-but-unacked byte offset not covered by SACK.
    fn first_hole_offset(&self) -> usize {
        let mut off = 0;
        for &(s, e) in &self.sacked {
            if s - self.snd_una <= off {
                off = off.max(e - self.snd_una);
            } else {
                break;
            }
        }
        off
    }

    fn enter_fast_retransmit(&mut self, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        let flight = (self.snd_nxt - self.snd_una) as u32;
        self.ssthresh = (flight / 2).max(2 * self.smss as u32);
        self.in_recovery = true;
        self.recover = self.snd_nxt;
        debug!(flow = %self.flow, ssthresh = self.ssthresh, "fast retransmit");
        self.retransmit_one(ctx, out);
        self.cwnd = self.ssthresh + 3 * self.smss as u32;
        // Retransmission is not a valid RTT sample.
        self.rtt_probe = None;
    }

    /// Retransmit one segment from the oldest unacknowledged hole.
    fn retransmit_one(&mut self, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        match self.state {
            State::SynSent => {
                let seq = self.iss;
                self.emit(ctx, out, TcpControl::Syn, seq, &[], false);
                return;
            }
            State::SynRcvd => {
                let seq = self.iss;
                self.emit(ctx, out, TcpControl::Syn, seq, &[], true);
                return;
            }
            _ => {}
        }

        let hole = self.first_hole_offset();
        let payload = self.wq.slice_from_una(hole, self.smss as usize).map(<[u8]>::to_vec);
        if let Some(payload) = payload {
            let seq = self.snd_una + hole;
            if let Some(tx) = self.build_segment(ctx, TcpControl::Psh, seq, &payload, true) {
                out.tx.push(tx);
                self.after_emit(ctx);
            }
        } else if self.fin_sent
            && let Some(fin_seq) = self.fin_seq
        {
            self.emit(ctx, out, TcpControl::Fin, fin_seq, &[], true);
        } else if !self.all_acked() {
            // Unacked persist-probe bytes live outside the queue's sent
            // span; just re-ack to solicit the peer.
            let seq = self.snd_nxt;
            self.emit(ctx, out, TcpControl::None, seq, &[], true);
        }
    }

    /// Build and queue one segment; returns false on pool exhaustion.
    fn emit(
        &mut self,
        ctx: &mut TcpCtx<'_>,
        out: &mut ConnOutput,
        control: TcpControl,
        seq: TcpSeqNumber,
        payload: &[u8],
        with_ack: bool,
    ) -> bool {
        match self.build_segment(ctx, control, seq, payload, with_ack) {
            Some(tx) => {
                out.tx.push(tx);
                if with_ack {
                    self.after_emit(ctx);
                }
                true
            }
            None => {
                self.congest(ctx);
                false
            }
        }
    }

    /// Every outgoing ACK-carrying segment satisfies any pending ACK
    /// obligation.
    fn after_emit(&mut self, ctx: &mut TcpCtx<'_>) {
        self.ack_now = false;
        self.disarm(ctx, TcpTimer::DelayedAck);
    }

    fn congest(&mut self, ctx: &mut TcpCtx<'_>) {
        self.congested = true;
        if self.timer_retry.is_none() {
            self.timer_retry = Some(ctx.timers.start(
                ctx.now + CONGESTED_RETRY,
                TimerEvent::Tcp { flow: self.flow, kind: TcpTimer::Retry },
            ));
        }
    }

    fn build_segment(
        &self,
        ctx: &mut TcpCtx<'_>,
        control: TcpControl,
        seq: TcpSeqNumber,
        payload: &[u8],
        with_ack: bool,
    ) -> Option<IpTx> {
        let buf = ctx.pool.acquire()?;
        let mut frame = Frame::new_tx(buf);

        let is_syn = control == TcpControl::Syn;
        // A SYN carrying an ACK answers the peer's SYN and must only echo
        // the options the peer offered.
        let is_syn_ack = is_syn && with_ack;
        let window = if is_syn {
            self.rcv_window().min(u16::MAX as u32) as u16
        } else {
            (self.rcv_window() >> self.wnd_shift_rcv).min(u16::MAX as u32) as u16
        };

        let offer_ws = if is_syn_ack { self.ws_negotiated } else { is_syn };
        let offer_sack = if is_syn_ack { self.sack_on } else { is_syn && self.cfg.sack_enabled };
        let timestamp = if is_syn && !is_syn_ack {
            self.cfg
                .timestamps_enabled
                .then(|| TcpTimestampRepr::new(tsval(ctx.now), 0))
        } else if self.ts_on {
            Some(TcpTimestampRepr::new(tsval(ctx.now), self.ts_recent))
        } else {
            None
        };

        let sack_ranges = if self.sack_on && with_ack && !self.ooo.is_empty() {
            self.sack_blocks()
        } else {
            [None; 3]
        };

        let repr = TcpRepr {
            src_port: self.flow.local.port,
            dst_port: self.flow.remote.port,
            control,
            seq_number: seq,
            ack_number: with_ack.then_some(self.rcv_nxt),
            window_len: window,
            window_scale: offer_ws.then_some(self.cfg.window_scale),
            max_seg_size: is_syn.then_some(self.cfg.mss),
            sack_permitted: offer_sack,
            sack_ranges,
            timestamp,
            payload,
        };

        let data = frame.append(repr.buffer_len());
        let mut pkt = TcpPacket::new_unchecked(data);
        repr.emit(
            &mut pkt,
            &self.flow.local.addr.into(),
            &self.flow.remote.addr.into(),
            ctx.caps,
        );
        trace!(flow = %self.flow, ?control, seq = seq.0, len = payload.len(), "tcp tx");
        Some(IpTx::new(frame, self.flow.local.addr, self.flow.remote.addr, IpProtocol::Tcp))
    }

    /// Receive-side SACK blocks, most recently changed first.
    fn sack_blocks(&self) -> [Option<(u32, u32)>; 3] {
        let mut blocks = [None; 3];
        let mut n = 0;
        if let Some(recent) = self.recent_ooo {
            blocks[0] = Some(recent);
            n = 1;
        }
        for seg in &self.ooo {
            if n >= 3 {
                break;
            }
            let block = (seg.seq.0 as u32, (seg.seq + seg.data.len()).0 as u32);
            if Some(block) != self.recent_ooo {
                blocks[n] = Some(block);
                n += 1;
            }
        }
        blocks
    }

    /// RFC 793 reset generation for an offending segment.
    fn send_reset_for(&mut self, repr: &TcpRepr<'_>, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        if repr.control == TcpControl::Rst {
            return;
        }
        match repr.ack_number {
            Some(ack) => {
                self.emit(ctx, out, TcpControl::Rst, ack, &[], false);
            }
            None => {
                let ack = repr.seq_number + repr.payload.len() + repr.control.len();
                let old_rcv = self.rcv_nxt;
                self.rcv_nxt = ack;
                let seq = TcpSeqNumber(0);
                self.emit(ctx, out, TcpControl::Rst, seq, &[], true);
                self.rcv_nxt = old_rcv;
            }
        }
    }

    /// Kill the connection: optional RST, exactly one disconnect callback,
    /// registry removal.
    fn terminate(
        &mut self,
        reason: DisconnectReason,
        send_rst: bool,
        ctx: &mut TcpCtx<'_>,
        out: &mut ConnOutput,
    ) {
        if send_rst {
            let seq = self.snd_nxt;
            self.emit(ctx, out, TcpControl::Rst, seq, &[], true);
        }
        self.wq.reset();
        self.state = State::Closed;
        self.disarm_all(ctx);
        if !self.disconnect_fired {
            self.disconnect_fired = true;
            out.cbs.push(DeferredCb::Disconnect(reason));
        }
        out.remove = true;
    }

    /// Quietly drop a half-open passive connection.
    fn abandon(&mut self, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        self.state = State::Closed;
        self.disarm_all(ctx);
        out.remove = true;
    }

    fn enter_time_wait(&mut self, ctx: &mut TcpCtx<'_>, out: &mut ConnOutput) {
        self.state = State::TimeWait;
        self.disarm(ctx, TcpTimer::Rto);
        self.disarm(ctx, TcpTimer::DelayedAck);
        self.disarm(ctx, TcpTimer::Persist);
        self.disarm(ctx, TcpTimer::Keepalive);
        self.arm_time_wait(ctx);
        if !self.close_fired {
            self.close_fired = true;
            out.cbs.push(DeferredCb::Close);
        }
    }

    fn arm_time_wait(&mut self, ctx: &mut TcpCtx<'_>) {
        if let Some(id) = self.timer_timewait.take() {
            ctx.timers.stop(id);
        }
        self.timer_timewait = Some(ctx.timers.start(
            ctx.now + self.cfg.msl * 2,
            TimerEvent::Tcp { flow: self.flow, kind: TcpTimer::TimeWait },
        ));
    }

    fn arm_persist(&mut self, ctx: &mut TcpCtx<'_>) {
        if self.timer_persist.is_some() {
            return;
        }
        let interval = self.rtt.rto() * 2u32.pow(self.persist_backoff);
        let interval = if interval > Duration::from_secs(60) {
            Duration::from_secs(60)
        } else {
            interval
        };
        self.timer_persist = Some(ctx.timers.start(
            ctx.now + interval,
            TimerEvent::Tcp { flow: self.flow, kind: TcpTimer::Persist },
        ));
    }

    fn arm_keepalive(&mut self, ctx: &mut TcpCtx<'_>) {
        let Some(interval) = self.cfg.keepalive_interval else { return };
        if let Some(id) = self.timer_keepalive.take() {
            ctx.timers.stop(id);
        }
        self.timer_keepalive = Some(ctx.timers.start(
            ctx.now + interval,
            TimerEvent::Tcp { flow: self.flow, kind: TcpTimer::Keepalive },
        ));
    }

    fn arm(&mut self, ctx: &mut TcpCtx<'_>, kind: TcpTimer, delay: Duration) {
        self.disarm(ctx, kind);
        let id = ctx.timers.start(ctx.now + delay, TimerEvent::Tcp { flow: self.flow, kind });
        match kind {
            TcpTimer::Rto => self.timer_rto = Some(id),
            TcpTimer::DelayedAck => self.timer_delack = Some(id),
            TcpTimer::Persist => self.timer_persist = Some(id),
            TcpTimer::Keepalive => self.timer_keepalive = Some(id),
            TcpTimer::TimeWait => self.timer_timewait = Some(id),
            TcpTimer::Retry => self.timer_retry = Some(id),
        }
    }

    fn disarm(&mut self, ctx: &mut TcpCtx<'_>, kind: TcpTimer) {
        let slot = match kind {
            TcpTimer::Rto => &mut self.timer_rto,
            TcpTimer::DelayedAck => &mut self.timer_delack,
            TcpTimer::Persist => &mut self.timer_persist,
            TcpTimer::Keepalive => &mut self.timer_keepalive,
            TcpTimer::TimeWait => &mut self.timer_timewait,
            TcpTimer::Retry => &mut self.timer_retry,
        };
        if let Some(id) = slot.take() {
            ctx.timers.stop(id);
        }
    }

    fn disarm_all(&mut self, ctx: &mut TcpCtx<'_>) {
        for kind in [
            TcpTimer::Rto,
            TcpTimer::DelayedAck,
            TcpTimer::Persist,
            TcpTimer::Keepalive,
            TcpTimer::TimeWait,
            TcpTimer::Retry,
        ] {
            self.disarm(ctx, kind);
        }
    }

    fn all_acked(&self) -> bool {
        self.snd_una == self.snd_nxt
    }

    // Accessors for the handle and the engine.

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn snd_una(&self) -> TcpSeqNumber {
        self.snd_una
    }

    pub(crate) fn snd_nxt(&self) -> TcpSeqNumber {
        self.snd_nxt
    }

    pub(crate) fn write_queue(&self) -> &WriteQueue {
        &self.wq
    }
}

fn tsval(now: Instant) -> u32 {
    now.total_millis() as u32
}

/// RFC 5681 initial window.
fn initial_window(mss: u16) -> u32 {
    let mss = mss as u32;
    (4 * mss).min((2 * mss).max(4380))
}

/// User-facing handle to a connection. Clones share the connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Rc<RefCell<Conn>>,
    pub(crate) service: ServiceHandle,
}

impl Connection {
    pub(crate) fn new(conn: Conn, service: ServiceHandle) -> Self {
        Connection { inner: Rc::new(RefCell::new(conn)), service }
    }

    fn wake(&self, flow: Flow) {
        self.service.borrow_mut().push_back(flow);
    }

    /// Queue bytes for transmission. Accepted (and queued) before the
    /// handshake completes; rejected once the send side is shut down or
    /// while the stream is congested.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), TcpError> {
        let mut conn = self.inner.borrow_mut();
        conn.queue_write(data.into())?;
        let flow = conn.flow;
        drop(conn);
        self.wake(flow);
        Ok(())
    }

    /// Close the send side. Inside a callback this is deferred until the
    /// callback returns.
    pub fn close(&self) -> Result<(), TcpError> {
        let mut conn = self.inner.borrow_mut();
        if conn.busy {
            conn.deferred_close = true;
            return Ok(());
        }
        conn.close_requested()?;
        let flow = conn.flow;
        drop(conn);
        self.wake(flow);
        Ok(())
    }

    /// Reset the connection immediately.
    pub fn abort(&self) {
        let mut conn = self.inner.borrow_mut();
        if conn.state == State::Closed {
            return;
        }
        conn.abort_requested();
        let flow = conn.flow;
        let cb = conn.on_disconnect.take();
        drop(conn);
        if let Some(mut cb) = cb {
            cb(self, DisconnectReason::Reset);
            let mut conn = self.inner.borrow_mut();
            if conn.on_disconnect.is_none() {
                conn.on_disconnect = Some(cb);
            }
        }
        self.wake(flow);
    }

    /// Deliver received data in chunks of at most `size` bytes.
    pub fn on_read(&self, size: usize, cb: impl FnMut(&[u8]) + 'static) {
        let mut conn = self.inner.borrow_mut();
        conn.set_read_chunk(size);
        conn.on_read = Some(Box::new(cb));
    }

    /// Notify when buffered data (or end-of-stream) is available for
    /// `read_next`.
    pub fn on_data(&self, cb: impl FnMut(&Connection) + 'static) {
        self.inner.borrow_mut().on_data = Some(Box::new(cb));
    }

    /// Pop the next buffered chunk, if any.
    pub fn read_next(&self) -> Option<Vec<u8>> {
        self.inner.borrow_mut().pop_read_buffer()
    }

    /// Completion of user writes: fires once per `write`, with its full
    /// length, after the peer acknowledged every byte of it.
    pub fn on_write(&self, cb: impl FnMut(usize) + 'static) {
        self.inner.borrow_mut().on_write = Some(Box::new(cb));
    }

    pub fn on_disconnect(&self, cb: impl FnMut(&Connection, DisconnectReason) + 'static) {
        self.inner.borrow_mut().on_disconnect = Some(Box::new(cb));
    }

    pub fn on_close(&self, cb: impl FnMut() + 'static) {
        self.inner.borrow_mut().on_close = Some(Box::new(cb));
    }

    pub fn local(&self) -> super::Socket {
        self.inner.borrow().flow.local
    }

    pub fn remote(&self) -> super::Socket {
        self.inner.borrow().flow.remote
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_writable(&self) -> bool {
        self.state().is_writable() && !self.inner.borrow().congested
    }

    pub fn is_readable(&self) -> bool {
        self.state().is_readable()
    }

    pub fn is_closing(&self) -> bool {
        self.state().is_closing()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::Socket;
    use smoltcp::wire::Ipv4Address;

    fn test_conn() -> Conn {
        let flow = Flow::new(
            Socket::new(Ipv4Address::new(10, 0, 0, 1), 4000),
            Socket::new(Ipv4Address::new(10, 0, 0, 2), 80),
        );
        let mut conn = Conn::new(flow, Rc::new(TcpConfig::default()), TcpSeqNumber(100), false);
        conn.rcv_nxt = TcpSeqNumber(1000);
        conn
    }

    #[test]
    fn test_seq_acceptability() {
        let conn = test_conn();
        // Window is cfg.window_size = 8192 from rcv_nxt = 1000.
        assert!(conn.seq_acceptable(TcpSeqNumber(1000), 0));
        assert!(conn.seq_acceptable(TcpSeqNumber(1000), 100));
        assert!(conn.seq_acceptable(TcpSeqNumber(9191), 1));
        assert!(!conn.seq_acceptable(TcpSeqNumber(9192), 1));
        // Old segment overlapping the window edge is still acceptable.
        assert!(conn.seq_acceptable(TcpSeqNumber(900), 150));
        // Entirely old is not.
        assert!(!conn.seq_acceptable(TcpSeqNumber(900), 100));
        assert!(!conn.seq_acceptable(TcpSeqNumber(900), 0));
    }

    #[test]
    fn test_seq_acceptability_wraps() {
        let mut conn = test_conn();
        conn.rcv_nxt = TcpSeqNumber(-5); // 2^32 - 5
        assert!(conn.seq_acceptable(TcpSeqNumber(-5), 10));
        assert!(conn.seq_acceptable(TcpSeqNumber(3), 1));
        assert!(!conn.seq_acceptable(TcpSeqNumber(-10), 2));
    }

    #[test]
    fn test_sack_scoreboard_merge_and_holes() {
        let mut conn = test_conn();
        conn.snd_una = TcpSeqNumber(0);
        conn.snd_nxt = TcpSeqNumber(10_000);

        assert_eq!(conn.register_sack((2000, 3000)), 1000);
        assert_eq!(conn.register_sack((4000, 5000)), 1000);
        // Overlap only counts the new bytes.
        assert_eq!(conn.register_sack((2500, 3500)), 500);
        assert_eq!(conn.sacked.len(), 2);

        // Hole starts at the front until the first range is contiguous
        // with SND.UNA.
        assert_eq!(conn.first_hole_offset(), 0);
        conn.register_sack((0, 2000));
        assert_eq!(conn.first_hole_offset(), 3500);
    }

    #[test]
    fn test_sack_clamped_to_flight() {
        let mut conn = test_conn();
        conn.snd_una = TcpSeqNumber(1000);
        conn.snd_nxt = TcpSeqNumber(2000);
        assert_eq!(conn.register_sack((0, 500)), 0);
        assert_eq!(conn.register_sack((1500, 9000)), 500);
    }

    #[test]
    fn test_ooo_insert_and_merge() {
        let mut conn = test_conn();
        conn.insert_ooo(TcpSeqNumber(1100), &[1; 100]);
        conn.insert_ooo(TcpSeqNumber(1300), &[3; 100]);
        assert_eq!(conn.ooo.len(), 2);
        assert_eq!(conn.sack_blocks()[0], Some((1300, 1400)));

        // Filling 1000..1100 merges the first block but not the second.
        let mut assembled = vec![0u8; 100];
        conn.rcv_nxt = TcpSeqNumber(1100);
        conn.merge_ooo(&mut assembled);
        assert_eq!(conn.rcv_nxt, TcpSeqNumber(1200));
        assert_eq!(assembled.len(), 200);
        assert_eq!(conn.ooo.len(), 1);
    }

    #[test]
    fn test_initial_window() {
        assert_eq!(initial_window(1460), 4380);
        assert_eq!(initial_window(536), 2144);
        assert_eq!(initial_window(2000), 4380.max(4000).min(8000));
    }
}
