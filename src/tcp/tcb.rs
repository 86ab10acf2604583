//! Per-connection control block and the inbound segment state machine.
//!
//! `on_segment` dispatches on the incoming flag set and mutates only this
//! socket; anything that crosses sockets (promoting a child to its parent's
//! accept queue, waking waiters, tearing the socket out of the tables) is
//! reported back to the manager as an [`Action`].

use std::collections::VecDeque;

use log::{debug, error, warn};

use super::ring::RingBuf;
use super::timer::{TimerHandle, TimerKind, TimerList};
use super::wire::{self, ControlBlock, IpSink};
use super::{
    seq, Quad, State, ACK, DUPACK_THRESHOLD, FIN, INIT_CWND, MMS, PSH, RETRANS_INTERVAL_INITIAL_MS,
    RST, SYN, TIMEWAIT_TIMEOUT_MS,
};

/// Why a socket was torn down underneath its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fate {
    Reset,
    Refused,
    Unreachable,
}

/// A transmitted segment, kept until it is cumulatively acknowledged.
/// Retransmission always puts a copy of `bytes` on the wire; the entry
/// itself only leaves the queue through an ACK.
#[derive(Debug)]
pub(crate) struct PendingSegment {
    pub seq: u32,
    /// Sequence space the segment occupies, counting SYN and FIN.
    pub len: u32,
    /// The full IP packet as originally sent.
    pub bytes: Vec<u8>,
    pub retrans_count: u32,
}

/// Payload parked until the gap before it closes.
#[derive(Debug)]
pub(crate) struct OfoSegment {
    pub seq: u32,
    pub seq_end: u32,
    pub fin: bool,
    pub payload: Vec<u8>,
}

/// Cross-socket effects of one inbound segment, applied by the manager
/// once the per-socket processing is done.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Action {
    Noop,
    /// Active open finished; wake the connect waiter.
    Established,
    /// Passive open finished; move this child to its parent's accept queue.
    Promote { wake_recv: bool },
    Wakeup { recv: bool, send: bool },
    HardClose(Fate),
    /// Orderly teardown completed; unlink and release the socket.
    Free,
}

pub(crate) struct Tcb {
    pub quad: Quad,
    pub state: State,
    /// Port of the listener this socket was spawned from, if any. The
    /// listener outlives its children; the port is resolved back to it
    /// only while delivering accept wakeups.
    pub parent: Option<u16>,

    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,

    /// Effective send window, `min(adv_wnd, cwnd)` once ACKs flow.
    pub snd_wnd: u32,
    /// Receive window most recently advertised by the peer.
    pub adv_wnd: u32,

    pub cwnd: u32,
    pub ssthresh: u32,
    pub dup_ack: u32,
    /// `snd_nxt` snapshot taken on entry to fast recovery.
    pub recovery_point: u32,
    /// Bytes (and SYN/FIN octets) transmitted but not yet acknowledged.
    pub inflight: u32,

    pub rcv_buf: RingBuf,
    pub send_queue: VecDeque<PendingSegment>,
    pub ofo_queue: Vec<OfoSegment>,

    pub retrans_timer: TimerHandle,
    pub timewait_timer: TimerHandle,
}

impl Tcb {
    pub fn new(quad: Quad, iss: u32, rcv_capacity: usize) -> Self {
        Tcb {
            quad,
            state: State::Closed,
            parent: None,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            rcv_nxt: 0,
            snd_wnd: 0,
            adv_wnd: 0,
            cwnd: INIT_CWND,
            ssthresh: u32::MAX,
            dup_ack: 0,
            recovery_point: iss,
            inflight: 0,
            rcv_buf: RingBuf::with_capacity(rcv_capacity),
            send_queue: VecDeque::new(),
            ofo_queue: Vec::new(),
            retrans_timer: TimerHandle::new(),
            timewait_timer: TimerHandle::new(),
        }
    }

    /// Child socket for a SYN that arrived at a listening port. The
    /// endpoints are the listener's seen from our side; the caller sends
    /// the SYN|ACK and links the child under the listener.
    pub fn child(quad: Quad, iss: u32, parent: u16, cb: &ControlBlock, rcv_capacity: usize) -> Self {
        let mut tcb = Tcb::new(quad, iss, rcv_capacity);
        tcb.parent = Some(parent);
        tcb.rcv_nxt = cb.seq_end;
        tcb.adv_wnd = cb.rwnd;
        tcb.state = State::SynRecv;
        tcb
    }

    /// Free space of the receive ring, which is what we advertise.
    pub fn rcv_wnd(&self) -> u32 {
        self.rcv_buf.free() as u32
    }

    pub fn window_open(&self) -> bool {
        self.snd_wnd > self.inflight
    }

    /// No more payload will ever arrive from the peer.
    pub fn peer_closed(&self) -> bool {
        matches!(
            self.state,
            State::CloseWait | State::LastAck | State::TimeWait | State::Closed
        )
    }

    pub(crate) fn timer_mut(&mut self, kind: TimerKind) -> &mut TimerHandle {
        match kind {
            TimerKind::Retrans => &mut self.retrans_timer,
            TimerKind::TimeWait => &mut self.timewait_timer,
        }
    }

    pub fn arm_retrans(&mut self, timers: &mut TimerList) {
        self.retrans_timer.enabled = true;
        self.retrans_timer.remaining_ms = RETRANS_INTERVAL_INITIAL_MS;
        timers.link(self.quad, TimerKind::Retrans);
    }

    pub fn disarm_retrans(&mut self, timers: &mut TimerList) {
        self.retrans_timer.enabled = false;
        timers.unlink(&self.quad, TimerKind::Retrans);
    }

    pub fn arm_timewait(&mut self, timers: &mut TimerList) {
        self.timewait_timer.enabled = true;
        self.timewait_timer.remaining_ms = TIMEWAIT_TIMEOUT_MS;
        timers.link(self.quad, TimerKind::TimeWait);
    }

    /// Emit a zero-payload segment carrying the socket's current numbers.
    /// SYN and FIN consume sequence space: they are queued for
    /// retransmission and the retransmission timer is armed. Bare ACKs are
    /// neither queued nor timed.
    pub fn send_control(&mut self, flags: u8, timers: &mut TimerList, sink: &mut dyn IpSink) {
        let seq = self.snd_nxt;
        let pkt = wire::build_segment(&self.quad, seq, self.rcv_nxt, self.rcv_wnd(), flags, &[]);
        sink.send_ip(&pkt);
        if flags & (SYN | FIN) != 0 {
            self.send_queue.push_back(PendingSegment {
                seq,
                len: 1,
                bytes: pkt,
                retrans_count: 0,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.inflight = self.inflight.wrapping_add(1);
            self.arm_retrans(timers);
        }
    }

    /// Bare ACK for the current `rcv_nxt`.
    fn send_ack(&self, sink: &mut dyn IpSink) {
        let pkt = wire::build_segment(
            &self.quad,
            self.snd_nxt,
            self.rcv_nxt,
            self.rcv_wnd(),
            ACK,
            &[],
        );
        sink.send_ip(&pkt);
    }

    /// Transmit as much of `data` as the effective window allows, in
    /// MMS-sized segments. Returns the number of bytes consumed.
    pub fn send_data(&mut self, data: &[u8], timers: &mut TimerList, sink: &mut dyn IpSink) -> usize {
        let mut sent = 0;
        while sent < data.len() {
            let window = self.snd_wnd.saturating_sub(self.inflight) as usize;
            if window == 0 {
                break;
            }
            let n = (data.len() - sent).min(window).min(MMS as usize);
            let seq = self.snd_nxt;
            let pkt = wire::build_segment(
                &self.quad,
                seq,
                self.rcv_nxt,
                self.rcv_wnd(),
                PSH | ACK,
                &data[sent..sent + n],
            );
            sink.send_ip(&pkt);
            self.send_queue.push_back(PendingSegment {
                seq,
                len: n as u32,
                bytes: pkt,
                retrans_count: 0,
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(n as u32);
            self.inflight += n as u32;
            sent += n;
        }
        if sent > 0 {
            self.arm_retrans(timers);
        }
        sent
    }

    /// Inject our FIN and move to the matching teardown state.
    pub fn close(&mut self, timers: &mut TimerList, sink: &mut dyn IpSink) {
        match self.state {
            State::Established => {
                self.send_control(FIN | ACK, timers, sink);
                self.state = State::FinWait1;
            }
            State::CloseWait => {
                self.send_control(FIN | ACK, timers, sink);
                self.state = State::LastAck;
            }
            _ => {}
        }
    }

    pub fn recv_data(&mut self, out: &mut [u8]) -> usize {
        self.rcv_buf.read(out)
    }

    pub fn on_segment(
        &mut self,
        cb: &ControlBlock,
        timers: &mut TimerList,
        sink: &mut dyn IpSink,
    ) -> Action {
        if cb.has(RST) {
            return self.on_rst();
        }
        if cb.flags & (SYN | ACK) == SYN {
            debug!("{:?}: unexpected syn in {:?}, dropped", self.quad, self.state);
            return Action::Noop;
        }
        if cb.flags & (SYN | ACK) == (SYN | ACK) {
            return self.on_syn_ack(cb, timers, sink);
        }
        if cb.has(FIN) {
            return self.on_fin(cb, timers, sink);
        }
        if !cb.payload.is_empty() {
            return self.on_data(cb, timers, sink);
        }
        if cb.has(ACK) {
            return self.on_ack(cb, timers, sink);
        }
        debug!("{:?}: segment with flags {:#x} ignored", self.quad, cb.flags);
        Action::Noop
    }

    fn on_rst(&mut self) -> Action {
        debug!("{:?}: rst received in {:?}", self.quad, self.state);
        let fate = if self.state == State::SynSent {
            Fate::Refused
        } else {
            Fate::Reset
        };
        Action::HardClose(fate)
    }

    fn on_syn_ack(
        &mut self,
        cb: &ControlBlock,
        timers: &mut TimerList,
        sink: &mut dyn IpSink,
    ) -> Action {
        match self.state {
            State::SynSent => {
                if !(seq::le(self.snd_una, cb.ack) && seq::le(cb.ack, self.snd_nxt)) {
                    error!(
                        "{:?}: syn|ack with ack {} outside [{}, {}], dropped",
                        self.quad, cb.ack, self.snd_una, self.snd_nxt
                    );
                    return Action::Noop;
                }

                self.disarm_retrans(timers);
                self.send_queue.pop_front(); // our syn

                self.adv_wnd = cb.rwnd;
                self.cwnd = INIT_CWND;
                self.ssthresh = cb.rwnd / 2;
                self.dup_ack = 0;
                self.recovery_point = cb.ack.wrapping_sub(1);
                self.inflight = 0;

                self.snd_wnd = cb.rwnd;
                self.snd_una = cb.ack;
                self.rcv_nxt = cb.seq_end;
                self.state = State::Established;

                self.send_ack(sink);
                Action::Established
            }
            State::Established => {
                // our handshake ack was lost; the next data ack settles it
                debug!("{:?}: retransmitted syn|ack ignored", self.quad);
                Action::Noop
            }
            _ => {
                debug!("{:?}: syn|ack in {:?} ignored", self.quad, self.state);
                Action::Noop
            }
        }
    }

    /// The handshake ack (explicit, or implied by data) finishes a
    /// passive open: retire the queued SYN|ACK and seed the congestion
    /// state from the peer's advertised window.
    fn establish_passive(&mut self, timers: &mut TimerList) {
        self.disarm_retrans(timers);
        self.send_queue.pop_front();
        self.snd_una = self.snd_nxt;
        self.inflight = 0;
        self.dup_ack = 0;
        self.recovery_point = self.snd_una.wrapping_sub(1);
        self.ssthresh = self.adv_wnd / 2;
        self.snd_wnd = self.adv_wnd.min(self.cwnd);
        self.state = State::Established;
    }

    fn on_ack(&mut self, cb: &ControlBlock, timers: &mut TimerList, sink: &mut dyn IpSink) -> Action {
        match self.state {
            State::SynRecv => {
                if seq::le(self.snd_una, cb.ack) && seq::le(cb.ack, self.snd_nxt) {
                    self.adv_wnd = cb.rwnd;
                    self.establish_passive(timers);
                    self.rcv_nxt = cb.seq_end;
                    Action::Promote { wake_recv: false }
                } else {
                    error!(
                        "{:?}: handshake ack {} outside [{}, {}], dropped",
                        self.quad, cb.ack, self.snd_una, self.snd_nxt
                    );
                    Action::Noop
                }
            }
            State::FinWait1 => {
                if seq::le(self.snd_una, cb.ack) && seq::le(cb.ack, self.snd_nxt) {
                    if cb.ack == self.snd_nxt {
                        // the ack covers our fin
                        self.snd_una = cb.ack;
                        self.inflight = 0;
                        self.send_queue.clear();
                        self.disarm_retrans(timers);
                        self.state = State::FinWait2;
                    }
                } else {
                    error!(
                        "{:?}: ack {} outside [{}, {}] in fin-wait-1",
                        self.quad, cb.ack, self.snd_una, self.snd_nxt
                    );
                }
                Action::Noop
            }
            State::LastAck => {
                self.snd_una = cb.ack;
                self.inflight = 0;
                self.send_queue.clear();
                self.disarm_retrans(timers);
                self.state = State::Closed;
                Action::Free
            }
            State::Established => self.on_ack_established(cb, timers, sink),
            _ => {
                debug!("{:?}: ack in {:?} ignored", self.quad, self.state);
                Action::Noop
            }
        }
    }

    /// The data path: duplicate-ACK counting, reno window growth, and
    /// retransmission-queue upkeep.
    fn on_ack_established(
        &mut self,
        cb: &ControlBlock,
        timers: &mut TimerList,
        sink: &mut dyn IpSink,
    ) -> Action {
        let ack = cb.ack;
        if !(seq::le(self.snd_una, ack) && seq::le(ack, self.snd_nxt)) {
            debug!(
                "{:?}: ack {} outside [{}, {}], old or invalid; ignored",
                self.quad, ack, self.snd_una, self.snd_nxt
            );
            return Action::Noop;
        }

        if ack == self.snd_una {
            // No new data. The window may still have reopened.
            let wake_send = self.update_window(cb);

            // Duplicates only count once the previous recovery epoch is over.
            if seq::le(self.recovery_point, ack) {
                self.dup_ack += 1;
                if self.dup_ack >= DUPACK_THRESHOLD {
                    debug!(
                        "{:?}: {} duplicate acks at {}, entering fast recovery",
                        self.quad, self.dup_ack, ack
                    );
                    self.ssthresh = self.cwnd / 2;
                    self.cwnd = self.ssthresh;
                    self.adv_wnd = cb.rwnd;
                    self.snd_wnd = self.adv_wnd.min(self.cwnd);
                    self.recovery_point = self.snd_nxt;
                    self.retransmit_head(sink);
                    self.dup_ack = 0;
                }
            }
            return Action::Wakeup {
                recv: false,
                send: wake_send,
            };
        }

        // New data acknowledged.
        let acked = seq::diff(ack, self.snd_una);
        self.dup_ack = 0;
        self.inflight -= acked;
        self.adv_wnd = cb.rwnd;
        if self.cwnd < self.ssthresh {
            // slow start
            self.cwnd += acked;
        } else {
            // congestion avoidance
            self.cwnd += (MMS * acked) / self.cwnd;
        }
        self.snd_wnd = self.adv_wnd.min(self.cwnd);
        self.snd_una = ack;

        while let Some(head) = self.send_queue.front() {
            if seq::lt(head.seq, ack) {
                self.send_queue.pop_front();
            } else {
                break;
            }
        }

        if seq::lt(ack, self.recovery_point) {
            // still inside the recovery epoch: keep pushing the hole
            self.retransmit_head(sink);
        }

        if self.send_queue.is_empty() {
            self.disarm_retrans(timers);
        } else {
            self.arm_retrans(timers);
        }

        Action::Wakeup {
            recv: false,
            send: true,
        }
    }

    /// Refresh the effective window from a peer advertisement; reports
    /// whether a closed window reopened so the send waiter can be kicked.
    fn update_window(&mut self, cb: &ControlBlock) -> bool {
        let old = self.snd_wnd;
        self.adv_wnd = cb.rwnd;
        self.snd_wnd = self.adv_wnd.min(self.cwnd);
        old == 0 && self.snd_wnd > 0
    }

    /// Put a copy of the oldest pending segment back on the wire; the
    /// original stays queued until it is cumulatively acknowledged.
    fn retransmit_head(&self, sink: &mut dyn IpSink) {
        if let Some(pkt) = self.send_queue.front() {
            debug!("{:?}: retransmitting seq {}", self.quad, pkt.seq);
            sink.send_ip(&pkt.bytes);
        }
    }

    fn on_fin(&mut self, cb: &ControlBlock, timers: &mut TimerList, sink: &mut dyn IpSink) -> Action {
        if !cb.payload.is_empty() {
            warn!(
                "{:?}: fin with {} payload bytes, payload ignored",
                self.quad,
                cb.payload.len()
            );
        }

        if seq::gt(cb.seq, self.rcv_nxt) {
            // The fin itself is out of order; park it for the drain.
            self.ofo_queue.push(OfoSegment {
                seq: cb.seq,
                seq_end: cb.seq_end,
                fin: true,
                payload: Vec::new(),
            });
            return Action::Noop;
        }

        if cb.seq != self.rcv_nxt {
            // A fin whose sequence space we already consumed: the peer
            // retransmitted it because one of our acks got lost.
            match self.state {
                State::TimeWait => {
                    self.send_ack(sink);
                    self.arm_timewait(timers);
                }
                State::CloseWait => {
                    self.send_ack(sink);
                }
                State::LastAck => {
                    debug!("{:?}: duplicate fin in last-ack, harmless", self.quad);
                }
                _ => {
                    debug!(
                        "{:?}: duplicate fin in {:?}, re-acking",
                        self.quad, self.state
                    );
                    self.send_ack(sink);
                }
            }
            return Action::Noop;
        }

        match self.state {
            State::Established => {
                self.rcv_nxt = cb.seq_end;
                self.state = State::CloseWait;
                self.send_ack(sink);
                Action::Wakeup {
                    recv: true,
                    send: false,
                }
            }
            State::FinWait2 => {
                self.rcv_nxt = cb.seq_end;
                self.state = State::TimeWait;
                self.send_ack(sink);
                self.arm_timewait(timers);
                Action::Wakeup {
                    recv: true,
                    send: false,
                }
            }
            State::FinWait1 => {
                // Simultaneous close: their fin arrived before the ack of ours.
                self.disarm_retrans(timers);
                self.rcv_nxt = cb.seq_end;
                self.state = State::TimeWait;
                self.send_ack(sink);
                self.arm_timewait(timers);
                Action::Wakeup {
                    recv: true,
                    send: false,
                }
            }
            _ => {
                debug!("{:?}: fin in {:?} ignored", self.quad, self.state);
                Action::Noop
            }
        }
    }

    fn on_data(&mut self, cb: &ControlBlock, timers: &mut TimerList, sink: &mut dyn IpSink) -> Action {
        let mut promoted = false;
        if self.state == State::SynRecv {
            // Data implies the handshake ack made it through.
            self.adv_wnd = cb.rwnd;
            self.establish_passive(timers);
            promoted = true;
        }

        if seq::lt(cb.seq, self.rcv_nxt) {
            debug!(
                "{:?}: duplicate segment seq={} below rcv_nxt={}, re-acking",
                self.quad, cb.seq, self.rcv_nxt
            );
            self.send_ack(sink);
            return data_action(promoted, false);
        }

        if !seq::acceptable(self.rcv_nxt, self.rcv_wnd(), cb.seq, cb.seq_end) {
            error!(
                "{:?}: segment outside receive window, dropped: seq={} seq_end={} rcv_nxt={} rcv_wnd={}",
                self.quad,
                cb.seq,
                cb.seq_end,
                self.rcv_nxt,
                self.rcv_wnd()
            );
            self.send_ack(sink);
            return data_action(promoted, false);
        }

        if cb.seq == self.rcv_nxt {
            let wrote = self.rcv_buf.write(cb.payload);
            if wrote < cb.payload.len() {
                warn!(
                    "{:?}: receive ring full, {} bytes dropped",
                    self.quad,
                    cb.payload.len() - wrote
                );
            }
            self.rcv_nxt = cb.seq_end;
            self.drain_ofo();
            self.send_ack(sink);
            data_action(promoted, true)
        } else {
            debug!(
                "{:?}: out of order segment seq={} while expecting {}",
                self.quad, cb.seq, self.rcv_nxt
            );
            self.ofo_queue.push(OfoSegment {
                seq: cb.seq,
                seq_end: cb.seq_end,
                fin: cb.has(FIN),
                payload: cb.payload.to_vec(),
            });
            // duplicate ack pointing at the gap
            self.send_ack(sink);
            data_action(promoted, false)
        }
    }

    /// Fold queued out-of-order segments into the ring now that the gap
    /// has closed. A fin found mid-drain ends the connection's receive
    /// side; whatever is queued past it is discarded.
    fn drain_ofo(&mut self) {
        loop {
            let Some(pos) = self.ofo_queue.iter().position(|p| p.seq == self.rcv_nxt) else {
                break;
            };
            let pkt = self.ofo_queue.swap_remove(pos);
            if pkt.fin {
                self.rcv_nxt = pkt.seq_end;
                self.state = State::CloseWait;
                self.ofo_queue.clear();
                break;
            }
            let wrote = self.rcv_buf.write(&pkt.payload);
            if wrote < pkt.payload.len() {
                warn!(
                    "{:?}: receive ring full, {} bytes dropped during reassembly",
                    self.quad,
                    pkt.payload.len() - wrote
                );
            }
            self.rcv_nxt = pkt.seq_end;
        }
    }
}

fn data_action(promoted: bool, wake_recv: bool) -> Action {
    if promoted {
        Action::Promote { wake_recv }
    } else if wake_recv {
        Action::Wakeup {
            recv: true,
            send: false,
        }
    } else {
        Action::Noop
    }
}
