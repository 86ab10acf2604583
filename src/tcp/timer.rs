//! Timer subsystem.
//!
//! Each socket embeds one TIME_WAIT handle and one retransmission handle;
//! arming a handle links it into the process-wide [`TimerList`]. The timer
//! thread decrements every linked handle by the scan interval and retires
//! the ones whose deadline passed: TIME_WAIT expiry releases the socket,
//! retransmission expiry resends the head of the send queue with
//! exponential backoff, or gives up on the connection entirely.

use std::collections::HashSet;

use log::{debug, warn};

use super::tcb::Fate;
use super::{Quad, MAX_RETRANS, MMS, RETRANS_INTERVAL_INITIAL_MS, TIMER_SCAN_INTERVAL_MS};
use crate::Manager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    TimeWait,
    Retrans,
}

#[derive(Debug)]
pub(crate) struct TimerHandle {
    pub enabled: bool,
    pub remaining_ms: i64,
}

impl TimerHandle {
    pub fn new() -> Self {
        TimerHandle {
            enabled: false,
            remaining_ms: 0,
        }
    }
}

/// Membership list for armed timers. Only the timer thread walks it; the
/// handles themselves live in the sockets.
#[derive(Debug, Default)]
pub(crate) struct TimerList {
    entries: HashSet<(Quad, TimerKind)>,
}

impl TimerList {
    pub fn link(&mut self, quad: Quad, kind: TimerKind) {
        self.entries.insert((quad, kind));
    }

    pub fn unlink(&mut self, quad: &Quad, kind: TimerKind) {
        self.entries.remove(&(*quad, kind));
    }

    pub fn snapshot(&self) -> Vec<(Quad, TimerKind)> {
        self.entries.iter().copied().collect()
    }
}

impl Manager {
    /// One tick of the timer thread: walk every linked timer and retire
    /// those whose deadline passed.
    pub(crate) fn scan_timers(&mut self) {
        let mut expired = Vec::new();

        for (quad, kind) in self.timers.snapshot() {
            let Manager {
                sockets,
                timers,
                sink,
                ..
            } = self;

            let Some(entry) = sockets.get_mut(&quad) else {
                timers.unlink(&quad, kind);
                continue;
            };
            let tcb = &mut entry.tcb;

            {
                let handle = tcb.timer_mut(kind);
                if !handle.enabled {
                    timers.unlink(&quad, kind);
                    continue;
                }
                handle.remaining_ms -= TIMER_SCAN_INTERVAL_MS;
                if handle.remaining_ms > 0 {
                    continue;
                }
            }

            match kind {
                TimerKind::TimeWait => {
                    debug!("{:?}: 2*msl elapsed, releasing socket", quad);
                    tcb.timewait_timer.enabled = false;
                    timers.unlink(&quad, kind);
                    expired.push((quad, None));
                }
                TimerKind::Retrans => {
                    // Loss signal: collapse to one segment's worth.
                    tcb.ssthresh = tcb.cwnd / 2;
                    tcb.cwnd = MMS;

                    match tcb.send_queue.front_mut() {
                        None => {
                            tcb.retrans_timer.enabled = false;
                            timers.unlink(&quad, kind);
                        }
                        Some(pkt) if pkt.retrans_count >= MAX_RETRANS => {
                            warn!(
                                "{:?}: seq {} resent {} times without an ack, giving up",
                                quad, pkt.seq, pkt.retrans_count
                            );
                            tcb.retrans_timer.enabled = false;
                            timers.unlink(&quad, kind);
                            expired.push((quad, Some(Fate::Unreachable)));
                        }
                        Some(pkt) => {
                            debug!(
                                "{:?}: retransmission timeout, resending seq {} ({} octets)",
                                quad, pkt.seq, pkt.len
                            );
                            sink.send_ip(&pkt.bytes);
                            pkt.retrans_count += 1;
                            tcb.retrans_timer.remaining_ms =
                                RETRANS_INTERVAL_INITIAL_MS << pkt.retrans_count;
                        }
                    }
                }
            }
        }

        for (quad, fate) in expired {
            self.hard_close(&quad, fate);
        }
    }
}
