use std::net::Ipv4Addr;

mod listen;
mod ring;
pub(crate) mod seq;
mod stream;
mod tcb;
mod timer;
pub(crate) mod wire;


pub use listen::TcpListener;
pub use stream::TcpStream;

pub(crate) use ring::RingBuf;
pub(crate) use tcb::{Action, Fate, Tcb};
pub(crate) use timer::{TimerHandle, TimerKind, TimerList};
pub(crate) use wire::{ControlBlock, IpSink};

// Flag bits, in wire order.
pub(crate) const FIN: u8 = 0x01;
pub(crate) const SYN: u8 = 0x02;
pub(crate) const RST: u8 = 0x04;
pub(crate) const PSH: u8 = 0x08;
pub(crate) const ACK: u8 = 0x10;

/// Interval between two scans of the timer list.
pub(crate) const TIMER_SCAN_INTERVAL_MS: i64 = 10;
/// Deadline of a freshly armed retransmission timer.
pub(crate) const RETRANS_INTERVAL_INITIAL_MS: i64 = 200;
/// How long a socket lingers in TIME_WAIT (2*MSL).
pub(crate) const TIMEWAIT_TIMEOUT_MS: i64 = 2_000;
/// Resends of the same pending segment before the peer is declared dead.
pub(crate) const MAX_RETRANS: u32 = 3;
/// Most payload bytes carried by one outgoing data segment.
pub(crate) const MMS: u32 = 1_000;
/// Initial congestion window. Large for reno; revisit when tuning.
pub(crate) const INIT_CWND: u32 = 1_000;
/// Consecutive duplicate ACKs that trigger fast recovery.
pub(crate) const DUPACK_THRESHOLD: u32 = 2;
/// Default capacity of the receive ring.
pub(crate) const DEFAULT_RCV_BUF: usize = 16_384;

/// One half of a connection's endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dual {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

/// The four-tuple identifying a connection; `src` is the local end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub src: Dual,
    pub dst: Dual,
}

impl Quad {
    /// The same pair seen from the other side, e.g. to key an incoming
    /// packet to the local socket it belongs to.
    pub(crate) fn flip(&self) -> Quad {
        Quad {
            src: self.dst,
            dst: self.src,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Closed,
    SynSent,
    SynRecv,
    Established,
    FinWait1,
    FinWait2,
    TimeWait,
    CloseWait,
    LastAck,
}
