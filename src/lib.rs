//! A user-space TCP stack over a TUN device.
//!
//! Three long-lived threads cooperate around one manager: the segment
//! loop reads the device and feeds parsed segments to the per-socket
//! state machine, the timer thread scans the timer list on a fixed tick,
//! and application threads block on per-socket condition variables for
//! `connect`, `accept`, `send`, and `recv`. All of them take the manager
//! lock; wakeups are delivered only after the state mutations of the
//! triggering event are complete.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::Read;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

mod err;
pub use err::Error;

mod tcp;
pub use tcp::{TcpListener, TcpStream};

use tcp::{
    wire, Action, ControlBlock, Dual, Fate, IpSink, Quad, State, Tcb, TimerKind, TimerList,
    DEFAULT_RCV_BUF, SYN, TIMER_SCAN_INTERVAL_MS,
};

/// Tunables for one stack instance.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub ifname: String,
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub rcv_buf_capacity: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            ifname: "tun0".to_string(),
            addr: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            rcv_buf_capacity: DEFAULT_RCV_BUF,
        }
    }
}

struct TunSink {
    fd: RawFd,
}

impl IpSink for TunSink {
    fn send_ip(&mut self, packet: &[u8]) {
        if let Err(err) = nix::unistd::write(self.fd, packet) {
            warn!("tun write failed: {err}");
        }
    }
}

fn new_iss() -> u32 {
    rand::random()
}

pub(crate) struct SocketEntry {
    pub tcb: Tcb,
    pub rvar: Arc<Condvar>,
    pub wvar: Arc<Condvar>,
    pub cvar: Arc<Condvar>,
    /// Set when the socket is torn down underneath its owner; waiters
    /// observe it after being woken.
    pub fate: Option<Fate>,
    /// Whether a user handle currently refers to this socket.
    pub attached: bool,
}

impl SocketEntry {
    fn new(tcb: Tcb) -> Self {
        SocketEntry {
            tcb,
            rvar: Arc::new(Condvar::new()),
            wvar: Arc::new(Condvar::new()),
            cvar: Arc::new(Condvar::new()),
            fate: None,
            attached: false,
        }
    }
}

/// The record behind a listening port: children mid-handshake and
/// children ready to be accepted.
pub(crate) struct ListenerEntry {
    pub avar: Arc<Condvar>,
    pub listen_queue: Vec<Quad>,
    pub accept_queue: Vec<Quad>,
}

pub(crate) struct Manager {
    local_addr: Ipv4Addr,
    rcv_buf_capacity: usize,
    pub sink: Box<dyn IpSink>,
    pub sockets: HashMap<Quad, SocketEntry>,
    pub listeners: HashMap<u16, ListenerEntry>,
    pub timers: TimerList,
    next_port: u16,
}

impl Manager {
    pub(crate) fn new(
        local_addr: Ipv4Addr,
        rcv_buf_capacity: usize,
        sink: Box<dyn IpSink>,
    ) -> Self {
        Manager {
            local_addr,
            rcv_buf_capacity,
            sink,
            sockets: HashMap::new(),
            listeners: HashMap::new(),
            timers: TimerList::default(),
            next_port: 49_152,
        }
    }

    pub(crate) fn bind(&mut self, port: u16) -> Result<Arc<Condvar>, Error> {
        match self.listeners.entry(port) {
            Entry::Occupied(_) => Err(Error::PortInUse(port)),
            Entry::Vacant(v) => {
                let avar = Arc::new(Condvar::new());
                v.insert(ListenerEntry {
                    avar: avar.clone(),
                    listen_queue: Vec::new(),
                    accept_queue: Vec::new(),
                });
                Ok(avar)
            }
        }
    }

    pub(crate) fn unbind(&mut self, port: u16) {
        if let Some(listener) = self.listeners.remove(&port) {
            let orphans: Vec<Quad> = listener
                .listen_queue
                .into_iter()
                .chain(listener.accept_queue)
                .collect();
            for quad in orphans {
                self.hard_close(&quad, None);
            }
        }
    }

    fn alloc_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port == u16::MAX { 49_152 } else { port + 1 };
        port
    }

    /// Start an active open: allocate the socket, fire the SYN, and leave
    /// it in syn-sent for the connect waiter to watch.
    pub(crate) fn open(&mut self, dst: Dual) -> Quad {
        let quad = Quad {
            src: Dual {
                ipv4: self.local_addr,
                port: self.alloc_port(),
            },
            dst,
        };
        let mut entry = SocketEntry::new(Tcb::new(quad, new_iss(), self.rcv_buf_capacity));
        entry.tcb.state = State::SynSent;
        debug!("{:?}: active open, iss {}", quad, entry.tcb.iss);
        entry
            .tcb
            .send_control(SYN, &mut self.timers, self.sink.as_mut());
        self.sockets.insert(quad, entry);
        quad
    }

    /// Dispatch one parsed segment: to its socket if one exists, to a
    /// listening port if it is a fresh SYN, and otherwise answer with a
    /// reset.
    pub(crate) fn process_segment(&mut self, cb: &ControlBlock) {
        let key = cb.quad.flip();

        let action = {
            let Manager {
                sockets,
                timers,
                sink,
                ..
            } = self;
            sockets
                .get_mut(&key)
                .map(|entry| entry.tcb.on_segment(cb, timers, sink.as_mut()))
        };
        if let Some(action) = action {
            self.apply(&key, action);
            return;
        }

        if cb.flags == SYN && self.listeners.contains_key(&key.src.port) {
            self.on_listen_syn(key, cb);
            return;
        }

        // Closed endpoint: anything but a reset is answered with one.
        if !cb.has(tcp::RST) {
            debug!("segment for unknown connection {:?}, resetting", key);
            wire::send_reset(cb, self.sink.as_mut());
        }
    }

    /// A SYN reached a listening port: spawn a child socket with swapped
    /// endpoints, reply SYN|ACK, and link the child under the listener.
    fn on_listen_syn(&mut self, quad: Quad, cb: &ControlBlock) {
        let mut tcb = Tcb::child(quad, new_iss(), quad.src.port, cb, self.rcv_buf_capacity);
        debug!("{:?}: child socket created in syn-recv, iss {}", quad, tcb.iss);
        tcb.send_control(SYN | tcp::ACK, &mut self.timers, self.sink.as_mut());
        self.sockets.insert(quad, SocketEntry::new(tcb));
        if let Some(listener) = self.listeners.get_mut(&quad.src.port) {
            listener.listen_queue.push(quad);
        }
    }

    fn apply(&mut self, quad: &Quad, action: Action) {
        match action {
            Action::Noop => {}
            Action::Established => {
                if let Some(entry) = self.sockets.get(quad) {
                    entry.cvar.notify_all();
                }
            }
            Action::Promote { wake_recv } => {
                let parent = self.sockets.get(quad).and_then(|e| e.tcb.parent);
                if let Some(port) = parent {
                    if let Some(listener) = self.listeners.get_mut(&port) {
                        listener.listen_queue.retain(|q| q != quad);
                        listener.accept_queue.push(*quad);
                        listener.avar.notify_one();
                    }
                }
                if wake_recv {
                    if let Some(entry) = self.sockets.get(quad) {
                        entry.rvar.notify_all();
                    }
                }
            }
            Action::Wakeup { recv, send } => {
                if let Some(entry) = self.sockets.get(quad) {
                    if recv {
                        entry.rvar.notify_all();
                    }
                    if send {
                        entry.wvar.notify_all();
                    }
                }
            }
            Action::HardClose(fate) => self.hard_close(quad, Some(fate)),
            Action::Free => self.hard_close(quad, None),
        }
    }

    /// Drive the socket to closed: drop its timers, unlink it from the
    /// tables, and wake everything blocked on it. With no user handle
    /// attached the record is released on the spot.
    pub(crate) fn hard_close(&mut self, quad: &Quad, fate: Option<Fate>) {
        let Some(entry) = self.sockets.get_mut(quad) else {
            return;
        };
        entry.tcb.disarm_retrans(&mut self.timers);
        entry.tcb.timewait_timer.enabled = false;
        self.timers.unlink(quad, TimerKind::TimeWait);
        entry.tcb.state = State::Closed;
        entry.fate = fate;
        entry.rvar.notify_all();
        entry.wvar.notify_all();
        entry.cvar.notify_all();

        let parent = entry.tcb.parent;
        let attached = entry.attached;
        if let Some(port) = parent {
            if let Some(listener) = self.listeners.get_mut(&port) {
                listener.listen_queue.retain(|q| q != quad);
                listener.accept_queue.retain(|q| q != quad);
            }
        }
        if !attached {
            self.sockets.remove(quad);
        }
    }

    /// The user handle went away; release the record once the state
    /// machine is done with it.
    pub(crate) fn release(&mut self, quad: &Quad) {
        let done = match self.sockets.get_mut(quad) {
            Some(entry) => {
                entry.attached = false;
                entry.tcb.state == State::Closed
            }
            None => false,
        };
        if done {
            self.sockets.remove(quad);
        }
    }
}

pub struct NetStack {
    manager: Arc<Mutex<Manager>>,
    jh: thread::JoinHandle<()>,
    th: thread::JoinHandle<()>,
}

impl NetStack {
    pub fn new(config: StackConfig) -> Result<Self, Error> {
        let tun = Tun::new(&config.ifname, false)?;
        tun.set_addr(config.addr)?;
        tun.set_netmask(config.netmask)?;
        tun.bring_up()?;

        let sink = Box::new(TunSink {
            fd: tun.as_raw_fd(),
        });
        let manager = Arc::new(Mutex::new(Manager::new(
            config.addr,
            config.rcv_buf_capacity,
            sink,
        )));

        let jh = {
            let manager = manager.clone();
            thread::spawn(move || segment_loop(tun, manager))
        };
        let th = {
            let manager = manager.clone();
            thread::spawn(move || timer_loop(manager))
        };

        Ok(NetStack { manager, jh, th })
    }

    pub fn bind(&self, port: u16) -> Result<TcpListener, Error> {
        let mut manager = self.manager.lock().unwrap();
        let avar = manager.bind(port)?;
        Ok(TcpListener::new(port, self.manager.clone(), avar))
    }

    /// Active open; blocks until the connection is established or refused.
    pub fn connect(&self, addr: Ipv4Addr, port: u16) -> Result<TcpStream, Error> {
        let mut manager = self.manager.lock().unwrap();
        let quad = manager.open(Dual { ipv4: addr, port });
        let (cvar, rvar, wvar) = {
            let entry = &manager.sockets[&quad];
            (entry.cvar.clone(), entry.rvar.clone(), entry.wvar.clone())
        };

        manager = cvar
            .wait_while(manager, |m| {
                m.sockets
                    .get(&quad)
                    .map_or(false, |e| e.tcb.state == State::SynSent && e.fate.is_none())
            })
            .unwrap();

        let fate = manager.sockets.get(&quad).and_then(|e| e.fate);
        if let Some(fate) = fate {
            manager.sockets.remove(&quad);
            return Err(fate.into());
        }
        match manager.sockets.get_mut(&quad) {
            Some(entry) => entry.attached = true,
            None => return Err(Error::ConnectionReset),
        }
        Ok(TcpStream::new(self.manager.clone(), quad, rvar, wvar))
    }

    pub fn join(self) {
        self.jh.join().unwrap();
        self.th.join().unwrap();
    }
}

fn segment_loop(mut tun: Tun, manager: Arc<Mutex<Manager>>) {
    let mut buf = [0u8; 1500];
    loop {
        let mut pfd = [PollFd::new(tun.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut pfd[..], 10) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(err) => {
                warn!("poll failed: {err}");
                continue;
            }
        }

        let n = match tun.read(&mut buf) {
            Ok(n) => n,
            Err(err) => {
                warn!("tun read failed: {err}");
                continue;
            }
        };

        let Some(cb) = wire::parse_segment(&buf[..n]) else {
            continue;
        };
        manager.lock().unwrap().process_segment(&cb);
    }
}

fn timer_loop(manager: Arc<Mutex<Manager>>) {
    loop {
        thread::sleep(Duration::from_millis(TIMER_SCAN_INTERVAL_MS as u64));
        manager.lock().unwrap().scan_timers();
    }
}
