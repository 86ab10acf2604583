use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use crate::Manager;

use super::tcb::Fate;
use super::{Quad, State};

/// One connection. Reads and writes block on the socket's waiters; `close`
/// injects our FIN and lets the state machine finish the teardown in the
/// background.
pub struct TcpStream {
    manager: Arc<Mutex<Manager>>,
    quad: Quad,
    rvar: Arc<Condvar>,
    wvar: Arc<Condvar>,
    closed: bool,
}

fn fate_to_io(fate: Fate) -> io::Error {
    match fate {
        Fate::Reset => io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
        Fate::Refused => io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
        Fate::Unreachable => io::Error::new(
            io::ErrorKind::TimedOut,
            "peer unreachable: retransmission limit exceeded",
        ),
    }
}

impl TcpStream {
    pub(crate) fn new(
        manager: Arc<Mutex<Manager>>,
        quad: Quad,
        rvar: Arc<Condvar>,
        wvar: Arc<Condvar>,
    ) -> Self {
        TcpStream {
            manager,
            quad,
            rvar,
            wvar,
            closed: false,
        }
    }

    /// Send our FIN. Further writes fail; reads drain what has already
    /// arrived.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut manager = self.manager.lock().unwrap();
        let Manager {
            sockets,
            timers,
            sink,
            ..
        } = &mut *manager;
        if let Some(entry) = sockets.get_mut(&self.quad) {
            entry.tcb.close(timers, sink.as_mut());
        }
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut manager = self.manager.lock().unwrap();

        manager = self
            .rvar
            .wait_while(manager, |m| {
                m.sockets.get(&self.quad).map_or(false, |e| {
                    e.tcb.rcv_buf.is_empty() && e.fate.is_none() && !e.tcb.peer_closed()
                })
            })
            .unwrap();

        let Some(entry) = manager.sockets.get_mut(&self.quad) else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is gone"));
        };
        if let Some(fate) = entry.fate {
            return Err(fate_to_io(fate));
        }
        if entry.tcb.rcv_buf.is_empty() {
            // orderly end of stream
            return Ok(0);
        }
        Ok(entry.tcb.recv_data(buf))
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write half of the stream is closed",
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut manager = self.manager.lock().unwrap();
        loop {
            let Some(entry) = manager.sockets.get(&self.quad) else {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "socket is gone"));
            };
            if let Some(fate) = entry.fate {
                return Err(fate_to_io(fate));
            }
            match entry.tcb.state {
                State::Established | State::CloseWait => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "socket is not established",
                    ))
                }
            }
            if entry.tcb.window_open() {
                break;
            }
            manager = self.wvar.wait(manager).unwrap();
        }

        let Manager {
            sockets,
            timers,
            sink,
            ..
        } = &mut *manager;
        let entry = sockets.get_mut(&self.quad).unwrap();
        Ok(entry.tcb.send_data(buf, timers, sink.as_mut()))
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut manager = self.manager.lock().unwrap();

        manager = self
            .wvar
            .wait_while(manager, |m| {
                m.sockets
                    .get(&self.quad)
                    .map_or(false, |e| e.fate.is_none() && !e.tcb.send_queue.is_empty())
            })
            .unwrap();

        match manager.sockets.get(&self.quad).and_then(|e| e.fate) {
            Some(fate) => Err(fate_to_io(fate)),
            None => Ok(()),
        }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.close();
        self.manager.lock().unwrap().release(&self.quad);
    }
}
