use std::sync::{Arc, Condvar, Mutex};

use crate::{Error, Manager};

use super::stream::TcpStream;

/// Handle to a bound, listening port.
pub struct TcpListener {
    port: u16,
    manager: Arc<Mutex<Manager>>,
    avar: Arc<Condvar>,
}

impl TcpListener {
    pub(crate) fn new(port: u16, manager: Arc<Mutex<Manager>>, avar: Arc<Condvar>) -> Self {
        TcpListener {
            port,
            manager,
            avar,
        }
    }

    /// Block until a fully established connection is ready to be taken.
    pub fn accept(&self) -> Result<TcpStream, Error> {
        let mut manager = self.manager.lock().unwrap();

        manager = self
            .avar
            .wait_while(manager, |m| {
                m.listeners
                    .get(&self.port)
                    .map_or(false, |l| l.accept_queue.is_empty())
            })
            .unwrap();

        let listener = manager
            .listeners
            .get_mut(&self.port)
            .ok_or(Error::PortClosed(self.port))?;
        let quad = listener.accept_queue.remove(0);

        let entry = manager
            .sockets
            .get_mut(&quad)
            .ok_or(Error::ConnectionReset)?;
        entry.attached = true;
        let (rvar, wvar) = (entry.rvar.clone(), entry.wvar.clone());

        Ok(TcpStream::new(self.manager.clone(), quad, rvar, wvar))
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.manager.lock().unwrap().unbind(self.port);
    }
}
