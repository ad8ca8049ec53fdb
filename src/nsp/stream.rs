use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::{Error, Manager};

use super::cb::Fault;
use super::MAX_USER_DATA;

/// How long a closing stream waits for the peer to confirm the disconnect.
const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// One end of an established (or establishing) logical link.
#[derive(Debug)]
pub struct NspStream {
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) local_addr: u16,
    pub(crate) rvar: Arc<Condvar>,
    pub(crate) ovar: Arc<Condvar>,
    pub(crate) wvar: Arc<Condvar>,
    pub(crate) svar: Arc<Condvar>,
    pub(crate) closed: bool,
}

fn fault_err(fault: Fault) -> io::Error {
    let kind = match fault {
        Fault::Refused => io::ErrorKind::ConnectionRefused,
        Fault::Unreachable => io::ErrorKind::HostUnreachable,
        Fault::NoResources => io::ErrorKind::ConnectionRefused,
        Fault::Disconnected => io::ErrorKind::ConnectionAborted,
        Fault::TimedOut => io::ErrorKind::TimedOut,
    };
    io::Error::new(kind, fault.as_error())
}

impl NspStream {
    /// Wrap an existing connection table entry. The manager guard proves
    /// the caller holds the lock.
    pub(crate) fn attach(
        manager: Arc<Mutex<Manager>>,
        guard: &Manager,
        local_addr: u16,
    ) -> NspStream {
        let entry = &guard.conns[&local_addr];
        NspStream {
            manager,
            local_addr,
            rvar: entry.rvar.clone(),
            ovar: entry.ovar.clone(),
            wvar: entry.wvar.clone(),
            svar: entry.svar.clone(),
            closed: false,
        }
    }

    pub fn local_addr(&self) -> u16 {
        self.local_addr
    }

    /// Connect data the peer attached to its Connect-Initiate or
    /// Connect-Confirm, at most 16 bytes.
    pub fn connect_data(&self) -> Result<Vec<u8>, Error> {
        let manager = self.manager.lock().unwrap();
        let entry = manager
            .conns
            .get(&self.local_addr)
            .ok_or(Error::StreamClosed(self.local_addr))?;
        Ok(entry.cb.conndata_in.clone())
    }

    /// Reason code and data from the peer's disconnect, once there is one.
    pub fn disconnect_data(&self) -> Result<(u16, Vec<u8>), Error> {
        let manager = self.manager.lock().unwrap();
        let entry = manager
            .conns
            .get(&self.local_addr)
            .ok_or(Error::StreamClosed(self.local_addr))?;
        Ok((entry.cb.disc_reason, entry.cb.discdata_in.clone()))
    }

    /// When the peer was last heard from.
    pub fn last_heard(&self) -> Result<Instant, Error> {
        let manager = self.manager.lock().unwrap();
        let entry = manager
            .conns
            .get(&self.local_addr)
            .ok_or(Error::StreamClosed(self.local_addr))?;
        Ok(entry.cb.stamp)
    }

    /// Segments dropped against this link's receive budget.
    pub fn receive_drops(&self) -> Result<u64, Error> {
        let manager = self.manager.lock().unwrap();
        let entry = manager
            .conns
            .get(&self.local_addr)
            .ok_or(Error::StreamClosed(self.local_addr))?;
        Ok(entry.cb.receive_drops())
    }

    /// Install a receive filter; rejected payloads are dropped before they
    /// are queued or charged.
    pub fn set_filter(&self, filter: fn(&[u8]) -> bool) -> Result<(), Error> {
        let mut manager = self.manager.lock().unwrap();
        let entry = manager
            .conns
            .get_mut(&self.local_addr)
            .ok_or(Error::StreamClosed(self.local_addr))?;
        entry.cb.filter = Some(filter);
        Ok(())
    }

    /// Queue an interrupt message for the other-data subchannel, blocking
    /// while the peer has granted no interrupt requests.
    pub fn send_interrupt(&self, buf: &[u8]) -> Result<(), Error> {
        if buf.len() > MAX_USER_DATA {
            return Err(Error::InterruptTooLong);
        }

        let mut manager = self.manager.lock().unwrap();
        loop {
            let entry = manager
                .conns
                .get_mut(&self.local_addr)
                .ok_or(Error::StreamClosed(self.local_addr))?;

            if let Some(fault) = entry.cb.fault {
                return Err(fault.as_error());
            }
            if entry.cb.state.post_terminal() {
                return Err(Error::Disconnected);
            }
            if entry.cb.can_send_oth() {
                entry.held = true;
                entry.cb.push_interrupt(buf);
                entry.held = false;
                return Ok(());
            }

            manager = self.wvar.wait(manager).unwrap();
        }
    }

    /// Receive one interrupt message, boundaries preserved.
    pub fn recv_interrupt(&self) -> Result<Vec<u8>, Error> {
        let mut manager = self.manager.lock().unwrap();
        loop {
            let entry = manager
                .conns
                .get_mut(&self.local_addr)
                .ok_or(Error::StreamClosed(self.local_addr))?;

            if entry.cb.has_interrupt() {
                entry.held = true;
                let msg = entry.cb.recv_interrupt().unwrap();
                entry.held = false;
                return Ok(msg);
            }
            if let Some(fault) = entry.cb.fault {
                return Err(fault.as_error());
            }
            if entry.cb.state.post_terminal() || entry.cb.shutdown {
                return Err(Error::Disconnected);
            }

            manager = self.ovar.wait(manager).unwrap();
        }
    }

    /// Send Disconnect-Initiate and linger briefly for the confirm.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut manager = self.manager.lock().unwrap();
        if manager.conns.get(&self.local_addr).is_none() {
            return;
        }

        {
            let entry = manager.conns.get_mut(&self.local_addr).unwrap();
            entry.held = true;
            entry.cb.user_close(&[], Instant::now());
            entry.held = false;
        }

        let deadline = Instant::now() + CLOSE_LINGER;
        loop {
            let Some(entry) = manager.conns.get(&self.local_addr) else {
                return;
            };
            if entry.cb.state.post_terminal() {
                return;
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                return;
            }
            let (guard, _) = self.svar.wait_timeout(manager, timeout).unwrap();
            manager = guard;
        }
    }
}

impl Read for NspStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut manager = self.manager.lock().unwrap();
        loop {
            let entry = manager
                .conns
                .get_mut(&self.local_addr)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotConnected,
                        Error::StreamClosed(self.local_addr),
                    )
                })?;

            if entry.cb.has_data() {
                entry.held = true;
                let n = entry.cb.recv(buf);
                entry.held = false;
                return Ok(n);
            }

            match entry.cb.fault {
                /* an orderly teardown reads as end of stream */
                Some(Fault::Disconnected) => return Ok(0),
                Some(fault) => return Err(fault_err(fault)),
                None => {}
            }
            if entry.cb.shutdown || entry.cb.state.post_terminal() {
                return Ok(0);
            }

            manager = self.rvar.wait(manager).unwrap();
        }
    }
}

impl Write for NspStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut manager = self.manager.lock().unwrap();
        loop {
            let entry = manager
                .conns
                .get_mut(&self.local_addr)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotConnected,
                        Error::StreamClosed(self.local_addr),
                    )
                })?;

            if let Some(fault) = entry.cb.fault {
                return Err(fault_err(fault));
            }
            if entry.cb.shutdown || entry.cb.state.post_terminal() {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    Error::Disconnected,
                ));
            }

            if entry.cb.send_space() > 0 {
                entry.held = true;
                let n = entry.cb.push_out(buf);
                entry.held = false;
                return Ok(n);
            }

            manager = self.wvar.wait(manager).unwrap();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut manager = self.manager.lock().unwrap();
        loop {
            let entry = manager
                .conns
                .get(&self.local_addr)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotConnected,
                        Error::StreamClosed(self.local_addr),
                    )
                })?;

            if let Some(fault) = entry.cb.fault {
                return Err(fault_err(fault));
            }
            if entry.cb.state.post_terminal() {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    Error::Disconnected,
                ));
            }
            if entry.cb.out_empty() {
                return Ok(());
            }

            manager = self.wvar.wait(manager).unwrap();
        }
    }
}

impl Drop for NspStream {
    fn drop(&mut self) {
        self.close();
    }
}
