//! In-memory transport
//!
//! A scripted implementation of [`NetServices`] for driving the engine
//! without sockets: tests (and embedders prototyping against the
//! engine) push client bytes in, step the server loop, and inspect the
//! frames the engine sent. Time is a manually advanced counter so
//! keep-alive behavior can be exercised deterministically.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::protocol::{Error, Result};

use super::{NetHandle, NetServices, SecureConn};

#[derive(Debug, Default)]
struct MemConn {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    peer_closed: bool,
    engine_closed: bool,
    fail_sends: bool,
}

#[derive(Debug, Default)]
struct MemInner {
    next_handle: u64,
    listeners: HashMap<u64, VecDeque<u64>>,
    conns: HashMap<u64, MemConn>,
    udps: HashMap<u64, VecDeque<Vec<u8>>>,
    udp_ports: HashMap<u16, u64>,
}

/// Scripted in-memory transport
#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<MemInner>,
    clock: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    // --- driver surface ---------------------------------------------------

    /// Queue a new client connection on a listener; the returned handle
    /// is what the engine will see from `accept`, and what the driver
    /// uses to push and inspect bytes.
    pub fn connect(&self, listener: NetHandle) -> NetHandle {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = inner.next_handle;

        inner.conns.insert(handle, MemConn::default());
        inner
            .listeners
            .get_mut(&listener.0)
            .expect("no such listener")
            .push_back(handle);

        NetHandle(handle)
    }

    /// Push client-to-server bytes onto a connection
    pub fn push_bytes(&self, conn: NetHandle, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        let c = inner.conns.get_mut(&conn.0).expect("no such connection");
        c.inbound.extend(bytes.iter().copied());
    }

    /// Take everything the engine has sent on a connection so far
    pub fn take_sent(&self, conn: NetHandle) -> Vec<u8> {
        let mut inner = self.inner.lock();
        let c = inner.conns.get_mut(&conn.0).expect("no such connection");
        std::mem::take(&mut c.outbound)
    }

    /// Simulate the peer closing its end
    pub fn peer_close(&self, conn: NetHandle) {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.conns.get_mut(&conn.0) {
            c.peer_closed = true;
        }
    }

    /// Make subsequent sends on a connection fail
    pub fn fail_sends(&self, conn: NetHandle) {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.conns.get_mut(&conn.0) {
            c.fail_sends = true;
        }
    }

    /// Has the engine closed this connection?
    pub fn engine_closed(&self, conn: NetHandle) -> bool {
        let inner = self.inner.lock();
        inner.conns.get(&conn.0).map_or(true, |c| c.engine_closed)
    }

    /// Advance the monotonic clock
    pub fn advance_time(&self, secs: u64) {
        self.clock.fetch_add(secs, Ordering::SeqCst);
    }
}

impl NetServices for MemoryTransport {
    fn listen(&self, _port: u16, _secure: Option<&SecureConn>) -> Result<NetHandle> {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.listeners.insert(handle, VecDeque::new());
        Ok(NetHandle(handle))
    }

    fn accept(&self, listener: NetHandle) -> Result<(NetHandle, SocketAddr)> {
        let mut inner = self.inner.lock();
        let pending = inner
            .listeners
            .get_mut(&listener.0)
            .ok_or(Error::Network)?
            .pop_front()
            .ok_or(Error::Timeout)?;

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000 + pending as u16);
        Ok((NetHandle(pending), addr))
    }

    fn open_loopback(&self, port: u16) -> Result<NetHandle> {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.udps.insert(handle, VecDeque::new());
        inner.udp_ports.insert(port, handle);
        Ok(NetHandle(handle))
    }

    fn send(&self, conn: NetHandle, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let c = inner.conns.get_mut(&conn.0).ok_or(Error::Network)?;
        if c.engine_closed || c.fail_sends {
            return Err(Error::Network);
        }
        c.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn recv(&self, conn: NetHandle, buf: &mut [u8], _wait: Option<Duration>) -> Result<usize> {
        let mut inner = self.inner.lock();
        let c = inner.conns.get_mut(&conn.0).ok_or(Error::Network)?;

        if c.inbound.is_empty() {
            if c.peer_closed {
                return Ok(0);
            }
            return Err(Error::Timeout);
        }

        let mut n = 0;
        while n < buf.len() {
            match c.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn send_to(&self, _conn: NetHandle, buf: &[u8], port: u16, _addr: IpAddr) -> Result<usize> {
        let mut inner = self.inner.lock();
        let target = *inner.udp_ports.get(&port).ok_or(Error::Network)?;
        inner
            .udps
            .get_mut(&target)
            .ok_or(Error::Network)?
            .push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn recv_from(&self, conn: NetHandle, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let datagram = inner
            .udps
            .get_mut(&conn.0)
            .ok_or(Error::Network)?
            .pop_front()
            .ok_or(Error::Timeout)?;

        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }

    fn close(&self, handle: NetHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.conns.get_mut(&handle.0) {
            c.engine_closed = true;
        }
        inner.listeners.remove(&handle.0);
        if inner.udps.remove(&handle.0).is_some() {
            inner.udp_ports.retain(|_, h| *h != handle.0);
        }
        Ok(())
    }

    fn io_mon(
        &self,
        recv_set: &[NetHandle],
        _wait: Option<Duration>,
    ) -> Result<SmallVec<[NetHandle; 8]>> {
        let inner = self.inner.lock();
        let ready = recv_set
            .iter()
            .copied()
            .filter(|h| {
                if let Some(q) = inner.listeners.get(&h.0) {
                    return !q.is_empty();
                }
                if let Some(q) = inner.udps.get(&h.0) {
                    return !q.is_empty();
                }
                if let Some(c) = inner.conns.get(&h.0) {
                    return !c.engine_closed && (!c.inbound.is_empty() || c.peer_closed);
                }
                false
            })
            .collect();
        Ok(ready)
    }

    fn time(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}
