//! Default TCP transport
//!
//! A `mio`-backed implementation of [`NetServices`]: non-blocking TCP
//! streams under a readiness poll, plus a local UDP port for the
//! engine's wake-up channel. Readiness is reported statelessly (peek
//! for streams, eager drain queues for accepts and datagrams), so a
//! consumed poll event never strands buffered data.

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token};
use parking_lot::Mutex;
use smallvec::SmallVec;
use socket2::{Domain, Socket, Type};
use tracing::{debug, warn};

use crate::protocol::{Error, Result};

use super::{NetHandle, NetServices, SecureConn};

const EVENTS_CAPACITY: usize = 64;

/// Poll granularity for mid-packet continuation reads
const RECV_RETRY: Duration = Duration::from_millis(1);

struct Sockets {
    registry: Registry,
    next_token: u64,
    listeners: HashMap<u64, TcpListener>,
    streams: HashMap<u64, TcpStream>,
    udps: HashMap<u64, UdpSocket>,
    /// Connections accepted eagerly, not yet handed to the engine
    accept_queue: HashMap<u64, VecDeque<(TcpStream, SocketAddr)>>,
    /// Datagrams drained eagerly from local ports
    datagram_queue: HashMap<u64, VecDeque<Vec<u8>>>,
}

/// TCP + UDP loopback transport over a mio readiness poll
pub struct TcpTransport {
    sockets: Mutex<Sockets>,
    poller: Mutex<(Poll, Events)>,
    started: Instant,
}

impl TcpTransport {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(|_| Error::Fatal("readiness poll unavailable"))?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|_| Error::Fatal("readiness poll unavailable"))?;

        Ok(TcpTransport {
            sockets: Mutex::new(Sockets {
                registry,
                next_token: 1,
                listeners: HashMap::new(),
                streams: HashMap::new(),
                udps: HashMap::new(),
                accept_queue: HashMap::new(),
                datagram_queue: HashMap::new(),
            }),
            poller: Mutex::new((poll, Events::with_capacity(EVENTS_CAPACITY))),
            started: Instant::now(),
        })
    }

    /// Accept everything pending on every listener and drain every
    /// local datagram port, so readiness can be answered statelessly.
    fn drain_pending(sockets: &mut Sockets) {
        let tokens: Vec<u64> = sockets.listeners.keys().copied().collect();
        for token in tokens {
            loop {
                let accepted = match sockets.listeners.get_mut(&token).unwrap().accept() {
                    Ok(pair) => pair,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("accept failed on listener {}: {}", token, e);
                        break;
                    }
                };
                sockets
                    .accept_queue
                    .entry(token)
                    .or_default()
                    .push_back(accepted);
            }
        }

        let tokens: Vec<u64> = sockets.udps.keys().copied().collect();
        for token in tokens {
            let mut scratch = [0u8; 64];
            loop {
                let n = match sockets.udps.get_mut(&token).unwrap().recv_from(&mut scratch) {
                    Ok((n, _)) => n,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                };
                sockets
                    .datagram_queue
                    .entry(token)
                    .or_default()
                    .push_back(scratch[..n].to_vec());
            }
        }
    }

    fn handle_ready(sockets: &mut Sockets, handle: u64) -> bool {
        if sockets
            .accept_queue
            .get(&handle)
            .is_some_and(|q| !q.is_empty())
        {
            return true;
        }

        if sockets
            .datagram_queue
            .get(&handle)
            .is_some_and(|q| !q.is_empty())
        {
            return true;
        }

        if let Some(stream) = sockets.streams.get(&handle) {
            let mut probe = [0u8; 1];
            return match stream.peek(&mut probe) {
                Ok(_) => true, // data, or EOF the engine must observe
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => false,
                Err(_) => true, // broken socket, report so it gets closed
            };
        }

        false
    }
}

impl NetServices for TcpTransport {
    fn listen(&self, port: u16, _secure: Option<&SecureConn>) -> Result<NetHandle> {
        let addr: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);

        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(|_| Error::Network)?;
        socket.set_reuse_address(true).map_err(|_| Error::Network)?;
        socket.bind(&addr.into()).map_err(|_| Error::Network)?;
        socket.listen(128).map_err(|_| Error::Network)?;
        socket.set_nonblocking(true).map_err(|_| Error::Network)?;

        let mut listener = TcpListener::from_std(socket.into());

        let mut sockets = self.sockets.lock();
        let token = sockets.next_token;
        sockets.next_token += 1;

        sockets
            .registry
            .register(&mut listener, Token(token as usize), Interest::READABLE)
            .map_err(|_| Error::Network)?;
        sockets.listeners.insert(token, listener);

        debug!("listening on port {} (handle {})", port, token);
        Ok(NetHandle(token))
    }

    fn accept(&self, listener: NetHandle) -> Result<(NetHandle, SocketAddr)> {
        let mut sockets = self.sockets.lock();
        Self::drain_pending(&mut sockets);

        let (mut stream, addr) = sockets
            .accept_queue
            .get_mut(&listener.0)
            .and_then(|q| q.pop_front())
            .ok_or(Error::Timeout)?;

        let _ = stream.set_nodelay(true);

        let token = sockets.next_token;
        sockets.next_token += 1;

        sockets
            .registry
            .register(&mut stream, Token(token as usize), Interest::READABLE)
            .map_err(|_| Error::Network)?;
        sockets.streams.insert(token, stream);

        Ok((NetHandle(token), addr))
    }

    fn open_loopback(&self, port: u16) -> Result<NetHandle> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let mut socket = UdpSocket::bind(addr).map_err(|_| Error::Network)?;

        let mut sockets = self.sockets.lock();
        let token = sockets.next_token;
        sockets.next_token += 1;

        sockets
            .registry
            .register(&mut socket, Token(token as usize), Interest::READABLE)
            .map_err(|_| Error::Network)?;
        sockets.udps.insert(token, socket);

        Ok(NetHandle(token))
    }

    fn send(&self, conn: NetHandle, buf: &[u8]) -> Result<usize> {
        let mut sent = 0;
        while sent < buf.len() {
            let mut sockets = self.sockets.lock();
            let stream = sockets.streams.get_mut(&conn.0).ok_or(Error::Network)?;

            match stream.write(&buf[sent..]) {
                Ok(0) => return Err(Error::Network),
                Ok(n) => sent += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    drop(sockets);
                    std::thread::sleep(RECV_RETRY);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return Err(Error::Network),
            }
        }
        Ok(sent)
    }

    fn recv(&self, conn: NetHandle, buf: &mut [u8], wait: Option<Duration>) -> Result<usize> {
        let deadline = wait.map(|w| Instant::now() + w);

        loop {
            let mut sockets = self.sockets.lock();
            let stream = sockets.streams.get_mut(&conn.0).ok_or(Error::Network)?;

            match stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    drop(sockets);
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return Err(Error::Timeout);
                        }
                    }
                    std::thread::sleep(RECV_RETRY);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return Err(Error::Network),
            }
        }
    }

    fn send_to(&self, conn: NetHandle, buf: &[u8], port: u16, addr: IpAddr) -> Result<usize> {
        let sockets = self.sockets.lock();
        let socket = sockets.udps.get(&conn.0).ok_or(Error::Network)?;

        socket
            .send_to(buf, SocketAddr::new(addr, port))
            .map_err(|_| Error::Network)
    }

    fn recv_from(&self, conn: NetHandle, buf: &mut [u8]) -> Result<usize> {
        let mut sockets = self.sockets.lock();
        Self::drain_pending(&mut sockets);

        let datagram = sockets
            .datagram_queue
            .get_mut(&conn.0)
            .and_then(|q| q.pop_front())
            .ok_or(Error::Timeout)?;

        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }

    fn close(&self, handle: NetHandle) -> Result<()> {
        let mut sockets = self.sockets.lock();

        if let Some(mut stream) = sockets.streams.remove(&handle.0) {
            let _ = sockets.registry.deregister(&mut stream);
        }
        if let Some(mut listener) = sockets.listeners.remove(&handle.0) {
            let _ = sockets.registry.deregister(&mut listener);
            sockets.accept_queue.remove(&handle.0);
        }
        if let Some(mut udp) = sockets.udps.remove(&handle.0) {
            let _ = sockets.registry.deregister(&mut udp);
            sockets.datagram_queue.remove(&handle.0);
        }

        Ok(())
    }

    fn io_mon(
        &self,
        recv_set: &[NetHandle],
        wait: Option<Duration>,
    ) -> Result<SmallVec<[NetHandle; 8]>> {
        let deadline = wait.map(|w| Instant::now() + w);

        loop {
            {
                let mut sockets = self.sockets.lock();
                Self::drain_pending(&mut sockets);

                let ready: SmallVec<[NetHandle; 8]> = recv_set
                    .iter()
                    .copied()
                    .filter(|h| Self::handle_ready(&mut sockets, h.0))
                    .collect();
                if !ready.is_empty() {
                    return Ok(ready);
                }
            }

            let timeout = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(SmallVec::new());
                    }
                    Some(d - now)
                }
                None => None,
            };

            let mut poller = self.poller.lock();
            let (poll, events) = &mut *poller;
            match poll.poll(events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return Err(Error::Fatal("readiness poll failed")),
            }
        }
    }

    fn time(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
