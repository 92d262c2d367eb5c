//! Transport capability
//!
//! The engine consumes the network through this abstract contract: a
//! byte-stream listener/connection surface plus a readiness monitor
//! with an out-of-band timeout, and a local datagram port used purely
//! as a wake-up mechanism. Implementations may be plain TCP, TLS
//! wrapped, or entirely in memory.

mod memory;
mod tcp;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use smallvec::SmallVec;

use crate::protocol::Result;

/// Opaque handle to a listener, connection or datagram port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetHandle(pub u64);

/// Opaque secure-connection configuration, passed through to the
/// transport untouched. The engine makes no use of its contents.
#[derive(Debug, Clone, Default)]
pub struct SecureConn {
    /// Protocol or method selector, implementation specific
    pub method: Option<String>,
    /// Cipher selection, implementation specific
    pub cipher: Option<String>,
    /// Key/certificate/CA file paths, implementation specific order
    pub files: Vec<PathBuf>,
}

/// Abstract network services consumed by the engine.
///
/// `recv` returning `Ok(0)` signals an orderly peer close; transport
/// errors and resets surface as [`crate::protocol::Error::Network`],
/// an expired wait as [`crate::protocol::Error::Timeout`].
pub trait NetServices: Send + Sync {
    /// Listen for incoming connections on `port`
    fn listen(&self, port: u16, secure: Option<&SecureConn>) -> Result<NetHandle>;

    /// Accept one pending connection
    fn accept(&self, listener: NetHandle) -> Result<(NetHandle, SocketAddr)>;

    /// Bind a local datagram port (the loopback wake-up channel)
    fn open_loopback(&self, port: u16) -> Result<NetHandle>;

    /// Send on a connection; blocks until the data is queued
    fn send(&self, conn: NetHandle, buf: &[u8]) -> Result<usize>;

    /// Receive from a connection, waiting at most `wait` (forever when
    /// `None`). May return fewer bytes than requested.
    fn recv(&self, conn: NetHandle, buf: &mut [u8], wait: Option<Duration>) -> Result<usize>;

    /// Send a datagram to `addr:port`
    fn send_to(&self, conn: NetHandle, buf: &[u8], port: u16, addr: IpAddr) -> Result<usize>;

    /// Receive one datagram on a local port
    fn recv_from(&self, conn: NetHandle, buf: &mut [u8]) -> Result<usize>;

    /// Close a handle
    fn close(&self, handle: NetHandle) -> Result<()>;

    /// Block until at least one of `recv_set` is readable or `wait`
    /// expires; returns the readable subset (empty on timeout).
    fn io_mon(
        &self,
        recv_set: &[NetHandle],
        wait: Option<Duration>,
    ) -> Result<SmallVec<[NetHandle; 8]>>;

    /// Monotonic time in seconds, stable across low-power states
    fn time(&self) -> u64;
}
