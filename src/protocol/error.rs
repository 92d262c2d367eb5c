//! Engine error types

use std::fmt;

/// Errors produced by the engine and the transport capability.
///
/// Errors local to one connection (network, timeout, content) never
/// propagate past that connection; `Fatal` is the only variant that
/// aborts the server loop and requires reinitialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Socket error or connection reset
    Network,
    /// No data within the allowed window
    Timeout,
    /// Required platform network operation unavailable
    NetOps(&'static str),
    /// Invalid caller-provided argument
    BadArg(&'static str),
    /// Packet pool exhausted
    NoFreePacket,
    /// Packet does not fit the available buffer
    PacketLength,
    /// Operation requires an established MQTT connection
    NotConnected,
    /// Operation invalid for the current state
    BadState(&'static str),
    /// Malformed or invalid message content
    Content(&'static str),
    /// Unrecoverable condition, the server must be reinitialized
    Fatal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Network => write!(f, "network I/O failure"),
            Error::Timeout => write!(f, "timed out"),
            Error::NetOps(op) => write!(f, "network operation unavailable: {}", op),
            Error::BadArg(msg) => write!(f, "invalid argument: {}", msg),
            Error::NoFreePacket => write!(f, "no free packet in pool"),
            Error::PacketLength => write!(f, "insufficient buffer for packet length"),
            Error::NotConnected => write!(f, "not connected"),
            Error::BadState(msg) => write!(f, "invalid for current state: {}", msg),
            Error::Content(msg) => write!(f, "malformed message: {}", msg),
            Error::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
