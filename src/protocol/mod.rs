//! MQTT Protocol definitions and types
//!
//! Core protocol types for MQTT v3.1 and v3.1.1: packet types, QoS
//! levels, fixed-header flag helpers, CONNECT flags and CONNACK codes.

mod error;

pub use error::{Error, Result};

/// MQTT Packet Type (high nibble of the fixed-header first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (for subscription matching)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// Maximum length of the fixed header: 1 type/flags byte + up to 4
/// remaining-length bytes.
pub const MAX_FIXED_HEADER: usize = 5;

/// Maximum number of bytes in the remaining-length field
pub const MAX_REMLEN_BYTES: usize = MAX_FIXED_HEADER - 1;

/// Largest value representable by the remaining-length encoding
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// QoS marker in a SUBACK payload indicating a failed subscription
pub const SUBACK_FAILURE: u8 = 0x80;

/// Build the fixed-header first byte from type and flags
#[inline]
pub fn fh_byte1(msg_type: PacketType, flags: u8) -> u8 {
    ((msg_type as u8) << 4) | (flags & 0x0F)
}

/// Build fixed-header flags from DUP, QoS and RETAIN
#[inline]
pub fn fh_flags(dup: bool, qos: QoS, retain: bool) -> u8 {
    ((dup as u8) << 3) | ((qos as u8) << 1) | (retain as u8)
}

/// DUP bit value, for setting/clearing on an already-built first byte
pub const FH_DUP_BIT: u8 = 0x08;

#[inline]
pub fn fh_msg_type(byte1: u8) -> Option<PacketType> {
    PacketType::from_u8(byte1 >> 4)
}

#[inline]
pub fn fh_dup(byte1: u8) -> bool {
    (byte1 & FH_DUP_BIT) != 0
}

#[inline]
pub fn fh_qos(byte1: u8) -> Option<QoS> {
    QoS::from_u8((byte1 & 0x06) >> 1)
}

#[inline]
pub fn fh_retain(byte1: u8) -> bool {
    (byte1 & 0x01) != 0
}

/// CONNECT message flags, as laid out in the MQTT specification
pub mod connect_flags {
    pub const CLEAN_SESSION: u8 = 0x02;
    pub const WILL: u8 = 0x04;
    pub const WILL_RETAIN: u8 = 0x20;
    pub const USERNAME: u8 = 0x40;
    pub const PASSWORD: u8 = 0x80;

    /// Will QoS occupies bits 3-4
    #[inline]
    pub fn will_qos(flags: u8) -> u8 {
        (flags >> 3) & 0x03
    }
}

/// CONNACK return code (low byte of the composite CONNACK word)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0x00,
    BadProtocolVersion = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadCredentials = 0x04,
    NotAuthorized = 0x05,
}

/// Composite 16-bit CONNACK word: high byte carries the acknowledge
/// flags (bit 0 = session present), low byte the return code. The
/// reserved low-byte value 0xFF means "send nothing, drop the
/// connection" and is used for CONNECT packets too malformed to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnackWord(pub u16);

impl ConnackWord {
    pub const SUPPRESS: ConnackWord = ConnackWord(0x00FF);

    pub fn accepted(session_present: bool) -> Self {
        ConnackWord(if session_present { 0x0100 } else { 0x0000 })
    }

    pub fn refused(code: ConnectReturnCode) -> Self {
        ConnackWord(code as u16)
    }

    pub fn return_code(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn is_accepted(self) -> bool {
        self.return_code() == ConnectReturnCode::Accepted as u8
    }

    pub fn is_suppressed(self) -> bool {
        self.return_code() == 0xFF
    }
}
