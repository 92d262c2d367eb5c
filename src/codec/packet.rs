//! Packet buffer and fixed-capacity packet pool
//!
//! A `Packet` owns one fixed-size byte buffer holding a single MQTT
//! message, tracked by region offsets: fixed header, variable header
//! and payload. Outbound packets are composed forward starting past a
//! reserved fixed-header area; the fixed header is then retrofitted
//! backward into the unused space immediately before the variable
//! header, so the header bytes abut the payload without a copy.

use crate::protocol::{
    fh_byte1, fh_qos, Error, PacketType, Result, MAX_FIXED_HEADER, MAX_REMLEN_BYTES,
};
use crate::session::ClientSet;

use super::{read_string, read_u16, remaining_length_size, write_remaining_length_tail};

/// Index of a packet inside a [`PacketPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketId(pub(crate) u16);

/// One MQTT message in transit
#[derive(Debug)]
pub struct Packet {
    /// Fixed header byte 1 (type nibble + flags)
    pub fh_byte1: u8,
    /// Message transaction id (0 when absent)
    pub msg_id: u16,
    /// Index in `buffer` where the message content starts
    pub offset: usize,
    /// Fixed header length
    pub fh_len: usize,
    /// Variable header length
    pub vh_len: usize,
    /// Payload length
    pub pl_len: usize,
    /// Clients that still owe an acknowledgement for this packet
    pub pending: ClientSet,
    buffer: Vec<u8>,
    /// Wait-list link
    pub(crate) next: Option<PacketId>,
}

impl Packet {
    /// Create a stand-alone packet with a fixed buffer capacity
    pub fn new(buf_len: usize) -> Self {
        Packet {
            fh_byte1: 0,
            msg_id: 0,
            offset: 0,
            fh_len: 0,
            vh_len: 0,
            pl_len: 0,
            pending: ClientSet::empty(),
            buffer: vec![0; buf_len],
            next: None,
        }
    }

    /// Reset all message state, placing the content start at `offset`
    pub fn reset(&mut self, offset: usize) {
        self.fh_byte1 = 0;
        self.msg_id = 0;
        self.offset = offset;
        self.fh_len = 0;
        self.vh_len = 0;
        self.pl_len = 0;
        self.pending = ClientSet::empty();
        self.next = None;
    }

    pub fn msg_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.fh_byte1 >> 4)
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn content_len(&self) -> usize {
        self.fh_len + self.vh_len + self.pl_len
    }

    fn vh_start(&self) -> usize {
        self.offset + self.fh_len
    }

    fn pl_start(&self) -> usize {
        self.vh_start() + self.vh_len
    }

    fn free_len(&self) -> usize {
        self.buffer.len() - self.offset - self.content_len()
    }

    /// The complete wire frame: fixed header, variable header, payload
    pub fn frame(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.content_len()]
    }

    pub(crate) fn frame_mut(&mut self) -> &mut [u8] {
        let start = self.offset;
        let end = start + self.content_len();
        &mut self.buffer[start..end]
    }

    pub fn variable_header(&self) -> &[u8] {
        &self.buffer[self.vh_start()..self.vh_start() + self.vh_len]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.pl_start()..self.pl_start() + self.pl_len]
    }

    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Append the variable-header topic (and, for QoS > 0, the message
    /// id) during PUBLISH composition. Must precede payload data.
    pub fn append_topic(&mut self, topic: &str, msg_id: u16) -> Result<()> {
        let need = 2 + topic.len() + if msg_id != 0 { 2 } else { 0 };
        if topic.len() > u16::MAX as usize || self.free_len() < need {
            return Err(Error::PacketLength);
        }

        let mut at = self.pl_start() + self.pl_len;
        self.buffer[at..at + 2].copy_from_slice(&(topic.len() as u16).to_be_bytes());
        at += 2;
        self.buffer[at..at + topic.len()].copy_from_slice(topic.as_bytes());
        at += topic.len();
        if msg_id != 0 {
            self.buffer[at..at + 2].copy_from_slice(&msg_id.to_be_bytes());
        }

        self.vh_len += need;
        self.msg_id = msg_id;
        Ok(())
    }

    /// Append payload bytes during PUBLISH composition
    pub fn append_data(&mut self, data: &[u8]) -> Result<()> {
        if self.free_len() < data.len() {
            return Err(Error::PacketLength);
        }

        let at = self.pl_start() + self.pl_len;
        self.buffer[at..at + data.len()].copy_from_slice(data);
        self.pl_len += data.len();
        Ok(())
    }

    /// Finalize composition: compute the remaining length from the
    /// variable header and payload, write it backward from the byte
    /// immediately preceding the variable header, then the first byte
    /// before that, and pull `offset` back over the new header.
    pub fn prep_fixed_header(&mut self, msg_type: PacketType, flags: u8) -> Result<usize> {
        let remlen = (self.vh_len + self.pl_len) as u32;
        let fh_len = 1 + remaining_length_size(remlen);
        if self.vh_start() < fh_len {
            return Err(Error::PacketLength);
        }

        let mut scratch = [0u8; MAX_REMLEN_BYTES];
        let n = write_remaining_length_tail(&mut scratch, remlen)?;

        let vh_start = self.vh_start();
        self.buffer[vh_start - n..vh_start].copy_from_slice(&scratch[MAX_REMLEN_BYTES - n..]);
        self.buffer[vh_start - n - 1] = fh_byte1(msg_type, flags);

        self.fh_byte1 = fh_byte1(msg_type, flags);
        self.fh_len = fh_len;
        self.offset = vh_start - fh_len;
        Ok(fh_len)
    }

    /// Parse a received PUBLISH: topic length + bytes, then a message
    /// id only when QoS is non-zero. Strictly length-checked; fails
    /// closed on any underrun.
    pub fn read_publish(&mut self) -> Result<()> {
        let qos = fh_qos(self.fh_byte1).ok_or(Error::Content("bad PUBLISH QoS"))?;

        let pl = self.payload();
        let (topic, consumed) = read_string(pl)?;
        if topic.is_empty() {
            return Err(Error::Content("empty PUBLISH topic"));
        }

        let mut vh = consumed;
        let mut msg_id = 0;
        if qos as u8 != 0 {
            msg_id = read_u16(&pl[consumed..])?;
            if msg_id == 0 {
                return Err(Error::Content("zero PUBLISH message id"));
            }
            vh += 2;
        }

        self.vh_len += vh;
        self.pl_len -= vh;
        self.msg_id = msg_id;
        Ok(())
    }

    /// Topic of a parsed PUBLISH
    pub fn publish_topic(&self) -> Result<&str> {
        let vh = self.variable_header();
        let (topic, _) = read_string(vh)?;
        Ok(topic)
    }

    /// Parse a message-id-bearing acknowledgement (PUBACK, PUBREC,
    /// PUBREL, PUBCOMP, UNSUBACK). `has_payload` permits trailing
    /// payload bytes (SUBACK); otherwise any excess fails the packet.
    pub fn read_msg_id_ack(&mut self, has_payload: bool) -> Result<()> {
        let pl = self.payload();
        let msg_id = read_u16(pl)?;
        if !has_payload && pl.len() != 2 {
            return Err(Error::Content("unexpected payload in ack"));
        }

        self.vh_len += 2;
        self.pl_len -= 2;
        self.msg_id = msg_id;
        Ok(())
    }

    /// Consume a leading message id out of the payload into the
    /// variable header (SUBSCRIBE/UNSUBSCRIBE processing).
    pub fn read_msg_id_vh(&mut self) -> Result<()> {
        let msg_id = read_u16(self.payload())?;
        self.vh_len += 2;
        self.pl_len -= 2;
        self.msg_id = msg_id;
        Ok(())
    }
}

/// Fixed-capacity pool of packet buffers with an explicit free list.
/// No dynamic growth: allocation fails when the pool is exhausted.
#[derive(Debug)]
pub struct PacketPool {
    slots: Vec<Packet>,
    free: Vec<PacketId>,
}

impl PacketPool {
    pub fn new(count: usize, buf_len: usize) -> Self {
        let slots = (0..count).map(|_| Packet::new(buf_len)).collect();
        let free = (0..count).rev().map(|i| PacketId(i as u16)).collect();
        PacketPool { slots, free }
    }

    /// Allocate a packet for composition, content start reserved past
    /// the maximum fixed-header area.
    pub fn alloc(&mut self) -> Option<PacketId> {
        let id = self.free.pop()?;
        self.slots[id.0 as usize].reset(MAX_FIXED_HEADER);
        Some(id)
    }

    pub fn free(&mut self, id: PacketId) {
        debug_assert!(!self.free.contains(&id));
        self.slots[id.0 as usize].reset(0);
        self.free.push(id);
    }

    pub fn get(&self, id: PacketId) -> &Packet {
        &self.slots[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: PacketId) -> &mut Packet {
        &mut self.slots[id.0 as usize]
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}
