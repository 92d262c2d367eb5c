//! Client/session registry
//!
//! A fixed table of client sessions, independent of the transport
//! connection carrying them. Each slot's index doubles as the client's
//! bit position in every subscriber set, which hard-caps the number of
//! simultaneously tracked clients at [`MAX_CLIENTS`]. A session
//! outlives its connection when the client asked for a persistent
//! (clean-session = false) session.

mod qos2;
mod waitlist;

#[cfg(test)]
mod tests;

pub use qos2::{Qos2Queue, MAX_QOS2_INFLIGHT};
pub use waitlist::AckWaitList;

use std::fmt;

use compact_str::CompactString;

use crate::broker::ConnId;
use crate::codec::PacketPool;
use crate::protocol::ConnectReturnCode;
use crate::topic::NodeId;

/// Upper bound on simultaneously tracked client sessions. Fixed by the
/// width of [`ClientSet`].
pub const MAX_CLIENTS: usize = 32;

/// A set of client indices, one bit per session slot
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientSet(u32);

impl ClientSet {
    pub const fn empty() -> Self {
        ClientSet(0)
    }

    pub const fn single(index: usize) -> Self {
        ClientSet(1 << index)
    }

    pub fn insert(&mut self, index: usize) {
        self.0 |= 1 << index;
    }

    pub fn remove(&mut self, index: usize) {
        self.0 &= !(1 << index);
    }

    pub fn contains(self, index: usize) -> bool {
        (self.0 >> index) & 1 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: ClientSet) -> ClientSet {
        ClientSet(self.0 | other.0)
    }

    pub fn intersect(self, other: ClientSet) -> ClientSet {
        ClientSet(self.0 & other.0)
    }

    pub fn difference(self, other: ClientSet) -> ClientSet {
        ClientSet(self.0 & !other.0)
    }

    /// Iterate the set client indices, lowest first
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_CLIENTS).filter(move |i| self.contains(*i))
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }
}

impl fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSet({:#010x})", self.0)
    }
}

/// One logical MQTT client identity
#[derive(Debug)]
pub struct Session {
    used: bool,
    /// Client identifier (empty only while unused)
    pub client_id: CompactString,
    /// CONNACK has been sent and the connection is live
    pub connected: bool,
    /// Discard session state at connect and disconnect
    pub clean_session: bool,
    /// CONNECT accepted, CONNACK not yet sent
    pub assigned: bool,
    /// The connection currently carrying this session
    pub conn: Option<ConnId>,
    /// Topic node holding this client's will, if any
    pub will_node: Option<NodeId>,
    /// Number of live subscriptions
    pub sub_count: u32,
    /// Inbound QoS2 PUBLISH ids awaiting PUBREL
    pub qos2_rx: Qos2Queue,
    /// Outbound QoS2 ids: PUBREC seen, awaiting PUBCOMP
    pub qos2_tx: Qos2Queue,
}

impl Session {
    fn unused() -> Self {
        Session {
            used: false,
            client_id: CompactString::default(),
            connected: false,
            clean_session: false,
            assigned: false,
            conn: None,
            will_node: None,
            sub_count: 0,
            qos2_rx: Qos2Queue::new(),
            qos2_tx: Qos2Queue::new(),
        }
    }

    fn reset(&mut self) {
        *self = Session::unused();
    }

    pub fn in_use(&self) -> bool {
        self.used
    }
}

/// Result of resolving a CONNECT against the session table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignOutcome {
    /// Slot index; also the client's bit position
    pub index: usize,
    /// An earlier persistent session was resumed
    pub session_present: bool,
}

/// What happened to the session when its connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Slot released; subscriptions and pending state must be purged
    Deleted,
    /// Slot kept with `connected = false` for later resumption
    Preserved,
}

/// The fixed session table plus the two acknowledgement wait-lists
#[derive(Debug)]
pub struct SessionTable {
    slots: Vec<Session>,
    /// QoS1/QoS2 packets dispatched and awaiting PUBACK/PUBREC
    pub ack_list: AckWaitList,
    /// Packets parked for clients whose persistent session is offline
    pub stale_list: AckWaitList,
    next_msg_id: u16,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            slots: (0..MAX_CLIENTS).map(|_| Session::unused()).collect(),
            ack_list: AckWaitList::new(),
            stale_list: AckWaitList::new(),
            next_msg_id: 0,
        }
    }

    pub fn get(&self, index: usize) -> &Session {
        &self.slots[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Session {
        &mut self.slots[index]
    }

    /// Next server-generated message id (never 0)
    pub fn next_msg_id(&mut self) -> u16 {
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        if self.next_msg_id == 0 {
            self.next_msg_id = 1;
        }
        self.next_msg_id
    }

    /// The set of currently connected clients among `set`
    pub fn connected_subset(&self, set: ClientSet) -> ClientSet {
        let mut out = ClientSet::empty();
        for idx in set.iter() {
            if self.slots[idx].used && self.slots[idx].connected {
                out.insert(idx);
            }
        }
        out
    }

    /// Clients in `set` holding an offline persistent session
    pub fn parked_subset(&self, set: ClientSet) -> ClientSet {
        let mut out = ClientSet::empty();
        for idx in set.iter() {
            let s = &self.slots[idx];
            if s.used && !s.connected && !s.clean_session {
                out.insert(idx);
            }
        }
        out
    }

    /// Resolve a CONNECT's client id against the table.
    ///
    /// An exact client-id match wins; a live slot rejects the attempt.
    /// An absent client id auto-assigns a free slot under a synthesized
    /// id (the caller has already enforced clean-session for that
    /// case).
    pub fn assign(
        &mut self,
        client_id: Option<&str>,
        clean_session: bool,
    ) -> std::result::Result<AssignOutcome, ConnectReturnCode> {
        if let Some(id) = client_id {
            if let Some(index) = self
                .slots
                .iter()
                .position(|s| s.used && s.client_id.as_str() == id)
            {
                let slot = &mut self.slots[index];
                if slot.connected || slot.assigned {
                    return Err(ConnectReturnCode::IdentifierRejected);
                }

                let session_present = !clean_session;
                slot.assigned = true;
                slot.clean_session = clean_session;
                return Ok(AssignOutcome {
                    index,
                    session_present,
                });
            }
        }

        let index = self
            .slots
            .iter()
            .position(|s| !s.used)
            .ok_or(ConnectReturnCode::ServerUnavailable)?;

        let slot = &mut self.slots[index];
        slot.reset();
        slot.used = true;
        slot.assigned = true;
        slot.clean_session = clean_session;
        slot.client_id = match client_id {
            Some(id) => CompactString::new(id),
            None => CompactString::new(format!("emberq-{:02}", index)),
        };

        Ok(AssignOutcome {
            index,
            session_present: false,
        })
    }

    /// CONNACK with return code 0 has gone out
    pub fn on_connack_sent(&mut self, index: usize, conn: ConnId) {
        let slot = &mut self.slots[index];
        slot.assigned = false;
        slot.connected = true;
        slot.conn = Some(conn);
    }

    /// Drop everything this session owes or is owed: wait-list bits and
    /// the QoS2 in-flight windows. Subscriptions live in the topic tree
    /// and are the caller's to clear.
    pub fn purge_session(&mut self, index: usize, pool: &mut PacketPool) {
        let bit = ClientSet::single(index);
        self.ack_list.purge_client(pool, bit);
        self.stale_list.purge_client(pool, bit);

        let slot = &mut self.slots[index];
        slot.qos2_rx.reset();
        slot.qos2_tx.reset();
        slot.sub_count = 0;
    }

    /// Does this session carry anything worth preserving?
    pub fn has_session_data(&self, index: usize, pool: &PacketPool) -> bool {
        let slot = &self.slots[index];
        let bit = ClientSet::single(index);

        slot.sub_count > 0
            || slot.qos2_rx.count() > 0
            || slot.qos2_tx.count() > 0
            || self.ack_list.holds_client(pool, bit)
            || self.stale_list.holds_client(pool, bit)
    }

    /// The connection under this session closed. The session is
    /// deleted when clean-session was requested, or when nothing worth
    /// preserving remains (which covers a CONNECT that never reached
    /// its CONNACK); otherwise the slot is kept with
    /// `connected = false` for later resumption. The caller clears
    /// topic-tree subscriptions when `Deleted` comes back.
    pub fn on_net_close(&mut self, index: usize, pool: &mut PacketPool) -> CloseOutcome {
        if self.slots[index].clean_session || !self.has_session_data(index, pool) {
            self.purge_session(index, pool);
            self.slots[index].reset();
            return CloseOutcome::Deleted;
        }

        let slot = &mut self.slots[index];
        slot.connected = false;
        slot.assigned = false;
        slot.conn = None;
        slot.will_node = None;
        CloseOutcome::Preserved
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        SessionTable::new()
    }
}
