//! Acknowledgement wait-lists
//!
//! Singly linked lists of pool packets awaiting acknowledgement. One
//! packet can be owed by several clients at once; its pending set
//! tracks which clients still owe an ack, so an identical PUBLISH
//! payload is never duplicated per subscriber. An entry is unlinked and
//! its packet freed once the pending set drains.

use smallvec::SmallVec;

use crate::codec::{PacketId, PacketPool};

use super::ClientSet;

#[derive(Debug, Default)]
pub struct AckWaitList {
    head: Option<PacketId>,
    tail: Option<PacketId>,
}

impl AckWaitList {
    pub fn new() -> Self {
        AckWaitList {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Insert at the trailing end
    pub fn append(&mut self, pool: &mut PacketPool, id: PacketId) {
        pool.get_mut(id).next = None;

        match self.tail {
            Some(tail) => pool.get_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    fn unlink(&mut self, pool: &mut PacketPool, prev: Option<PacketId>, id: PacketId) {
        let next = pool.get(id).next;
        match prev {
            Some(p) => pool.get_mut(p).next = next,
            None => self.head = next,
        }
        if self.tail == Some(id) {
            self.tail = prev;
        }
    }

    /// Acknowledge `msg_id` on behalf of one client: clear that
    /// client's bit and, once no client still owes the packet, unlink
    /// it and return it to the pool. Returns true when a matching entry
    /// owed by this client was found.
    pub fn ack(&mut self, pool: &mut PacketPool, msg_id: u16, client: ClientSet) -> bool {
        let mut prev = None;
        let mut cur = self.head;

        while let Some(id) = cur {
            let pkt = pool.get_mut(id);
            if pkt.msg_id == msg_id && !pkt.pending.intersect(client).is_empty() {
                pkt.pending = pkt.pending.difference(client);
                if pkt.pending.is_empty() {
                    self.unlink(pool, prev, id);
                    pool.free(id);
                }
                return true;
            }

            prev = cur;
            cur = pkt.next;
        }

        false
    }

    /// Drop one client from every entry, freeing packets that drain
    pub fn purge_client(&mut self, pool: &mut PacketPool, client: ClientSet) {
        let mut prev = None;
        let mut cur = self.head;

        while let Some(id) = cur {
            let pkt = pool.get_mut(id);
            let next = pkt.next;

            pkt.pending = pkt.pending.difference(client);
            if pkt.pending.is_empty() {
                self.unlink(pool, prev, id);
                pool.free(id);
            } else {
                prev = cur;
            }

            cur = next;
        }
    }

    /// Does any entry still hold a bit for this client?
    pub fn holds_client(&self, pool: &PacketPool, client: ClientSet) -> bool {
        let mut cur = self.head;
        while let Some(id) = cur {
            let pkt = pool.get(id);
            if !pkt.pending.intersect(client).is_empty() {
                return true;
            }
            cur = pkt.next;
        }
        false
    }

    /// Ids of entries owed by this client, in list order
    pub fn ids_with_client(
        &self,
        pool: &PacketPool,
        client: ClientSet,
    ) -> SmallVec<[PacketId; 8]> {
        let mut out = SmallVec::new();
        let mut cur = self.head;
        while let Some(id) = cur {
            let pkt = pool.get(id);
            if !pkt.pending.intersect(client).is_empty() {
                out.push(id);
            }
            cur = pkt.next;
        }
        out
    }

    /// Unlink and free every entry
    pub fn purge_all(&mut self, pool: &mut PacketPool) {
        let mut cur = self.head;
        while let Some(id) = cur {
            cur = pool.get(id).next;
            pool.free(id);
        }
        self.head = None;
        self.tail = None;
    }
}
