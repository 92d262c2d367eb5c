//! Message routing
//!
//! Publish fan-out over the topic tree, retained-message delivery to
//! new subscribers, and the QoS acknowledgement flows. Outbound
//! publishes are composed once per matching leaf and QoS level and
//! dispatched to every subscriber in that leaf's client set at the
//! minimum of the subscribed and published QoS.

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::codec::{read_string, Packet};
use crate::protocol::{fh_flags, fh_qos, fh_retain, Error, PacketType, QoS, Result, SUBACK_FAILURE};
use crate::session::ClientSet;
use crate::topic::{self, NodeId};
use crate::transport::NetServices;

use super::connection::ConnId;
use super::Engine;

/// Upper bound on topics in one SUBSCRIBE/UNSUBSCRIBE
const MAX_SUB_TOPICS: usize = 16;

/// Retained payloads collected for delivery after tree walks
type RetainedBatch = SmallVec<[(String, Vec<u8>, QoS); 4]>;

impl Engine {
    // --- outbound publish -------------------------------------------------

    /// Compose one PUBLISH and dispatch it to every client in
    /// `targets`. Connected clients get it now; for QoS > 0 the packet
    /// is held on a wait-list with the owing clients' bits until each
    /// acknowledges, parked instead when any owing persistent session
    /// is offline.
    fn pub_send(
        &mut self,
        net: &dyn NetServices,
        topic: &str,
        payload: &[u8],
        dup: bool,
        qos: QoS,
        retain: bool,
        targets: ClientSet,
    ) {
        let Some(pkt_id) = self.pool.alloc() else {
            warn!("packet pool exhausted, dropping publish to {}", topic);
            return;
        };

        let msg_id = if qos == QoS::AtMostOnce {
            0
        } else {
            self.sessions.next_msg_id()
        };

        {
            let pkt = self.pool.get_mut(pkt_id);
            let composed = pkt
                .append_topic(topic, msg_id)
                .and_then(|_| pkt.append_data(payload))
                .and_then(|_| {
                    pkt.prep_fixed_header(PacketType::Publish, fh_flags(dup, qos, retain))
                        .map(|_| ())
                });
            if composed.is_err() {
                self.pool.free(pkt_id);
                warn!("publish to {} exceeds the transmit budget", topic);
                return;
            }
        }

        let connected = self.sessions.connected_subset(targets);
        let parked = if qos == QoS::AtMostOnce {
            ClientSet::empty()
        } else {
            self.sessions.parked_subset(targets)
        };

        let sends: SmallVec<[(ConnId, crate::transport::NetHandle); 8]> = connected
            .iter()
            .filter_map(|idx| self.sessions.get(idx).conn)
            .map(|cid| (cid, self.conns.get(cid).net))
            .collect();

        let mut failed: SmallVec<[ConnId; 4]> = SmallVec::new();
        {
            let frame = self.pool.get(pkt_id).frame();
            for (cid, handle) in &sends {
                if net.send(*handle, frame).is_err() {
                    failed.push(*cid);
                }
            }
        }
        for cid in failed {
            self.mark_close_tx(net, cid, true);
        }

        let pending = if qos == QoS::AtMostOnce {
            ClientSet::empty()
        } else {
            connected.union(parked)
        };

        if pending.is_empty() {
            self.pool.free(pkt_id);
        } else {
            self.pool.get_mut(pkt_id).pending = pending;
            if parked.is_empty() {
                self.sessions.ack_list.append(&mut self.pool, pkt_id);
            } else {
                self.sessions.stale_list.append(&mut self.pool, pkt_id);
            }
        }
    }

    /// Fan a message out to every subscription leaf matching `topic`,
    /// per QoS level, plus any hooks enrolled on those leaves.
    pub(crate) fn route_to_subscribers(
        &mut self,
        net: &dyn NetServices,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) {
        let leaves = self.tree.match_topic(topic);

        for leaf in leaves {
            for qid in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
                let map = self.tree.subscribers(leaf, qid);
                if !map.is_empty() {
                    self.pub_send(net, topic, payload, false, qid.min(qos), retain, map);
                }
            }

            let hook_map = self.tree.hook_map(leaf);
            if !hook_map.is_default() {
                self.hooks
                    .publish(hook_map, topic, payload, false, qos, retain);
            }
        }
    }

    /// Full publish path shared by clients and the application API:
    /// subscriber fan-out plus retained-store update. The topic has
    /// been normalized and validated by the caller.
    pub(crate) fn route_publish(
        &mut self,
        net: &dyn NetServices,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) {
        self.route_to_subscribers(net, topic, payload, qos, false);

        if retain {
            self.retain_update(topic, payload, qos);
        }
    }

    /// Store the most recent retained payload for a topic; an empty
    /// payload clears retention.
    fn retain_update(&mut self, topic: &str, payload: &[u8], qos: QoS) {
        if payload.is_empty() {
            if let Some(leaf) = self.tree.find(topic) {
                self.tree.clear_data(leaf);
                self.tree.try_delete(leaf);
            }
            return;
        }

        match self.tree.create(topic) {
            Some(leaf) => self.tree.set_data(leaf, payload, qos, true),
            None => warn!("topic tree exhausted, retained {} dropped", topic),
        }
    }

    // --- inbound PUBLISH --------------------------------------------------

    pub(crate) fn proc_publish(
        &mut self,
        net: &dyn NetServices,
        id: ConnId,
        rx: &mut Packet,
    ) -> Result<()> {
        rx.read_publish()?;

        let qos = fh_qos(rx.fh_byte1).ok_or(Error::Content("bad PUBLISH QoS"))?;
        let retain = fh_retain(rx.fh_byte1);
        let msg_id = rx.msg_id;

        let topic = topic::normalize(rx.publish_topic()?);
        if !topic::validate_topic_name(&topic) {
            return Err(Error::Content("invalid PUBLISH topic"));
        }

        let sidx = self.conns.get(id).session.ok_or(Error::NotConnected)?;

        if qos == QoS::ExactlyOnce {
            let window = &mut self.sessions.get_mut(sidx).qos2_rx;
            if window.check(msg_id) {
                // Retransmission of a PUBLISH whose PUBREC the client
                // has not seen yet: acknowledge again, deliver nothing.
                return self.send_vh_msg(net, id, PacketType::PubRec, 0, Some(msg_id));
            }
            if !window.logup(msg_id) {
                return Err(Error::Content("QoS2 in-flight window full"));
            }
        }

        self.route_publish(net, &topic, rx.payload(), qos, retain);

        match qos {
            QoS::AtMostOnce => Ok(()),
            QoS::AtLeastOnce => self.send_vh_msg(net, id, PacketType::PubAck, 0, Some(msg_id)),
            QoS::ExactlyOnce => self.send_vh_msg(net, id, PacketType::PubRec, 0, Some(msg_id)),
        }
    }

    // --- SUBSCRIBE --------------------------------------------------------

    pub(crate) fn proc_subscribe(
        &mut self,
        net: &dyn NetServices,
        id: ConnId,
        rx: &mut Packet,
    ) -> Result<()> {
        rx.read_msg_id_vh()?;
        let msg_id = rx.msg_id;
        let sidx = self.conns.get(id).session.ok_or(Error::NotConnected)?;

        let mut topics: SmallVec<[(String, QoS); 8]> = SmallVec::new();
        {
            let pl = rx.payload();
            let mut pos = 0;
            while pos < pl.len() && topics.len() < MAX_SUB_TOPICS {
                let (filter, n) = read_string(&pl[pos..])?;
                pos += n;
                if pos >= pl.len() {
                    return Err(Error::Content("SUBSCRIBE topic without QoS"));
                }
                let qos =
                    QoS::from_u8(pl[pos]).ok_or(Error::Content("bad SUBSCRIBE QoS"))?;
                pos += 1;
                topics.push((filter.to_owned(), qos));
            }

            if topics.is_empty() || pos != pl.len() {
                return Err(Error::Content("malformed SUBSCRIBE payload"));
            }
        }

        let mut acks: SmallVec<[u8; MAX_SUB_TOPICS]> = SmallVec::new();
        for (filter, req) in &topics {
            let normalized = topic::normalize(filter);
            let ack = if !topic::validate_topic_filter(&normalized) {
                SUBACK_FAILURE
            } else if normalized == "#" || normalized.ends_with("/#") {
                self.subscribe_multi_wildcard(net, sidx, &normalized, *req)
            } else {
                self.subscribe_plain(net, sidx, &normalized, *req)
            };

            debug!("SUB {} acknowledged with {:#04x}", filter, ack);
            acks.push(ack);
        }

        // SUBACK: the payload is one granted-QoS byte per topic, in
        // order; remaining length stays below 128 by the topic bound.
        let mut frame: SmallVec<[u8; 8 + MAX_SUB_TOPICS]> = SmallVec::new();
        frame.push(crate::protocol::fh_byte1(PacketType::SubAck, 0));
        frame.push((2 + acks.len()) as u8);
        frame.extend_from_slice(&msg_id.to_be_bytes());
        frame.extend_from_slice(&acks);

        self.conn_send(net, id, &frame)
    }

    /// Deliver retained payloads matching a new subscription and fold
    /// their stored QoS into the granted value.
    fn deliver_retained_batch(
        &mut self,
        net: &dyn NetServices,
        sidx: usize,
        batch: RetainedBatch,
        requested: u8,
    ) -> u8 {
        let mut granted = requested;
        let target = ClientSet::single(sidx);

        for (path, payload, stored) in batch {
            let qid = (stored as u8).min(requested);
            granted = granted.min(qid);
            let qos = QoS::from_u8(qid).unwrap_or(QoS::AtMostOnce);
            self.pub_send(net, &path, &payload, false, qos, true, target);
        }

        granted
    }

    /// Single-level-wildcard or literal subscription: deliver matching
    /// retained messages, then record the subscription at the granted
    /// QoS.
    fn subscribe_plain(&mut self, net: &dyn NetServices, sidx: usize, filter: &str, req: QoS) -> u8 {
        let mut batch: RetainedBatch = SmallVec::new();
        for (node, path) in self.tree.match_filter(filter) {
            if let Some(data) = self.tree.data(node) {
                if data.retain {
                    batch.push((path, data.payload.clone(), data.qos));
                }
            }
        }

        let granted = self.deliver_retained_batch(net, sidx, batch, req as u8);

        let Some(leaf) = self.tree.create(filter) else {
            return SUBACK_FAILURE;
        };
        let qos = QoS::from_u8(granted).unwrap_or(QoS::AtMostOnce);
        if self.tree.subscribe_at(leaf, qos, sidx) {
            self.sessions.get_mut(sidx).sub_count += 1;
        }

        granted
    }

    /// Multi-level wildcard subscription. `prefix/#` matches the
    /// prefix node itself plus its entire subtree, so retained
    /// delivery walks both; the subscription is recorded as two tree
    /// entries, the prefix node and a literal `#` child beneath it.
    fn subscribe_multi_wildcard(
        &mut self,
        net: &dyn NetServices,
        sidx: usize,
        filter: &str,
        req: QoS,
    ) -> u8 {
        let prefix = filter
            .strip_suffix('#')
            .map(|p| p.trim_end_matches('/'))
            .unwrap_or("")
            .to_owned();

        let mut batch: RetainedBatch = SmallVec::new();
        {
            let spots: SmallVec<[(NodeId, String); 4]> = if prefix.is_empty() {
                self.tree
                    .collect_all()
                    .into_iter()
                    .collect()
            } else {
                let mut all: SmallVec<[(NodeId, String); 4]> = SmallVec::new();
                for (node, path) in self.tree.match_filter(&prefix) {
                    all.extend(self.tree.collect_subtree(node, &path));
                }
                all
            };

            for (node, path) in spots {
                if let Some(data) = self.tree.data(node) {
                    if data.retain {
                        batch.push((path, data.payload.clone(), data.qos));
                    }
                }
            }
        }

        let granted = self.deliver_retained_batch(net, sidx, batch, req as u8);
        let qos = QoS::from_u8(granted).unwrap_or(QoS::AtMostOnce);

        let mut parent_added = false;
        let mut parent_leaf = None;
        if !prefix.is_empty() {
            let Some(leaf) = self.tree.create(&prefix) else {
                return SUBACK_FAILURE;
            };
            parent_added = self.tree.subscribe_at(leaf, qos, sidx);
            parent_leaf = Some(leaf);
        }

        match self.tree.create(filter) {
            Some(leaf) => {
                if self.tree.subscribe_at(leaf, qos, sidx) {
                    self.sessions.get_mut(sidx).sub_count += 1;
                }
                if parent_added {
                    self.sessions.get_mut(sidx).sub_count += 1;
                }
            }
            None => {
                // Roll the prefix entry back so a half-made
                // subscription does not linger.
                if let Some(leaf) = parent_leaf {
                    if parent_added {
                        self.tree.unsubscribe_at(leaf, sidx);
                    }
                }
                return SUBACK_FAILURE;
            }
        }

        granted
    }

    // --- UNSUBSCRIBE ------------------------------------------------------

    pub(crate) fn proc_unsubscribe(
        &mut self,
        net: &dyn NetServices,
        id: ConnId,
        rx: &mut Packet,
    ) -> Result<()> {
        rx.read_msg_id_vh()?;
        let msg_id = rx.msg_id;
        let sidx = self.conns.get(id).session.ok_or(Error::NotConnected)?;

        let mut topics: SmallVec<[String; 8]> = SmallVec::new();
        {
            let pl = rx.payload();
            let mut pos = 0;
            while pos < pl.len() && topics.len() < MAX_SUB_TOPICS {
                let (filter, n) = read_string(&pl[pos..])?;
                pos += n;
                topics.push(filter.to_owned());
            }

            if topics.is_empty() || pos != pl.len() {
                return Err(Error::Content("malformed UNSUBSCRIBE payload"));
            }
        }

        for filter in &topics {
            let normalized = topic::normalize(filter);

            // A multi-level wildcard subscription occupies two tree
            // entries; drop both.
            if normalized == "#" || normalized.ends_with("/#") {
                let prefix = normalized
                    .strip_suffix('#')
                    .map(|p| p.trim_end_matches('/'))
                    .unwrap_or("");
                if !prefix.is_empty() {
                    self.unsubscribe_leaf(sidx, prefix);
                }
            }

            self.unsubscribe_leaf(sidx, &normalized);
        }

        self.send_vh_msg(net, id, PacketType::UnsubAck, 0, Some(msg_id))
    }

    /// Unsubscribing a topic not currently subscribed is a no-op.
    fn unsubscribe_leaf(&mut self, sidx: usize, filter: &str) {
        if let Some(leaf) = self.tree.find(filter) {
            if self.tree.unsubscribe_at(leaf, sidx) {
                let count = &mut self.sessions.get_mut(sidx).sub_count;
                *count = count.saturating_sub(1);
            }
        }
    }

    // --- acknowledgements -------------------------------------------------

    /// PUBACK/PUBREC/PUBREL/PUBCOMP sequencing. Out-of-order or
    /// unexpected acknowledgements are protocol errors fatal to the
    /// connection.
    pub(crate) fn proc_ack(
        &mut self,
        net: &dyn NetServices,
        id: ConnId,
        msg_type: PacketType,
        rx: &mut Packet,
    ) -> Result<()> {
        rx.read_msg_id_ack(false)?;
        let msg_id = rx.msg_id;
        let sidx = self.conns.get(id).session.ok_or(Error::NotConnected)?;
        let bit = ClientSet::single(sidx);

        match msg_type {
            PacketType::PubAck => {
                let found = self.sessions.ack_list.ack(&mut self.pool, msg_id, bit)
                    || self.sessions.stale_list.ack(&mut self.pool, msg_id, bit);
                if !found {
                    return Err(Error::Content("unexpected PUBACK"));
                }
                Ok(())
            }
            PacketType::PubRec => {
                let found = self.sessions.ack_list.ack(&mut self.pool, msg_id, bit)
                    || self.sessions.stale_list.ack(&mut self.pool, msg_id, bit);
                if !found {
                    return Err(Error::Content("unexpected PUBREC"));
                }
                if !self.sessions.get_mut(sidx).qos2_tx.logup(msg_id) {
                    return Err(Error::Content("QoS2 in-flight window full"));
                }
                self.send_vh_msg(net, id, PacketType::PubRel, 0x02, Some(msg_id))
            }
            PacketType::PubRel => {
                if !self.sessions.get_mut(sidx).qos2_rx.unlog(msg_id) {
                    return Err(Error::Content("PUBREL out of order"));
                }
                self.send_vh_msg(net, id, PacketType::PubComp, 0, Some(msg_id))
            }
            PacketType::PubComp => {
                if !self.sessions.get_mut(sidx).qos2_tx.unlog(msg_id) {
                    return Err(Error::Content("PUBCOMP out of order"));
                }
                Ok(())
            }
            _ => Err(Error::Content("unexpected message type")),
        }
    }
}
