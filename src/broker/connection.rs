//! Connection contexts and the per-connection packet state machine
//!
//! A connection context exists from transport accept until close, and
//! is not necessarily bound to an MQTT session yet: there is a window
//! between accept and the CONNECT message. States are implicit in the
//! context flags: before CONNECT the only legal message is CONNECT,
//! anything else is a protocol violation closing the connection.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::{read_binary, read_string, read_u16, recv_packet, Packet};
use crate::protocol::{
    connect_flags, fh_byte1, ConnackWord, ConnectReturnCode, Error, PacketType, QoS, Result,
};
use crate::session::CloseOutcome;
use crate::topic;
use crate::transport::{NetHandle, NetServices};

use super::Engine;

/// Index of a live connection context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId(pub(crate) usize);

#[derive(Debug)]
pub(crate) struct ConnCtx {
    used: bool,
    pub(crate) net: NetHandle,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) session: Option<usize>,
    /// Grace-adjusted keep-alive interval; 0 means no timeout
    pub(crate) ka_secs: u32,
    /// Absolute deadline in transport seconds; None once keep-alive 0
    /// was negotiated
    pub(crate) deadline: Option<u64>,
    pub(crate) got_connect: bool,
    pub(crate) need_close: bool,
    pub(crate) conn_error: bool,
}

impl ConnCtx {
    fn unused() -> Self {
        ConnCtx {
            used: false,
            net: NetHandle(0),
            remote: None,
            session: None,
            ka_secs: 0,
            deadline: None,
            got_connect: false,
            need_close: false,
            conn_error: false,
        }
    }
}

/// Fixed pool of connection contexts
#[derive(Debug)]
pub(crate) struct ConnTable {
    slots: Vec<ConnCtx>,
}

impl ConnTable {
    pub(crate) fn new(capacity: usize) -> Self {
        ConnTable {
            slots: (0..capacity).map(|_| ConnCtx::unused()).collect(),
        }
    }

    pub(crate) fn alloc(
        &mut self,
        net: NetHandle,
        remote: SocketAddr,
        deadline: u64,
    ) -> Option<ConnId> {
        let idx = self.slots.iter().position(|c| !c.used)?;
        self.slots[idx] = ConnCtx {
            used: true,
            net,
            remote: Some(remote),
            deadline: Some(deadline),
            ..ConnCtx::unused()
        };
        Some(ConnId(idx))
    }

    pub(crate) fn free(&mut self, id: ConnId) {
        self.slots[id.0] = ConnCtx::unused();
    }

    pub(crate) fn get(&self, id: ConnId) -> &ConnCtx {
        &self.slots[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: ConnId) -> &mut ConnCtx {
        &mut self.slots[id.0]
    }

    pub(crate) fn find_by_net(&self, net: NetHandle) -> Option<ConnId> {
        self.slots
            .iter()
            .position(|c| c.used && c.net == net)
            .map(ConnId)
    }

    pub(crate) fn live_handles(&self, out: &mut Vec<NetHandle>) {
        out.extend(self.slots.iter().filter(|c| c.used).map(|c| c.net));
    }

    /// Live contexts in ascending deadline order, deadline-free last
    fn sweep_order(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = (0..self.slots.len())
            .filter(|i| self.slots[*i].used)
            .map(ConnId)
            .collect();
        ids.sort_by_key(|id| self.slots[id.0].deadline.unwrap_or(u64::MAX));
        ids
    }
}

impl Engine {
    // --- send helpers -----------------------------------------------------

    /// Send raw bytes on a connection. A failed send is fatal to that
    /// connection: it is flagged for close and the loop is nudged so
    /// the sweep picks it up.
    pub(crate) fn conn_send(&mut self, net: &dyn NetServices, id: ConnId, buf: &[u8]) -> Result<()> {
        let handle = self.conns.get(id).net;
        match net.send(handle, buf) {
            Ok(_) => Ok(()),
            Err(_) => {
                self.mark_close_tx(net, id, true);
                Err(Error::Network)
            }
        }
    }

    /// Send a message consisting of a fixed header and an optional
    /// 2-byte variable header (CONNACK, PUBACK, PUBREC, PUBREL,
    /// PUBCOMP, UNSUBACK, PINGRESP).
    pub(crate) fn send_vh_msg(
        &mut self,
        net: &dyn NetServices,
        id: ConnId,
        msg_type: PacketType,
        flags: u8,
        vh: Option<u16>,
    ) -> Result<()> {
        if !self.conns.get(id).got_connect {
            return Err(Error::NotConnected);
        }

        let mut buf = [0u8; 4];
        buf[0] = fh_byte1(msg_type, flags);
        let len = match vh {
            Some(word) => {
                buf[1] = 2;
                buf[2..4].copy_from_slice(&word.to_be_bytes());
                4
            }
            None => {
                buf[1] = 0;
                2
            }
        };

        self.conn_send(net, id, &buf[..len])
    }

    // --- close paths ------------------------------------------------------

    /// Flag a connection for close from the send path and wake the
    /// loop; the actual teardown happens in the sweep.
    pub(crate) fn mark_close_tx(&mut self, net: &dyn NetServices, id: ConnId, due_to_error: bool) {
        {
            let ctx = self.conns.get_mut(id);
            ctx.need_close = true;
            if due_to_error {
                ctx.conn_error = true;
            }
        }
        self.loopb_trigger(net);
    }

    /// Close a connection and reconcile its session: dispatch the will
    /// on an unclean close, then delete or preserve the session per its
    /// clean-session flag.
    pub(crate) fn close_conn(&mut self, net: &dyn NetServices, id: ConnId, due_to_error: bool) {
        let (handle, remote, session) = {
            let ctx = self.conns.get(id);
            (ctx.net, ctx.remote, ctx.session)
        };

        debug!(
            "closing connection {:?} from {:?} (error: {})",
            handle, remote, due_to_error
        );
        let _ = net.close(handle);

        if let Some(sidx) = session {
            if let Some(wnode) = self.sessions.get(sidx).will_node {
                if self.tree.will_client(wnode) == Some(sidx) {
                    if due_to_error {
                        self.dispatch_will(net, wnode);
                    }
                    self.tree.clear_data(wnode);
                    self.tree.set_will_client(wnode, None);
                    self.tree.try_delete(wnode);
                }
                self.sessions.get_mut(sidx).will_node = None;
            }

            let client_id = self.sessions.get(sidx).client_id.clone();
            self.hooks.notify_disconnect(&client_id, due_to_error);

            let outcome = self.sessions.on_net_close(sidx, &mut self.pool);
            if outcome == CloseOutcome::Deleted {
                self.tree.remove_client(sidx);
                info!("session {} deleted", client_id);
            } else {
                info!("session {} preserved for resumption", client_id);
            }
        }

        self.conns.free(id);
    }

    fn dispatch_will(&mut self, net: &dyn NetServices, wnode: crate::topic::NodeId) {
        let Some(data) = self.tree.data(wnode).cloned() else {
            return;
        };
        let path = self.tree.path(wnode);
        self.route_to_subscribers(net, &path, &data.payload, data.qos, data.retain);
    }

    // --- keep-alive -------------------------------------------------------

    /// Restart a connection's keep-alive window after a received
    /// message
    pub(crate) fn rx_touch(&mut self, net: &dyn NetServices, id: ConnId) {
        if !self.conns.get(id).got_connect {
            return;
        }

        let now = net.time();
        let ctx = self.conns.get_mut(id);
        ctx.deadline = if ctx.ka_secs == 0 {
            None
        } else {
            Some(now + ctx.ka_secs as u64)
        };
    }

    /// Close every connection whose deadline has passed or which was
    /// flagged by a failed send, then report the time until the next
    /// deadline so the io wait can be bounded precisely.
    pub(crate) fn sweep_keep_alive(&mut self, net: &dyn NetServices) -> Option<Duration> {
        let now = net.time();

        for id in self.conns.sweep_order() {
            let (need_close, conn_error, expired) = {
                let ctx = self.conns.get(id);
                (
                    ctx.need_close,
                    ctx.conn_error,
                    ctx.deadline.is_some_and(|d| d <= now),
                )
            };

            if need_close || expired {
                // A keep-alive expiry is an unclean end: the client
                // went silent, so its will must fire.
                self.close_conn(net, id, conn_error || expired);
            }
        }

        self.conns
            .sweep_order()
            .first()
            .and_then(|id| self.conns.get(*id).deadline)
            .map(|d| Duration::from_secs(d.saturating_sub(now)))
    }

    // --- accept and receive -----------------------------------------------

    pub(crate) fn accept_conn(&mut self, net: &dyn NetServices) {
        let Some(listener) = self.listen else {
            return;
        };

        let (handle, remote) = match net.accept(listener) {
            Ok(pair) => pair,
            Err(_) => return,
        };

        let deadline = net.time() + self.cfg.connect_timeout.as_secs();
        match self.conns.alloc(handle, remote, deadline) {
            Some(id) => debug!("accepted {} as {:?}", remote, id),
            None => {
                warn!("connection table full, refusing {}", remote);
                let _ = net.close(handle);
            }
        }
    }

    /// Drain one wake-up datagram; its only job was to unblock the
    /// readiness wait.
    pub(crate) fn proc_loopback(&mut self, net: &dyn NetServices) -> Result<()> {
        let Some(loopb) = self.loopb else {
            return Ok(());
        };

        let mut buf = [0u8; 8];
        self.pending_trigs = false;
        match net.recv_from(loopb, &mut buf) {
            Ok(_) => Ok(()),
            Err(_) => {
                let _ = net.close(loopb);
                Err(Error::Fatal("loopback port failed"))
            }
        }
    }

    /// Wake the loop so it reconsiders state an entry point just
    /// mutated. Level-triggered: duplicate wake-ups while one is
    /// outstanding are suppressed.
    pub(crate) fn loopb_trigger(&mut self, net: &dyn NetServices) {
        const LOOP_DATA: [u8; 2] = [0x00, 0x01];

        if let Some(loopb) = self.loopb {
            if !self.pending_trigs {
                let port = self.cfg.loopback_port;
                if net
                    .send_to(loopb, &LOOP_DATA, port, "127.0.0.1".parse().unwrap())
                    .is_ok()
                {
                    self.pending_trigs = true;
                }
            }
        }
    }

    /// Frame one packet off a ready connection and run it through the
    /// dispatch table. Receive or content errors close the connection;
    /// the rest of the server is unaffected.
    pub(crate) fn proc_net_data(&mut self, net: &dyn NetServices, handle: NetHandle) {
        let Some(id) = self.conns.find_by_net(handle) else {
            return;
        };

        let mut rx = std::mem::replace(&mut self.rx, Packet::new(0));
        let wait = Some(self.cfg.recv_timeout);

        let result = recv_packet(net, handle, &mut rx, wait)
            .and_then(|_| self.process_recv(net, id, &mut rx));

        self.rx = rx;

        if let Err(e) = result {
            debug!("connection {:?} failed: {}", handle, e);
            // The dispatch above may already have torn the context down
            // (DISCONNECT); only close when it is still this handle's.
            if self.conns.find_by_net(handle) == Some(id) {
                self.close_conn(net, id, true);
            }
        }
    }

    /// Dispatch one framed packet by message type
    fn process_recv(&mut self, net: &dyn NetServices, id: ConnId, rx: &mut Packet) -> Result<()> {
        let msg_type = rx.msg_type().ok_or(Error::Content("bad packet type"))?;

        // The first message must be CONNECT, and CONNECT must not
        // repeat.
        let got_connect = self.conns.get(id).got_connect;
        if (msg_type == PacketType::Connect) == got_connect {
            return Err(Error::BadState("CONNECT ordering violation"));
        }

        self.rx_touch(net, id);

        match msg_type {
            PacketType::Connect => self.proc_connect(net, id, rx),
            PacketType::Disconnect => {
                // Clean shutdown: the will is discarded, not dispatched.
                self.close_conn(net, id, false);
                Ok(())
            }
            PacketType::PingReq => self.send_vh_msg(net, id, PacketType::PingResp, 0, None),
            PacketType::Publish => self.proc_publish(net, id, rx),
            PacketType::Subscribe => self.proc_subscribe(net, id, rx),
            PacketType::Unsubscribe => self.proc_unsubscribe(net, id, rx),
            PacketType::PubAck | PacketType::PubRec | PacketType::PubRel | PacketType::PubComp => {
                self.proc_ack(net, id, msg_type, rx)
            }
            _ => Err(Error::Content("unexpected message type")),
        }
    }

    // --- CONNECT ----------------------------------------------------------

    /// Parse and answer a CONNECT. Protocol name/level must be
    /// `MQTT`/4 or the legacy `MQIsdp`/3; will, username and password
    /// fields are each conditional on their flag, and a password
    /// requires a username. The reply is the composite CONNACK word;
    /// its reserved "suppress" value sends nothing and drops the
    /// connection.
    fn proc_connect(&mut self, net: &dyn NetServices, id: ConnId, rx: &mut Packet) -> Result<()> {
        self.conns.get_mut(id).got_connect = true;

        let (ack, accepted) = self.proc_connect_inner(id, rx);

        debug!("CONNACK word {:#06x}", ack.0);

        if !ack.is_suppressed() {
            let _ = self.send_vh_msg(net, id, PacketType::ConnAck, 0, Some(ack.0));
        }

        let Some((sidx, clean_session, session_present)) = accepted else {
            return Err(Error::Content("connection refused"));
        };

        self.rx_touch(net, id);

        if clean_session {
            self.tree.remove_client(sidx);
            self.sessions.purge_session(sidx, &mut self.pool);
        }
        self.sessions.on_connack_sent(sidx, id);

        info!(
            "client {} connected (clean: {}, resumed: {})",
            self.sessions.get(sidx).client_id,
            clean_session,
            session_present
        );

        if session_present {
            self.redeliver_parked(net, sidx);
        }

        Ok(())
    }

    /// Returns the CONNACK word and, on acceptance, the session index,
    /// clean-session flag and session-present marker for the follow-up
    /// steps that run after the CONNACK goes out.
    fn proc_connect_inner(
        &mut self,
        id: ConnId,
        rx: &Packet,
    ) -> (ConnackWord, Option<(usize, bool, bool)>) {
        let pl = rx.payload();
        let mut pos = 0;

        // Variable header: protocol name, level, flags, keep-alive.
        let Ok((proto_name, n)) = read_string(pl) else {
            return (ConnackWord::SUPPRESS, None);
        };
        pos += n;

        if pos >= pl.len() {
            return (ConnackWord::SUPPRESS, None);
        }
        let level = pl[pos];
        pos += 1;

        let known = (proto_name == "MQTT" && level == 4) || (proto_name == "MQIsdp" && level == 3);
        if !known {
            return (
                ConnackWord::refused(ConnectReturnCode::BadProtocolVersion),
                None,
            );
        }

        if pos >= pl.len() {
            return (ConnackWord::SUPPRESS, None);
        }
        let flags = pl[pos];
        pos += 1;

        let Ok(ka_secs) = read_u16(&pl[pos..]) else {
            return (ConnackWord::SUPPRESS, None);
        };
        pos += 2;

        let clean_session = flags & connect_flags::CLEAN_SESSION != 0;
        let has_will = flags & connect_flags::WILL != 0;
        let has_username = flags & connect_flags::USERNAME != 0;
        let has_password = flags & connect_flags::PASSWORD != 0;

        if has_password && !has_username {
            return (ConnackWord::SUPPRESS, None);
        }

        // Payload: client id, then will topic/message, username,
        // password, each conditional on its flag.
        let Ok((client_id, n)) = read_string(&pl[pos..]) else {
            return (ConnackWord::SUPPRESS, None);
        };
        pos += n;

        let mut will: Option<(&str, &[u8], QoS, bool)> = None;
        if has_will {
            let Ok((wtopic, n)) = read_string(&pl[pos..]) else {
                return (ConnackWord::SUPPRESS, None);
            };
            pos += n;
            let Ok((wmsg, n)) = read_binary(&pl[pos..]) else {
                return (ConnackWord::SUPPRESS, None);
            };
            pos += n;

            let Some(wqos) = QoS::from_u8(connect_flags::will_qos(flags)) else {
                return (ConnackWord::SUPPRESS, None);
            };
            will = Some((
                wtopic,
                wmsg,
                wqos,
                flags & connect_flags::WILL_RETAIN != 0,
            ));
        }

        let mut username = None;
        if has_username {
            let Ok((u, n)) = read_string(&pl[pos..]) else {
                return (ConnackWord::SUPPRESS, None);
            };
            pos += n;
            username = Some(u);
        }

        let mut password = None;
        if has_password {
            let Ok((p, _)) = read_binary(&pl[pos..]) else {
                return (ConnackWord::SUPPRESS, None);
            };
            password = Some(p);
        }

        if client_id.is_empty() && !clean_session {
            return (
                ConnackWord::refused(ConnectReturnCode::IdentifierRejected),
                None,
            );
        }
        if client_id.len() > self.cfg.max_client_id_len {
            return (
                ConnackWord::refused(ConnectReturnCode::IdentifierRejected),
                None,
            );
        }

        if let Err(code) = self.hooks.authorize_connect(client_id, username, password) {
            return (ConnackWord::refused(code), None);
        }

        // Will storage happens before session assignment; roll it back
        // on any refusal past this point.
        let mut will_node = None;
        if let Some((wtopic, wmsg, wqos, wretain)) = will {
            let normalized = topic::normalize(wtopic);
            if !topic::validate_topic_name(&normalized) {
                return (ConnackWord::SUPPRESS, None);
            }

            let Some(node) = self.tree.create(&normalized) else {
                return (
                    ConnackWord::refused(ConnectReturnCode::ServerUnavailable),
                    None,
                );
            };
            self.tree.set_data(node, wmsg, wqos, wretain);
            will_node = Some(node);
        }

        let assigned = self.sessions.assign(
            if client_id.is_empty() {
                None
            } else {
                Some(client_id)
            },
            clean_session,
        );

        let outcome = match assigned {
            Ok(outcome) => outcome,
            Err(code) => {
                if let Some(node) = will_node {
                    self.tree.clear_data(node);
                    self.tree.try_delete(node);
                }
                return (ConnackWord::refused(code), None);
            }
        };

        // Keep-alive with the configured grace factor; 0 disables the
        // timeout entirely.
        let grace = self.cfg.ka_grace_percent as u64;
        let ka = ka_secs as u64;
        self.conns.get_mut(id).ka_secs = (ka + ka * grace / 100) as u32;

        if let Some(node) = will_node {
            self.tree.set_will_client(node, Some(outcome.index));
            self.sessions.get_mut(outcome.index).will_node = Some(node);
        }
        self.conns.get_mut(id).session = Some(outcome.index);

        (
            ConnackWord::accepted(outcome.session_present),
            Some((outcome.index, clean_session, outcome.session_present)),
        )
    }

    /// Retransmit packets parked while this persistent session was
    /// offline, DUP bit set for the resend.
    fn redeliver_parked(&mut self, net: &dyn NetServices, sidx: usize) {
        let bit = crate::session::ClientSet::single(sidx);
        let parked = self.sessions.stale_list.ids_with_client(&self.pool, bit);

        for pkt_id in parked {
            let handle = {
                let Some(conn) = self.sessions.get(sidx).conn else {
                    return;
                };
                self.conns.get(conn).net
            };

            let pkt = self.pool.get_mut(pkt_id);
            let frame = pkt.frame_mut();
            frame[0] |= crate::protocol::FH_DUP_BIT;
            let sent = net.send(handle, frame);
            let frame = self.pool.get_mut(pkt_id).frame_mut();
            frame[0] &= !crate::protocol::FH_DUP_BIT;

            if sent.is_err() {
                if let Some(conn) = self.sessions.get(sidx).conn {
                    self.mark_close_tx(net, conn, true);
                }
                return;
            }
        }
    }
}
