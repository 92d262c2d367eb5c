//! Engine scenario tests
//!
//! Drive the full engine through the in-memory transport: scripted
//! client frames in, dispatched frames out, with a manually advanced
//! clock for keep-alive behavior.

use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use crate::broker::{Broker, EngineConfig};
use crate::codec::read_remaining_length;
use crate::hooks::Hook;
use crate::protocol::QoS;
use crate::session::ClientSet;
use crate::transport::{MemoryTransport, NetHandle};

// --- client-side frame builders -------------------------------------------

fn mqtt_string(s: &str) -> Vec<u8> {
    let mut out = (s.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(s.as_bytes());
    out
}

fn frame(byte1: u8, body: &[u8]) -> Vec<u8> {
    assert!(body.len() < 128);
    let mut out = vec![byte1, body.len() as u8];
    out.extend_from_slice(body);
    out
}

fn connect_frame(
    client_id: &str,
    clean: bool,
    keep_alive: u16,
    will: Option<(&str, &[u8], u8, bool)>,
) -> Vec<u8> {
    let mut body = mqtt_string("MQTT");
    body.push(0x04);

    let mut flags = 0u8;
    if clean {
        flags |= 0x02;
    }
    if let Some((_, _, wqos, wretain)) = will {
        flags |= 0x04 | (wqos << 3);
        if wretain {
            flags |= 0x20;
        }
    }
    body.push(flags);
    body.extend_from_slice(&keep_alive.to_be_bytes());
    body.extend_from_slice(&mqtt_string(client_id));

    if let Some((wtopic, wmsg, _, _)) = will {
        body.extend_from_slice(&mqtt_string(wtopic));
        body.extend_from_slice(&(wmsg.len() as u16).to_be_bytes());
        body.extend_from_slice(wmsg);
    }

    frame(0x10, &body)
}

fn subscribe_frame(msg_id: u16, filters: &[(&str, u8)]) -> Vec<u8> {
    let mut body = msg_id.to_be_bytes().to_vec();
    for (filter, qos) in filters {
        body.extend_from_slice(&mqtt_string(filter));
        body.push(*qos);
    }
    frame(0x82, &body)
}

fn unsubscribe_frame(msg_id: u16, filters: &[&str]) -> Vec<u8> {
    let mut body = msg_id.to_be_bytes().to_vec();
    for filter in filters {
        body.extend_from_slice(&mqtt_string(filter));
    }
    frame(0xA2, &body)
}

fn publish_frame(topic: &str, payload: &[u8], qos: u8, retain: bool, msg_id: u16) -> Vec<u8> {
    let mut byte1 = 0x30 | (qos << 1);
    if retain {
        byte1 |= 0x01;
    }

    let mut body = mqtt_string(topic);
    if qos > 0 {
        body.extend_from_slice(&msg_id.to_be_bytes());
    }
    body.extend_from_slice(payload);
    frame(byte1, &body)
}

fn msg_id_frame(byte1: u8, msg_id: u16) -> Vec<u8> {
    frame(byte1, &msg_id.to_be_bytes())
}

// --- server-side frame inspection -----------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct OutFrame {
    byte1: u8,
    body: Vec<u8>,
}

impl OutFrame {
    fn msg_type(&self) -> u8 {
        self.byte1 >> 4
    }

    fn qos(&self) -> u8 {
        (self.byte1 & 0x06) >> 1
    }

    fn dup(&self) -> bool {
        self.byte1 & 0x08 != 0
    }

    fn retain(&self) -> bool {
        self.byte1 & 0x01 != 0
    }

    fn msg_id(&self) -> u16 {
        u16::from_be_bytes([self.body[0], self.body[1]])
    }

    /// (topic, msg_id, payload) of a PUBLISH body
    fn publish_parts(&self) -> (String, u16, Vec<u8>) {
        let topic_len = u16::from_be_bytes([self.body[0], self.body[1]]) as usize;
        let topic = String::from_utf8(self.body[2..2 + topic_len].to_vec()).unwrap();
        let mut pos = 2 + topic_len;

        let msg_id = if self.qos() > 0 {
            pos += 2;
            u16::from_be_bytes([self.body[pos - 2], self.body[pos - 1]])
        } else {
            0
        };

        (topic, msg_id, self.body[pos..].to_vec())
    }
}

fn parse_frames(bytes: &[u8]) -> Vec<OutFrame> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let byte1 = bytes[pos];
        let (remlen, n) = read_remaining_length(&bytes[pos + 1..]).unwrap();
        let start = pos + 1 + n;
        let end = start + remlen as usize;
        out.push(OutFrame {
            byte1,
            body: bytes[start..end].to_vec(),
        });
        pos = end;
    }
    out
}

// --- harness ---------------------------------------------------------------

struct Harness {
    net: Arc<MemoryTransport>,
    broker: Broker,
    listener: NetHandle,
}

fn harness() -> Harness {
    let net = Arc::new(MemoryTransport::new());
    let broker = Broker::new(EngineConfig::default(), net.clone());
    broker.bind().unwrap();
    let listener = broker.lock().listen.unwrap();
    Harness {
        net,
        broker,
        listener,
    }
}

impl Harness {
    fn pump(&self) {
        for _ in 0..6 {
            self.broker.run_once().unwrap();
        }
    }

    /// Open a connection and complete the CONNECT handshake, returning
    /// the connection handle and the CONNACK body.
    fn connect(&self, client_id: &str, clean: bool) -> (NetHandle, Vec<u8>) {
        let (conn, frames) = self.connect_full(connect_frame(client_id, clean, 0, None));
        let connack = frames.iter().find(|f| f.msg_type() == 2).expect("CONNACK");
        (conn, connack.body.clone())
    }

    /// Like `connect`, but returns every frame the engine sent during
    /// the handshake (a resumed session may get redeliveries alongside
    /// its CONNACK).
    fn connect_full(&self, connect: Vec<u8>) -> (NetHandle, Vec<OutFrame>) {
        let conn = self.net.connect(self.listener);
        self.pump();
        self.net.push_bytes(conn, &connect);
        self.pump();

        (conn, parse_frames(&self.net.take_sent(conn)))
    }

    fn subscribe(&self, conn: NetHandle, filters: &[(&str, u8)]) -> Vec<u8> {
        self.net.push_bytes(conn, &subscribe_frame(1, filters));
        self.pump();
        let frames = parse_frames(&self.net.take_sent(conn));
        frames
            .iter()
            .find(|f| f.msg_type() == 9)
            .expect("SUBACK")
            .body[2..]
            .to_vec()
    }

    fn sent(&self, conn: NetHandle) -> Vec<OutFrame> {
        parse_frames(&self.net.take_sent(conn))
    }
}

// --- scenarios -------------------------------------------------------------

#[test]
fn connect_handshake_accepts() {
    let h = harness();
    let (_, connack) = h.connect("c1", true);
    assert_eq!(connack, vec![0x00, 0x00]);
}

#[test]
fn first_message_must_be_connect() {
    let h = harness();
    let conn = h.net.connect(h.listener);
    h.pump();

    h.net.push_bytes(conn, &frame(0xC0, &[]));
    h.pump();

    assert!(h.net.engine_closed(conn));
}

#[test]
fn duplicate_connect_is_a_violation() {
    let h = harness();
    let (conn, _) = h.connect("c1", true);

    h.net.push_bytes(conn, &connect_frame("c1", true, 0, None));
    h.pump();

    assert!(h.net.engine_closed(conn));
}

#[test]
fn bad_protocol_version_is_refused() {
    let h = harness();
    let conn = h.net.connect(h.listener);
    h.pump();

    let mut body = mqtt_string("MQTT");
    body.push(0x07); // unknown level
    body.push(0x02);
    body.extend_from_slice(&0u16.to_be_bytes());
    body.extend_from_slice(&mqtt_string("c1"));
    h.net.push_bytes(conn, &frame(0x10, &body));
    h.pump();

    let frames = parse_frames(&h.net.take_sent(conn));
    assert_eq!(frames[0].body, vec![0x00, 0x01]);
    assert!(h.net.engine_closed(conn));
}

#[test]
fn empty_client_id_requires_clean_session() {
    let h = harness();
    let conn = h.net.connect(h.listener);
    h.pump();
    h.net.push_bytes(conn, &connect_frame("", false, 0, None));
    h.pump();

    let frames = parse_frames(&h.net.take_sent(conn));
    assert_eq!(frames[0].body, vec![0x00, 0x02]);
    assert!(h.net.engine_closed(conn));

    // With clean session the server synthesizes an id.
    let (_, connack) = h.connect("", true);
    assert_eq!(connack, vec![0x00, 0x00]);
}

#[test]
fn ping_round_trip() {
    let h = harness();
    let (conn, _) = h.connect("c1", true);

    h.net.push_bytes(conn, &frame(0xC0, &[]));
    h.pump();

    let frames = h.sent(conn);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].msg_type(), 13);
}

#[test]
fn wildcard_subscriber_receives_at_min_qos() {
    let h = harness();
    let (sub, _) = h.connect("a", true);
    let granted = h.subscribe(sub, &[("home/+/temp", 1)]);
    assert_eq!(granted, vec![0x01]);

    let (publisher, _) = h.connect("b", true);
    h.net
        .push_bytes(publisher, &publish_frame("home/kitchen/temp", b"21.5", 2, false, 9));
    h.pump();

    // Publisher gets PUBREC for its QoS2 transaction.
    let pub_frames = h.sent(publisher);
    assert_eq!(pub_frames.len(), 1);
    assert_eq!(pub_frames[0].msg_type(), 5);
    assert_eq!(pub_frames[0].msg_id(), 9);

    // Subscriber receives at min(1, 2) = 1.
    let sub_frames = h.sent(sub);
    assert_eq!(sub_frames.len(), 1);
    assert_eq!(sub_frames[0].msg_type(), 3);
    assert_eq!(sub_frames[0].qos(), 1);
    let (topic, msg_id, payload) = sub_frames[0].publish_parts();
    assert_eq!(topic, "home/kitchen/temp");
    assert!(msg_id != 0);
    assert_eq!(payload, b"21.5");
}

#[test]
fn retained_message_reaches_late_subscriber() {
    let h = harness();
    let (publisher, _) = h.connect("p", true);
    h.net
        .push_bytes(publisher, &publish_frame("status/x", b"on", 0, true, 0));
    h.pump();

    let (sub, _) = h.connect("s", true);
    h.net.push_bytes(sub, &subscribe_frame(3, &[("status/x", 0)]));
    h.pump();

    let frames = h.sent(sub);
    let publish = frames.iter().find(|f| f.msg_type() == 3).expect("retained");
    assert!(publish.retain());
    let (topic, _, payload) = publish.publish_parts();
    assert_eq!(topic, "status/x");
    assert_eq!(payload, b"on");

    // An empty retained publish clears retention.
    h.net
        .push_bytes(publisher, &publish_frame("status/x", b"", 0, true, 0));
    h.pump();

    let (late, _) = h.connect("late", true);
    let granted = h.subscribe(late, &[("status/x", 0)]);
    assert_eq!(granted, vec![0x00]);
    assert!(h.sent(late).iter().all(|f| f.msg_type() != 3));
}

#[test]
fn multi_level_wildcard_matches_parent_and_subtree() {
    let h = harness();
    let (sub, _) = h.connect("s", true);
    h.subscribe(sub, &[("a/#", 0)]);

    let (publisher, _) = h.connect("p", true);
    h.net
        .push_bytes(publisher, &publish_frame("a/b/c", b"deep", 0, false, 0));
    h.net.push_bytes(publisher, &publish_frame("a", b"parent", 0, false, 0));
    h.pump();

    let topics: Vec<String> = h
        .sent(sub)
        .iter()
        .filter(|f| f.msg_type() == 3)
        .map(|f| f.publish_parts().0)
        .collect();
    assert_eq!(topics, vec!["a/b/c", "a"]);
}

#[test]
fn multi_level_wildcard_subscribe_delivers_existing_retained() {
    let h = harness();
    let (publisher, _) = h.connect("p", true);
    h.net
        .push_bytes(publisher, &publish_frame("a", b"top", 0, true, 0));
    h.net
        .push_bytes(publisher, &publish_frame("a/b/c", b"deep", 0, true, 0));
    h.pump();

    let (sub, _) = h.connect("s", true);
    h.subscribe(sub, &[("a/#", 1)]);

    let mut topics: Vec<String> = h
        .sent(sub)
        .iter()
        .filter(|f| f.msg_type() == 3)
        .map(|f| f.publish_parts().0)
        .collect();
    topics.sort();
    assert_eq!(topics, vec!["a", "a/b/c"]);
}

#[test]
fn suback_marks_bad_filters_independently() {
    let h = harness();
    let (sub, _) = h.connect("s", true);
    let granted = h.subscribe(sub, &[("a/#/b", 1), ("ok/topic", 1)]);
    assert_eq!(granted, vec![0x80, 0x01]);
}

#[test]
fn unsubscribe_is_idempotent() {
    let h = harness();
    let (sub, _) = h.connect("s", true);
    h.subscribe(sub, &[("t/x", 1)]);

    for _ in 0..2 {
        h.net.push_bytes(sub, &unsubscribe_frame(7, &["t/x"]));
        h.pump();
        let frames = h.sent(sub);
        let unsuback = frames.iter().find(|f| f.msg_type() == 11).expect("UNSUBACK");
        assert_eq!(unsuback.msg_id(), 7);
    }

    // Unsubscribing something never subscribed is equally quiet.
    h.net.push_bytes(sub, &unsubscribe_frame(8, &["never/was"]));
    h.pump();
    assert!(h.sent(sub).iter().any(|f| f.msg_type() == 11));
}

#[test]
fn qos1_packet_waits_for_offline_persistent_subscriber() {
    let h = harness();

    // Client 0: persistent subscriber that goes offline.
    let (offline, _) = h.connect("keeper", false);
    h.subscribe(offline, &[("t", 1)]);
    h.net.push_bytes(offline, &frame(0xE0, &[]));
    h.pump();
    assert!(h.net.engine_closed(offline));

    // Clients 1 and 2: connected subscribers.
    let (b, _) = h.connect("b", true);
    let (c, _) = h.connect("c", true);
    h.subscribe(b, &[("t", 1)]);
    h.subscribe(c, &[("t", 1)]);

    let (publisher, _) = h.connect("p", true);
    h.net
        .push_bytes(publisher, &publish_frame("t", b"data", 1, false, 21));
    h.pump();

    let b_pub = h.sent(b).into_iter().find(|f| f.msg_type() == 3).unwrap();
    let c_pub = h.sent(c).into_iter().find(|f| f.msg_type() == 3).unwrap();

    // Connected subscribers acknowledge; the packet must stay parked
    // with only the offline client's bit.
    h.net.push_bytes(b, &msg_id_frame(0x40, b_pub.msg_id()));
    h.net.push_bytes(c, &msg_id_frame(0x40, c_pub.msg_id()));
    h.pump();

    {
        let g = h.broker.lock();
        assert!(g
            .sessions
            .stale_list
            .holds_client(&g.pool, ClientSet::single(0)));
        assert!(!g
            .sessions
            .stale_list
            .holds_client(&g.pool, ClientSet::single(1)));
    }

    // The keeper reconnects: session present, parked packet redelivered
    // with the DUP bit, and its PUBACK finally releases the buffer.
    let (resumed, frames) = h.connect_full(connect_frame("keeper", false, 0, None));
    let connack = frames.iter().find(|f| f.msg_type() == 2).expect("CONNACK");
    assert_eq!(connack.body, vec![0x01, 0x00]);

    let redelivered = frames
        .into_iter()
        .find(|f| f.msg_type() == 3)
        .expect("redelivery");
    assert!(redelivered.dup());
    let (topic, msg_id, payload) = redelivered.publish_parts();
    assert_eq!(topic, "t");
    assert_eq!(payload, b"data");

    h.net.push_bytes(resumed, &msg_id_frame(0x40, msg_id));
    h.pump();

    let g = h.broker.lock();
    assert!(!g
        .sessions
        .stale_list
        .holds_client(&g.pool, ClientSet::single(0)));
}

#[test]
fn qos2_inbound_flow_is_exactly_once() {
    let h = harness();
    let (sub, _) = h.connect("s", true);
    h.subscribe(sub, &[("t", 0)]);

    let (publisher, _) = h.connect("p", true);
    let publish = publish_frame("t", b"x", 2, false, 40);

    h.net.push_bytes(publisher, &publish);
    h.pump();
    assert_eq!(h.sent(publisher)[0].msg_type(), 5);
    assert_eq!(h.sent(sub).len(), 1);

    // A retransmission before PUBREL is acknowledged again but not
    // delivered again.
    h.net.push_bytes(publisher, &publish);
    h.pump();
    assert_eq!(h.sent(publisher)[0].msg_type(), 5);
    assert!(h.sent(sub).is_empty());

    h.net.push_bytes(publisher, &msg_id_frame(0x62, 40));
    h.pump();
    let frames = h.sent(publisher);
    assert_eq!(frames[0].msg_type(), 7);
    assert_eq!(frames[0].msg_id(), 40);
}

#[test]
fn qos2_outbound_flow_completes() {
    let h = harness();
    let (sub, _) = h.connect("s", true);
    h.subscribe(sub, &[("t", 2)]);

    let (publisher, _) = h.connect("p", true);
    h.net
        .push_bytes(publisher, &publish_frame("t", b"x", 2, false, 50));
    h.pump();

    let delivered = h.sent(sub).into_iter().find(|f| f.msg_type() == 3).unwrap();
    assert_eq!(delivered.qos(), 2);
    let msg_id = delivered.publish_parts().1;

    h.net.push_bytes(sub, &msg_id_frame(0x50, msg_id));
    h.pump();
    let pubrel = h.sent(sub).into_iter().find(|f| f.msg_type() == 6).unwrap();
    assert_eq!(pubrel.byte1, 0x62);
    assert_eq!(pubrel.msg_id(), msg_id);

    h.net.push_bytes(sub, &msg_id_frame(0x70, msg_id));
    h.pump();

    let g = h.broker.lock();
    assert_eq!(g.sessions.get(0).qos2_tx.count(), 0);
}

#[test]
fn keep_alive_expiry_closes_and_reconciles() {
    let h = harness();

    // Persistent session with a subscription survives the close.
    let conn = h.net.connect(h.listener);
    h.pump();
    h.net
        .push_bytes(conn, &connect_frame("keeper", false, 10, None));
    h.pump();
    h.subscribe(conn, &[("t", 0)]);

    // Clean session dies with its connection.
    let conn2 = h.net.connect(h.listener);
    h.pump();
    h.net
        .push_bytes(conn2, &connect_frame("goner", true, 10, None));
    h.pump();

    // 10 s keep-alive with the default 50% grace expires after 15 s.
    h.net.advance_time(14);
    h.pump();
    assert!(!h.net.engine_closed(conn));

    h.net.advance_time(2);
    h.pump();
    assert!(h.net.engine_closed(conn));
    assert!(h.net.engine_closed(conn2));

    let g = h.broker.lock();
    assert!(g.sessions.get(0).in_use());
    assert!(!g.sessions.get(0).connected);
    assert!(!g.sessions.get(1).in_use());
}

#[test]
fn silent_connection_never_reaches_connect() {
    let h = harness();
    let conn = h.net.connect(h.listener);
    h.pump();

    // The accept-time provisional deadline (20 s default) applies
    // before any CONNECT arrives.
    h.net.advance_time(21);
    h.pump();
    assert!(h.net.engine_closed(conn));
}

#[test]
fn will_fires_on_unclean_close_only() {
    let h = harness();
    let (watcher, _) = h.connect("w", true);
    h.subscribe(watcher, &[("alerts/+", 0)]);

    // Unclean close dispatches the will.
    let (doomed, _) =
        h.connect_full(connect_frame("d1", true, 0, Some(("alerts/d1", b"gone", 0, false))));
    h.net.peer_close(doomed);
    h.pump();

    let frames = h.sent(watcher);
    let will = frames.iter().find(|f| f.msg_type() == 3).expect("will");
    let (topic, _, payload) = will.publish_parts();
    assert_eq!(topic, "alerts/d1");
    assert_eq!(payload, b"gone");

    // Clean DISCONNECT discards the will.
    let (polite, _) =
        h.connect_full(connect_frame("d2", true, 0, Some(("alerts/d2", b"gone", 0, false))));
    h.net.push_bytes(polite, &frame(0xE0, &[]));
    h.pump();

    assert!(h.net.engine_closed(polite));
    assert!(h.sent(watcher).iter().all(|f| f.msg_type() != 3));
}

#[test]
fn send_failure_closes_connection() {
    let h = harness();
    let (sub, _) = h.connect("s", true);
    h.subscribe(sub, &[("t", 0)]);
    h.net.fail_sends(sub);

    let (publisher, _) = h.connect("p", true);
    h.net
        .push_bytes(publisher, &publish_frame("t", b"x", 0, false, 0));
    h.pump();

    assert!(h.net.engine_closed(sub));
}

struct Recorder {
    seen: Arc<Mutex<Vec<(String, Vec<u8>, QoS)>>>,
}

impl Hook for Recorder {
    fn on_publish(&mut self, topic: &str, payload: &[u8], _dup: bool, qos: QoS, _retain: bool) {
        self.seen
            .lock()
            .push((topic.to_string(), payload.to_vec(), qos));
    }
}

#[test]
fn hooks_receive_enrolled_topics() {
    let h = harness();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook = h
        .broker
        .register_hook(Box::new(Recorder { seen: seen.clone() }))
        .unwrap();
    h.broker
        .enroll_topic(hook, "sys/stat", QoS::AtLeastOnce)
        .unwrap();

    let (publisher, _) = h.connect("p", true);
    h.net
        .push_bytes(publisher, &publish_frame("sys/stat", b"up", 2, false, 60));
    h.pump();

    let records = seen.lock();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, "sys/stat");
    assert_eq!(records[0].1, b"up");
    // Delivered at min(enrolled 1, published 2).
    assert_eq!(records[0].2, QoS::AtLeastOnce);
}

#[test]
fn application_publish_reaches_clients() {
    let h = harness();
    let (sub, _) = h.connect("s", true);
    h.subscribe(sub, &[("app/news", 0)]);

    h.broker
        .publish("app/news", b"hello", QoS::AtMostOnce, false)
        .unwrap();
    h.pump();

    let frames = h.sent(sub);
    assert_eq!(frames.len(), 1);
    let (topic, _, payload) = frames[0].publish_parts();
    assert_eq!(topic, "app/news");
    assert_eq!(payload, b"hello");
}
