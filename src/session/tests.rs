//! Session registry, QoS2 window and wait-list tests

use pretty_assertions::assert_eq;

use crate::broker::ConnId;
use crate::codec::PacketPool;
use crate::protocol::ConnectReturnCode;
use crate::session::{
    AckWaitList, ClientSet, CloseOutcome, Qos2Queue, SessionTable, MAX_QOS2_INFLIGHT,
};

#[test]
fn client_set_operations() {
    let mut set = ClientSet::empty();
    assert!(set.is_empty());

    set.insert(0);
    set.insert(31);
    assert!(set.contains(0));
    assert!(set.contains(31));
    assert!(!set.contains(5));
    assert_eq!(set.len(), 2);
    assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 31]);

    let other = ClientSet::single(31);
    assert_eq!(set.intersect(other), other);
    assert_eq!(set.difference(other), ClientSet::single(0));

    set.remove(0);
    set.remove(31);
    assert!(set.is_empty());
}

#[test]
fn qos2_window_enforces_fifo_order() {
    let mut q = Qos2Queue::new();
    assert!(q.logup(10));
    assert!(q.logup(11));
    assert!(q.logup(12));

    // Only the oldest id can be removed.
    assert!(!q.unlog(11));
    assert!(q.unlog(10));
    assert!(q.unlog(11));
    assert!(q.unlog(12));
    assert!(!q.unlog(12));
    assert_eq!(q.count(), 0);
}

#[test]
fn qos2_window_fills_without_corruption() {
    let mut q = Qos2Queue::new();
    for id in 0..MAX_QOS2_INFLIGHT as u16 {
        assert!(q.logup(100 + id));
    }
    assert!(!q.logup(999));
    assert_eq!(q.count(), MAX_QOS2_INFLIGHT);

    // Every logged id is still present, the rejected one is not.
    for id in 0..MAX_QOS2_INFLIGHT as u16 {
        assert!(q.check(100 + id));
    }
    assert!(!q.check(999));

    // And FIFO order survives the full state.
    assert!(q.unlog(100));
    assert!(q.logup(999));
    assert!(q.check(999));
}

#[test]
fn wait_list_tracks_per_client_bits() {
    let mut pool = PacketPool::new(4, 64);
    let mut list = AckWaitList::new();

    let pkt = pool.alloc().unwrap();
    {
        let p = pool.get_mut(pkt);
        p.msg_id = 7;
        p.pending = ClientSet::single(1).union(ClientSet::single(2));
    }
    list.append(&mut pool, pkt);

    // First ack clears one bit; the packet stays.
    assert!(list.ack(&mut pool, 7, ClientSet::single(1)));
    assert!(!list.is_empty());
    assert!(list.holds_client(&pool, ClientSet::single(2)));
    assert!(!list.holds_client(&pool, ClientSet::single(1)));

    // An ack from a client that owes nothing finds no entry.
    assert!(!list.ack(&mut pool, 7, ClientSet::single(1)));

    // The last ack drains the packet back to the pool.
    let free_before = pool.free_count();
    assert!(list.ack(&mut pool, 7, ClientSet::single(2)));
    assert!(list.is_empty());
    assert_eq!(pool.free_count(), free_before + 1);
}

#[test]
fn wait_list_purge_client_drains_entries() {
    let mut pool = PacketPool::new(4, 64);
    let mut list = AckWaitList::new();

    for msg_id in [1u16, 2, 3] {
        let pkt = pool.alloc().unwrap();
        {
            let p = pool.get_mut(pkt);
            p.msg_id = msg_id;
            p.pending = if msg_id == 2 {
                ClientSet::single(0).union(ClientSet::single(1))
            } else {
                ClientSet::single(0)
            };
        }
        list.append(&mut pool, pkt);
    }

    list.purge_client(&mut pool, ClientSet::single(0));

    // Only the entry also owed by client 1 survives.
    assert!(!list.is_empty());
    assert!(list.holds_client(&pool, ClientSet::single(1)));
    assert_eq!(pool.free_count(), 3);
}

#[test]
fn assign_resolves_client_ids() {
    let mut table = SessionTable::new();

    let first = table.assign(Some("sensor-1"), false).unwrap();
    assert!(!first.session_present);
    table.on_connack_sent(first.index, ConnId(0));

    // A live slot rejects a duplicate client id.
    assert_eq!(
        table.assign(Some("sensor-1"), false),
        Err(ConnectReturnCode::IdentifierRejected)
    );

    // A different id lands in a different slot.
    let second = table.assign(Some("sensor-2"), true).unwrap();
    assert_ne!(second.index, first.index);
}

#[test]
fn assign_resumes_persistent_session() {
    let mut pool = PacketPool::new(2, 64);
    let mut table = SessionTable::new();

    let outcome = table.assign(Some("sensor-1"), false).unwrap();
    let idx = outcome.index;
    table.on_connack_sent(idx, ConnId(0));
    table.get_mut(idx).sub_count = 1;

    assert_eq!(table.on_net_close(idx, &mut pool), CloseOutcome::Preserved);
    assert!(!table.get(idx).connected);

    let resumed = table.assign(Some("sensor-1"), false).unwrap();
    assert_eq!(resumed.index, idx);
    assert!(resumed.session_present);

    // Resuming with clean-session forgets the history.
    table.get_mut(idx).assigned = false;
    let clean = table.assign(Some("sensor-1"), true).unwrap();
    assert_eq!(clean.index, idx);
    assert!(!clean.session_present);
}

#[test]
fn assign_synthesizes_absent_client_id() {
    let mut table = SessionTable::new();
    let outcome = table.assign(None, true).unwrap();
    assert!(!table.get(outcome.index).client_id.is_empty());
}

#[test]
fn assign_degrades_when_table_is_full() {
    let mut table = SessionTable::new();
    for i in 0..crate::session::MAX_CLIENTS {
        table.assign(Some(&format!("client-{}", i)), true).unwrap();
    }
    assert_eq!(
        table.assign(Some("one-too-many"), true),
        Err(ConnectReturnCode::ServerUnavailable)
    );
}

#[test]
fn close_deletes_clean_sessions() {
    let mut pool = PacketPool::new(2, 64);
    let mut table = SessionTable::new();

    let outcome = table.assign(Some("c"), true).unwrap();
    let idx = outcome.index;
    table.on_connack_sent(idx, ConnId(0));
    table.get_mut(idx).sub_count = 2;

    assert_eq!(table.on_net_close(idx, &mut pool), CloseOutcome::Deleted);
    assert!(!table.get(idx).in_use());
}

#[test]
fn close_frees_never_acknowledged_slots() {
    let mut pool = PacketPool::new(2, 64);
    let mut table = SessionTable::new();

    // CONNECT processed, CONNACK never sent, nothing accumulated.
    let outcome = table.assign(Some("half-open"), false).unwrap();
    assert_eq!(
        table.on_net_close(outcome.index, &mut pool),
        CloseOutcome::Deleted
    );
    assert!(!table.get(outcome.index).in_use());
}

#[test]
fn parked_packets_count_as_session_data() {
    let mut pool = PacketPool::new(2, 64);
    let mut table = SessionTable::new();

    let outcome = table.assign(Some("p"), false).unwrap();
    let idx = outcome.index;
    table.on_connack_sent(idx, ConnId(0));

    let pkt = pool.alloc().unwrap();
    pool.get_mut(pkt).msg_id = 9;
    pool.get_mut(pkt).pending = ClientSet::single(idx);
    table.stale_list.append(&mut pool, pkt);

    assert!(table.has_session_data(idx, &pool));
    assert_eq!(table.on_net_close(idx, &mut pool), CloseOutcome::Preserved);

    // Deleting the session purges the parked packet.
    table.get_mut(idx).clean_session = true;
    table.get_mut(idx).connected = true;
    assert_eq!(table.on_net_close(idx, &mut pool), CloseOutcome::Deleted);
    assert_eq!(pool.free_count(), 2);
}
