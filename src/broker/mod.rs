//! MQTT Server Engine
//!
//! The engine owns every piece of shared state (topic tree, session
//! table, connection contexts, packet pool, hooks) behind one mutex,
//! the single lock domain. A dedicated thread runs [`Broker::run`],
//! blocking in the transport's readiness monitor; application threads
//! call the publish/enroll entry points, which take the same mutex and
//! nudge the loop through the loopback wake-up channel when it needs
//! to reconsider state.

mod connection;
mod router;

#[cfg(test)]
mod tests;

pub use connection::ConnId;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::codec::{Packet, PacketPool};
use crate::hooks::{Hook, HookRegistry};
use crate::protocol::{Error, QoS, Result};
use crate::session::SessionTable;
use crate::topic::{self, TopicTree};
use crate::transport::{NetHandle, NetServices};

use connection::ConnTable;

/// Engine configuration. Every capacity is a hard bound: pools never
/// grow, so memory use is fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// MQTT listener port
    pub listener_port: u16,
    /// Local UDP port for the wake-up channel; 0 disables it
    pub loopback_port: u16,
    /// Maximum concurrently open network connections
    pub max_connections: usize,
    /// Topic tree arena capacity
    pub max_topic_nodes: usize,
    /// Bound on one topic level's length
    pub max_subtop_len: usize,
    /// Bound on the client identifier length
    pub max_client_id_len: usize,
    /// Packet pool capacity
    pub max_packets: usize,
    /// Receive buffer budget per packet
    pub rx_buffer: usize,
    /// Transmit buffer budget per packet
    pub tx_buffer: usize,
    /// Keep-alive grace in percent of the negotiated interval
    /// (50 stretches a 60 s keep-alive to a 90 s deadline)
    pub ka_grace_percent: u32,
    /// How long a fresh connection may take to deliver CONNECT
    pub connect_timeout: Duration,
    /// Wait for continuation bytes mid-packet
    pub recv_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            listener_port: 1883,
            loopback_port: 1882,
            max_connections: 16,
            max_topic_nodes: 128,
            max_subtop_len: 32,
            max_client_id_len: 64,
            max_packets: 32,
            rx_buffer: 1024,
            tx_buffer: 1024,
            ka_grace_percent: 50,
            connect_timeout: Duration::from_secs(20),
            recv_timeout: Duration::from_secs(5),
        }
    }
}

/// All engine state under the single lock
pub(crate) struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) tree: TopicTree,
    pub(crate) sessions: SessionTable,
    pub(crate) conns: ConnTable,
    pub(crate) pool: PacketPool,
    pub(crate) hooks: HookRegistry,
    pub(crate) rx: Packet,
    pub(crate) listen: Option<NetHandle>,
    pub(crate) loopb: Option<NetHandle>,
    pub(crate) pending_trigs: bool,
}

/// The MQTT server engine
pub struct Broker {
    net: Arc<dyn NetServices>,
    inner: Mutex<Engine>,
}

impl Broker {
    pub fn new(cfg: EngineConfig, net: Arc<dyn NetServices>) -> Self {
        let engine = Engine {
            tree: TopicTree::new(cfg.max_topic_nodes, cfg.max_subtop_len),
            sessions: SessionTable::new(),
            conns: ConnTable::new(cfg.max_connections),
            pool: PacketPool::new(cfg.max_packets, cfg.tx_buffer),
            hooks: HookRegistry::new(),
            rx: Packet::new(cfg.rx_buffer),
            listen: None,
            loopb: None,
            pending_trigs: false,
            cfg,
        };

        Broker {
            net,
            inner: Mutex::new(engine),
        }
    }

    /// Run the server loop on the calling thread. Returns only on a
    /// library-fatal condition; the caller must reinitialize the engine
    /// before serving again.
    pub fn run(&self) -> Result<()> {
        self.bind()?;
        loop {
            self.run_once()?;
        }
    }

    /// Open the listener and, when configured, the loopback wake-up
    /// port. Failure of either is library-fatal.
    pub fn bind(&self) -> Result<()> {
        let mut g = self.inner.lock();

        if g.cfg.loopback_port != 0 {
            let h = self
                .net
                .open_loopback(g.cfg.loopback_port)
                .map_err(|_| Error::Fatal("cannot open loopback port"))?;
            g.loopb = Some(h);
        }

        let listener = self
            .net
            .listen(g.cfg.listener_port, None)
            .map_err(|_| Error::Fatal("cannot open listener"))?;
        g.listen = Some(listener);

        info!("serving MQTT on port {}", g.cfg.listener_port);
        Ok(())
    }

    /// One iteration of the server loop: sweep keep-alive deadlines,
    /// block in the readiness monitor until the nearest deadline, then
    /// service every ready handle under the lock.
    pub fn run_once(&self) -> Result<()> {
        let (handles, wait) = {
            let mut g = self.inner.lock();
            let wait = g.sweep_keep_alive(self.net.as_ref());

            let mut handles = Vec::with_capacity(g.cfg.max_connections + 2);
            if let Some(h) = g.listen {
                handles.push(h);
            }
            if let Some(h) = g.loopb {
                handles.push(h);
            }
            g.conns.live_handles(&mut handles);

            (handles, wait)
        };

        let ready = self.net.io_mon(&handles, wait)?;

        let mut g = self.inner.lock();
        for h in ready {
            if g.listen == Some(h) {
                g.accept_conn(self.net.as_ref());
            } else if g.loopb == Some(h) {
                g.proc_loopback(self.net.as_ref())?;
            } else {
                g.proc_net_data(self.net.as_ref(), h);
            }
        }

        Ok(())
    }

    // --- application surface ----------------------------------------------

    /// Publish a message from the embedding application, fanning it out
    /// to subscribers exactly as a client publish would (minus any
    /// acknowledgement flow back to the publisher).
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<()> {
        let normalized = topic::normalize(topic);
        if !topic::validate_topic_name(&normalized) {
            return Err(Error::BadArg("invalid publish topic"));
        }

        let mut g = self.inner.lock();
        g.route_publish(self.net.as_ref(), &normalized, payload, qos, retain);
        Ok(())
    }

    /// Register an application hook. Fails when all hook slots are in
    /// use.
    pub fn register_hook(&self, hook: Box<dyn Hook>) -> Result<usize> {
        let mut g = self.inner.lock();
        g.hooks
            .register(hook)
            .ok_or(Error::BadState("all hook slots in use"))
    }

    /// Enroll a hook as a virtual subscriber on a topic filter
    pub fn enroll_topic(&self, hook: usize, filter: &str, qos: QoS) -> Result<()> {
        let normalized = topic::normalize(filter);
        if !topic::validate_topic_filter(&normalized) {
            return Err(Error::BadArg("invalid topic filter"));
        }

        let mut g = self.inner.lock();
        if !g.hooks.is_registered(hook) {
            return Err(Error::BadArg("no such hook"));
        }

        let node = g
            .tree
            .create(&normalized)
            .ok_or(Error::BadState("topic tree exhausted"))?;
        g.tree.hook_map_mut(node).enroll(hook, qos);
        Ok(())
    }

    /// Cancel a hook's enrollment on a topic filter. Unknown filters
    /// are a no-op.
    pub fn cancel_topic(&self, hook: usize, filter: &str) -> Result<()> {
        let normalized = topic::normalize(filter);

        let mut g = self.inner.lock();
        if let Some(node) = g.tree.find(&normalized) {
            g.tree.hook_map_mut(node).cancel(hook);
            g.tree.try_delete(node);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Engine> {
        self.inner.lock()
    }
}
