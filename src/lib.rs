//! EmberQ - Embeddable MQTT v3.1/v3.1.1 broker engine
//!
//! A fixed-capacity MQTT server engine designed for constrained
//! networked devices: wire codec, topic tree with retained-message and
//! will handling, client/session registry with QoS 0/1/2
//! acknowledgement tracking, all behind an abstract transport
//! capability so the same engine runs over TCP, TLS or an in-memory
//! harness.

pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;

pub use broker::{Broker, EngineConfig};
pub use config::Config;
pub use hooks::{Hook, HookRegistry};
pub use protocol::{ConnectReturnCode, Error, PacketType, QoS, Result};
pub use session::{ClientSet, SessionTable, MAX_CLIENTS};
pub use topic::TopicTree;
pub use transport::{MemoryTransport, NetHandle, NetServices, SecureConn, TcpTransport};
