//! EmberMQ - MQTT 3.1.1 message broker
//!
//! Clients connect over TCP (optionally TLS) and WebSocket, publish to
//! hierarchical topics and subscribe to wildcard filters. Peer brokers
//! federate through injected route connections. QoS 0 and 1 are supported;
//! QoS 2 publishes are dropped by design.

pub mod acl;
pub mod bridge;
pub mod broker;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod session;
pub mod topic;
pub mod transport;

pub use acl::{AclConfig, TopicAcl};
pub use bridge::{BridgeEvent, BridgeSink, LogBridge, NullBridge};
pub use broker::{Broker, BrokerConfig, ConnKind, Connection, TlsConfig};
pub use cluster::{Discovery, RouterInfo, BROKER_INFO_TOPIC};
pub use config::Config;
pub use protocol::{Packet, Publish, QoS};
pub use session::SessionStore;
pub use topic::TopicStore;
