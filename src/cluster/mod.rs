//! Cluster federation surface
//!
//! Discovery and peer dialing live outside the core. The broker exposes two
//! seams: route connections are injected through
//! [`crate::broker::Broker::accept_router`], and a [`Discovery`] handle is
//! notified when a route connection drops so the external client can
//! re-dial. Peer identity travels over the broker-info topic as a private
//! JSON blob.

use serde::{Deserialize, Serialize};

/// Reserved publish topic carrying peer identity between brokers.
pub const BROKER_INFO_TOPIC: &str = "broker000100101info";

/// Peer identity announced over the broker-info topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterInfo {
    #[serde(rename = "brokerID")]
    pub broker_id: String,
    #[serde(rename = "brokerUrl")]
    pub broker_url: String,
}

/// Hook back into the external discovery client.
pub trait Discovery: Send + Sync {
    /// Called when the route connection to `remote_id` has closed.
    fn router_lost(&self, remote_id: &str);
}

/// Discovery handle that does nothing; used when clustering is off.
pub struct NoDiscovery;

impl Discovery for NoDiscovery {
    fn router_lost(&self, _remote_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_info_wire_format() {
        let info = RouterInfo {
            broker_id: "node-2".to_string(),
            broker_url: "10.0.0.2:1883".to_string(),
        };
        let json = serde_json::to_string(&info).expect("serialize");
        assert_eq!(json, r#"{"brokerID":"node-2","brokerUrl":"10.0.0.2:1883"}"#);
        let parsed: RouterInfo = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, info);
    }
}
