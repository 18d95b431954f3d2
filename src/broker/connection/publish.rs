//! PUBLISH handling

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{Broker, ConnKind, Connection};
use crate::acl::AclAction;
use crate::bridge::{BridgeAction, BridgeEvent};
use crate::cluster::{RouterInfo, BROKER_INFO_TOPIC};
use crate::protocol::{Packet, PubAck, Publish, QoS};

impl Connection {
    pub(crate) async fn process_publish(
        self: &Arc<Self>,
        broker: &Arc<Broker>,
        publish: Publish,
    ) {
        match self.kind {
            ConnKind::Client => self.client_publish(broker, publish).await,
            ConnKind::Router => self.router_publish(broker, publish).await,
        }
    }

    async fn client_publish(self: &Arc<Self>, broker: &Arc<Broker>, publish: Publish) {
        if !self.is_connected() {
            return;
        }

        // 3.1.1 has no publish nack; denied publishes are dropped
        if !broker.acl().check(
            AclAction::Publish,
            &self.remote_ip,
            &self.username,
            &self.client_id,
            &publish.topic,
        ) {
            warn!(
                client_id = %self.client_id,
                topic = %publish.topic,
                "publish denied by acl"
            );
            return;
        }

        broker.bridge().deliver(
            BridgeEvent::new(&self.client_id, &self.username, BridgeAction::Publish)
                .with_topic(&publish.topic)
                .with_payload(&publish.payload),
        );

        match publish.qos {
            QoS::AtMostOnce => broker.publish_message(&publish).await,
            QoS::AtLeastOnce => {
                let Some(packet_id) = publish.packet_id else {
                    // The decoder guarantees an id for QoS 1
                    return;
                };
                if let Err(e) = self.write_packet(&Packet::PubAck(PubAck { packet_id })).await {
                    error!(client_id = %self.client_id, "send puback error: {}", e);
                    self.close(broker).await;
                    return;
                }
                broker.publish_message(&publish).await;
            }
            QoS::ExactlyOnce => {
                // Exactly-once delivery is not implemented; the publish is
                // dropped without acknowledgment
                debug!(
                    client_id = %self.client_id,
                    topic = %publish.topic,
                    "dropping qos 2 publish"
                );
            }
        }
    }

    /// Route connections may only announce peer identity; anything else is
    /// dropped so federated traffic cannot loop between brokers.
    async fn router_publish(self: &Arc<Self>, broker: &Arc<Broker>, publish: Publish) {
        if !self.is_connected() {
            return;
        }

        if publish.topic.as_ref() == BROKER_INFO_TOPIC {
            self.process_info(broker, &publish);
        } else {
            debug!(
                remote = %self.client_id,
                topic = %publish.topic,
                "dropping publish from route connection"
            );
        }
    }

    fn process_info(self: &Arc<Self>, broker: &Arc<Broker>, publish: &Publish) {
        match serde_json::from_slice::<RouterInfo>(&publish.payload) {
            Ok(info) => broker.update_router(self, info),
            Err(e) => warn!(remote = %self.client_id, "malformed broker info payload: {}", e),
        }
    }
}
