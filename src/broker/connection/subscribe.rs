//! SUBSCRIBE and UNSUBSCRIBE handling

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{Broker, ConnKind, Connection};
use crate::acl::AclAction;
use crate::bridge::{BridgeAction, BridgeEvent};
use crate::protocol::{
    Packet, Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe, QOS_FAILURE,
};
use crate::topic::{parse_shared, RetainedMessage, Subscription};

impl Connection {
    /// Build the trie record for a filter as received in SUBSCRIBE.
    ///
    /// The session and the connection's sub-map key by the original string;
    /// the trie registers under the inner filter with the share group kept
    /// on the record, so unsubscribes resolve the original key first and
    /// remove by the inner one.
    pub(crate) fn make_subscription(
        self: &Arc<Self>,
        original: &str,
        qos: QoS,
    ) -> Option<Subscription> {
        let (filter, shared, group) = if original.starts_with("$share/") {
            let (group, inner) = parse_shared(original)?;
            (inner, true, Some(group))
        } else {
            (original, false, None)
        };

        Some(Subscription {
            conn_id: self.id,
            conn: Arc::downgrade(self),
            client_id: self.client_id.clone(),
            filter: filter.into(),
            origin: original.into(),
            qos,
            shared,
            group: group.map(Into::into),
        })
    }

    pub(crate) async fn process_subscribe(
        self: &Arc<Self>,
        broker: &Arc<Broker>,
        packet: Subscribe,
    ) {
        if !self.is_connected() {
            return;
        }

        let mut return_codes = Vec::with_capacity(packet.filters.len());
        let mut retained: Vec<(RetainedMessage, QoS)> = Vec::new();

        for req in &packet.filters {
            let original = req.filter.as_str();

            // Route connections subscribe on behalf of remote brokers and
            // bypass the client-facing ACL and bridge
            if self.kind == ConnKind::Client {
                if !broker.acl().check(
                    AclAction::Subscribe,
                    &self.remote_ip,
                    &self.username,
                    &self.client_id,
                    original,
                ) {
                    warn!(
                        client_id = %self.client_id,
                        filter = %original,
                        "subscribe denied by acl"
                    );
                    return_codes.push(QOS_FAILURE);
                    continue;
                }

                broker.bridge().deliver(
                    BridgeEvent::new(&self.client_id, &self.username, BridgeAction::Subscribe)
                        .with_topic(original),
                );
            }

            let Some(sub) = self.make_subscription(original, req.qos) else {
                // Malformed $share filter
                return_codes.push(QOS_FAILURE);
                continue;
            };
            let inner = sub.filter.clone();

            let granted = match broker.topics().subscribe(sub.clone()) {
                Ok(granted) => granted,
                Err(e) => {
                    error!(
                        client_id = %self.client_id,
                        filter = %original,
                        "subscribe error: {}", e
                    );
                    return_codes.push(QOS_FAILURE);
                    continue;
                }
            };

            {
                let mut granted_sub = sub;
                granted_sub.qos = granted;
                self.sub_map
                    .lock()
                    .insert(original.to_string(), granted_sub);
            }
            self.session
                .write()
                .add_filter(original.to_string(), granted);

            for msg in broker.topics().retained(&inner) {
                retained.push((msg, granted));
            }

            return_codes.push(granted as u8);
            debug!(
                client_id = %self.client_id,
                filter = %original,
                granted = granted as u8,
                "subscribed"
            );
        }

        let suback = Packet::SubAck(SubAck {
            packet_id: packet.packet_id,
            return_codes,
        });
        if let Err(e) = self.write_packet(&suback).await {
            error!(client_id = %self.client_id, "send suback error: {}", e);
            self.close(broker).await;
            return;
        }

        // Retained copies follow the SUBACK, flagged retain=true
        for (msg, granted) in retained {
            let qos = msg.qos.min(granted);
            let publish = Publish {
                dup: false,
                qos,
                retain: true,
                topic: msg.topic.clone(),
                packet_id: (qos != QoS::AtMostOnce).then(|| self.next_packet_id()),
                payload: msg.payload.clone(),
            };
            if let Err(e) = self.write_packet(&Packet::Publish(publish)).await {
                error!(
                    client_id = %self.client_id,
                    topic = %msg.topic,
                    "error publishing retained message: {}", e
                );
            }
        }
    }

    pub(crate) async fn process_unsubscribe(
        self: &Arc<Self>,
        broker: &Arc<Broker>,
        packet: Unsubscribe,
    ) {
        if !self.is_connected() {
            return;
        }

        for filter in &packet.filters {
            if self.kind == ConnKind::Client {
                broker.bridge().deliver(
                    BridgeEvent::new(&self.client_id, &self.username, BridgeAction::Unsubscribe)
                        .with_topic(filter),
                );
            }

            let sub = self.sub_map.lock().remove(filter.as_str());
            if let Some(sub) = sub {
                broker
                    .topics()
                    .unsubscribe(&sub.filter, &sub.client_id, sub.group.as_deref());
                self.session.write().remove_filter(filter);
            }
        }

        let unsuback = Packet::UnsubAck(UnsubAck {
            packet_id: packet.packet_id,
        });
        if let Err(e) = self.write_packet(&unsuback).await {
            error!(client_id = %self.client_id, "send unsuback error: {}", e);
            self.close(broker).await;
        }
    }
}
