//! End-to-end broker tests over real TCP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use embermq::acl::{Access, AclConfig, AclRule, Scope, Subject, TopicAcl};
use embermq::bridge::NullBridge;
use embermq::broker::{Broker, BrokerConfig};
use embermq::cluster::{RouterInfo, BROKER_INFO_TOPIC};
use embermq::codec::{encode, Decoder};
use embermq::protocol::{
    ConnAck, Connect, ConnectReturnCode, FilterRequest, Packet, PubAck, Publish, QoS, Subscribe,
    Unsubscribe, Will,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_TIMEOUT: Duration = Duration::from_millis(300);

async fn start_broker() -> (Arc<Broker>, SocketAddr) {
    start_broker_with(BrokerConfig {
        workers: 8,
        ..BrokerConfig::default()
    })
    .await
}

async fn start_broker_with(config: BrokerConfig) -> (Arc<Broker>, SocketAddr) {
    let broker = Arc::new(Broker::new(config));
    serve(&broker).await
}

async fn start_broker_with_acl(rules: Vec<AclRule>) -> (Arc<Broker>, SocketAddr) {
    let acl = TopicAcl::new(AclConfig {
        enabled: true,
        rules,
    });
    let broker = Arc::new(Broker::with_parts(
        BrokerConfig {
            workers: 8,
            ..BrokerConfig::default()
        },
        acl,
        Arc::new(NullBridge),
    ));
    serve(&broker).await
}

async fn serve(broker: &Arc<Broker>) -> (Arc<Broker>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.serve(listener).await;
    });
    (broker.clone(), addr)
}

/// Minimal MQTT 3.1.1 client speaking through the crate's own codec.
struct TestClient {
    stream: TcpStream,
    decoder: Decoder,
    buf: BytesMut,
    next_packet_id: u16,
}

impl TestClient {
    async fn connect(addr: SocketAddr, client_id: &str) -> Self {
        let (client, connack) = Self::connect_full(addr, client_id, true, 30, None).await;
        assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
        client
    }

    async fn connect_full(
        addr: SocketAddr,
        client_id: &str,
        clean_session: bool,
        keep_alive: u16,
        will: Option<Will>,
    ) -> (Self, ConnAck) {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut client = Self {
            stream,
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(1024),
            next_packet_id: 1,
        };

        client
            .send(Packet::Connect(Box::new(Connect {
                client_id: client_id.to_string(),
                clean_session,
                keep_alive,
                will,
                ..Connect::default()
            })))
            .await;

        match client.recv().await {
            Packet::ConnAck(connack) => (client, connack),
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn send(&mut self, packet: Packet) {
        let mut out = BytesMut::new();
        encode(&packet, &mut out).expect("encode");
        self.stream.write_all(&out).await.expect("write");
    }

    async fn recv(&mut self) -> Packet {
        match timeout(RECV_TIMEOUT, self.recv_inner()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => panic!("connection closed while waiting for packet"),
            Err(_) => panic!("timed out waiting for packet"),
        }
    }

    /// Receive a packet, or None after a short quiet period.
    async fn try_recv(&mut self) -> Option<Packet> {
        match timeout(QUIET_TIMEOUT, self.recv_inner()).await {
            Ok(packet) => packet,
            Err(_) => None,
        }
    }

    async fn recv_inner(&mut self) -> Option<Packet> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.buf).expect("decode") {
                self.buf.advance(consumed);
                return Some(packet);
            }
            let n = self.stream.read_buf(&mut self.buf).await.expect("read");
            if n == 0 {
                return None;
            }
        }
    }

    /// Wait for the broker to hang up on us.
    async fn expect_closed(&mut self) {
        match timeout(RECV_TIMEOUT, self.recv_inner()).await {
            Ok(None) => {}
            Ok(Some(packet)) => panic!("expected close, got {:?}", packet),
            Err(_) => panic!("timed out waiting for close"),
        }
    }

    fn packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id += 1;
        id
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Vec<u8> {
        let packet_id = self.packet_id();
        self.send(Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![FilterRequest {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;

        match self.recv().await {
            Packet::SubAck(suback) => {
                assert_eq!(suback.packet_id, packet_id);
                suback.return_codes
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        let packet_id = (qos != QoS::AtMostOnce).then(|| self.packet_id());
        self.send(Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.into(),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;

        if let Some(packet_id) = packet_id {
            match self.recv().await {
                Packet::PubAck(PubAck { packet_id: acked }) => assert_eq!(acked, packet_id),
                other => panic!("expected PUBACK, got {:?}", other),
            }
        }
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn connect_and_ping() {
    let (_broker, addr) = start_broker().await;
    let mut client = TestClient::connect(addr, "pinger").await;

    client.send(Packet::PingReq).await;
    assert_eq!(client.recv().await, Packet::PingResp);
}

#[tokio::test]
async fn rejects_unknown_protocol_level() {
    let (_broker, addr) = start_broker().await;
    let stream = TcpStream::connect(addr).await.expect("connect");
    let mut client = TestClient {
        stream,
        decoder: Decoder::new(),
        buf: BytesMut::new(),
        next_packet_id: 1,
    };
    client
        .send(Packet::Connect(Box::new(Connect {
            protocol_level: 3,
            client_id: "old".to_string(),
            ..Connect::default()
        })))
        .await;

    match client.recv().await {
        Packet::ConnAck(connack) => assert_eq!(
            connack.return_code,
            ConnectReturnCode::UnacceptableProtocolVersion
        ),
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

#[tokio::test]
async fn qos0_publish_reaches_wildcard_subscriber() {
    let (_broker, addr) = start_broker().await;
    let mut subscriber = TestClient::connect(addr, "sub").await;
    let mut publisher = TestClient::connect(addr, "pub").await;

    assert_eq!(subscriber.subscribe("a/+", QoS::AtMostOnce).await, vec![0]);
    publisher.publish("a/b", b"hello", QoS::AtMostOnce, false).await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "a/b");
    assert_eq!(publish.payload.as_ref(), b"hello");
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(!publish.retain);
}

#[tokio::test]
async fn qos1_retained_flow() {
    let (_broker, addr) = start_broker().await;
    let mut c1 = TestClient::connect(addr, "c1").await;
    let mut c2 = TestClient::connect(addr, "c2").await;

    assert_eq!(c1.subscribe("a/+", QoS::AtLeastOnce).await, vec![1]);

    // publish() asserts the PUBACK for us
    c2.publish("a/b", b"hello", QoS::AtLeastOnce, true).await;

    // Live delivery arrives at QoS 1 with the retain flag cleared
    let publish = c1.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "a/b");
    assert_eq!(publish.payload.as_ref(), b"hello");
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(!publish.retain);
    assert!(publish.packet_id.is_some());

    // A later subscriber gets the retained copy, flagged retain=true
    let mut c3 = TestClient::connect(addr, "c3").await;
    assert_eq!(c3.subscribe("a/#", QoS::AtLeastOnce).await, vec![1]);
    let retained = c3.expect_publish().await;
    assert_eq!(retained.topic.as_ref(), "a/b");
    assert_eq!(retained.payload.as_ref(), b"hello");
    assert!(retained.retain);
    assert!(!retained.dup);
}

#[tokio::test]
async fn empty_payload_clears_retained() {
    let (_broker, addr) = start_broker().await;
    let mut publisher = TestClient::connect(addr, "pub").await;

    publisher.publish("state/x", b"on", QoS::AtMostOnce, true).await;
    publisher.publish("state/x", b"", QoS::AtMostOnce, true).await;

    // A ping round-trip guarantees both publishes were processed, since
    // work for one client-id is ordered
    publisher.send(Packet::PingReq).await;
    assert_eq!(publisher.recv().await, Packet::PingResp);

    let mut subscriber = TestClient::connect(addr, "sub").await;
    subscriber.subscribe("state/#", QoS::AtMostOnce).await;
    assert!(subscriber.try_recv().await.is_none());
}

#[tokio::test]
async fn qos2_publish_is_dropped_without_ack() {
    let (_broker, addr) = start_broker().await;
    let mut subscriber = TestClient::connect(addr, "sub").await;
    let mut publisher = TestClient::connect(addr, "pub").await;

    subscriber.subscribe("t/#", QoS::AtLeastOnce).await;

    publisher
        .send(Packet::Publish(Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "t/x".into(),
            packet_id: Some(9),
            payload: Bytes::from_static(b"never"),
        }))
        .await;

    // No PUBREC comes back and nothing is delivered
    assert!(publisher.try_recv().await.is_none());
    assert!(subscriber.try_recv().await.is_none());

    // The connection is still healthy
    publisher.send(Packet::PingReq).await;
    assert_eq!(publisher.recv().await, Packet::PingResp);
}

#[tokio::test]
async fn subscription_grants_cap_at_qos1() {
    let (_broker, addr) = start_broker().await;
    let mut client = TestClient::connect(addr, "c1").await;
    assert_eq!(client.subscribe("t", QoS::ExactlyOnce).await, vec![1]);
}

#[tokio::test]
async fn malformed_shared_filter_fails_in_suback() {
    let (_broker, addr) = start_broker().await;
    let mut client = TestClient::connect(addr, "c1").await;

    let packet_id = client.packet_id();
    client
        .send(Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![
                FilterRequest {
                    filter: "$share//broken".to_string(),
                    qos: QoS::AtMostOnce,
                },
                FilterRequest {
                    filter: "ok/topic".to_string(),
                    qos: QoS::AtMostOnce,
                },
            ],
        }))
        .await;

    match client.recv().await {
        Packet::SubAck(suback) => assert_eq!(suback.return_codes, vec![0x80, 0x00]),
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn shared_group_delivers_each_message_to_exactly_one_member() {
    let (broker, addr) = start_broker().await;
    broker.set_rng_seed(7);

    let mut worker_a = TestClient::connect(addr, "worker-a").await;
    let mut worker_b = TestClient::connect(addr, "worker-b").await;
    assert_eq!(
        worker_a.subscribe("$share/g1/work/#", QoS::AtMostOnce).await,
        vec![0]
    );
    assert_eq!(
        worker_b.subscribe("$share/g1/work/#", QoS::AtMostOnce).await,
        vec![0]
    );

    let mut publisher = TestClient::connect(addr, "pub").await;
    for i in 0..10u8 {
        publisher
            .publish("work/x", &[i], QoS::AtMostOnce, false)
            .await;
    }

    let mut seen = Vec::new();
    while let Some(Packet::Publish(p)) = worker_a.try_recv().await {
        seen.push(p.payload[0]);
    }
    while let Some(Packet::Publish(p)) = worker_b.try_recv().await {
        seen.push(p.payload[0]);
    }

    // Every message went to exactly one member of the group
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<u8>>());
}

#[tokio::test]
async fn acl_deny_pub_does_not_block_sub() {
    let (_broker, addr) = start_broker_with_acl(vec![AclRule {
        subject: Subject::Username,
        value: "*".to_string(),
        topics: vec!["secret/%u".to_string()],
        access: Access::Deny,
        scope: Scope::Pub,
    }])
    .await;

    let stream = TcpStream::connect(addr).await.expect("connect");
    let mut alice = TestClient {
        stream,
        decoder: Decoder::new(),
        buf: BytesMut::new(),
        next_packet_id: 1,
    };
    alice
        .send(Packet::Connect(Box::new(Connect {
            client_id: "alice-client".to_string(),
            username: Some("alice".to_string()),
            ..Connect::default()
        })))
        .await;
    match alice.recv().await {
        Packet::ConnAck(connack) => {
            assert_eq!(connack.return_code, ConnectReturnCode::Accepted)
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }

    // The deny-pub rule grants the subscribe
    assert_eq!(alice.subscribe("secret/alice", QoS::AtMostOnce).await, vec![0]);

    // Publishing to the same topic is silently dropped
    alice
        .publish("secret/alice", b"leak", QoS::AtMostOnce, false)
        .await;
    assert!(alice.try_recv().await.is_none());
}

#[tokio::test]
async fn duplicate_client_id_takes_over() {
    let (_broker, addr) = start_broker().await;

    let (mut first, connack) =
        TestClient::connect_full(addr, "k", false, 30, None).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(!connack.session_present);
    assert_eq!(first.subscribe("t/#", QoS::AtLeastOnce).await, vec![1]);

    // Same client-id connects again: the old socket is closed and the
    // persistent session's subscriptions move to the new connection
    let (mut second, connack) =
        TestClient::connect_full(addr, "k", false, 30, None).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(connack.session_present);
    first.expect_closed().await;

    let mut publisher = TestClient::connect(addr, "pub").await;
    publisher.publish("t/x", b"moved", QoS::AtMostOnce, false).await;

    let publish = second.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "t/x");
    assert_eq!(publish.payload.as_ref(), b"moved");
}

#[tokio::test]
async fn clean_session_discards_subscriptions() {
    let (_broker, addr) = start_broker().await;

    let (mut first, _) = TestClient::connect_full(addr, "c", false, 30, None).await;
    first.subscribe("t/#", QoS::AtMostOnce).await;
    first.send(Packet::Disconnect).await;
    first.expect_closed().await;

    // clean_session=1 replaces the stored session outright
    let (mut second, connack) = TestClient::connect_full(addr, "c", true, 30, None).await;
    assert!(!connack.session_present);

    let mut publisher = TestClient::connect(addr, "pub").await;
    publisher.publish("t/x", b"gone", QoS::AtMostOnce, false).await;
    assert!(second.try_recv().await.is_none());
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (_broker, addr) = start_broker().await;
    let mut subscriber = TestClient::connect(addr, "sub").await;
    let mut publisher = TestClient::connect(addr, "pub").await;

    subscriber.subscribe("n/+", QoS::AtMostOnce).await;

    let packet_id = subscriber.packet_id();
    subscriber
        .send(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: vec!["n/+".to_string()],
        }))
        .await;
    match subscriber.recv().await {
        Packet::UnsubAck(unsuback) => assert_eq!(unsuback.packet_id, packet_id),
        other => panic!("expected UNSUBACK, got {:?}", other),
    }

    publisher.publish("n/1", b"x", QoS::AtMostOnce, false).await;
    assert!(subscriber.try_recv().await.is_none());
}

#[tokio::test]
async fn keepalive_timeout_publishes_will() {
    let (_broker, addr) = start_broker().await;

    let mut observer = TestClient::connect(addr, "observer").await;
    observer.subscribe("wills/#", QoS::AtMostOnce).await;

    let will = Will {
        topic: "wills/k".to_string(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtMostOnce,
        retain: false,
    };
    let (mut silent, _) = TestClient::connect_full(addr, "k", true, 1, Some(will)).await;

    // Past 1.5x the keepalive the broker drops the connection and fires
    // the will message
    match timeout(Duration::from_secs(4), observer.recv_inner()).await {
        Ok(Some(Packet::Publish(publish))) => {
            assert_eq!(publish.topic.as_ref(), "wills/k");
            assert_eq!(publish.payload.as_ref(), b"gone");
        }
        other => panic!("expected will publish, got {:?}", other),
    }
    silent.expect_closed().await;
}

#[tokio::test]
async fn graceful_disconnect_drops_will() {
    let (_broker, addr) = start_broker().await;

    let mut observer = TestClient::connect(addr, "observer").await;
    observer.subscribe("wills/#", QoS::AtMostOnce).await;

    let will = Will {
        topic: "wills/g".to_string(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtMostOnce,
        retain: false,
    };
    let (mut client, _) = TestClient::connect_full(addr, "g", true, 30, Some(will)).await;
    client.send(Packet::Disconnect).await;
    client.expect_closed().await;

    assert!(observer.try_recv().await.is_none());
}

#[tokio::test]
async fn route_connection_federates_traffic() {
    let (broker, addr) = start_broker().await;

    // Hand the broker the server side of a fresh socket pair, as the
    // external cluster client would after dialing a peer
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let router_addr = listener.local_addr().expect("addr");
    let accept = tokio::spawn(async move { listener.accept().await });
    let client_side = TcpStream::connect(router_addr).await.expect("connect");
    let (server_side, peer_addr) = accept.await.expect("join").expect("accept");
    {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .accept_router(Box::new(server_side), String::new(), peer_addr)
                .await;
        });
    }

    let mut route = TestClient {
        stream: client_side,
        decoder: Decoder::new(),
        buf: BytesMut::new(),
        next_packet_id: 1,
    };
    route
        .send(Packet::Connect(Box::new(Connect {
            client_id: "node-2".to_string(),
            ..Connect::default()
        })))
        .await;
    match route.recv().await {
        Packet::ConnAck(connack) => {
            assert_eq!(connack.return_code, ConnectReturnCode::Accepted)
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }

    // The peer announces itself over the broker-info topic
    let info = RouterInfo {
        broker_id: "node-2".to_string(),
        broker_url: "10.0.0.2:1883".to_string(),
    };
    route
        .send(Packet::Publish(Publish {
            topic: BROKER_INFO_TOPIC.into(),
            payload: Bytes::from(serde_json::to_vec(&info).expect("json")),
            ..Publish::default()
        }))
        .await;

    // The route subscribes on behalf of the remote node's subscribers
    route.subscribe("remote/#", QoS::AtMostOnce).await;

    // Local publications flow out over the route
    let mut local = TestClient::connect(addr, "local").await;
    local.publish("remote/x", b"fanout", QoS::AtMostOnce, false).await;
    let publish = route.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "remote/x");

    // But ordinary publishes arriving over the route are dropped
    let mut subscriber = TestClient::connect(addr, "sub").await;
    subscriber.subscribe("loop/#", QoS::AtMostOnce).await;
    route
        .send(Packet::Publish(Publish {
            topic: "loop/x".into(),
            payload: Bytes::from_static(b"nope"),
            ..Publish::default()
        }))
        .await;
    assert!(subscriber.try_recv().await.is_none());

    assert_eq!(broker.router_peers(), vec![info]);
}
