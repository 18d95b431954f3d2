//! Broker core
//!
//! Process-wide singleton owning the topic store, the session store, the
//! client and router registries, the ACL evaluator, the bridge sink and the
//! worker pool. Inbound packets are enqueued per client-id; dispatch runs
//! the matching handler on the connection actor.

mod connection;
mod tls;
mod worker;

pub use connection::{ConnKind, Connection};
pub use tls::{load_tls_config, TlsError};
pub use worker::WorkerPool;

pub(crate) use worker::Message;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acl::TopicAcl;
use crate::bridge::{unix_now, BridgeAction, BridgeEvent, BridgeSink, NullBridge};
use crate::cluster::{Discovery, RouterInfo};
use crate::codec::{self, Decoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, PROTOCOL_LEVEL,
};
use crate::session::SessionStore;
use crate::topic::{RetainedMessage, Subscription, TopicStore};
use crate::transport::{BoxedStream, WsStream};

/// TLS listener file configuration.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
    /// Require and verify client certificates
    pub verify: bool,
}

/// Runtime broker configuration, assembled from the external loader.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Plain TCP listener address
    pub bind_addr: SocketAddr,
    /// TLS listener address (requires `tls`)
    pub tls_bind_addr: Option<SocketAddr>,
    /// TLS certificate configuration
    pub tls: Option<TlsConfig>,
    /// WebSocket listener address
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket upgrade path
    pub ws_path: String,
    /// Serve the WebSocket listener over TLS
    pub ws_tls: bool,
    /// Worker pool size
    pub workers: usize,
    /// Per-packet size limit
    pub max_packet_size: usize,
    /// How long a fresh stream may take to present CONNECT
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().expect("static address"),
            tls_bind_addr: None,
            tls: None,
            ws_bind_addr: None,
            ws_path: "/mqtt".to_string(),
            ws_tls: false,
            workers: 1024,
            max_packet_size: codec::DEFAULT_MAX_PACKET_SIZE,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// The broker.
pub struct Broker {
    config: BrokerConfig,
    topics: TopicStore,
    sessions: SessionStore,
    /// Connected clients by client-id; at most one entry per id
    clients: DashMap<Arc<str>, Arc<Connection>>,
    /// Route connections by their client-id
    routers: DashMap<Arc<str>, Arc<Connection>>,
    /// Peer identities announced over the broker-info topic, keyed by the
    /// announcing route connection's client-id
    peers: DashMap<Arc<str>, RouterInfo>,
    acl: TopicAcl,
    bridge: Arc<dyn BridgeSink>,
    discovery: RwLock<Option<Arc<dyn Discovery>>>,
    workers: WorkerPool,
    /// Shared-subscription member selection; reseedable for reproducibility
    rng: Mutex<SmallRng>,
    next_conn_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_parts(config, TopicAcl::allow_all(), Arc::new(NullBridge))
    }

    pub fn with_parts(config: BrokerConfig, acl: TopicAcl, bridge: Arc<dyn BridgeSink>) -> Self {
        let workers = WorkerPool::new(config.workers);
        Self {
            config,
            topics: TopicStore::new(),
            sessions: SessionStore::new(),
            clients: DashMap::new(),
            routers: DashMap::new(),
            peers: DashMap::new(),
            acl,
            bridge,
            discovery: RwLock::new(None),
            workers,
            rng: Mutex::new(SmallRng::from_entropy()),
            next_conn_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Reseed the shared-subscription RNG for deterministic selection.
    pub fn set_rng_seed(&self, seed: u64) {
        *self.rng.lock() = SmallRng::seed_from_u64(seed);
    }

    /// Register the external discovery client's hook.
    pub fn set_discovery(&self, discovery: Arc<dyn Discovery>) {
        *self.discovery.write() = Some(discovery);
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn topics(&self) -> &TopicStore {
        &self.topics
    }

    pub(crate) fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub(crate) fn acl(&self) -> &TopicAcl {
        &self.acl
    }

    pub(crate) fn bridge(&self) -> &dyn BridgeSink {
        self.bridge.as_ref()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Peer identities currently announced by route connections.
    pub fn router_peers(&self) -> Vec<RouterInfo> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind the configured listeners and serve until shutdown.
    pub async fn run(self: &Arc<Self>) -> io::Result<()> {
        let tls_acceptor = match self.config.tls.as_ref() {
            Some(cfg) => Some(tls::load_tls_config(cfg).map_err(io::Error::other)?),
            None => None,
        };

        if let Some(addr) = self.config.tls_bind_addr {
            let acceptor = tls_acceptor.clone().ok_or_else(|| {
                io::Error::other("tls listener requires certificate configuration")
            })?;
            let listener = TcpListener::bind(addr).await?;
            info!("MQTT/TLS listening on {}", addr);
            let broker = self.clone();
            tokio::spawn(async move { broker.serve_tls(listener, acceptor).await });
        }

        if let Some(addr) = self.config.ws_bind_addr {
            let acceptor = if self.config.ws_tls {
                Some(tls_acceptor.clone().ok_or_else(|| {
                    io::Error::other("wsTLS requires certificate configuration")
                })?)
            } else {
                None
            };
            let listener = TcpListener::bind(addr).await?;
            info!(
                "MQTT/WebSocket listening on {} (path {})",
                addr, self.config.ws_path
            );
            let broker = self.clone();
            let path = self.config.ws_path.clone();
            tokio::spawn(async move { broker.serve_ws(listener, path, acceptor).await });
        }

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve plain MQTT connections from an already-bound listener.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> io::Result<()> {
        self.start_workers();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let local_ip = stream
                            .local_addr()
                            .map(|a| a.ip().to_string())
                            .unwrap_or_default();
                        let broker = self.clone();
                        tokio::spawn(async move {
                            broker
                                .accept_stream(Box::new(stream), local_ip, addr, ConnKind::Client)
                                .await;
                        });
                    }
                    Err(e) => error!("accept error: {}", e),
                }
            }
        }
    }

    async fn serve_tls(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let local_ip = stream
                            .local_addr()
                            .map(|a| a.ip().to_string())
                            .unwrap_or_default();
                        let broker = self.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    broker
                                        .accept_stream(
                                            Box::new(tls_stream),
                                            local_ip,
                                            addr,
                                            ConnKind::Client,
                                        )
                                        .await;
                                }
                                Err(e) => debug!("tls handshake failed from {}: {}", addr, e),
                            }
                        });
                    }
                    Err(e) => error!("tls accept error: {}", e),
                }
            }
        }
    }

    async fn serve_ws(
        self: Arc<Self>,
        listener: TcpListener,
        path: String,
        acceptor: Option<TlsAcceptor>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let local_ip = stream
                            .local_addr()
                            .map(|a| a.ip().to_string())
                            .unwrap_or_default();
                        let broker = self.clone();
                        let acceptor = acceptor.clone();
                        let path = path.clone();
                        tokio::spawn(async move {
                            let ws: Result<BoxedStream, io::Error> = match acceptor {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls_stream) => WsStream::accept(tls_stream, &path)
                                        .await
                                        .map(|ws| Box::new(ws) as BoxedStream),
                                    Err(e) => Err(io::Error::other(e)),
                                },
                                None => WsStream::accept(stream, &path)
                                    .await
                                    .map(|ws| Box::new(ws) as BoxedStream),
                            };
                            match ws {
                                Ok(ws) => {
                                    broker
                                        .accept_stream(ws, local_ip, addr, ConnKind::Client)
                                        .await;
                                }
                                Err(e) => {
                                    debug!("websocket handshake failed from {}: {}", addr, e)
                                }
                            }
                        });
                    }
                    Err(e) => error!("websocket accept error: {}", e),
                }
            }
        }
    }

    /// Inject an established stream to a peer broker as a route connection.
    /// The external cluster client dials and hands the socket over here.
    pub async fn accept_router(
        self: &Arc<Self>,
        stream: BoxedStream,
        local_ip: String,
        remote: SocketAddr,
    ) {
        self.accept_stream(stream, local_ip, remote, ConnKind::Router)
            .await;
    }

    /// Spawn one consumer task per worker shard. Safe to call more than
    /// once; only the first call finds receivers to take.
    pub fn start_workers(self: &Arc<Self>) {
        for mut rx in self.workers.take_receivers() {
            let broker = self.clone();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    broker.dispatch(msg).await;
                }
            });
        }
    }

    /// Enqueue work for a client-id, blocking when its shard is full.
    pub(crate) async fn submit_work(&self, key: &str, msg: Message) {
        self.workers.submit(key, msg).await;
    }

    /// Run the handler for one inbound packet. Per-client ordering holds
    /// because every packet for a client-id lands on the same worker.
    pub(crate) async fn dispatch(self: &Arc<Self>, msg: Message) {
        let conn = msg.conn;
        if conn.kind == ConnKind::Client {
            debug!(
                client_id = %conn.client_id,
                packet_type = msg.packet.packet_type(),
                "processing packet"
            );
        }

        match msg.packet {
            Packet::Publish(p) => conn.process_publish(self, p).await,
            Packet::Subscribe(p) => conn.process_subscribe(self, p).await,
            Packet::Unsubscribe(p) => conn.process_unsubscribe(self, p).await,
            Packet::PingReq => conn.process_ping(self).await,
            Packet::Disconnect => conn.close(self).await,
            // QoS 1 inflight acknowledgment, accepted silently
            Packet::PubAck(_) => {}
            // QoS 2 is not implemented; its handshake packets are ignored
            Packet::PubRec(_) | Packet::PubRel(_) | Packet::PubComp(_) => {}
            other => {
                info!(
                    client_id = %conn.client_id,
                    packet_type = other.packet_type(),
                    "ignoring unexpected packet"
                );
            }
        }
    }

    /// CONNECT handshake for a fresh stream, then the read loop.
    pub(crate) async fn accept_stream(
        self: &Arc<Self>,
        mut stream: BoxedStream,
        local_ip: String,
        remote: SocketAddr,
        kind: ConnKind,
    ) {
        let connect = match timeout(
            self.config.connect_timeout,
            read_connect(&mut stream, self.config.max_packet_size),
        )
        .await
        {
            Ok(Ok(connect)) => connect,
            Ok(Err(e)) => {
                debug!("connect handshake failed from {}: {}", remote, e);
                return;
            }
            Err(_) => {
                debug!("connect timeout from {}", remote);
                return;
            }
        };

        if connect.protocol_level != PROTOCOL_LEVEL {
            debug!(
                "unsupported protocol level {} from {}",
                connect.protocol_level, remote
            );
            refuse(stream, ConnectReturnCode::UnacceptableProtocolVersion).await;
            return;
        }

        let client_id: Arc<str> = if connect.client_id.is_empty() {
            // A zero-byte client-id is only acceptable with clean-session=1
            if !connect.clean_session {
                refuse(stream, ConnectReturnCode::IdentifierRejected).await;
                return;
            }
            self.generate_client_id().into()
        } else {
            connect.client_id.as_str().into()
        };

        // Duplicate client-id: the existing connection is taken over
        let previous = match kind {
            ConnKind::Client => self.clients.get(&client_id).map(|e| e.value().clone()),
            ConnKind::Router => self.routers.get(&client_id).map(|e| e.value().clone()),
        };
        if let Some(old) = previous {
            info!(client_id = %client_id, "session takeover, closing previous connection");
            old.close(self).await;
        }

        let (session, resumed) = self.sessions.get_or_create(&client_id, connect.clean_session);
        {
            let mut s = session.write();
            s.clean = connect.clean_session;
            s.will = connect.will.as_ref().map(|w| Publish {
                dup: false,
                qos: w.qos,
                retain: w.retain,
                topic: Arc::from(w.topic.as_str()),
                packet_id: None,
                payload: w.payload.clone(),
            });
        }

        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(Connection::new(
            self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            kind,
            client_id.clone(),
            connect.username.clone().unwrap_or_default(),
            connect.keep_alive,
            local_ip,
            remote.ip().to_string(),
            writer,
            session.clone(),
        ));

        match kind {
            ConnKind::Client => {
                self.clients.insert(client_id.clone(), conn.clone());
            }
            ConnKind::Router => {
                self.routers.insert(client_id.clone(), conn.clone());
            }
        }

        let connack = Packet::ConnAck(ConnAck {
            session_present: resumed,
            return_code: ConnectReturnCode::Accepted,
        });
        if let Err(e) = conn.write_packet(&connack).await {
            debug!(client_id = %client_id, "send connack error: {}", e);
            conn.close(self).await;
            return;
        }

        if resumed {
            self.reattach_subscriptions(&conn);
        }

        if kind == ConnKind::Client {
            self.bridge.deliver(BridgeEvent::new(
                &client_id,
                &conn.username,
                BridgeAction::Connect,
            ));
            self.online_offline_notification(&client_id, true).await;
        }

        debug!(client_id = %client_id, remote = %remote, "connection established");
        connection::read_loop(self.clone(), conn, reader).await;
    }

    /// Re-register a resumed session's filters in the trie under the new
    /// connection. Retained messages are not re-delivered on resume.
    fn reattach_subscriptions(self: &Arc<Self>, conn: &Arc<Connection>) {
        let filters: Vec<(String, QoS)> = conn
            .session
            .read()
            .filters
            .iter()
            .map(|(f, q)| (f.clone(), *q))
            .collect();

        for (original, qos) in filters {
            let Some(sub) = conn.make_subscription(&original, qos) else {
                warn!(
                    client_id = %conn.client_id,
                    filter = %original,
                    "dropping malformed session filter on resume"
                );
                continue;
            };
            match self.topics.subscribe(sub.clone()) {
                Ok(_) => {
                    conn.sub_map.lock().insert(original, sub);
                }
                Err(e) => warn!(
                    client_id = %conn.client_id,
                    filter = %original,
                    "failed to re-attach subscription: {}", e
                ),
            }
        }
    }

    /// Fan a publication out to matching subscribers.
    ///
    /// The retained slot is updated first when the retain flag is set
    /// (cleared on empty payload). Exclusive subscribers each get a copy at
    /// `min(publish qos, granted qos)`; every shared group delivers to one
    /// connected member chosen uniformly at random. A failed write closes
    /// that connection and nothing else.
    pub async fn publish_message(self: &Arc<Self>, publish: &Publish) {
        if publish.retain {
            self.topics.retain(RetainedMessage {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos,
            });
        }

        let matched = self.topics.matches(&publish.topic);
        if matched.is_empty() {
            return;
        }

        let mut exclusive: AHashMap<Arc<str>, Subscription> = AHashMap::new();
        let mut groups: AHashMap<(Arc<str>, Arc<str>), Vec<Subscription>> = AHashMap::new();

        for sub in matched {
            if sub.shared {
                if let Some(group) = sub.group.clone() {
                    groups
                        .entry((group, sub.filter.clone()))
                        .or_default()
                        .push(sub);
                }
            } else {
                // One delivery per client at the highest matching QoS
                match exclusive.entry(sub.client_id.clone()) {
                    std::collections::hash_map::Entry::Occupied(mut e) => {
                        if sub.qos > e.get().qos {
                            e.insert(sub);
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(v) => {
                        v.insert(sub);
                    }
                }
            }
        }

        for sub in exclusive.into_values() {
            let Some(conn) = sub.conn.upgrade() else {
                continue;
            };
            if !conn.is_connected() {
                continue;
            }
            self.deliver(&conn, &sub, publish).await;
        }

        for members in groups.into_values() {
            let alive: Vec<(Arc<Connection>, Subscription)> = members
                .into_iter()
                .filter_map(|sub| {
                    sub.conn
                        .upgrade()
                        .filter(|c| c.is_connected())
                        .map(|c| (c, sub))
                })
                .collect();
            if alive.is_empty() {
                continue;
            }
            let idx = { self.rng.lock().gen_range(0..alive.len()) };
            let (conn, sub) = &alive[idx];
            self.deliver(conn, sub, publish).await;
        }
    }

    async fn deliver(self: &Arc<Self>, conn: &Arc<Connection>, sub: &Subscription, publish: &Publish) {
        let qos = publish.qos.min(sub.qos);
        let out = Publish {
            dup: false,
            qos,
            retain: false,
            topic: publish.topic.clone(),
            packet_id: (qos != QoS::AtMostOnce).then(|| conn.next_packet_id()),
            payload: publish.payload.clone(),
        };

        if let Err(e) = conn.write_packet(&Packet::Publish(out)).await {
            error!(client_id = %conn.client_id, "deliver error: {}", e);
            let broker = self.clone();
            let conn = conn.clone();
            tokio::spawn(async move { conn.close(&broker).await });
        }
    }

    /// Publish the system event topic announcing a client coming or going.
    pub(crate) async fn online_offline_notification(
        self: &Arc<Self>,
        client_id: &str,
        online: bool,
    ) {
        let topic = format!("$SYS/broker/connection/clients/{}", client_id);
        let payload = serde_json::json!({
            "clientID": client_id,
            "online": online,
            "timestamp": unix_now(),
        });
        let publish = Publish {
            topic: Arc::from(topic.as_str()),
            payload: Bytes::from(payload.to_string()),
            ..Default::default()
        };
        self.publish_message(&publish).await;
    }

    /// Drop a connection from its registry, but only while the registered
    /// entry is still this very connection; a takeover may already have
    /// installed a fresh one under the same client-id.
    pub(crate) fn remove_connection(&self, conn: &Connection) {
        let registry = match conn.kind {
            ConnKind::Client => &self.clients,
            ConnKind::Router => &self.routers,
        };
        registry.remove_if(&conn.client_id, |_, current| current.id == conn.id);
        if conn.kind == ConnKind::Router {
            self.peers.remove(&conn.client_id);
        }
    }

    /// Record the peer identity a route connection announced.
    pub(crate) fn update_router(&self, conn: &Arc<Connection>, info: RouterInfo) {
        info!(
            remote = %conn.client_id,
            broker_id = %info.broker_id,
            broker_url = %info.broker_url,
            "route peer announced"
        );
        self.peers.insert(conn.client_id.clone(), info);
    }

    /// A route connection dropped; hand the remote id to discovery so the
    /// external cluster client can reconnect.
    pub(crate) fn router_lost(&self, remote_id: &str) {
        let discovery = self.discovery.read().clone();
        if let Some(discovery) = discovery {
            discovery.router_lost(remote_id);
        }
    }

    fn generate_client_id(&self) -> String {
        let n: u64 = self.rng.lock().gen();
        format!("embermq-{:012x}", n & 0xffff_ffff_ffff)
    }
}

/// Read packets off a fresh stream until CONNECT arrives.
async fn read_connect(
    stream: &mut BoxedStream,
    max_packet_size: usize,
) -> io::Result<Box<Connect>> {
    let decoder = Decoder::new().with_max_packet_size(max_packet_size);
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        match decoder.decode(&buf).map_err(io::Error::other)? {
            Some((Packet::Connect(connect), consumed)) => {
                buf.advance(consumed);
                return Ok(connect);
            }
            Some(_) => {
                return Err(io::Error::other("first packet must be CONNECT"));
            }
            None => {}
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before CONNECT",
            ));
        }
    }
}

/// Refuse a connect attempt with the given return code and hang up.
async fn refuse(mut stream: BoxedStream, return_code: ConnectReturnCode) {
    let mut buf = BytesMut::with_capacity(4);
    let connack = Packet::ConnAck(ConnAck {
        session_present: false,
        return_code,
    });
    if codec::encode(&connack, &mut buf).is_ok() {
        let _ = stream.write_all(&buf).await;
        let _ = stream.flush().await;
    }
    let _ = stream.shutdown().await;
}
