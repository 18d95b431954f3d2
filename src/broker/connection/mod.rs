//! Connection actor
//!
//! One `Connection` per accepted stream. The read task decodes packets and
//! submits them to the broker's worker pool keyed by client-id; handlers run
//! on the owning worker, so everything for one client is serialized. All
//! outbound bytes go through the per-connection write mutex.

mod publish;
mod subscribe;

use std::io;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::{Buf, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{Broker, Message};
use crate::bridge::{BridgeAction, BridgeEvent};
use crate::codec::{self, Decoder};
use crate::protocol::Packet;
use crate::session::Session;
use crate::topic::Subscription;
use crate::transport::BoxedStream;

/// What sits on the other end of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// An end-user MQTT client
    Client,
    /// A peer broker route connection
    Router,
}

const STATUS_CONNECTED: u8 = 1;
const STATUS_DISCONNECTED: u8 = 2;

/// Per-stream connection state.
pub struct Connection {
    /// Stable id, unique for the broker's lifetime. Guards registry removal
    /// and subscription delivery against takeover races.
    pub(crate) id: u64,
    pub(crate) kind: ConnKind,
    pub(crate) client_id: Arc<str>,
    /// Username from CONNECT, empty when none was given
    pub(crate) username: String,
    pub(crate) keep_alive: u16,
    pub(crate) local_ip: String,
    pub(crate) remote_ip: String,
    status: AtomicU8,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    /// Cancels the read task; close triggers it, cancellation is idempotent
    pub(crate) cancel: CancellationToken,
    pub(crate) session: Arc<RwLock<Session>>,
    /// Live subscriptions keyed by the filter string as subscribed
    /// (`$share/...` included)
    pub(crate) sub_map: Mutex<AHashMap<String, Subscription>>,
    packet_ids: AtomicU16,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        kind: ConnKind,
        client_id: Arc<str>,
        username: String,
        keep_alive: u16,
        local_ip: String,
        remote_ip: String,
        writer: WriteHalf<BoxedStream>,
        session: Arc<RwLock<Session>>,
    ) -> Self {
        Self {
            id,
            kind,
            client_id,
            username,
            keep_alive,
            local_ip,
            remote_ip,
            status: AtomicU8::new(STATUS_CONNECTED),
            writer: tokio::sync::Mutex::new(writer),
            cancel: CancellationToken::new(),
            session,
            sub_map: Mutex::new(AHashMap::with_capacity(8)),
            packet_ids: AtomicU16::new(1),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_CONNECTED
    }

    /// Flip to disconnected. Returns true on the first transition only.
    fn set_disconnected(&self) -> bool {
        self.status.swap(STATUS_DISCONNECTED, Ordering::AcqRel) == STATUS_CONNECTED
    }

    /// Next outbound packet identifier, wrapping and never zero.
    pub(crate) fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.packet_ids.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Serialize and write a packet under the write mutex so packet bytes
    /// never interleave on the wire. Writes to a disconnected connection
    /// are silently dropped.
    pub(crate) async fn write_packet(&self, packet: &Packet) -> io::Result<()> {
        if !self.is_connected() {
            return Ok(());
        }

        let mut buf = BytesMut::with_capacity(64);
        codec::encode(packet, &mut buf).map_err(io::Error::other)?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await
    }

    /// Tear the connection down. Idempotent: the second call is a no-op.
    ///
    /// Cancels the read task, emits the disconnect bridge event, closes the
    /// socket, deregisters from the broker and removes every subscription
    /// from the trie. Client connections additionally publish the offline
    /// notification and any will message; router connections notify the
    /// discovery hook so the external cluster client can re-dial.
    pub(crate) fn close<'a>(
        self: &'a Arc<Self>,
        broker: &'a Arc<Broker>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if !self.set_disconnected() {
                return;
            }

            self.cancel.cancel();

            broker.bridge().deliver(BridgeEvent::new(
                &self.client_id,
                &self.username,
                BridgeAction::Disconnect,
            ));

            // The will must be read out before the session forgets it
            let will = self.session.write().will.take();

            {
                let mut writer = self.writer.lock().await;
                let _ = writer.shutdown().await;
            }

            broker.remove_connection(self);

            let clean = self.session.read().clean;
            if clean {
                broker.sessions().remove(&self.client_id);
            } else {
                broker.sessions().disconnect(&self.client_id);
            }

            let subs: Vec<Subscription> = self
                .sub_map
                .lock()
                .drain()
                .map(|(_, sub)| sub)
                .collect();
            for sub in subs {
                broker
                    .topics()
                    .unsubscribe(&sub.filter, &sub.client_id, sub.group.as_deref());
            }

            match self.kind {
                ConnKind::Client => {
                    broker
                        .online_offline_notification(&self.client_id, false)
                        .await;
                    if let Some(will) = will {
                        broker.publish_message(&will).await;
                    }
                }
                ConnKind::Router => broker.router_lost(&self.client_id),
            }

            debug!(client_id = %self.client_id, "connection closed");
        })
    }

    pub(crate) async fn process_ping(self: &Arc<Self>, broker: &Arc<Broker>) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.write_packet(&Packet::PingResp).await {
            error!(client_id = %self.client_id, "send pingresp error: {}", e);
            self.close(broker).await;
        }
    }
}

/// Read loop for one connection.
///
/// Each read runs under a `keepalive + keepalive/2` deadline (none when
/// keepalive is 0). Parse errors, timeouts and EOF all enqueue a synthetic
/// DISCONNECT for this client-id and end the task, so teardown runs in
/// packet order on the owning worker. Cancellation stops the loop without
/// a synthetic packet since close already ran.
pub(crate) async fn read_loop(
    broker: Arc<Broker>,
    conn: Arc<Connection>,
    mut reader: ReadHalf<BoxedStream>,
) {
    let decoder = Decoder::new().with_max_packet_size(broker.config().max_packet_size);
    let mut buf = BytesMut::with_capacity(4096);
    let deadline = if conn.keep_alive > 0 {
        Some(Duration::from_millis(conn.keep_alive as u64 * 1500))
    } else {
        None
    };

    loop {
        // Drain every complete packet already buffered
        loop {
            match decoder.decode(&buf) {
                Ok(Some((packet, consumed))) => {
                    buf.advance(consumed);
                    broker
                        .submit_work(
                            &conn.client_id,
                            Message {
                                conn: conn.clone(),
                                packet,
                            },
                        )
                        .await;
                }
                Ok(None) => break,
                Err(e) => {
                    error!(client_id = %conn.client_id, "read packet error: {}", e);
                    submit_disconnect(&broker, &conn).await;
                    return;
                }
            }
        }

        let result = tokio::select! {
            biased;

            _ = conn.cancel.cancelled() => return,

            result = async {
                match deadline {
                    Some(t) => match timeout(t, reader.read_buf(&mut buf)).await {
                        Ok(r) => r,
                        Err(_) => Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read deadline exceeded",
                        )),
                    },
                    None => reader.read_buf(&mut buf).await,
                }
            } => result,
        };

        match result {
            Ok(0) => {
                debug!(client_id = %conn.client_id, "connection closed by peer");
                submit_disconnect(&broker, &conn).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(client_id = %conn.client_id, "read error: {}", e);
                submit_disconnect(&broker, &conn).await;
                return;
            }
        }
    }
}

async fn submit_disconnect(broker: &Arc<Broker>, conn: &Arc<Connection>) {
    broker
        .submit_work(
            &conn.client_id,
            Message {
                conn: conn.clone(),
                packet: Packet::Disconnect,
            },
        )
        .await;
}
