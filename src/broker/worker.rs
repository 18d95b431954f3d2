//! Sharded worker pool
//!
//! `W` independent FIFO queues, each drained by a single task. A packet for
//! a given client-id always lands in the same queue, so all work for one
//! client is strictly ordered while different clients proceed in parallel.
//! Queues are bounded; a full shard blocks the submitting read task, which
//! is the backpressure path from a slow consumer back to the socket.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::Connection;
use crate::protocol::Packet;

/// One unit of work: a packet and the connection it arrived on.
pub(crate) struct Message {
    pub conn: Arc<Connection>,
    pub packet: Packet,
}

/// Per-shard queue depth.
const WORK_QUEUE_DEPTH: usize = 64;

/// Fixed pool of worker queues, sharded by a stable hash of the client-id.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Message>>,
    /// Receivers parked here until the broker starts its workers.
    receivers: Mutex<Vec<mpsc::Receiver<Message>>>,
    /// Hash state fixed at construction so a client-id maps to the same
    /// shard for the lifetime of the broker.
    hasher: ahash::RandomState,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(WORK_QUEUE_DEPTH);
            senders.push(tx);
            receivers.push(rx);
        }
        Self {
            senders,
            receivers: Mutex::new(receivers),
            hasher: ahash::RandomState::new(),
        }
    }

    /// Shard index for a key.
    pub fn shard(&self, key: &str) -> usize {
        (self.hasher.hash_one(key) % self.senders.len() as u64) as usize
    }

    /// Enqueue work for `key`, waiting when the shard queue is full.
    pub(crate) async fn submit(&self, key: &str, msg: Message) {
        // The send only fails after shutdown has dropped the receivers
        let _ = self.senders[self.shard(key)].send(msg).await;
    }

    /// Hand out the shard receivers, once.
    pub(crate) fn take_receivers(&self) -> Vec<mpsc::Receiver<Message>> {
        std::mem::take(&mut self.receivers.lock())
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
