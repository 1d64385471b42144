//! The seam between the ingest pipeline and the message-bus publisher: a
//! bounded mpsc channel of ready-to-produce records. Workers never talk to
//! the Kafka client directly.

use crate::identity::HASH_LEN;
use bytes::Bytes;
use std::sync::Arc;

/// Default channel depth between workers and the publisher task.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100_000;

/// One keyed record bound for the bus.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub topic: Arc<str>,
    /// Router hash for raw BMP records, collector hash for collector
    /// records; constant per source, which preserves per-router ordering
    /// on key-partitioned brokers.
    pub key: [u8; HASH_LEN],
    pub payload: Bytes,
    /// Milliseconds since epoch, derived from the capture timestamp.
    pub timestamp_ms: i64,
}

pub type BusSender = tokio::sync::mpsc::Sender<BusRecord>;
pub type BusReceiver = tokio::sync::mpsc::Receiver<BusRecord>;

pub fn channel(capacity: usize) -> (BusSender, BusReceiver) {
    tokio::sync::mpsc::channel(capacity)
}
