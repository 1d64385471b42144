//! The per-router ingest pipeline.
//!
//! Two tasks own a session: the reader pulls bytes off the socket into the
//! ring buffer, the framer pulls bytes out of the ring into its parse
//! window, frames BMP messages and turns each one into a keyed bus record.
//! The tasks share nothing but the ring and a few atomic status flags the
//! supervisor also reads.

use crate::bus::{BusRecord, BusSender};
use crate::envelope::{CaptureTime, EnvelopeEncoder};
use crate::frame::{self, BmpMsgType, FrameInvalid, Outcome};
use crate::identity::{PeerIdentity, RouterIdentity};
use crate::ring::{self, RingReader, RingWriter};
use crate::statistics::WorkerStatistics;
use crate::topic::TopicBuilder;
use metrics::counter;
use std::cmp;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

/// Compact the parse window before refilling once the unread remainder is
/// this small; keeps a full message contiguous without moving big tails.
pub const COMPACT_THRESHOLD: usize = 64;
/// Bytes per socket read once the session is in bulk mode.
pub const DEFAULT_REFILL_SIZE: usize = 8 * 1024;
pub const DEFAULT_RING_CAPACITY: usize = 15 * 1024 * 1024;
/// Upper bound on the parse window, and with it on a single BMP message.
pub const MAX_MESSAGE_WINDOW: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WorkerTuning {
    pub ring_capacity: usize,
    pub refill_size: usize,
    /// Read one byte at a time until Initiation is seen, so the first
    /// messages of a session surface immediately.
    pub slow_start: bool,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        WorkerTuning {
            ring_capacity: DEFAULT_RING_CAPACITY,
            refill_size: DEFAULT_REFILL_SIZE,
            slow_start: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Waiting = 0,
    Running = 1,
    Stopped = 2,
}

/// Why a session ended; also the worker's return value so tests can assert
/// on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Clean BMP Termination message.
    Termination,
    /// Socket EOF or read error.
    ConnectionClosed,
    /// Supervisor asked us to stop.
    Requested,
    /// A message larger than the parse window.
    Overflow,
    /// Unrecoverable framing error.
    Framing(FrameInvalid),
    /// The publisher side of the bus is gone.
    BusClosed,
}

/// Flags shared between the worker tasks and the supervisor. One-way
/// ownership: the supervisor holds a handle and reads status; the worker
/// never sees the supervisor.
#[derive(Debug, Default)]
pub struct WorkerShared {
    status: AtomicU8,
    router_init: AtomicBool,
    rib_dump_started: AtomicBool,
    stop_requested: AtomicBool,
    stop_notify: Notify,
}

impl WorkerShared {
    pub fn status(&self) -> WorkerStatus {
        match self.status.load(Ordering::Acquire) {
            1 => WorkerStatus::Running,
            2 => WorkerStatus::Stopped,
            _ => WorkerStatus::Waiting,
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn router_init(&self) -> bool {
        self.router_init.load(Ordering::Acquire)
    }

    fn set_router_init(&self) {
        self.router_init.store(true, Ordering::Release);
    }

    /// The admission-gate signal the supervisor reads: true once the bulk
    /// RIB dump after Initiation is under way.
    pub fn rib_dump_started(&self) -> bool {
        self.rib_dump_started.load(Ordering::Acquire)
    }

    fn set_rib_dump_started(&self) {
        self.rib_dump_started.store(true, Ordering::Release);
    }

    /// Cooperative stop: both tasks observe the flag at their next
    /// suspension point or message boundary.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    async fn stopped(&self) {
        loop {
            let notified = self.stop_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.stop_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Everything a session needs, handed over at construction. Config is
/// baked in (templates, rules), the bus sender is the only shared service.
pub struct WorkerContext {
    pub router: RouterIdentity,
    pub encoder: EnvelopeEncoder,
    pub topics: TopicBuilder,
    pub tx: BusSender,
    pub tuning: WorkerTuning,
}

/// Runs one router session to completion. Generic over the byte source so
/// tests drive it with in-memory streams.
pub async fn run<R>(shared: Arc<WorkerShared>, stream: R, ctx: WorkerContext) -> StopReason
where
    R: AsyncRead + Unpin + Send + 'static,
{
    shared.set_status(WorkerStatus::Running);
    info!(
        router = %ctx.router.addr,
        port = ctx.router.port,
        hostname = %ctx.router.hostname,
        group = %ctx.router.group,
        "router session established"
    );

    let (ring_writer, ring_reader) = ring::ring(ctx.tuning.ring_capacity);
    let reader = tokio::spawn(read_into_ring(
        stream,
        ring_writer,
        shared.clone(),
        ctx.tuning.refill_size,
        ctx.tuning.slow_start,
    ));

    let reason = frame_loop(ring_reader, ctx, &shared).await;

    // frame_loop set the stop flag on its way out; the reader wakes on it
    let _ = reader.await;
    shared.set_status(WorkerStatus::Stopped);
    reason
}

/// Producer half: socket to ring. One byte per read until Initiation
/// (slow start), then `refill_size` chunks.
async fn read_into_ring<R>(
    mut stream: R,
    mut ring: RingWriter,
    shared: Arc<WorkerShared>,
    refill_size: usize,
    slow_start: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; refill_size.max(1)];
    loop {
        if shared.stop_requested() {
            break;
        }
        let want = if slow_start && !shared.router_init() {
            1
        } else {
            chunk.len()
        };
        let n = tokio::select! {
            res = stream.read(&mut chunk[..want]) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "socket read failed");
                    break;
                }
            },
            _ = shared.stopped() => break,
        };
        if ring.write_all(&chunk[..n]).await.is_err() {
            // framer is gone
            break;
        }
    }
}

enum Refill {
    Read,
    Eof,
    Stopped,
    Full,
}

/// The framer's contiguous view over the ring. Consumed messages free the
/// front; compaction keeps the next message contiguous at offset 0.
struct ParseWindow {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl ParseWindow {
    fn new(capacity: usize) -> Self {
        ParseWindow {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    fn unread(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    fn unread_len(&self) -> usize {
        self.end - self.start
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    fn compact(&mut self) {
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    async fn refill(&mut self, ring: &mut RingReader, shared: &WorkerShared) -> Refill {
        if self.start > 0
            && (self.unread_len() <= COMPACT_THRESHOLD || self.end == self.buf.len())
        {
            self.compact();
        }
        if self.end == self.buf.len() {
            return Refill::Full;
        }
        tokio::select! {
            n = ring.read(&mut self.buf[self.end..]) => {
                if n == 0 {
                    Refill::Eof
                } else {
                    self.end += n;
                    Refill::Read
                }
            }
            _ = shared.stopped() => Refill::Stopped,
        }
    }
}

/// Consumer half: ring to bus. Frames, classifies, wraps, publishes.
async fn frame_loop(
    mut ring: RingReader,
    mut ctx: WorkerContext,
    shared: &Arc<WorkerShared>,
) -> StopReason {
    let window_capacity = cmp::min(ctx.tuning.ring_capacity, MAX_MESSAGE_WINDOW);
    let mut window = ParseWindow::new(window_capacity);
    let mut stats = WorkerStatistics::default();
    let mut peers: HashMap<(IpAddr, u32), PeerIdentity> = HashMap::new();
    let mut msgs_since_init: u32 = 0;

    let router_topic = ctx.topics.router_topic();
    debug!(topic = %router_topic, "router topic resolved");

    let reason = 'session: loop {
        if shared.stop_requested() {
            break StopReason::Requested;
        }
        match frame::parse(window.unread()) {
            Outcome::Complete(meta) => {
                stats.observe_rx(meta.kind);
                counter!("obmpd_bmp_messages_total").increment(1);
                let ts = CaptureTime::now();

                let peer_key = meta.peer.as_ref().map(|p| (p.addr, p.asn));
                let peer_id = meta.peer.as_ref().map(|hdr| {
                    peers
                        .entry((hdr.addr, hdr.asn))
                        .or_insert_with(|| PeerIdentity::from_header(&ctx.router.hash, hdr))
                        .clone()
                });

                let topic = ctx.topics.bmp_raw_topic(peer_key);
                let raw = &window.unread()[..meta.len];
                trace!(len = meta.len, msg_type = meta.msg_type, "framed bmp message");
                let envelope = ctx.encoder.encode(meta.msg_type, peer_id.as_ref(), raw, ts);
                let record = BusRecord {
                    topic,
                    key: ctx.router.hash,
                    payload: envelope.into(),
                    timestamp_ms: ts.as_millis(),
                };
                match ctx.tx.try_send(record) {
                    Ok(()) => stats.tx_envelopes += 1,
                    Err(TrySendError::Full(_)) => {
                        stats.tx_dropped += 1;
                        counter!("obmpd_bus_records_dropped_total").increment(1);
                        warn!("bus channel full, dropping record");
                    }
                    Err(TrySendError::Closed(_)) => {
                        stats.tx_dropped += 1;
                        debug!("bus channel closed");
                        window.consume(meta.len);
                        break 'session StopReason::BusClosed;
                    }
                }

                // messages after Initiation; the second one marks the start
                // of the RIB dump for admission control
                if shared.router_init() {
                    msgs_since_init += 1;
                    if msgs_since_init >= 2 && !shared.rib_dump_started() {
                        shared.set_rib_dump_started();
                        debug!(router = %ctx.router.addr, "rib dump started");
                    }
                }

                match meta.kind {
                    Some(BmpMsgType::InitiationMessage) => {
                        info!(router = %ctx.router.addr, "received initiation message");
                        shared.set_router_init();
                    }
                    Some(BmpMsgType::TerminationMessage) => {
                        info!(router = %ctx.router.addr, "received termination message");
                        window.consume(meta.len);
                        break 'session StopReason::Termination;
                    }
                    Some(BmpMsgType::PeerUpNotification) => {
                        if let Some(peer) = &peer_id {
                            info!(router = %ctx.router.addr, peer = %peer.addr, asn = peer.asn, "peer up");
                        }
                    }
                    Some(BmpMsgType::PeerDownNotification) => {
                        if let Some(peer) = &peer_id {
                            info!(router = %ctx.router.addr, peer = %peer.addr, asn = peer.asn, "peer down");
                        }
                    }
                    Some(BmpMsgType::StatisticsReport) => {
                        debug!(router = %ctx.router.addr, "stats report");
                    }
                    Some(_) => {}
                    None => {
                        debug!(msg_type = meta.msg_type, "unknown bmp message type forwarded");
                    }
                }
                window.consume(meta.len);
            }
            Outcome::Partial { need } => {
                if need > window.capacity() {
                    error!(
                        need,
                        capacity = window.capacity(),
                        "bmp message exceeds the parse window, stopping session"
                    );
                    break StopReason::Overflow;
                }
                match window.refill(&mut ring, shared).await {
                    Refill::Read => {}
                    Refill::Eof => {
                        debug!(router = %ctx.router.addr, "connection closed");
                        break StopReason::ConnectionClosed;
                    }
                    Refill::Stopped => break StopReason::Requested,
                    Refill::Full => break StopReason::Overflow,
                }
            }
            Outcome::Invalid(invalid) => {
                stats.rx_invalid += 1;
                counter!("obmpd_invalid_frames_total").increment(1);
                match invalid.skippable() {
                    Some(skip) => {
                        warn!(error = %invalid, skip, "skipping invalid bmp message");
                        match skip_bytes(&mut window, &mut ring, shared, skip).await {
                            Some(reason) => break reason,
                            None => {}
                        }
                    }
                    None => {
                        error!(error = %invalid, "unrecoverable framing error, stopping session");
                        break StopReason::Framing(invalid);
                    }
                }
            }
        }
    };

    // wake the reader task; it observes the flag at its next suspension
    shared.request_stop();
    info!(
        router = %ctx.router.addr,
        messages = stats.rx_bmp_messages,
        envelopes = stats.tx_envelopes,
        dropped = stats.tx_dropped,
        invalid = stats.rx_invalid,
        "router session ended"
    );
    debug!(?stats, "session statistics");
    reason
}

/// Discards exactly `skip` bytes, refilling as needed. Returns a stop
/// reason if the stream ends first.
async fn skip_bytes(
    window: &mut ParseWindow,
    ring: &mut RingReader,
    shared: &WorkerShared,
    mut skip: usize,
) -> Option<StopReason> {
    loop {
        let have = cmp::min(skip, window.unread_len());
        window.consume(have);
        skip -= have;
        if skip == 0 {
            return None;
        }
        match window.refill(ring, shared).await {
            Refill::Read => {}
            Refill::Eof => return Some(StopReason::ConnectionClosed),
            Refill::Stopped => return Some(StopReason::Requested),
            Refill::Full => return Some(StopReason::Overflow),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_compacts_small_remainders_to_the_front() {
        let mut w = ParseWindow::new(128);
        w.buf[..100].copy_from_slice(&[7u8; 100]);
        w.end = 100;
        w.consume(90);
        assert_eq!(w.unread_len(), 10);
        w.compact();
        assert_eq!(w.start, 0);
        assert_eq!(w.unread(), &[7u8; 10]);
    }

    #[test]
    fn window_resets_when_fully_consumed() {
        let mut w = ParseWindow::new(64);
        w.end = 40;
        w.consume(40);
        assert_eq!((w.start, w.end), (0, 0));
    }

    #[tokio::test]
    async fn shared_stop_flag_wakes_waiters() {
        let shared = Arc::new(WorkerShared::default());
        let waiter = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.stopped().await })
        };
        shared.request_stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("stop flag must wake the waiter")
            .unwrap();
    }
}
