use std::cell::UnsafeCell;
use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

/// Minimum capacity accepted by [`ring`]. The daemon enforces a much larger
/// floor through configuration; tests construct small rings directly.
pub const MIN_CAPACITY: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring buffer closed by the consumer")]
    Closed,
}

/// Single-producer/single-consumer byte ring between a socket reader and the
/// framer. Positions are monotonic virtual indices (`head` for written bytes,
/// `tail` for consumed bytes), so `head - tail` is the fill level and can
/// never exceed capacity: the writer waits for space instead of overtaking,
/// the reader waits for data instead of underrunning.
struct Shared {
    buf: UnsafeCell<Box<[u8]>>,
    cap: u64,
    head: AtomicU64,
    tail: AtomicU64,
    writer_closed: AtomicBool,
    reader_closed: AtomicBool,
    data: Notify,
    space: Notify,
}

// SAFETY: the buffer is only written by the unique `RingWriter` in
// `[head, head + free)` and only read by the unique `RingReader` in
// `[tail, head)`; the regions are disjoint because `head - tail <= cap`.
// Handing bytes across threads is ordered by the Release store of `head`
// (writer) paired with the Acquire load in the reader, and symmetrically for
// `tail`.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

/// Producer handle. Not `Clone`: single producer by construction.
pub struct RingWriter {
    shared: Arc<Shared>,
}

/// Consumer handle. Not `Clone`: single consumer by construction.
pub struct RingReader {
    shared: Arc<Shared>,
}

/// Creates a ring of `capacity` bytes and returns the two endpoint handles.
pub fn ring(capacity: usize) -> (RingWriter, RingReader) {
    assert!(capacity >= MIN_CAPACITY, "ring capacity too small");
    let shared = Arc::new(Shared {
        buf: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
        cap: capacity as u64,
        head: AtomicU64::new(0),
        tail: AtomicU64::new(0),
        writer_closed: AtomicBool::new(false),
        reader_closed: AtomicBool::new(false),
        data: Notify::new(),
        space: Notify::new(),
    });
    (
        RingWriter {
            shared: shared.clone(),
        },
        RingReader { shared },
    )
}

impl RingWriter {
    /// Writes up to `src.len()` bytes, waiting while the buffer is full.
    /// Returns the number of bytes written (at least 1 for a non-empty
    /// `src`), or [`RingError::Closed`] once the consumer is gone.
    pub async fn write(&mut self, src: &[u8]) -> Result<usize, RingError> {
        if src.is_empty() {
            return Ok(0);
        }
        loop {
            if self.shared.reader_closed.load(Ordering::Acquire) {
                return Err(RingError::Closed);
            }
            let head = self.shared.head.load(Ordering::Relaxed);
            let tail = self.shared.tail.load(Ordering::Acquire);
            let free = self.shared.cap - (head - tail);
            if free > 0 {
                let n = cmp::min(src.len() as u64, free) as usize;
                let off = (head % self.shared.cap) as usize;
                let first = cmp::min(n, self.shared.cap as usize - off);
                // SAFETY: `[off, off + first)` and `[0, n - first)` lie in the
                // writable region; the reader never touches bytes past `head`.
                unsafe {
                    let buf = &mut *self.shared.buf.get();
                    buf[off..off + first].copy_from_slice(&src[..first]);
                    if n > first {
                        buf[..n - first].copy_from_slice(&src[first..n]);
                    }
                }
                self.shared.head.store(head + n as u64, Ordering::Release);
                self.shared.data.notify_one();
                return Ok(n);
            }
            self.shared.space.notified().await;
        }
    }

    /// Writes the whole of `src`, waiting for space as needed.
    pub async fn write_all(&mut self, mut src: &[u8]) -> Result<(), RingError> {
        while !src.is_empty() {
            let n = self.write(src).await?;
            src = &src[n..];
        }
        Ok(())
    }

    /// Signals end of stream to the consumer.
    pub fn close(&mut self) {
        self.shared.writer_closed.store(true, Ordering::Release);
        self.shared.data.notify_one();
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl RingReader {
    /// Number of readable bytes.
    pub fn available(&self) -> usize {
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Relaxed);
        (head - tail) as usize
    }

    pub fn capacity(&self) -> usize {
        self.shared.cap as usize
    }

    /// Waits until at least one byte is readable. Returns the number of
    /// readable bytes, or 0 once the producer closed and the ring drained.
    pub async fn readable(&mut self) -> usize {
        loop {
            let avail = self.available();
            if avail > 0 {
                return avail;
            }
            if self.shared.writer_closed.load(Ordering::Acquire) {
                return 0;
            }
            self.shared.data.notified().await;
        }
    }

    /// Contiguous readable slice. Stops at the physical end of the buffer;
    /// after those bytes are consumed the next `peek` returns the wrapped
    /// region starting at offset 0.
    pub fn peek(&self) -> &[u8] {
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let avail = head - tail;
        let off = (tail % self.shared.cap) as usize;
        let len = cmp::min(avail, self.shared.cap - off as u64) as usize;
        // SAFETY: `[off, off + len)` is within `[tail, head)`, which the
        // writer never mutates until `tail` advances past it.
        unsafe { &(&*self.shared.buf.get())[off..off + len] }
    }

    /// Advances the reader past `n` consumed bytes.
    pub fn consume(&mut self, n: usize) {
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Relaxed);
        assert!(n as u64 <= head - tail, "consumed past the writer");
        self.shared.tail.store(tail + n as u64, Ordering::Release);
        self.shared.space.notify_one();
    }

    /// Copies up to `dst.len()` readable bytes into `dst`, waiting for data.
    /// Returns 0 at end of stream. Handles wrap internally, so callers get
    /// bytes in wire order regardless of where the ring wrapped.
    pub async fn read(&mut self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }
        let avail = self.readable().await;
        if avail == 0 {
            return 0;
        }
        let mut copied = 0;
        while copied < dst.len() && copied < avail {
            let n = {
                let chunk = self.peek();
                if chunk.is_empty() {
                    break;
                }
                let n = cmp::min(chunk.len(), dst.len() - copied);
                dst[copied..copied + n].copy_from_slice(&chunk[..n]);
                n
            };
            self.consume(n);
            copied += n;
        }
        copied
    }

    /// Tells the producer to stop: subsequent writes fail with `Closed`.
    pub fn close(&mut self) {
        self.shared.reader_closed.store(true, Ordering::Release);
        self.shared.space.notify_one();
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let (mut w, mut r) = ring(64);
        w.write_all(b"hello bmp").await.unwrap();
        let mut out = [0u8; 9];
        assert_eq!(r.read(&mut out).await, 9);
        assert_eq!(&out, b"hello bmp");
    }

    #[tokio::test]
    async fn peek_linearizes_on_wrap() {
        let (mut w, mut r) = ring(16);
        w.write_all(&[1u8; 12]).await.unwrap();
        r.consume(12);
        // 12 bytes of the next write land at offsets 12..16 then 0..8
        let write = tokio::spawn(async move {
            w.write_all(&[2u8; 12]).await.unwrap();
            w
        });
        let _w = write.await.unwrap();
        let first = r.peek().to_vec();
        assert_eq!(first, vec![2u8; 4]);
        r.consume(first.len());
        let second = r.peek().to_vec();
        assert_eq!(second, vec![2u8; 8]);
        r.consume(second.len());
        assert_eq!(r.available(), 0);
    }

    #[tokio::test]
    async fn writer_waits_instead_of_overtaking() {
        let (mut w, mut r) = ring(16);
        w.write_all(&[7u8; 16]).await.unwrap();
        assert_eq!(r.available(), 16);

        let writer = tokio::spawn(async move {
            w.write_all(&[8u8; 8]).await.unwrap();
            w
        });
        // full ring: the writer must be parked, not clobbering unread bytes
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        assert_eq!(r.peek(), &[7u8; 16][..]);

        r.consume(8);
        writer.await.unwrap();
        assert_eq!(r.available(), 16);
        let mut out = vec![0u8; 16];
        assert_eq!(r.read(&mut out).await, 16);
        assert_eq!(&out[..8], &[7u8; 8]);
        assert_eq!(&out[8..], &[8u8; 8]);
    }

    #[tokio::test]
    async fn fill_level_never_exceeds_capacity() {
        let (mut w, mut r) = ring(32);
        let writer = tokio::spawn(async move {
            for i in 0..64u8 {
                w.write_all(&[i; 7]).await.unwrap();
            }
        });
        let mut total = 0;
        let mut buf = [0u8; 5];
        while total < 64 * 7 {
            assert!(r.available() <= 32);
            let n = r.read(&mut buf).await;
            assert!(n > 0);
            total += n;
        }
        writer.await.unwrap();
        assert_eq!(total, 64 * 7);
    }

    #[tokio::test]
    async fn reader_sees_eof_after_writer_close() {
        let (mut w, mut r) = ring(32);
        w.write_all(b"tail").await.unwrap();
        drop(w);
        let mut out = [0u8; 8];
        assert_eq!(r.read(&mut out).await, 4);
        assert_eq!(r.read(&mut out).await, 0);
    }

    #[tokio::test]
    async fn writer_errors_after_reader_close() {
        let (mut w, r) = ring(32);
        drop(r);
        assert_eq!(w.write(b"x").await, Err(RingError::Closed));
    }
}
