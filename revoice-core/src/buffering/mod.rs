//! Bounded PCM ring buffers shared between the audio threads and the
//! inference worker.
//!
//! The pipeline-facing rings are mutex-guarded rather than lock-free: the
//! critical sections are short (a bounded memcpy), and `write` must never
//! fail — on overflow the *oldest* samples are shifted out so memory stays
//! bounded under overload. The lock-free `ringbuf` SPSC pair is still used
//! at the device-callback boundary (see `audio`), where the callback may
//! not block.

pub mod manager;

use parking_lot::Mutex;

/// Fixed-capacity f32 ring buffer with shift-on-overflow writes.
///
/// Thread-safe: every operation takes the internal mutex, so concurrent
/// writers and readers are linearizable. FIFO order is preserved; overflow
/// discards from the oldest end only and is counted in `drops()`.
pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    buf: Vec<f32>,
    /// Index of the oldest live sample.
    head: usize,
    /// Number of live samples, `0 ..= capacity`.
    len: usize,
    /// Total samples discarded by overflowing writes.
    drops: u64,
}

impl RingBuffer {
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                buf: vec![0.0; capacity],
                head: 0,
                len: 0,
                drops: 0,
            }),
        }
    }

    /// Append all samples. Never fails: if the write would exceed capacity,
    /// the oldest `size + len - capacity` samples are discarded first (the
    /// buffered ones, then the front of `samples` if it alone exceeds
    /// capacity) and counted as drops.
    pub fn write(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let mut g = self.inner.lock();
        let cap = self.capacity;
        let mut src = samples;

        let overflow = (g.len + src.len()).saturating_sub(cap);
        if overflow > 0 {
            g.drops += overflow as u64;
            let from_buffer = overflow.min(g.len);
            g.head = (g.head + from_buffer) % cap;
            g.len -= from_buffer;
            src = &src[overflow - from_buffer..];
        }

        let tail = (g.head + g.len) % cap;
        let first = src.len().min(cap - tail);
        g.buf[tail..tail + first].copy_from_slice(&src[..first]);
        if first < src.len() {
            let rest = src.len() - first;
            g.buf[..rest].copy_from_slice(&src[first..]);
        }
        g.len += src.len();
    }

    /// Remove and return up to `n` oldest samples, in FIFO order.
    pub fn read(&self, n: usize) -> Vec<f32> {
        let mut g = self.inner.lock();
        let take = n.min(g.len);
        let out = copy_from(&g, take);
        g.head = (g.head + take) % self.capacity;
        g.len -= take;
        out
    }

    /// Like `read`, but leaves the read cursor in place.
    pub fn peek(&self, n: usize) -> Vec<f32> {
        let g = self.inner.lock();
        let take = n.min(g.len);
        copy_from(&g, take)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len
    }

    pub fn available(&self) -> usize {
        self.capacity - self.inner.lock().len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples discarded by overflowing writes since creation (or the last
    /// `reset`).
    pub fn drops(&self) -> u64 {
        self.inner.lock().drops
    }

    /// Discard all buffered samples. The drops counter is preserved.
    pub fn clear(&self) {
        let mut g = self.inner.lock();
        g.head = 0;
        g.len = 0;
    }

    /// `clear` plus a drops-counter reset.
    pub fn reset(&self) {
        let mut g = self.inner.lock();
        g.head = 0;
        g.len = 0;
        g.drops = 0;
    }
}

fn copy_from(g: &Inner, take: usize) -> Vec<f32> {
    let cap = g.buf.len();
    let mut out = Vec::with_capacity(take);
    let first = take.min(cap - g.head);
    out.extend_from_slice(&g.buf[g.head..g.head + first]);
    if first < take {
        out.extend_from_slice(&g.buf[..take - first]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|i| i as f32).collect()
    }

    #[test]
    fn fifo_order_preserved() {
        let rb = RingBuffer::new(16);
        rb.write(&ramp(0, 4));
        rb.write(&ramp(4, 4));
        assert_eq!(rb.read(8), ramp(0, 8));
    }

    #[test]
    fn read_beyond_size_returns_what_is_available() {
        let rb = RingBuffer::new(8);
        rb.write(&ramp(0, 3));
        assert_eq!(rb.read(10), ramp(0, 3));
        assert!(rb.read(1).is_empty());
    }

    #[test]
    fn overflow_drops_oldest_only() {
        let rb = RingBuffer::new(8);
        rb.write(&ramp(0, 6));
        rb.write(&ramp(6, 4)); // 10 total → 2 oldest discarded
        assert_eq!(rb.size(), 8);
        assert_eq!(rb.drops(), 2);
        assert_eq!(rb.read(8), ramp(2, 8));
    }

    #[test]
    fn write_larger_than_capacity_keeps_tail() {
        let rb = RingBuffer::new(4);
        rb.write(&ramp(0, 2));
        rb.write(&ramp(2, 10)); // keeps the last 4 of the 12 logical samples
        assert_eq!(rb.size(), 4);
        assert_eq!(rb.drops(), 8);
        assert_eq!(rb.read(4), ramp(8, 4));
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let rb = RingBuffer::new(7);
        for i in 0..50 {
            rb.write(&ramp(i, (i % 11) + 1));
            assert!(rb.size() <= rb.capacity());
            let _ = rb.read(i % 5);
            assert!(rb.size() <= rb.capacity());
        }
    }

    #[test]
    fn peek_does_not_advance() {
        let rb = RingBuffer::new(8);
        rb.write(&ramp(0, 5));
        assert_eq!(rb.peek(3), ramp(0, 3));
        assert_eq!(rb.size(), 5);
        assert_eq!(rb.read(3), ramp(0, 3));
        assert_eq!(rb.size(), 2);
    }

    #[test]
    fn wraparound_write_and_read() {
        let rb = RingBuffer::new(8);
        rb.write(&ramp(0, 6));
        assert_eq!(rb.read(4), ramp(0, 4));
        rb.write(&ramp(6, 5)); // wraps past the end of the backing store
        assert_eq!(rb.size(), 7);
        assert_eq!(rb.read(7), ramp(4, 7));
    }

    #[test]
    fn clear_keeps_drops_reset_clears_them() {
        let rb = RingBuffer::new(4);
        rb.write(&ramp(0, 6));
        assert_eq!(rb.drops(), 2);
        rb.clear();
        assert_eq!(rb.size(), 0);
        assert_eq!(rb.drops(), 2);
        rb.reset();
        assert_eq!(rb.drops(), 0);
    }

    #[test]
    fn concurrent_write_read_stays_bounded() {
        use std::sync::Arc;

        let rb = Arc::new(RingBuffer::new(1024));
        let writer = {
            let rb = Arc::clone(&rb);
            std::thread::spawn(move || {
                for i in 0..200 {
                    rb.write(&ramp(i, 64));
                }
            })
        };
        let reader = {
            let rb = Arc::clone(&rb);
            std::thread::spawn(move || {
                let mut total = 0usize;
                for _ in 0..200 {
                    total += rb.read(64).len();
                }
                total
            })
        };
        writer.join().unwrap();
        let read_total = reader.join().unwrap();
        assert!(rb.size() <= rb.capacity());
        assert!(read_total + rb.size() + rb.drops() as usize == 200 * 64);
    }
}
