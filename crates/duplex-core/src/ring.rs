//! Fixed-capacity single-producer/single-consumer sample ring.
//!
//! Wraps a `ringbuf` heap ring of interleaved `f32` samples. Reads and writes
//! always move whole frames, never block and never overwrite unread data; a
//! short count is how a shortfall is reported. Both halves also maintain
//! monotonic cursor counters so a [`RingObserver`] held by a third context can
//! answer fill queries without touching the ring itself.

use crate::error::{Error, Result};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct RingCursors {
    written: AtomicU64,
    read: AtomicU64,
    capacity: usize,
    channels: usize,
}

impl RingCursors {
    #[inline]
    fn occupied(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let written = self.written.load(Ordering::Acquire);
        written.saturating_sub(read) as usize
    }
}

/// An unsplit sample ring. Call [`SampleRingBuffer::split`] to hand the two
/// halves to their contexts.
pub struct SampleRingBuffer {
    rb: HeapRb<f32>,
    cursors: Arc<RingCursors>,
}

impl SampleRingBuffer {
    /// Ring holding `frames` frames of `channels` interleaved samples.
    pub fn new(frames: usize, channels: usize) -> Result<Self> {
        if channels == 0 {
            return Err(Error::InvalidRing("channel count must be non-zero".into()));
        }
        if frames == 0 {
            return Err(Error::InvalidRing("capacity must be non-zero".into()));
        }
        let capacity = frames
            .checked_mul(channels)
            .ok_or_else(|| Error::InvalidRing(format!("{frames} frames x {channels} channels")))?;

        Ok(Self {
            rb: HeapRb::new(capacity),
            cursors: Arc::new(RingCursors {
                written: AtomicU64::new(0),
                read: AtomicU64::new(0),
                capacity,
                channels,
            }),
        })
    }

    /// Ring sized to hold `seconds` of audio at `sample_rate`.
    pub fn with_seconds(seconds: f64, sample_rate: f64, channels: usize) -> Result<Self> {
        if !(seconds.is_finite() && seconds > 0.0 && sample_rate.is_finite() && sample_rate > 0.0)
        {
            return Err(Error::InvalidRing(format!(
                "{seconds} s at {sample_rate} Hz"
            )));
        }
        Self::new((seconds * sample_rate).ceil() as usize, channels)
    }

    pub fn observer(&self) -> RingObserver {
        RingObserver {
            cursors: Arc::clone(&self.cursors),
        }
    }

    pub fn split(self) -> (RingProducer, RingConsumer) {
        let (prod, cons) = self.rb.split();
        (
            RingProducer {
                inner: prod,
                cursors: Arc::clone(&self.cursors),
            },
            RingConsumer {
                inner: cons,
                cursors: self.cursors,
            },
        )
    }
}

/// Writing half of a [`SampleRingBuffer`].
pub struct RingProducer {
    inner: HeapProd<f32>,
    cursors: Arc<RingCursors>,
}

impl RingProducer {
    /// Copy as many whole frames of `samples` as fit. Returns samples written.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let len = whole_frames(samples.len().min(self.inner.vacant_len()), self.cursors.channels);
        let written = self.inner.push_slice(&samples[..len]);
        self.cursors
            .written
            .fetch_add(written as u64, Ordering::Release);
        written
    }

    /// Write up to `samples` zero samples. Returns samples written.
    pub fn write_silence(&mut self, samples: usize) -> usize {
        let len = whole_frames(samples.min(self.inner.vacant_len()), self.cursors.channels);
        let written = self
            .inner
            .push_iter(core::iter::repeat(0.0).take(len));
        self.cursors
            .written
            .fetch_add(written as u64, Ordering::Release);
        written
    }

    #[inline]
    pub fn available_to_write(&self) -> usize {
        self.inner.vacant_len()
    }

    #[inline]
    pub fn available_to_read(&self) -> usize {
        self.inner.occupied_len()
    }

    #[inline]
    pub fn writable_frames(&self) -> usize {
        self.available_to_write() / self.cursors.channels
    }

    #[inline]
    pub fn readable_frames(&self) -> usize {
        self.available_to_read() / self.cursors.channels
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.cursors.channels
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cursors.capacity
    }

    /// Samples written over the ring's lifetime.
    #[inline]
    pub fn total_written(&self) -> u64 {
        self.cursors.written.load(Ordering::Acquire)
    }

    pub fn observer(&self) -> RingObserver {
        RingObserver {
            cursors: Arc::clone(&self.cursors),
        }
    }
}

/// Reading half of a [`SampleRingBuffer`].
pub struct RingConsumer {
    inner: HeapCons<f32>,
    cursors: Arc<RingCursors>,
}

impl RingConsumer {
    /// Fill `out` with as many whole frames as are available. Returns samples read.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let len = whole_frames(out.len().min(self.inner.occupied_len()), self.cursors.channels);
        let read = self.inner.pop_slice(&mut out[..len]);
        self.cursors.read.fetch_add(read as u64, Ordering::Release);
        read
    }

    /// Drop up to `samples` unread samples (whole frames). Returns samples dropped.
    pub fn discard(&mut self, samples: usize) -> usize {
        let len = whole_frames(samples.min(self.inner.occupied_len()), self.cursors.channels);
        let skipped = self.inner.skip(len);
        self.cursors
            .read
            .fetch_add(skipped as u64, Ordering::Release);
        skipped
    }

    #[inline]
    pub fn available_to_read(&self) -> usize {
        self.inner.occupied_len()
    }

    #[inline]
    pub fn available_to_write(&self) -> usize {
        self.inner.vacant_len()
    }

    #[inline]
    pub fn readable_frames(&self) -> usize {
        self.available_to_read() / self.cursors.channels
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.cursors.channels
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cursors.capacity
    }

    /// Samples read (or discarded) over the ring's lifetime.
    #[inline]
    pub fn total_read(&self) -> u64 {
        self.cursors.read.load(Ordering::Acquire)
    }

    pub fn observer(&self) -> RingObserver {
        RingObserver {
            cursors: Arc::clone(&self.cursors),
        }
    }
}

/// Read-only view of a ring's fill level, safe from any thread.
///
/// Values lag the true cursors by at most one in-flight read or write.
#[derive(Debug, Clone)]
pub struct RingObserver {
    cursors: Arc<RingCursors>,
}

impl RingObserver {
    #[inline]
    pub fn available_to_read(&self) -> usize {
        self.cursors.occupied()
    }

    #[inline]
    pub fn available_to_write(&self) -> usize {
        self.cursors.capacity.saturating_sub(self.cursors.occupied())
    }

    #[inline]
    pub fn readable_frames(&self) -> usize {
        self.available_to_read() / self.cursors.channels
    }

    #[inline]
    pub fn writable_frames(&self) -> usize {
        self.available_to_write() / self.cursors.channels
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cursors.capacity
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.cursors.channels
    }

    pub fn total_written(&self) -> u64 {
        self.cursors.written.load(Ordering::Acquire)
    }

    pub fn total_read(&self) -> u64 {
        self.cursors.read.load(Ordering::Acquire)
    }
}

#[inline]
fn whole_frames(samples: usize, channels: usize) -> usize {
    samples - samples % channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn test_rejects_zero_geometry() {
        assert!(SampleRingBuffer::new(0, 2).is_err());
        assert!(SampleRingBuffer::new(16, 0).is_err());
        assert!(SampleRingBuffer::with_seconds(0.0, 44100.0, 1).is_err());
    }

    #[test]
    fn test_with_seconds_capacity() {
        let ring = SampleRingBuffer::with_seconds(2.0, 44100.0, 2).unwrap();
        assert_eq!(ring.observer().capacity(), 2 * 44100 * 2);
    }

    #[test]
    fn test_write_never_overwrites() {
        let (mut prod, mut cons) = SampleRingBuffer::new(4, 1).unwrap().split();
        assert_eq!(prod.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), 4);
        assert_eq!(prod.write(&[7.0]), 0);

        let mut out = [0.0; 8];
        assert_eq!(cons.read(&mut out), 4);
        assert_eq!(&out[..4], &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_whole_frames_only() {
        let (mut prod, mut cons) = SampleRingBuffer::new(3, 2).unwrap().split();
        // 7 samples offered into room for 6: only 3 whole stereo frames go in
        assert_eq!(prod.write(&[0.0; 7]), 6);

        let mut out = [0.0; 5];
        assert_eq!(cons.read(&mut out), 4);
        assert_eq!(cons.available_to_read(), 2);
    }

    #[test]
    fn test_discard_and_observer() {
        let ring = SampleRingBuffer::new(8, 1).unwrap();
        let observer = ring.observer();
        let (mut prod, mut cons) = ring.split();

        prod.write(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(observer.available_to_read(), 4);
        assert_eq!(observer.available_to_write(), 4);

        assert_eq!(cons.discard(3), 3);
        let mut out = [0.0; 1];
        cons.read(&mut out);
        assert_eq!(out[0], 4.0);
        assert_eq!(observer.total_read(), 4);
        assert_eq!(observer.total_written(), 4);
    }

    #[test]
    fn test_write_silence() {
        let (mut prod, mut cons) = SampleRingBuffer::new(4, 2).unwrap().split();
        assert_eq!(prod.write_silence(5), 4);
        let mut out = [1.0; 4];
        assert_eq!(cons.read(&mut out), 4);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    /// Concurrent producer and consumer: every sample arrives once, in order.
    #[test]
    fn test_spsc_threads_fifo() {
        const TOTAL: usize = 200_000;
        let (mut prod, mut cons) = SampleRingBuffer::new(1024, 1).unwrap().split();

        let writer = thread::spawn(move || {
            let mut next = 0usize;
            let mut block = [0.0f32; 97];
            while next < TOTAL {
                let n = block.len().min(TOTAL - next);
                for (i, s) in block[..n].iter_mut().enumerate() {
                    *s = (next + i) as f32;
                }
                let written = prod.write(&block[..n]);
                next += written;
                if written == 0 {
                    thread::yield_now();
                }
            }
        });

        let mut expected = 0usize;
        let mut out = [0.0f32; 61];
        while expected < TOTAL {
            let read = cons.read(&mut out);
            for &s in &out[..read] {
                assert_eq!(s, expected as f32);
                expected += 1;
            }
            if read == 0 {
                thread::yield_now();
            }
        }
        writer.join().unwrap();
        assert_eq!(cons.total_read(), TOTAL as u64);
    }

    proptest! {
        /// Interleaved writes and reads: total read never exceeds total written,
        /// and data comes out in the order it went in.
        #[test]
        fn prop_read_never_passes_write(ops in prop::collection::vec((any::<bool>(), 0usize..40), 1..200)) {
            let ring = SampleRingBuffer::new(32, 2).unwrap();
            let observer = ring.observer();
            let (mut prod, mut cons) = ring.split();
            let mut next_in = 0u32;
            let mut next_out = 0u32;

            for (is_write, len) in ops {
                if is_write {
                    let block: Vec<f32> = (0..len as u32).map(|i| (next_in + i) as f32).collect();
                    let written = prod.write(&block);
                    prop_assert_eq!(written % 2, 0);
                    next_in += written as u32;
                } else {
                    let mut out = vec![0.0f32; len];
                    let read = cons.read(&mut out);
                    prop_assert_eq!(read % 2, 0);
                    for &s in &out[..read] {
                        prop_assert_eq!(s, next_out as f32);
                        next_out += 1;
                    }
                }
                prop_assert!(observer.total_read() <= observer.total_written());
                prop_assert!(observer.available_to_read() <= observer.capacity());
            }
        }
    }
}
