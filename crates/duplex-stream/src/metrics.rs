//! I/O statistics for the stream worker.
//!
//! Counts frames moved between track storage and the rings and how often the
//! worker found playback below its low-water mark.

use std::sync::atomic::{AtomicU64, Ordering};

/// Worker I/O counters. Updated with relaxed atomics from the worker (and its
/// rayon helpers), read from anywhere.
#[derive(Debug, Default)]
pub struct IoMetrics {
    /// Frames read from playback storage
    frames_read: AtomicU64,
    /// Frames appended to capture storage
    frames_written: AtomicU64,
    /// Storage read calls
    read_ops: AtomicU64,
    /// Storage append calls
    write_ops: AtomicU64,
    /// Reads that returned fewer frames than asked before the end of the track
    short_reads: AtomicU64,
    /// Refill passes that started below the low-water mark
    low_water_events: AtomicU64,
    /// Chunks rendered into the playback rings
    chunks_rendered: AtomicU64,
}

impl IoMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_read(&self, frames: u64) {
        self.frames_read.fetch_add(frames, Ordering::Relaxed);
        self.read_ops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write(&self, frames: u64) {
        self.frames_written.fetch_add(frames, Ordering::Relaxed);
        self.write_ops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_low_water(&self) {
        self.low_water_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_chunk(&self) {
        self.chunks_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IoMetricsSnapshot {
        IoMetricsSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            low_water_events: self.low_water_events.load(Ordering::Relaxed),
            chunks_rendered: self.chunks_rendered.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.frames_read.store(0, Ordering::Relaxed);
        self.frames_written.store(0, Ordering::Relaxed);
        self.read_ops.store(0, Ordering::Relaxed);
        self.write_ops.store(0, Ordering::Relaxed);
        self.short_reads.store(0, Ordering::Relaxed);
        self.low_water_events.store(0, Ordering::Relaxed);
        self.chunks_rendered.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`IoMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoMetricsSnapshot {
    pub frames_read: u64,
    pub frames_written: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub short_reads: u64,
    pub low_water_events: u64,
    pub chunks_rendered: u64,
}

impl IoMetricsSnapshot {
    /// Average frames per storage read.
    pub fn avg_read_frames(&self) -> u64 {
        if self.read_ops == 0 {
            0
        } else {
            self.frames_read / self.read_ops
        }
    }

    /// Average frames per storage append.
    pub fn avg_write_frames(&self) -> u64 {
        if self.write_ops == 0 {
            0
        } else {
            self.frames_written / self.write_ops
        }
    }
}
