//! Dropout (lost interval) detection and logging.
//!
//! [`DropoutDetector`] lives in the device callback. Consecutive callbacks with
//! a shortfall are coalesced into one [`LostInterval`]; the run is closed by
//! the first callback without one and pushed into a pre-sized ring, so the
//! callback never allocates. The run still open is mirrored into atomics so
//! the controller can include it after the device stops.

use crate::lockfree::SecondsCell;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// What caused a dropout. A coalesced run may carry several causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct DropoutKinds(u8);

impl DropoutKinds {
    pub const NONE: Self = Self(0);
    /// Playback ring ran dry.
    pub const PLAYBACK: Self = Self(1);
    /// Capture ring had no room.
    pub const CAPTURE: Self = Self(1 << 1);
    /// The driver reported an overflow or underflow of its own.
    pub const UPSTREAM: Self = Self(1 << 2);
    /// The final drain did not finish before the stop timeout.
    pub const DRAIN_TIMEOUT: Self = Self(1 << 3);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b1111)
    }
}

impl core::ops::BitOr for DropoutKinds {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for DropoutKinds {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A span of device time where samples were lost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LostInterval {
    /// Device seconds since stream start of the first lost frame.
    pub start: f64,
    /// Seconds of audio lost.
    pub duration: f64,
    pub kinds: DropoutKinds,
}

#[derive(Debug)]
struct OpenRun {
    start: SecondsCell,
    duration: SecondsCell,
    kinds: AtomicU8,
    dropped: AtomicU64,
}

/// Create a detector/log pair whose ring holds `capacity` closed intervals.
pub fn dropout_log(capacity: usize) -> (DropoutDetector, DropoutLog) {
    let (producer, consumer) = HeapRb::new(capacity.max(1)).split();
    let open = Arc::new(OpenRun {
        start: SecondsCell::empty(),
        duration: SecondsCell::new(0.0),
        kinds: AtomicU8::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        DropoutDetector {
            producer,
            run: None,
            open: Arc::clone(&open),
        },
        DropoutLog {
            consumer,
            open,
            intervals: Vec::with_capacity(16),
        },
    )
}

/// Callback-side coalescer.
pub struct DropoutDetector {
    producer: HeapProd<LostInterval>,
    run: Option<LostInterval>,
    open: Arc<OpenRun>,
}

impl DropoutDetector {
    /// Note `missing` seconds lost starting at device time `at`.
    #[inline]
    pub fn shortfall(&mut self, at: f64, missing: f64, kinds: DropoutKinds) {
        let run = self.run.get_or_insert(LostInterval {
            start: at,
            duration: 0.0,
            kinds: DropoutKinds::NONE,
        });
        run.duration += missing;
        run.kinds |= kinds;

        self.open.duration.set(run.duration);
        self.open.kinds.store(run.kinds.bits(), Ordering::Release);
        self.open.start.set(run.start);
    }

    /// A callback completed without shortfall: close any open run.
    #[inline]
    pub fn settle(&mut self) {
        if let Some(run) = self.run.take() {
            if self.producer.try_push(run).is_err() {
                self.open.dropped.fetch_add(1, Ordering::Relaxed);
            }
            self.open.start.clear();
        }
    }

    #[inline]
    pub fn in_run(&self) -> bool {
        self.run.is_some()
    }
}

/// Controller-side collection of closed intervals.
pub struct DropoutLog {
    consumer: HeapCons<LostInterval>,
    open: Arc<OpenRun>,
    intervals: Vec<LostInterval>,
}

impl DropoutLog {
    /// Move closed intervals out of the ring and return everything collected.
    pub fn collect(&mut self) -> &[LostInterval] {
        while let Some(interval) = self.consumer.try_pop() {
            self.intervals.push(interval);
        }
        &self.intervals
    }

    /// Record an interval observed outside the callback.
    pub fn record(&mut self, interval: LostInterval) {
        self.intervals.push(interval);
    }

    /// Collect, fold in a still-open run, and return intervals ordered by start.
    ///
    /// Only call once the detector's callback can no longer run.
    pub fn finish(&mut self) -> Vec<LostInterval> {
        self.collect();
        if let Some(start) = self.open.start.get() {
            self.intervals.push(LostInterval {
                start,
                duration: self.open.duration.get().unwrap_or(0.0),
                kinds: DropoutKinds::from_bits(self.open.kinds.load(Ordering::Acquire)),
            });
            self.open.start.clear();
        }
        self.intervals.sort_by(|a, b| a.start.total_cmp(&b.start));
        self.intervals.clone()
    }

    /// Intervals that could not be logged because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.open.dropped.load(Ordering::Relaxed)
    }
}
