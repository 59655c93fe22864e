//! Lock-free primitives shared between the device callback and other contexts.

use atomic_float::{AtomicF32, AtomicF64};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};

/// A boolean raised by one context and observed by others.
#[derive(Debug, Default)]
pub struct SyncFlag(AtomicBool);

impl SyncFlag {
    pub const fn new(value: bool) -> Self {
        Self(AtomicBool::new(value))
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }

    /// Read and lower the flag, for conditions reported once.
    #[inline]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// A linear level (gain, pan, volume or peak) written and read without locks.
#[derive(Debug)]
pub struct SharedLevel(AtomicF32);

impl SharedLevel {
    pub fn new(value: f32) -> Self {
        Self(AtomicF32::new(value))
    }

    #[inline]
    pub fn get(&self) -> f32 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: f32) {
        self.0.store(value, Ordering::Release);
    }

    /// Hold the larger of the current level and `value`.
    #[inline]
    pub fn raise(&self, value: f32) {
        self.0.fetch_max(value, Ordering::AcqRel);
    }

    /// Read the level and reset it to silence.
    #[inline]
    pub fn take(&self) -> f32 {
        self.0.swap(0.0, Ordering::AcqRel)
    }
}

/// A time in seconds that may be absent. Absence is stored as `NaN` so the
/// callback can write it without a lock.
#[derive(Debug)]
pub struct SecondsCell(AtomicF64);

impl SecondsCell {
    pub fn new(seconds: f64) -> Self {
        Self(AtomicF64::new(seconds))
    }

    pub fn empty() -> Self {
        Self::new(f64::NAN)
    }

    #[inline]
    pub fn get(&self) -> Option<f64> {
        let seconds = self.0.load(Ordering::Acquire);
        (!seconds.is_nan()).then_some(seconds)
    }

    #[inline]
    pub fn set(&self, seconds: f64) {
        self.0.store(seconds, Ordering::Release);
    }

    #[inline]
    pub fn clear(&self) {
        self.set(f64::NAN);
    }

    /// Keep the largest time seen; an empty cell takes `seconds`.
    #[inline]
    pub fn raise(&self, seconds: f64) {
        self.0.fetch_max(seconds, Ordering::AcqRel);
    }
}

/// A position snapshot published by the device callback.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StreamPosition {
    /// Seconds of device time since the stream started, including paused time.
    pub device_time: f64,
    /// Track time that is currently audible (or being captured).
    pub track_time: f64,
    /// Completed loop passes.
    pub pass: u64,
}

/// Single-writer, many-reader cell for [`StreamPosition`].
///
/// A sequence lock: the writer never waits, readers retry while a write is in
/// flight and never observe a torn snapshot. Only one thread may call
/// [`PositionCell::publish`].
#[derive(Debug, Default)]
pub struct PositionCell {
    seq: AtomicU64,
    device_time: AtomicU64,
    track_time: AtomicU64,
    pass: AtomicU64,
}

impl PositionCell {
    pub fn new(initial: StreamPosition) -> Self {
        let cell = Self::default();
        cell.publish(initial);
        cell
    }

    pub fn publish(&self, position: StreamPosition) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        self.device_time
            .store(position.device_time.to_bits(), Ordering::Relaxed);
        self.track_time
            .store(position.track_time.to_bits(), Ordering::Relaxed);
        self.pass.store(position.pass, Ordering::Relaxed);

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    pub fn load(&self) -> StreamPosition {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let position = StreamPosition {
                device_time: f64::from_bits(self.device_time.load(Ordering::Relaxed)),
                track_time: f64::from_bits(self.track_time.load(Ordering::Relaxed)),
                pass: self.pass.load(Ordering::Relaxed),
            };

            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return position;
            }
        }
    }
}
