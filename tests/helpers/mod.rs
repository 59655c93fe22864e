//! Test helpers and fixtures for duplex integration tests
//!
//! Streams run against the simulated driver with manual cycle control. The
//! I/O worker is a real thread, so [`pump`] waits for it to keep the rings
//! ahead of the device before each cycle. Tests that want dropouts run
//! cycles directly instead.

#![allow(dead_code)]

use duplex::prelude::*;
use duplex::SimulatedDevice;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default test rate (preferred by rate negotiation)
pub const TEST_RATE: f64 = 44100.0;

/// 10 ms blocks at the test rate
pub const BLOCK: usize = 441;

/// Floating point rounding errors (passthrough, unity gain).
pub const FLOAT_EPSILON: f32 = 1e-6;

/// Values below this are considered silent (~-80dB).
pub const SILENCE_THRESHOLD: f32 = 0.0001;

/// Install a fmt subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn device_config(block_frames: usize, input_latency: f64) -> SimulatedConfig {
    SimulatedConfig {
        block_frames,
        input_latency,
        ..SimulatedConfig::default()
    }
}

/// Controller on a simulated device.
pub fn test_controller(
    device: SimulatedConfig,
    buffers: BufferConfig,
) -> (StreamController, SimulatedDevice) {
    init_tracing();
    let (driver, handle) = SimulatedDriver::new(device);
    let controller = StreamController::builder()
        .driver(driver)
        .buffer_config(buffers)
        .build()
        .expect("Failed to create test controller");
    (controller, handle)
}

/// Buffers of `seconds` with a fast worker.
pub fn buffers(seconds: f64) -> BufferConfig {
    BufferConfig::with_buffer_seconds(seconds).worker_interval_ms(1)
}

/// Mono track holding `value` for `seconds`.
pub fn constant_track(rate: f64, seconds: f64, value: f32) -> Arc<Mutex<MemoryTrack>> {
    let frames = (rate * seconds).round() as usize;
    share(MemoryTrack::from_samples(rate, 1, vec![value; frames]))
}

/// Mono track whose samples count up by `step`.
pub fn staircase_track(rate: f64, seconds: f64, step: f32) -> Arc<Mutex<MemoryTrack>> {
    let frames = (rate * seconds).round() as usize;
    let samples = (0..frames).map(|i| i as f32 * step).collect();
    share(MemoryTrack::from_samples(rate, 1, samples))
}

/// Wait until the worker has the rings ready for a block of `frames`.
pub fn wait_ready(controller: &StreamController, frames: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let Some(status) = controller.ring_status() else {
            return true;
        };
        let playback_ok = status.fill_complete
            || status
                .playback_readable_frames
                .map_or(true, |readable| readable >= 2 * frames);
        let capture_ok = status
            .capture_writable_frames
            .map_or(true, |writable| writable >= frames);
        if playback_ok && capture_ok {
            return true;
        }
        thread::sleep(Duration::from_micros(200));
    }
    false
}

/// Run `cycles` device blocks, keeping the worker ahead of each one.
pub fn pump(controller: &StreamController, device: &SimulatedDevice, cycles: usize) {
    let block = device.block_frames().unwrap_or(BLOCK);
    for _ in 0..cycles {
        assert!(wait_ready(controller, block), "I/O worker fell behind");
        assert!(device.run_cycle(), "device is not running");
    }
}

/// Poll `cond` for up to five seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Calculate peak amplitude of a signal.
pub fn peak(samples: &[f32]) -> f32 {
    samples
        .iter()
        .map(|s| s.abs())
        .fold(0.0_f32, |a, b| a.max(b))
}

/// Longest run of silent frames in an interleaved signal.
pub fn longest_silence(samples: &[f32], channels: usize) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for frame in samples.chunks_exact(channels) {
        if peak(frame) <= SILENCE_THRESHOLD {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

/// Memory track whose reads block while the gate is closed, like storage
/// stuck on a slow disk.
pub struct GatedTrack {
    inner: MemoryTrack,
    stalled: Arc<AtomicBool>,
}

impl GatedTrack {
    pub fn new(inner: MemoryTrack) -> (Self, Arc<AtomicBool>) {
        let stalled = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                stalled: Arc::clone(&stalled),
            },
            stalled,
        )
    }
}

impl TrackStorage for GatedTrack {
    fn sample_rate(&self) -> f64 {
        self.inner.sample_rate()
    }

    fn channels(&self) -> usize {
        self.inner.channels()
    }

    fn len_frames(&self) -> u64 {
        self.inner.len_frames()
    }

    fn read(&mut self, start_frame: u64, out: &mut [f32]) -> duplex::stream::Result<usize> {
        while self.stalled.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        self.inner.read(start_frame, out)
    }

    fn append(&mut self, samples: &[f32], capture_time: f64) -> duplex::stream::Result<()> {
        self.inner.append(samples, capture_time)
    }

    fn shift_capture(&mut self, from: u64, offset: i64) -> duplex::stream::Result<()> {
        self.inner.shift_capture(from, offset)
    }
}

/// Capture track that refuses every append.
pub struct BrokenTrack;

impl TrackStorage for BrokenTrack {
    fn sample_rate(&self) -> f64 {
        TEST_RATE
    }

    fn channels(&self) -> usize {
        1
    }

    fn len_frames(&self) -> u64 {
        0
    }

    fn read(&mut self, _start_frame: u64, _out: &mut [f32]) -> duplex::stream::Result<usize> {
        Ok(0)
    }

    fn append(&mut self, _samples: &[f32], _capture_time: f64) -> duplex::stream::Result<()> {
        Err(duplex::stream::Error::Storage("disk full".into()))
    }

    fn shift_capture(&mut self, _from: u64, _offset: i64) -> duplex::stream::Result<()> {
        Ok(())
    }
}

/// Capture track whose storage backend crashes on the first append.
pub struct CrashingTrack;

impl TrackStorage for CrashingTrack {
    fn sample_rate(&self) -> f64 {
        TEST_RATE
    }

    fn channels(&self) -> usize {
        1
    }

    fn len_frames(&self) -> u64 {
        0
    }

    fn read(&mut self, _start_frame: u64, _out: &mut [f32]) -> duplex::stream::Result<usize> {
        Ok(0)
    }

    fn append(&mut self, _samples: &[f32], _capture_time: f64) -> duplex::stream::Result<()> {
        panic!("storage backend crashed");
    }

    fn shift_capture(&mut self, _from: u64, _offset: i64) -> duplex::stream::Result<()> {
        Ok(())
    }
}
