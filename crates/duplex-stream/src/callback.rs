//! The device callback.
//!
//! Runs on the device thread once per block. Moves captured input into the
//! capture rings, mixes the playback rings into the output and publishes the
//! stream position. Never allocates, locks, logs or touches storage: every
//! buffer is sized when the stream is built and larger device blocks are
//! processed in sub-blocks.

use crate::driver::{CallbackIo, DeviceProcess};
use crate::mixer::MixBus;
use crate::shared::{PauseControl, StreamShared};
use duplex_core::{DropoutDetector, DropoutKinds, RingConsumer, RingProducer, StreamPosition};
use ringbuf::traits::Consumer;
use ringbuf::HeapCons;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Maps a run of ring frames to the track time rendered into them.
///
/// The worker pushes one marker per rendered span, before the span's
/// samples, so the callback always finds a marker for what it plays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PositionMarker {
    /// Ring frames written before this span.
    pub frame: u64,
    pub start: f64,
    pub end: f64,
    pub frames: usize,
    pub pass: u64,
}

impl PositionMarker {
    #[inline]
    fn contains(&self, frame: u64) -> bool {
        frame < self.frame + self.frames as u64
    }

    #[inline]
    fn time_at(&self, frame: u64) -> f64 {
        if self.frames == 0 {
            return self.end;
        }
        let offset = frame.saturating_sub(self.frame).min(self.frames as u64);
        self.start + (self.end - self.start) * offset as f64 / self.frames as f64
    }
}

/// One capture track's ring and the device channels feeding it.
pub(crate) struct CaptureLane {
    pub producer: RingProducer,
    pub first_channel: usize,
}

pub(crate) struct CallbackSetup {
    pub shared: Arc<StreamShared>,
    pub pause: Arc<PauseControl>,
    pub capture: Vec<CaptureLane>,
    pub playback: Vec<RingConsumer>,
    pub bus: MixBus,
    pub markers: Option<HeapCons<PositionMarker>>,
    pub detector: Option<DropoutDetector>,
    pub detect_upstream: bool,
    pub playthrough: bool,
    pub device_rate: f64,
    pub max_block_frames: usize,
    pub start_time: f64,
    /// Device frames to record before capture stops, and the track time
    /// they end at. `None` records until stopped.
    pub capture_bound: Option<(u64, f64)>,
}

pub(crate) struct DeviceCallback {
    shared: Arc<StreamShared>,
    pause: Arc<PauseControl>,
    capture: Vec<CaptureLane>,
    playback: Vec<RingConsumer>,
    bus: MixBus,
    markers: Option<HeapCons<PositionMarker>>,
    marker: Option<PositionMarker>,
    detector: Option<DropoutDetector>,
    detect_upstream: bool,
    playthrough: bool,
    device_rate: f64,
    max_block: usize,
    start_time: f64,
    capture_bound: Option<(u64, f64)>,
    scratch: Vec<f32>,
    /// Device frames seen, paused or not.
    device_frames: u64,
    /// Device frames captured while running.
    captured_frames: u64,
    /// Frames taken from the playback rings, including flushed ones.
    consumed_frames: u64,
}

impl DeviceCallback {
    pub fn new(setup: CallbackSetup) -> Self {
        let max_block = setup.max_block_frames.max(1);
        let widest = setup
            .capture
            .iter()
            .map(|lane| lane.producer.channels())
            .chain(setup.playback.iter().map(RingConsumer::channels))
            .max()
            .unwrap_or(0);
        Self {
            shared: setup.shared,
            pause: setup.pause,
            capture: setup.capture,
            playback: setup.playback,
            bus: setup.bus,
            markers: setup.markers,
            marker: None,
            detector: setup.detector,
            detect_upstream: setup.detect_upstream,
            playthrough: setup.playthrough,
            device_rate: setup.device_rate,
            max_block,
            start_time: setup.start_time,
            capture_bound: setup.capture_bound,
            scratch: vec![0.0; max_block * widest],
            device_frames: 0,
            captured_frames: 0,
            consumed_frames: 0,
        }
    }

    /// Capture one sub-block. Returns frames that did not fit.
    fn capture_block(&mut self, input: &[f32], in_ch: usize, frames: usize) -> usize {
        let mut missing = 0;
        for lane in &mut self.capture {
            let ch = lane.producer.channels();
            let scratch = &mut self.scratch[..frames * ch];
            for (f, dst) in scratch.chunks_exact_mut(ch).enumerate() {
                for (c, d) in dst.iter_mut().enumerate() {
                    let src = lane.first_channel + c;
                    *d = if src < in_ch { input[f * in_ch + src] } else { 0.0 };
                }
            }
            let written = lane.producer.write(scratch) / ch;
            missing = missing.max(frames - written);
        }
        missing
    }

    /// Frames of a `frames` block still inside the capture bound.
    #[inline]
    fn capture_room(&self, frames: usize) -> usize {
        match self.capture_bound {
            Some((limit, _)) => (limit.saturating_sub(self.captured_frames) as usize).min(frames),
            None => frames,
        }
    }

    fn min_readable(&self) -> usize {
        self.playback
            .iter()
            .map(RingConsumer::readable_frames)
            .min()
            .unwrap_or(0)
    }

    /// Drop frames rendered before the last seek.
    fn flush_stale(&mut self) {
        let until = self.shared.flush_until.load(Ordering::Acquire);
        if self.consumed_frames >= until {
            return;
        }
        let frames = ((until - self.consumed_frames) as usize).min(self.min_readable());
        for lane in &mut self.playback {
            lane.discard(frames * lane.channels());
        }
        self.consumed_frames += frames as u64;
    }

    /// Mix one sub-block of playback. Returns frames played as silence
    /// because the rings ran dry.
    fn playback_block(&mut self, output: &mut [f32], out_ch: usize, frames: usize) -> usize {
        self.flush_stale();
        let take = frames.min(self.min_readable());
        let any_solo = self.bus.any_solo();
        for (i, lane) in self.playback.iter_mut().enumerate() {
            let ch = lane.channels();
            let scratch = &mut self.scratch[..take * ch];
            lane.read(scratch);
            self.bus.mix(i, any_solo, scratch, output, out_ch, take);
        }
        self.consumed_frames += take as u64;

        let missing = frames - take;
        if missing > 0 && self.shared.fill_complete.get() && self.min_readable() == 0 {
            // everything the worker rendered has been heard
            self.shared.playback_drained.set(true);
            return 0;
        }
        missing
    }

    fn add_playthrough(input: &[f32], in_ch: usize, output: &mut [f32], out_ch: usize) {
        if in_ch == 0 || out_ch == 0 {
            return;
        }
        for (src, dst) in input.chunks_exact(in_ch).zip(output.chunks_exact_mut(out_ch)) {
            if in_ch == 1 {
                dst.iter_mut().take(2).for_each(|d| *d += src[0]);
            } else {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += s;
                }
            }
        }
    }

    /// Track time at the next frame to be played.
    fn track_position(&mut self) -> (f64, u64) {
        let Some(markers) = self.markers.as_mut() else {
            let t = self.start_time + self.captured_frames as f64 / self.device_rate;
            return match self.capture_bound {
                Some((_, end)) => (t.min(end), 0),
                None => (t, 0),
            };
        };
        let frame = self.consumed_frames;
        while !self.marker.is_some_and(|m| m.contains(frame)) {
            match markers.try_pop() {
                Some(next) => self.marker = Some(next),
                None => break,
            }
        }
        match self.marker {
            Some(m) => (m.time_at(frame), m.pass),
            None => (self.start_time, 0),
        }
    }

    fn publish(&mut self) {
        let (track_time, pass) = self.track_position();
        self.shared.position.publish(StreamPosition {
            device_time: self.device_frames as f64 / self.device_rate,
            track_time,
            pass,
        });
    }

    fn run_block(
        &mut self,
        input: Option<&[f32]>,
        in_ch: usize,
        output: Option<&mut [f32]>,
        out_ch: usize,
        frames: usize,
        upstream: bool,
    ) {
        let block_start = self.device_frames as f64 / self.device_rate;
        let mut missing = 0;
        let mut kinds = DropoutKinds::NONE;

        if let Some(input) = input {
            let take = self.capture_room(frames);
            if !self.capture.is_empty() && take > 0 {
                let short = self.capture_block(&input[..take * in_ch], in_ch, take);
                if short > 0 {
                    missing = short;
                    kinds |= DropoutKinds::CAPTURE;
                }
            }
            self.captured_frames += take as u64;
            if self
                .capture_bound
                .is_some_and(|(limit, _)| self.captured_frames >= limit)
            {
                self.shared.capture_complete.set(true);
            }
            self.shared.input_meter.update(input, in_ch);
        }

        if let Some(output) = output {
            if !self.playback.is_empty() {
                let short = self.playback_block(output, out_ch, frames);
                if short > 0 {
                    missing = missing.max(short);
                    kinds |= DropoutKinds::PLAYBACK;
                }
            }
            if self.playthrough {
                if let Some(input) = input {
                    Self::add_playthrough(input, in_ch, output, out_ch);
                }
            }
            let volume = self.shared.output_volume.get();
            if volume != 1.0 {
                output.iter_mut().for_each(|s| *s *= volume);
            }
            self.shared.output_meter.update(output, out_ch);
        }

        if self.detect_upstream && upstream {
            missing = frames;
            kinds |= DropoutKinds::UPSTREAM;
        }
        if let Some(detector) = self.detector.as_mut() {
            if missing > 0 {
                let at = block_start + (frames - missing) as f64 / self.device_rate;
                detector.shortfall(at, missing as f64 / self.device_rate, kinds);
            } else {
                detector.settle();
            }
        }

        self.device_frames += frames as u64;
    }
}

impl DeviceProcess for DeviceCallback {
    fn process(&mut self, io: &mut CallbackIo<'_>) {
        self.shared.callbacks.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = io.input_latency {
            self.shared.observed_input_latency.raise(latency);
        }

        let in_ch = io.input_channels;
        let out_ch = io.output_channels;
        let frames = io.frames;
        if let Some(output) = io.output.as_deref_mut() {
            output.fill(0.0);
        }

        if self.shared.stopping.get() {
            self.device_frames += frames as u64;
            return;
        }

        if self.pause.is_paused() {
            self.device_frames += frames as u64;
            self.shared
                .paused_frames
                .fetch_add(frames as u64, Ordering::Relaxed);
            if let Some(detector) = self.detector.as_mut() {
                detector.settle();
            }
            self.publish();
            return;
        }

        let upstream = !io.status.is_clean();
        let mut offset = 0;
        while offset < frames {
            let n = (frames - offset).min(self.max_block);
            let input = io
                .input
                .map(|buf| &buf[offset * in_ch..(offset + n) * in_ch]);
            let output = io
                .output
                .as_deref_mut()
                .map(|buf| &mut buf[offset * out_ch..(offset + n) * out_ch]);
            // the device status applies to the first sub-block only
            self.run_block(input, in_ch, output, out_ch, n, upstream && offset == 0);
            offset += n;
        }
        self.publish();
    }
}
