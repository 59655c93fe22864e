//! Playback mixing.
//!
//! Split in two halves. [`PlaybackMixer`] runs on the I/O worker: for every
//! playback track it reads storage at the clock's position, converts to the
//! device rate and speed, and writes the result into that track's ring,
//! substituting silence when storage comes up short. [`MixBus`] runs in the
//! device callback: it applies gain, pan, mute and solo and sums the rings
//! into the device output, so level changes are heard within one block.

use crate::error::{Error, Result};
use crate::metrics::IoMetrics;
use crate::resample::{ConverterQuality, RateConverter};
use crate::storage::SharedTrack;
use duplex_core::{RingProducer, SharedLevel, Span, SyncFlag};
use rayon::prelude::*;
use std::sync::Arc;

/// Live mix parameters of one playback track.
#[derive(Debug)]
pub struct TrackControls {
    gain: SharedLevel,
    pan: SharedLevel,
    mute: SyncFlag,
    solo: SyncFlag,
}

impl Default for TrackControls {
    fn default() -> Self {
        Self {
            gain: SharedLevel::new(1.0),
            pan: SharedLevel::new(0.0),
            mute: SyncFlag::new(false),
            solo: SyncFlag::new(false),
        }
    }
}

impl TrackControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.set(gain.max(0.0));
    }

    /// -1.0 is hard left, 1.0 hard right.
    pub fn pan(&self) -> f32 {
        self.pan.get()
    }

    pub fn set_pan(&self, pan: f32) {
        self.pan.set(pan.clamp(-1.0, 1.0));
    }

    pub fn is_muted(&self) -> bool {
        self.mute.get()
    }

    pub fn set_muted(&self, muted: bool) {
        self.mute.set(muted);
    }

    pub fn is_soloed(&self) -> bool {
        self.solo.get()
    }

    pub fn set_soloed(&self, soloed: bool) {
        self.solo.set(soloed);
    }

    /// Left and right gains after panning.
    #[inline]
    pub fn channel_gains(&self) -> (f32, f32) {
        let gain = self.gain();
        let pan = self.pan();
        let left = if pan > 0.0 { gain * (1.0 - pan) } else { gain };
        let right = if pan < 0.0 { gain * (1.0 + pan) } else { gain };
        (left, right)
    }
}

/// A track to play, with its mix controls.
#[derive(Clone)]
pub struct PlaybackTrack {
    pub storage: SharedTrack,
    pub controls: Arc<TrackControls>,
}

impl PlaybackTrack {
    pub fn new(storage: SharedTrack) -> Self {
        Self {
            storage,
            controls: Arc::new(TrackControls::new()),
        }
    }

    pub fn with_controls(storage: SharedTrack, controls: Arc<TrackControls>) -> Self {
        Self { storage, controls }
    }
}

/// A track to record into, fed from consecutive device input channels
/// starting at `first_channel`.
#[derive(Clone)]
pub struct CaptureTrack {
    pub storage: SharedTrack,
    pub first_channel: usize,
}

impl CaptureTrack {
    pub fn new(storage: SharedTrack) -> Self {
        Self {
            storage,
            first_channel: 0,
        }
    }

    pub fn from_channel(mut self, first_channel: usize) -> Self {
        self.first_channel = first_channel;
        self
    }

    /// Device input channels this track needs.
    pub fn channels_needed(&self) -> usize {
        self.first_channel + self.storage.lock().channels()
    }
}

/// Callback-side mixing of playback rings into the device output.
pub struct MixBus {
    controls: Vec<Arc<TrackControls>>,
    channels: Vec<usize>,
}

impl MixBus {
    pub fn new(tracks: Vec<(Arc<TrackControls>, usize)>) -> Self {
        let (controls, channels) = tracks.into_iter().unzip();
        Self { controls, channels }
    }

    /// Whether any track is soloed. Sample once per block.
    #[inline]
    pub fn any_solo(&self) -> bool {
        self.controls.iter().any(|c| c.is_soloed())
    }

    /// Soloed tracks win over mute; without solos, unmuted tracks play.
    #[inline]
    pub fn is_audible(&self, track: usize, any_solo: bool) -> bool {
        let c = &self.controls[track];
        if any_solo {
            c.is_soloed()
        } else {
            !c.is_muted()
        }
    }

    /// Add `frames` frames of `track`'s interleaved samples into `output`.
    ///
    /// Mono tracks are panned across the first two device channels, stereo
    /// tracks are balanced. Wider tracks map channel to channel at unity pan.
    /// A mono device gets the average of the track's channels.
    #[inline]
    pub fn mix(
        &self,
        track: usize,
        any_solo: bool,
        input: &[f32],
        output: &mut [f32],
        out_channels: usize,
        frames: usize,
    ) {
        if out_channels == 0 || !self.is_audible(track, any_solo) {
            return;
        }
        let in_channels = self.channels[track];
        let (left, right) = self.controls[track].channel_gains();
        let gain = self.controls[track].gain();

        let frames_in = input.chunks_exact(in_channels).take(frames);
        let frames_out = output.chunks_exact_mut(out_channels);
        for (src, dst) in frames_in.zip(frames_out) {
            match (in_channels, out_channels) {
                (_, 1) => {
                    let sum: f32 = src.iter().sum();
                    dst[0] += sum / in_channels as f32 * gain;
                }
                (1, _) => {
                    dst[0] += src[0] * left;
                    dst[1] += src[0] * right;
                }
                (2, _) => {
                    dst[0] += src[0] * left;
                    dst[1] += src[1] * right;
                }
                _ => {
                    for (d, s) in dst.iter_mut().zip(src) {
                        *d += s * gain;
                    }
                }
            }
        }
    }

    pub fn track_channels(&self, track: usize) -> usize {
        self.channels[track]
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

/// Worker-side state for one playback track.
pub(crate) struct TrackFeed {
    storage: SharedTrack,
    producer: RingProducer,
    converter: RateConverter,
    channels: usize,
    track_rate: f64,
    /// Next storage frame to read, in the current direction.
    src_frame: i64,
    forward: bool,
    source: Vec<f32>,
    rendered: Vec<f32>,
}

impl TrackFeed {
    pub fn new(
        storage: SharedTrack,
        producer: RingProducer,
        device_rate: f64,
        start_time: f64,
        variable_speed: Option<f64>,
        quality: ConverterQuality,
        chunk_frames: usize,
    ) -> Result<Self> {
        let (channels, track_rate) = {
            let s = storage.lock();
            (s.channels(), s.sample_rate())
        };
        if producer.channels() != channels {
            return Err(Error::Worker(format!(
                "ring has {} channels, track has {}",
                producer.channels(),
                channels
            )));
        }
        let converter = match variable_speed {
            Some(max_speed) => {
                RateConverter::variable(track_rate, device_rate, channels, quality, max_speed)?
            }
            None => RateConverter::new(track_rate, device_rate, channels, quality)?,
        };
        Ok(Self {
            storage,
            producer,
            converter,
            channels,
            track_rate,
            src_frame: (start_time * track_rate).round() as i64,
            forward: true,
            source: vec![0.0; chunk_frames.max(1) * channels * 4],
            rendered: vec![0.0; chunk_frames.max(1) * channels],
        })
    }

    #[inline]
    pub fn writable_frames(&self) -> usize {
        self.producer.writable_frames()
    }

    #[inline]
    pub fn readable_frames(&self) -> usize {
        self.producer.readable_frames()
    }

    fn reposition(&mut self, time: f64, forward: bool) {
        self.src_frame = (time * self.track_rate).round() as i64;
        self.forward = forward;
        self.converter.reset();
    }

    /// Read `frames` storage frames in the current direction into `source`,
    /// zero-filling what storage cannot supply.
    fn pull_source(&mut self, frames: usize, metrics: &IoMetrics) -> Result<()> {
        let n = frames * self.channels;
        if self.source.len() < n {
            self.source.resize(n, 0.0);
        }
        let buf = &mut self.source[..n];
        buf.fill(0.0);

        let first = if self.forward {
            self.src_frame
        } else {
            self.src_frame - frames as i64
        };
        // frames before zero are silence
        let lead = if first < 0 {
            ((-first) as usize).min(frames)
        } else {
            0
        };
        let read_from = first.max(0) as u64;
        let want = frames - lead;

        if want > 0 {
            let mut storage = self.storage.lock();
            let got = storage.read(read_from, &mut buf[lead * self.channels..])?;
            let len = storage.len_frames();
            drop(storage);

            metrics.record_read(got as u64);
            if got < want && read_from + (got as u64) < len {
                metrics.record_short_read();
            }
        }

        if !self.forward {
            reverse_frames(buf, self.channels);
            self.src_frame -= frames as i64;
        } else {
            self.src_frame += frames as i64;
        }
        Ok(())
    }

    /// Render one clock span into the ring. The caller guarantees room for
    /// `span.frames` frames.
    pub fn render(&mut self, span: &Span, device_rate: f64, metrics: &IoMetrics) -> Result<()> {
        let frames = span.frames;
        let samples = frames * self.channels;
        if span.silent {
            self.producer.write_silence(samples);
            return Ok(());
        }

        let forward = span.end >= span.start;
        if span.jump || forward != self.forward {
            self.reposition(span.start, forward);
        }

        if self.rendered.len() < samples {
            self.rendered.resize(samples, 0.0);
        }

        if self.converter.is_passthrough() {
            self.pull_source(frames, metrics)?;
            self.producer.write(&self.source[..samples]);
            return Ok(());
        }

        let speed = span.speed(device_rate).abs();
        if speed > 0.0 {
            self.converter.set_speed(speed)?;
        }
        while self.converter.available_frames() < frames {
            let need = self.converter.input_hint(frames);
            self.pull_source(need, metrics)?;
            let n = need * self.channels;
            self.converter.push(&self.source[..n])?;
        }
        let popped = self.converter.pop(&mut self.rendered[..samples]);
        self.producer.write(&self.rendered[..popped]);
        Ok(())
    }
}

fn reverse_frames(buf: &mut [f32], channels: usize) {
    let frames = buf.len() / channels;
    for i in 0..frames / 2 {
        let j = frames - 1 - i;
        for c in 0..channels {
            buf.swap(i * channels + c, j * channels + c);
        }
    }
}

/// Worker-side renderer for all playback tracks of a stream.
pub(crate) struct PlaybackMixer {
    feeds: Vec<TrackFeed>,
    frames_written: u64,
    parallel: bool,
}

impl PlaybackMixer {
    pub fn new(feeds: Vec<TrackFeed>, parallel: bool) -> Self {
        Self {
            feeds,
            frames_written: 0,
            parallel,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Frames that fit in every ring.
    pub fn writable_frames(&self) -> usize {
        self.feeds
            .iter()
            .map(TrackFeed::writable_frames)
            .min()
            .unwrap_or(0)
    }

    /// Frames queued in the emptiest ring.
    pub fn readable_frames(&self) -> usize {
        self.feeds
            .iter()
            .map(TrackFeed::readable_frames)
            .min()
            .unwrap_or(0)
    }

    /// Device frames rendered into each ring so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Render `span` into every track's ring. Tracks run on the rayon pool
    /// when parallel I/O is on and there are three or more of them.
    pub fn render(&mut self, span: &Span, device_rate: f64, metrics: &IoMetrics) -> Result<()> {
        if self.parallel && self.feeds.len() >= 3 {
            self.feeds
                .par_iter_mut()
                .try_for_each(|feed| feed.render(span, device_rate, metrics))?;
        } else {
            for feed in &mut self.feeds {
                feed.render(span, device_rate, metrics)?;
            }
        }
        self.frames_written += span.frames as u64;
        metrics.record_chunk();
        Ok(())
    }
}
