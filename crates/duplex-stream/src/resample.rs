//! Streaming sample rate conversion using rubato.
//!
//! [`RateConverter`] accepts interleaved input in blocks of any size and hands
//! back interleaved output as it becomes available, keeping filter state
//! between calls. `SincFixedIn` starts interpolating half a filter length
//! before the first input frame, so output frame `k` already lines up with
//! input frame `k / ratio` and nothing is trimmed from the front.
//! [`RateConverter::flush`] pushes the held-back tail through, so a complete
//! pass produces `input_frames * ratio` frames.

use crate::error::{Error, Result};
use duplex_core::Error as CoreError;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};

/// Largest accepted conversion ratio in either direction.
const MAX_RATIO: f64 = 256.0;

/// Slowest varispeed the converter follows; slower requests are clamped.
const MIN_SPEED: f64 = 1.0 / 64.0;

/// Conversion quality presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConverterQuality {
    /// Short filter, small chunks.
    Fast,
    /// Balanced quality/latency (default)
    #[default]
    Medium,
    /// Long filter.
    High,
}

impl ConverterQuality {
    fn sinc_len(&self) -> usize {
        match self {
            ConverterQuality::Fast => 64,
            ConverterQuality::Medium => 128,
            ConverterQuality::High => 256,
        }
    }

    fn chunk_size(&self) -> usize {
        match self {
            ConverterQuality::Fast => 256,
            ConverterQuality::Medium => 512,
            ConverterQuality::High => 1024,
        }
    }

    fn parameters(&self) -> SincInterpolationParameters {
        SincInterpolationParameters {
            sinc_len: self.sinc_len(),
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        }
    }
}

struct Sinc {
    resampler: SincFixedIn<f32>,
    max_relative: f64,
}

/// Stateful streaming converter between two rates.
pub struct RateConverter {
    channels: usize,
    input_rate: f64,
    output_rate: f64,
    speed: f64,
    sinc: Option<Sinc>,
    pending: Vec<Vec<f32>>,
    output: Vec<f32>,
    out_pos: usize,
    frames_in: u64,
    frames_out: u64,
}

impl RateConverter {
    /// Fixed-ratio converter. Equal rates pass samples through untouched.
    pub fn new(
        input_rate: f64,
        output_rate: f64,
        channels: usize,
        quality: ConverterQuality,
    ) -> Result<Self> {
        let passthrough = input_rate == output_rate;
        Self::build(input_rate, output_rate, channels, quality, (!passthrough).then_some(1.0))
    }

    /// Converter whose speed can change while running, for warped or scrubbed
    /// playback. `max_speed` bounds [`RateConverter::set_speed`].
    pub fn variable(
        input_rate: f64,
        output_rate: f64,
        channels: usize,
        quality: ConverterQuality,
        max_speed: f64,
    ) -> Result<Self> {
        let max_relative = max_speed.max(1.0 / MIN_SPEED);
        Self::build(input_rate, output_rate, channels, quality, Some(max_relative))
    }

    fn build(
        input_rate: f64,
        output_rate: f64,
        channels: usize,
        quality: ConverterQuality,
        max_relative: Option<f64>,
    ) -> Result<Self> {
        let invalid = || {
            Error::Core(CoreError::InvalidRatio {
                input_rate,
                output_rate,
            })
        };
        if !(input_rate.is_finite() && output_rate.is_finite())
            || input_rate <= 0.0
            || output_rate <= 0.0
        {
            return Err(invalid());
        }
        let ratio = output_rate / input_rate;
        if !(1.0 / MAX_RATIO..=MAX_RATIO).contains(&ratio) {
            return Err(invalid());
        }
        if channels == 0 {
            return Err(Error::Core(CoreError::InvalidConfig(
                "converter needs at least one channel".into(),
            )));
        }

        let sinc = match max_relative {
            Some(max_relative) => {
                let max_relative = max_relative.max(1.0);
                let resampler = SincFixedIn::<f32>::new(
                    ratio,
                    max_relative,
                    quality.parameters(),
                    quality.chunk_size(),
                    channels,
                )?;
                Some(Sinc {
                    resampler,
                    max_relative,
                })
            }
            None => None,
        };

        Ok(Self {
            channels,
            input_rate,
            output_rate,
            speed: 1.0,
            sinc,
            pending: vec![Vec::with_capacity(quality.chunk_size() * 2); channels],
            output: Vec::with_capacity(quality.chunk_size() * channels * 4),
            out_pos: 0,
            frames_in: 0,
            frames_out: 0,
        })
    }

    #[inline]
    pub fn is_passthrough(&self) -> bool {
        self.sinc.is_none()
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn input_rate(&self) -> f64 {
        self.input_rate
    }

    #[inline]
    pub fn output_rate(&self) -> f64 {
        self.output_rate
    }

    /// Output frames per input frame at the current speed.
    #[inline]
    pub fn ratio(&self) -> f64 {
        self.output_rate / self.input_rate / self.speed
    }

    /// Play input `speed` times faster (fewer output frames per input frame).
    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        let base = self.output_rate / self.input_rate;
        let Some(sinc) = self.sinc.as_mut() else {
            if speed == 1.0 {
                return Ok(());
            }
            return Err(Error::Core(CoreError::InvalidConfig(
                "fixed-rate converter cannot change speed".into(),
            )));
        };
        if !speed.is_finite() || speed <= 0.0 {
            return Err(Error::Core(CoreError::InvalidConfig(format!(
                "converter speed {speed}"
            ))));
        }
        let speed = speed.clamp(1.0 / sinc.max_relative, sinc.max_relative);
        if speed != self.speed {
            sinc.resampler.set_resample_ratio(base / speed, false)?;
            self.speed = speed;
        }
        Ok(())
    }

    /// Input frames to push before at least `output_frames` more output frames
    /// can be expected. A hint, not a contract.
    pub fn input_hint(&self, output_frames: usize) -> usize {
        match &self.sinc {
            Some(sinc) => sinc
                .resampler
                .input_frames_next()
                .saturating_sub(self.pending[0].len())
                .max(1),
            None => output_frames.saturating_sub(self.available_frames()).max(1),
        }
    }

    /// Feed interleaved frames.
    pub fn push(&mut self, input: &[f32]) -> Result<()> {
        let frames = input.len() / self.channels;
        self.frames_in += frames as u64;

        if self.sinc.is_none() {
            self.compact();
            self.output
                .extend_from_slice(&input[..frames * self.channels]);
            self.frames_out += frames as u64;
            return Ok(());
        }

        for frame in input.chunks_exact(self.channels) {
            for (ch, &s) in self.pending.iter_mut().zip(frame) {
                ch.push(s);
            }
        }
        self.process_pending()
    }

    fn process_pending(&mut self) -> Result<()> {
        loop {
            let Some(sinc) = self.sinc.as_mut() else {
                return Ok(());
            };
            let need = sinc.resampler.input_frames_next();
            if self.pending[0].len() < need {
                return Ok(());
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..need).collect())
                .collect();
            let out = sinc.resampler.process(&chunk, None)?;
            self.append_planar(&out);
        }
    }

    fn append_planar(&mut self, planar: &[Vec<f32>]) {
        let Some(first) = planar.first() else {
            return;
        };
        self.compact();
        for i in 0..first.len() {
            for ch in planar {
                self.output.push(ch[i]);
            }
        }
        self.frames_out += first.len() as u64;
    }

    fn compact(&mut self) {
        if self.out_pos > 0 {
            self.output.drain(..self.out_pos);
            self.out_pos = 0;
        }
    }

    /// Converted frames ready to pop.
    #[inline]
    pub fn available_frames(&self) -> usize {
        (self.output.len() - self.out_pos) / self.channels
    }

    /// Move up to `out.len()` samples (whole frames) of output. Returns samples written.
    pub fn pop(&mut self, out: &mut [f32]) -> usize {
        let avail = self.output.len() - self.out_pos;
        let n = out.len().min(avail);
        let n = n - n % self.channels;
        out[..n].copy_from_slice(&self.output[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        n
    }

    /// Push the filter tail through so the output totals `input * ratio` frames.
    pub fn flush(&mut self) -> Result<()> {
        let expected = (self.frames_in as f64 * self.ratio()).round() as u64;
        let Some(sinc) = self.sinc.as_mut() else {
            return Ok(());
        };

        if !self.pending[0].is_empty() {
            let out = sinc.resampler.process_partial(Some(self.pending.as_slice()), None)?;
            for ch in &mut self.pending {
                ch.clear();
            }
            self.append_planar(&out);
        }

        let mut guard = 0;
        while self.frames_out < expected && guard < 64 {
            let Some(sinc) = self.sinc.as_mut() else {
                break;
            };
            let out = sinc.resampler.process_partial::<Vec<f32>>(None, None)?;
            if out.first().map_or(true, Vec::is_empty) {
                break;
            }
            self.append_planar(&out);
            guard += 1;
        }

        if self.frames_out > expected {
            let excess = (self.frames_out - expected) as usize * self.channels;
            let keep = self.output.len().saturating_sub(excess).max(self.out_pos);
            self.output.truncate(keep);
            self.frames_out = expected;
        }
        Ok(())
    }

    /// Forget all history, e.g. after a discontinuity in the input.
    pub fn reset(&mut self) {
        if let Some(sinc) = self.sinc.as_mut() {
            sinc.resampler.reset();
        }
        for ch in &mut self.pending {
            ch.clear();
        }
        self.output.clear();
        self.out_pos = 0;
        self.frames_in = 0;
        self.frames_out = 0;
    }
}
