//! Buffering and latency configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ring sizing and worker pacing for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Playback ring length in seconds (default: 4.0)
    pub playback_seconds: f64,
    /// Capture ring length in seconds (default: 5.0)
    pub capture_seconds: f64,
    /// Refill playback once any ring holds less than this (default: 1.0 s)
    pub low_water_seconds: f64,
    /// Capture is written to storage once this much is pending (default: 0.2 s)
    pub min_capture_seconds: f64,
    /// Worker render chunk in device frames (default: 2048)
    pub chunk_frames: usize,
    /// Largest block the callback processes at once; larger driver blocks are
    /// split (default: 8192)
    pub max_block_frames: usize,
    /// Worker sleep between iterations in milliseconds (default: 5)
    pub worker_interval_ms: u64,
    /// How long start waits for the first fill in milliseconds (default: 5000)
    pub prime_timeout_ms: u64,
    /// How long stop waits for the final drain in milliseconds (default: 5000)
    pub drain_timeout_ms: u64,
    /// Refill tracks concurrently with rayon when there are 3 or more (default: true)
    pub parallel_io: bool,
    /// Closed dropout intervals kept per stream (default: 1024)
    pub dropout_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            playback_seconds: 4.0,
            capture_seconds: 5.0,
            low_water_seconds: 1.0,
            min_capture_seconds: 0.2,
            chunk_frames: 2048,
            max_block_frames: 8192,
            worker_interval_ms: 5,
            prime_timeout_ms: 5000,
            drain_timeout_ms: 5000,
            parallel_io: true,
            dropout_capacity: 1024,
        }
    }
}

impl BufferConfig {
    /// Same length for playback and capture rings. The low-water mark and
    /// the capture flush threshold shrink with short buffers.
    pub fn with_buffer_seconds(seconds: f64) -> Self {
        let defaults = Self::default();
        Self {
            playback_seconds: seconds,
            capture_seconds: seconds,
            low_water_seconds: defaults.low_water_seconds.min(seconds / 2.0),
            min_capture_seconds: defaults.min_capture_seconds.min(seconds / 4.0),
            ..defaults
        }
    }

    pub fn low_water_seconds(mut self, seconds: f64) -> Self {
        self.low_water_seconds = seconds;
        self
    }

    pub fn chunk_frames(mut self, frames: usize) -> Self {
        self.chunk_frames = frames;
        self
    }

    pub fn worker_interval_ms(mut self, ms: u64) -> Self {
        self.worker_interval_ms = ms;
        self
    }

    pub fn drain_timeout_ms(mut self, ms: u64) -> Self {
        self.drain_timeout_ms = ms;
        self
    }

    pub fn parallel_io(mut self, enabled: bool) -> Self {
        self.parallel_io = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(Error::InvalidConfig(format!("{name} must be positive, got {v}")))
            }
        };
        positive("playback_seconds", self.playback_seconds)?;
        positive("capture_seconds", self.capture_seconds)?;
        positive("min_capture_seconds", self.min_capture_seconds)?;
        if !(self.low_water_seconds >= 0.0 && self.low_water_seconds < self.playback_seconds) {
            return Err(Error::InvalidConfig(format!(
                "low_water_seconds {} must be below playback_seconds {}",
                self.low_water_seconds, self.playback_seconds
            )));
        }
        if self.min_capture_seconds >= self.capture_seconds {
            return Err(Error::InvalidConfig(format!(
                "min_capture_seconds {} must be below capture_seconds {}",
                self.min_capture_seconds, self.capture_seconds
            )));
        }
        if self.chunk_frames == 0 || self.max_block_frames == 0 {
            return Err(Error::InvalidConfig("frame counts must be non-zero".into()));
        }
        if self.dropout_capacity == 0 {
            return Err(Error::InvalidConfig("dropout_capacity must be non-zero".into()));
        }
        Ok(())
    }

    pub fn playback_frames(&self, rate: f64) -> usize {
        (self.playback_seconds * rate).ceil() as usize
    }

    pub fn capture_frames(&self, rate: f64) -> usize {
        (self.capture_seconds * rate).ceil() as usize
    }

    pub fn low_water_frames(&self, rate: f64) -> usize {
        (self.low_water_seconds * rate).round() as usize
    }

    pub fn min_capture_frames(&self, rate: f64) -> usize {
        ((self.min_capture_seconds * rate).round() as usize).max(1)
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms)
    }

    pub fn prime_timeout(&self) -> Duration {
        Duration::from_millis(self.prime_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// How newly captured audio is shifted when a stream stops.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum LatencyCorrection {
    /// Leave captured audio where it landed.
    None,
    /// Shift by a fixed amount in seconds. Negative trims the start.
    Fixed(f64),
    /// Trim by the measured input latency, see [`LatencyCalibration`].
    #[default]
    Measured,
}

/// Blends the driver-reported input latency with the largest latency observed
/// in callbacks.
///
/// `observed_weight` of 0 trusts the driver alone; 1 uses the larger of the
/// two. `offset` is added afterwards to account for converter or hardware
/// delay neither source sees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyCalibration {
    pub observed_weight: f64,
    pub offset: f64,
}

impl Default for LatencyCalibration {
    fn default() -> Self {
        Self {
            observed_weight: 1.0,
            offset: 0.0,
        }
    }
}

impl LatencyCalibration {
    /// Input latency estimate in seconds.
    pub fn blend(&self, reported: f64, observed: Option<f64>) -> f64 {
        let reported = reported.max(0.0);
        let w = self.observed_weight.clamp(0.0, 1.0);
        let measured = match observed {
            Some(obs) if obs.is_finite() => reported * (1.0 - w) + reported.max(obs) * w,
            _ => reported,
        };
        (measured + self.offset).max(0.0)
    }
}

impl LatencyCorrection {
    /// Signed shift in seconds to apply to newly captured audio.
    pub fn shift_seconds(
        &self,
        calibration: &LatencyCalibration,
        reported: f64,
        observed: Option<f64>,
    ) -> f64 {
        match *self {
            LatencyCorrection::None => 0.0,
            LatencyCorrection::Fixed(s) if s.is_finite() => s,
            LatencyCorrection::Fixed(_) => 0.0,
            LatencyCorrection::Measured => -calibration.blend(reported, observed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_config() {
        let config = BufferConfig::default();
        assert_eq!(config.playback_seconds, 4.0);
        assert_eq!(config.chunk_frames, 2048);
        assert!(config.parallel_io);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frames_at_rate() {
        let config = BufferConfig::with_buffer_seconds(2.0);
        assert_eq!(config.playback_frames(44100.0), 88200);
        assert_eq!(config.capture_frames(48000.0), 96000);
        assert_eq!(config.low_water_frames(44100.0), 44100);
    }

    #[test]
    fn test_short_buffers_validate() {
        for seconds in [0.05, 0.1, 0.2, 0.25, 0.5] {
            let config = BufferConfig::with_buffer_seconds(seconds);
            assert!(config.validate().is_ok(), "{seconds} s rejected");
            assert!(config.min_capture_seconds < config.capture_seconds);
        }
        assert_relative_eq!(
            BufferConfig::with_buffer_seconds(0.2).min_capture_seconds,
            0.05
        );
        assert_eq!(BufferConfig::with_buffer_seconds(2.0).min_capture_seconds, 0.2);
    }

    #[test]
    fn test_validate_rejects_low_water_above_buffer() {
        let config = BufferConfig::with_buffer_seconds(0.5).low_water_seconds(0.75);
        assert!(config.validate().is_err());
        assert!(BufferConfig::with_buffer_seconds(0.0).validate().is_err());
    }

    #[test]
    fn test_config_persists_as_json() {
        let config = BufferConfig::with_buffer_seconds(2.0).parallel_io(false);
        let json = serde_json::to_string(&config).unwrap();
        let back: BufferConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        // missing fields fall back to defaults
        let partial: BufferConfig = serde_json::from_str(r#"{"playback_seconds": 3.0}"#).unwrap();
        assert_eq!(partial.playback_seconds, 3.0);
        assert_eq!(partial.capture_seconds, 5.0);
    }

    #[test]
    fn test_latency_shift() {
        let cal = LatencyCalibration::default();
        assert_relative_eq!(
            LatencyCorrection::Measured.shift_seconds(&cal, 0.01, Some(0.02)),
            -0.02
        );
        let driver_only = LatencyCalibration {
            observed_weight: 0.0,
            offset: 0.0,
        };
        assert_relative_eq!(
            LatencyCorrection::Measured.shift_seconds(&driver_only, 0.01, Some(0.02)),
            -0.01
        );
        assert_eq!(LatencyCorrection::Fixed(-0.13).shift_seconds(&cal, 0.5, None), -0.13);
        assert_eq!(LatencyCorrection::None.shift_seconds(&cal, 0.5, None), 0.0);
    }
}
