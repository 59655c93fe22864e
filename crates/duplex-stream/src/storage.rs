//! Track storage contract and the in-memory reference implementation.
//!
//! The engine only ever reads playback tracks by frame index and appends to
//! capture tracks. How a host keeps samples (block files, a database, plain
//! memory) stays behind [`TrackStorage`].

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Sample storage for one track.
///
/// Samples are interleaved `f32` with [`TrackStorage::channels`] channels.
pub trait TrackStorage: Send {
    fn sample_rate(&self) -> f64;

    fn channels(&self) -> usize;

    /// Frames currently stored.
    fn len_frames(&self) -> u64;

    /// Copy frames starting at `start_frame` into `out`. Returns the number of
    /// frames copied; fewer than `out` can hold means the rest is past the end
    /// or not yet available.
    fn read(&mut self, start_frame: u64, out: &mut [f32]) -> Result<usize>;

    /// Append captured frames. `capture_time` is the capture-clock position of
    /// the first frame in seconds since the stream started.
    fn append(&mut self, samples: &[f32], capture_time: f64) -> Result<()>;

    /// Shift audio captured from `from_frame` onward by `offset_frames`.
    /// Negative offsets drop leading frames, positive offsets insert silence.
    fn shift_capture(&mut self, from_frame: u64, offset_frames: i64) -> Result<()>;

    /// Called once after a stream stops writing to this track.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A track shared between the host and the engine.
pub type SharedTrack = Arc<Mutex<dyn TrackStorage>>;

/// Wrap a storage value for sharing. Keep the returned `Arc` to inspect the
/// concrete type later and pass a clone to the engine.
pub fn share<T: TrackStorage + 'static>(storage: T) -> Arc<Mutex<T>> {
    Arc::new(Mutex::new(storage))
}

/// Interleaved samples held in memory.
#[derive(Debug, Clone)]
pub struct MemoryTrack {
    sample_rate: f64,
    channels: usize,
    samples: Vec<f32>,
    readable_limit: Option<u64>,
    capture_times: Vec<f64>,
    finished: bool,
}

impl MemoryTrack {
    pub fn new(sample_rate: f64, channels: usize) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            samples: Vec::new(),
            readable_limit: None,
            capture_times: Vec::new(),
            finished: false,
        }
    }

    pub fn from_samples(sample_rate: f64, channels: usize, mut samples: Vec<f32>) -> Self {
        let channels = channels.max(1);
        samples.truncate(samples.len() - samples.len() % channels);
        Self {
            samples,
            ..Self::new(sample_rate, channels)
        }
    }

    /// Load a WAV file (integer or float).
    pub fn load_wav(path: impl AsRef<Path>) -> Result<Self> {
        let reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(Self::from_samples(
            spec.sample_rate as f64,
            spec.channels as usize,
            samples,
        ))
    }

    /// Write the track as 32-bit float WAV.
    pub fn save_wav(&self, path: impl AsRef<Path>) -> Result<()> {
        let spec = hound::WavSpec {
            channels: self.channels as u16,
            sample_rate: self.sample_rate.round() as u32,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &s in &self.samples {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
        Ok(())
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Make only the first `frames` frames readable, as if the rest were still
    /// loading. `None` lifts the limit.
    pub fn set_readable_limit(&mut self, frames: Option<u64>) {
        self.readable_limit = frames;
    }

    /// Capture-clock time of each appended block, in order.
    pub fn capture_times(&self) -> &[f64] {
        &self.capture_times
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl TrackStorage for MemoryTrack {
    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn len_frames(&self) -> u64 {
        (self.samples.len() / self.channels) as u64
    }

    fn read(&mut self, start_frame: u64, out: &mut [f32]) -> Result<usize> {
        let len = self.len_frames();
        let readable = self.readable_limit.map_or(len, |limit| limit.min(len));
        if start_frame >= readable {
            return Ok(0);
        }
        let wanted = (out.len() / self.channels) as u64;
        let frames = wanted.min(readable - start_frame) as usize;
        let from = start_frame as usize * self.channels;
        let n = frames * self.channels;
        out[..n].copy_from_slice(&self.samples[from..from + n]);
        Ok(frames)
    }

    fn append(&mut self, samples: &[f32], capture_time: f64) -> Result<()> {
        if samples.len() % self.channels != 0 {
            return Err(Error::Storage(format!(
                "{} samples is not a whole number of {}-channel frames",
                samples.len(),
                self.channels
            )));
        }
        self.samples.extend_from_slice(samples);
        self.capture_times.push(capture_time);
        Ok(())
    }

    fn shift_capture(&mut self, from_frame: u64, offset_frames: i64) -> Result<()> {
        let from = (from_frame.min(self.len_frames()) as usize) * self.channels;
        if offset_frames < 0 {
            let drop = (offset_frames.unsigned_abs() as usize * self.channels)
                .min(self.samples.len() - from);
            self.samples.drain(from..from + drop);
        } else if offset_frames > 0 {
            let pad = offset_frames as usize * self.channels;
            self.samples
                .splice(from..from, std::iter::repeat(0.0).take(pad));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_clamps_to_end() {
        let mut track = MemoryTrack::from_samples(44100.0, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut out = [0.0; 8];
        assert_eq!(track.read(1, &mut out).unwrap(), 2);
        assert_eq!(&out[..4], &[3.0, 4.0, 5.0, 6.0]);
        assert_eq!(track.read(3, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_readable_limit_reports_short_read() {
        let mut track = MemoryTrack::from_samples(44100.0, 1, vec![0.5; 100]);
        track.set_readable_limit(Some(10));
        let mut out = [0.0; 32];
        assert_eq!(track.read(0, &mut out).unwrap(), 10);
        track.set_readable_limit(None);
        assert_eq!(track.read(0, &mut out).unwrap(), 32);
    }

    #[test]
    fn test_append_rejects_partial_frames() {
        let mut track = MemoryTrack::new(48000.0, 2);
        assert!(track.append(&[0.0; 3], 0.0).is_err());
        track.append(&[0.0; 4], 0.0).unwrap();
        assert_eq!(track.len_frames(), 2);
    }

    #[test]
    fn test_shift_capture_only_touches_new_audio() {
        let mut track = MemoryTrack::from_samples(1000.0, 1, vec![9.0, 9.0]);
        track.append(&[1.0, 2.0, 3.0, 4.0], 0.0).unwrap();

        track.shift_capture(2, -1).unwrap();
        assert_eq!(track.samples(), &[9.0, 9.0, 2.0, 3.0, 4.0]);

        track.shift_capture(2, 2).unwrap();
        assert_eq!(track.samples(), &[9.0, 9.0, 0.0, 0.0, 2.0, 3.0, 4.0]);

        // trimming more than was captured empties the captured part
        track.shift_capture(2, -100).unwrap();
        assert_eq!(track.samples(), &[9.0, 9.0]);
    }

    #[test]
    fn test_wav_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let samples: Vec<f32> = (0..200).map(|i| (i as f32 / 200.0) - 0.5).collect();
        MemoryTrack::from_samples(44100.0, 2, samples.clone())
            .save_wav(&path)
            .unwrap();

        let loaded = MemoryTrack::load_wav(&path).unwrap();
        assert_eq!(loaded.sample_rate(), 44100.0);
        assert_eq!(loaded.channels(), 2);
        assert_eq!(loaded.samples(), samples.as_slice());
    }
}
