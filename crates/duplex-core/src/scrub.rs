//! Scrub interval queue.
//!
//! The controlling context turns pointer motion into play intervals with
//! [`ScrubQueue::enqueue`]; the worker's clock consumes them through a
//! [`ScrubFeed`]. Each new interval starts where the previous one ended and
//! lasts as long as the time since the previous request, limited to the
//! maximum scrub speed.

use crate::error::{Error, Result};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};

/// Scrubbing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrubOptions {
    /// Fastest playback speed a scrub interval may take (track s / real s).
    pub max_speed: f64,
    /// Below this speed an interval holds position and plays silence.
    pub min_speed: f64,
    /// Requests spanning less real time than this enqueue nothing (seconds).
    pub min_stutter: f64,
    /// When a request exceeds `max_speed`, move the interval start rather than
    /// its end so playback skips to stay near the target.
    pub adjust_start: bool,
    /// Maximum number of queued intervals.
    pub queue_len: usize,
}

impl Default for ScrubOptions {
    fn default() -> Self {
        Self {
            max_speed: 32.0,
            min_speed: 0.01,
            min_stutter: 0.2,
            adjust_start: false,
            queue_len: 32,
        }
    }
}

impl ScrubOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_speed.is_finite() && self.max_speed > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "scrub max_speed {} must be positive",
                self.max_speed
            )));
        }
        if !(self.min_speed >= 0.0 && self.min_speed < self.max_speed) {
            return Err(Error::InvalidConfig(format!(
                "scrub min_speed {} must be in [0, max_speed)",
                self.min_speed
            )));
        }
        if !(self.min_stutter.is_finite() && self.min_stutter >= 0.0) {
            return Err(Error::InvalidConfig("scrub min_stutter must be >= 0".into()));
        }
        if self.queue_len == 0 {
            return Err(Error::InvalidConfig("scrub queue_len must be non-zero".into()));
        }
        Ok(())
    }
}

/// What a scrub request aims at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScrubTarget {
    /// Reach this track time.
    Position(f64),
    /// Play at this signed speed.
    Speed(f64),
}

/// One queued play interval. `start == end` plays silence for `frames`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrubInterval {
    pub start: f64,
    pub end: f64,
    pub frames: u64,
}

impl ScrubInterval {
    #[inline]
    pub fn is_silent(&self) -> bool {
        self.start == self.end
    }
}

/// Producer half, owned by the controlling context.
pub struct ScrubQueue {
    producer: HeapProd<ScrubInterval>,
    options: ScrubOptions,
    device_rate: f64,
    bounds: (f64, f64),
    last_end: f64,
}

/// Consumer half, owned by the stream clock.
pub struct ScrubFeed {
    consumer: HeapCons<ScrubInterval>,
}

impl ScrubQueue {
    /// Create a queue whose first interval starts at `start_time`.
    pub fn new(
        options: ScrubOptions,
        device_rate: f64,
        bounds: (f64, f64),
        start_time: f64,
    ) -> Result<(Self, ScrubFeed)> {
        options.validate()?;
        if !(device_rate.is_finite() && device_rate > 0.0) {
            return Err(Error::InvalidConfig(format!("device rate {device_rate}")));
        }
        let (producer, consumer) = HeapRb::new(options.queue_len).split();
        Ok((
            Self {
                producer,
                options,
                device_rate,
                bounds,
                last_end: start_time.clamp(bounds.0, bounds.1),
            },
            ScrubFeed { consumer },
        ))
    }

    /// Queue an interval from the previous end toward `target`, played over
    /// `duration` real seconds.
    ///
    /// Returns `false` and changes nothing when `duration` is below the
    /// minimum stutter or the queue is full.
    pub fn enqueue(&mut self, target: ScrubTarget, duration: f64) -> bool {
        if !duration.is_finite() || duration < self.options.min_stutter || duration <= 0.0 {
            return false;
        }
        let frames = (duration * self.device_rate).round() as u64;
        if frames == 0 || self.producer.is_full() {
            return false;
        }

        let (lo, hi) = self.bounds;
        let max_delta = self.options.max_speed * duration;
        let from = self.last_end;

        let (mut start, mut end) = match target {
            ScrubTarget::Position(t) => {
                let t = t.clamp(lo, hi);
                let delta = t - from;
                if delta.abs() <= max_delta {
                    (from, t)
                } else if self.options.adjust_start {
                    (t - delta.signum() * max_delta, t)
                } else {
                    (from, from + delta.signum() * max_delta)
                }
            }
            ScrubTarget::Speed(v) => {
                let v = v.clamp(-self.options.max_speed, self.options.max_speed);
                (from, (from + v * duration).clamp(lo, hi))
            }
        };

        if ((end - start) / duration).abs() < self.options.min_speed {
            start = from;
            end = from;
        }

        let interval = ScrubInterval { start, end, frames };
        if self.producer.try_push(interval).is_err() {
            return false;
        }
        self.last_end = end;
        true
    }

    /// End time of the most recently queued interval.
    pub fn last_time_in_queue(&self) -> f64 {
        self.last_end
    }

    pub fn options(&self) -> &ScrubOptions {
        &self.options
    }
}

impl ScrubFeed {
    pub fn next_interval(&mut self) -> Option<ScrubInterval> {
        self.consumer.try_pop()
    }

    pub fn pending(&self) -> usize {
        self.consumer.occupied_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn queue(options: ScrubOptions) -> (ScrubQueue, ScrubFeed) {
        ScrubQueue::new(options, 1000.0, (0.0, 100.0), 10.0).unwrap()
    }

    #[test]
    fn test_short_stutter_enqueues_nothing() {
        let (mut q, mut feed) = queue(ScrubOptions::default());
        assert!(!q.enqueue(ScrubTarget::Position(12.0), 0.05));
        assert_eq!(q.last_time_in_queue(), 10.0);
        assert!(feed.next_interval().is_none());
    }

    #[test]
    fn test_interval_chains_from_last_end() {
        let (mut q, mut feed) = queue(ScrubOptions::default());
        assert!(q.enqueue(ScrubTarget::Position(11.0), 0.5));
        assert!(q.enqueue(ScrubTarget::Position(10.5), 0.25));

        let first = feed.next_interval().unwrap();
        assert_eq!((first.start, first.end, first.frames), (10.0, 11.0, 500));
        let second = feed.next_interval().unwrap();
        assert_eq!((second.start, second.end, second.frames), (11.0, 10.5, 250));
        assert_eq!(q.last_time_in_queue(), 10.5);
    }

    #[test]
    fn test_max_speed_limits_end() {
        let options = ScrubOptions {
            max_speed: 2.0,
            ..Default::default()
        };
        let (mut q, mut feed) = queue(options);
        assert!(q.enqueue(ScrubTarget::Position(50.0), 1.0));
        let iv = feed.next_interval().unwrap();
        assert_relative_eq!(iv.start, 10.0);
        assert_relative_eq!(iv.end, 12.0);
    }

    #[test]
    fn test_max_speed_adjusts_start() {
        let options = ScrubOptions {
            max_speed: 2.0,
            adjust_start: true,
            ..Default::default()
        };
        let (mut q, mut feed) = queue(options);
        assert!(q.enqueue(ScrubTarget::Position(50.0), 1.0));
        let iv = feed.next_interval().unwrap();
        assert_relative_eq!(iv.start, 48.0);
        assert_relative_eq!(iv.end, 50.0);
    }

    #[test]
    fn test_speed_target_and_silent_hold() {
        let (mut q, mut feed) = queue(ScrubOptions::default());
        assert!(q.enqueue(ScrubTarget::Speed(-1.0), 0.5));
        let iv = feed.next_interval().unwrap();
        assert_relative_eq!(iv.end, 9.5);

        assert!(q.enqueue(ScrubTarget::Speed(0.0), 0.5));
        assert!(feed.next_interval().unwrap().is_silent());
    }

    #[test]
    fn test_full_queue_rejects() {
        let options = ScrubOptions {
            queue_len: 1,
            ..Default::default()
        };
        let (mut q, _feed) = queue(options);
        assert!(q.enqueue(ScrubTarget::Position(11.0), 0.5));
        assert!(!q.enqueue(ScrubTarget::Position(12.0), 0.5));
        assert_eq!(q.last_time_in_queue(), 11.0);
    }
}
