//! Stream clock: maps device frames onto track time.
//!
//! The worker advances the clock one chunk at a time and renders whatever
//! [`Span`] of track time it returns. Straight and looped play walk a fixed
//! list of track-time segments (more than one when a cut-preview gap is
//! skipped) and count elapsed *device frames*, so a looped pass always lasts
//! the same real time no matter how the warp map bends track time. Scrub play
//! follows intervals from a [`ScrubFeed`].

use crate::error::{Error, Result};
use crate::scrub::{ScrubFeed, ScrubInterval};
use crate::warp::TimeWarp;
use serde::{Deserialize, Serialize};

/// How track time evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayMode {
    /// Play once from start to end.
    #[default]
    Straight,
    /// Wrap back to start when end is reached.
    Looped,
    /// Follow queued scrub intervals.
    Scrub,
}

/// A stretch of track time to render into `frames` device frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub start: f64,
    pub end: f64,
    pub frames: usize,
    /// Loop pass this span belongs to.
    pub pass: u64,
    /// Track time is discontinuous before this span (seek, wrap, gap, stutter).
    pub jump: bool,
    /// Render silence instead of track audio.
    pub silent: bool,
}

impl Span {
    fn empty(at: f64, pass: u64) -> Self {
        Self {
            start: at,
            end: at,
            frames: 0,
            pass,
            jump: false,
            silent: true,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Track seconds per device frame; negative when playing backwards.
    #[inline]
    pub fn track_step(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            (self.end - self.start) / self.frames as f64
        }
    }

    /// Playback speed relative to real time at `device_rate`.
    #[inline]
    pub fn speed(&self, device_rate: f64) -> f64 {
        self.track_step() * device_rate
    }
}

/// A track-time region skipped during playback, e.g. the removed part of a
/// cut preview.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CutGap {
    pub start: f64,
    pub length: f64,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: f64,
    end: f64,
    /// Device frames before this segment within a pass.
    offset: u64,
    frames: u64,
}

struct ActiveScrub {
    interval: ScrubInterval,
    done: u64,
}

/// Track-time state of one stream. Owned by the worker.
pub struct StreamClock {
    mode: PlayMode,
    start: f64,
    end: f64,
    device_rate: f64,
    warp: Option<TimeWarp>,
    gap: Option<CutGap>,
    segments: Vec<Segment>,
    total_frames: u64,
    elapsed_frames: u64,
    passes: u64,
    time: f64,
    finished: bool,
    pending_jump: bool,
    scrub: Option<ScrubFeed>,
    active_scrub: Option<ActiveScrub>,
}

impl StreamClock {
    pub fn new(mode: PlayMode, start: f64, end: f64, device_rate: f64) -> Result<Self> {
        if !(start.is_finite() && end.is_finite()) || end < start {
            return Err(Error::InvalidBounds { start, end });
        }
        if !(device_rate.is_finite() && device_rate > 0.0) {
            return Err(Error::InvalidConfig(format!("device rate {device_rate}")));
        }
        if mode == PlayMode::Looped && end <= start {
            return Err(Error::InvalidBounds { start, end });
        }

        let mut clock = Self {
            mode,
            start,
            end,
            device_rate,
            warp: None,
            gap: None,
            segments: Vec::with_capacity(2),
            total_frames: 0,
            elapsed_frames: 0,
            passes: 0,
            time: start,
            finished: false,
            pending_jump: false,
            scrub: None,
            active_scrub: None,
        };
        clock.rebuild()?;
        Ok(clock)
    }

    /// Apply a speed map. Pass length in device frames follows the warped duration.
    pub fn with_warp(mut self, warp: TimeWarp) -> Result<Self> {
        self.warp = Some(warp);
        self.rebuild()?;
        Ok(self)
    }

    /// Skip `gap` while playing. Parts of the gap outside the bounds are ignored.
    pub fn with_cut_gap(mut self, gap: CutGap) -> Result<Self> {
        if !(gap.start.is_finite() && gap.length.is_finite() && gap.length >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "cut gap at {} of {} s",
                gap.start, gap.length
            )));
        }
        self.gap = (gap.length > 0.0).then_some(gap);
        self.rebuild()?;
        Ok(self)
    }

    /// Drive the clock from scrub intervals. Only meaningful in [`PlayMode::Scrub`].
    pub fn with_scrub(mut self, feed: ScrubFeed) -> Self {
        self.scrub = Some(feed);
        self
    }

    fn rebuild(&mut self) -> Result<()> {
        let mut pieces: Vec<(f64, f64)> = Vec::with_capacity(2);
        match self.gap {
            Some(gap) => {
                let gap_end = gap.start + gap.length;
                if gap.start > self.start {
                    pieces.push((self.start, gap.start.min(self.end)));
                }
                if gap_end < self.end {
                    pieces.push((gap_end.max(self.start), self.end));
                }
            }
            None => pieces.push((self.start, self.end)),
        }

        self.segments.clear();
        let mut offset = 0u64;
        for (a, b) in pieces {
            let frames = (self.real_between(a, b) * self.device_rate).round() as u64;
            if frames == 0 && b > a {
                continue;
            }
            self.segments.push(Segment {
                start: a,
                end: b,
                offset,
                frames,
            });
            offset += frames;
        }
        self.total_frames = offset;

        if self.mode == PlayMode::Looped && self.total_frames == 0 {
            return Err(Error::InvalidConfig(
                "looped play needs a non-empty pass".into(),
            ));
        }

        self.elapsed_frames = 0;
        self.passes = 0;
        self.time = self.segments.first().map_or(self.start, |s| s.start);
        self.finished = self.mode == PlayMode::Straight && self.total_frames == 0;
        Ok(())
    }

    fn real_between(&self, a: f64, b: f64) -> f64 {
        match &self.warp {
            Some(warp) => warp.real_duration(a, b),
            None => b - a,
        }
    }

    fn advance_within(&self, from: f64, real: f64) -> f64 {
        match &self.warp {
            Some(warp) => warp.track_time_after(from, real),
            None => from + real,
        }
    }

    fn segment_index(&self, elapsed: u64) -> usize {
        self.segments
            .iter()
            .rposition(|s| s.offset <= elapsed)
            .unwrap_or(0)
    }

    /// Track time `into` device frames after the start of `seg`. The last
    /// frame of a segment resolves to its own end, never the next start.
    fn time_in(&self, seg: &Segment, into: u64) -> f64 {
        if into >= seg.frames {
            return seg.end;
        }
        let real = into as f64 / self.device_rate;
        self.advance_within(seg.start, real).min(seg.end)
    }

    /// Consume up to `max_frames` device frames and return the track time they cover.
    ///
    /// A span never crosses a segment boundary, a loop wrap, or a scrub
    /// interval boundary, so it may hold fewer frames than asked. Zero frames
    /// means straight play has finished.
    pub fn advance(&mut self, max_frames: usize) -> Span {
        if max_frames == 0 {
            return Span::empty(self.time, self.passes);
        }
        match self.mode {
            PlayMode::Scrub => self.advance_scrub(max_frames),
            PlayMode::Straight | PlayMode::Looped => self.advance_linear(max_frames),
        }
    }

    fn advance_linear(&mut self, max_frames: usize) -> Span {
        if self.finished {
            return Span::empty(self.time, self.passes);
        }

        let idx = self.segment_index(self.elapsed_frames);
        let seg = self.segments[idx];
        let seg_left = seg.offset + seg.frames - self.elapsed_frames;
        let frames = (max_frames as u64).min(seg_left);

        let from = self.time;
        self.elapsed_frames += frames;
        let to = self.time_in(&seg, self.elapsed_frames - seg.offset);
        let span = Span {
            start: from,
            end: to,
            frames: frames as usize,
            pass: self.passes,
            jump: std::mem::take(&mut self.pending_jump),
            silent: false,
        };
        self.time = to;

        if self.elapsed_frames == seg.offset + seg.frames {
            if let Some(next) = self.segments.get(idx + 1) {
                self.time = next.start;
                self.pending_jump = true;
            } else if self.mode == PlayMode::Looped {
                self.elapsed_frames = 0;
                self.passes += 1;
                self.time = self.segments[0].start;
                self.pending_jump = true;
            } else {
                self.finished = true;
            }
        }
        span
    }

    fn advance_scrub(&mut self, max_frames: usize) -> Span {
        if self.active_scrub.is_none() {
            if let Some(interval) = self.scrub.as_mut().and_then(ScrubFeed::next_interval) {
                self.active_scrub = Some(ActiveScrub { interval, done: 0 });
            }
        }

        let Some(active) = self.active_scrub.as_mut() else {
            return Span {
                frames: max_frames,
                ..Span::empty(self.time, self.passes)
            };
        };

        let iv = active.interval;
        let frames = (max_frames as u64).min(iv.frames - active.done);
        let lerp = |done: u64| iv.start + (iv.end - iv.start) * done as f64 / iv.frames as f64;

        let from = lerp(active.done);
        let jump = active.done == 0 && (iv.start - self.time).abs() > 0.5 / self.device_rate;
        active.done += frames;
        let to = lerp(active.done);
        if active.done >= iv.frames {
            self.active_scrub = None;
        }

        self.time = to.clamp(self.start, self.end);
        Span {
            start: from,
            end: to,
            frames: frames as usize,
            pass: self.passes,
            jump,
            silent: iv.is_silent(),
        }
    }

    /// Move by `delta` track seconds from the current position.
    ///
    /// The target is clamped to the bounds and pushed past a cut gap. Looped
    /// play lands on the start instead of the end bound. Ignored while scrubbing.
    /// Returns the new track time.
    pub fn seek(&mut self, delta: f64) -> f64 {
        if self.mode == PlayMode::Scrub || self.segments.is_empty() || !delta.is_finite() {
            return self.time;
        }

        let mut target = (self.time + delta).clamp(self.start, self.end);
        if self.mode == PlayMode::Looped && target >= self.end {
            target = self.start;
        }

        let mut elapsed = self.total_frames;
        let mut landed = self.segments[self.segments.len() - 1].end;
        for seg in &self.segments {
            if target < seg.start {
                // inside a gap: resume at the next segment
                elapsed = seg.offset;
                landed = seg.start;
                break;
            }
            if target < seg.end {
                let into = (self.real_between(seg.start, target) * self.device_rate).round() as u64;
                elapsed = seg.offset + into.min(seg.frames);
                landed = target;
                break;
            }
        }

        self.elapsed_frames = elapsed;
        self.time = landed;
        self.pending_jump = true;
        self.finished = self.mode == PlayMode::Straight && elapsed >= self.total_frames;
        if self.mode == PlayMode::Looped && elapsed >= self.total_frames {
            self.elapsed_frames = 0;
            self.time = self.segments[0].start;
        }
        self.time
    }

    #[inline]
    pub fn current_time(&self) -> f64 {
        self.time
    }

    #[inline]
    pub fn mode(&self) -> PlayMode {
        self.mode
    }

    #[inline]
    pub fn bounds(&self) -> (f64, f64) {
        (self.start, self.end)
    }

    #[inline]
    pub fn device_rate(&self) -> f64 {
        self.device_rate
    }

    #[inline]
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Real seconds played in the current pass.
    #[inline]
    pub fn warped_elapsed(&self) -> f64 {
        self.elapsed_frames as f64 / self.device_rate
    }

    /// Real seconds one full pass takes.
    #[inline]
    pub fn warped_total(&self) -> f64 {
        self.total_frames as f64 / self.device_rate
    }

    /// Device frames in one pass.
    #[inline]
    pub fn pass_frames(&self) -> u64 {
        self.total_frames
    }

    /// Straight play has reached the end bound.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::{ScrubOptions, ScrubQueue, ScrubTarget};
    use crate::warp::WarpPoint;
    use approx::assert_relative_eq;

    const RATE: f64 = 1000.0;

    fn drain(clock: &mut StreamClock, chunk: usize) -> Vec<Span> {
        let mut spans = Vec::new();
        loop {
            let span = clock.advance(chunk);
            if span.is_empty() {
                break;
            }
            spans.push(span);
        }
        spans
    }

    #[test]
    fn test_rejects_reversed_bounds() {
        assert!(StreamClock::new(PlayMode::Straight, 2.0, 1.0, RATE).is_err());
        assert!(StreamClock::new(PlayMode::Looped, 1.0, 1.0, RATE).is_err());
        assert!(StreamClock::new(PlayMode::Straight, 0.0, f64::INFINITY, RATE).is_err());
    }

    #[test]
    fn test_equal_bounds_straight_is_finished() {
        let mut clock = StreamClock::new(PlayMode::Straight, 3.0, 3.0, RATE).unwrap();
        assert!(clock.is_finished());
        assert!(clock.advance(256).is_empty());
        assert_eq!(clock.current_time(), 3.0);
    }

    #[test]
    fn test_straight_covers_bounds_exactly() {
        let mut clock = StreamClock::new(PlayMode::Straight, 1.0, 2.0, RATE).unwrap();
        let spans = drain(&mut clock, 300);
        let frames: usize = spans.iter().map(|s| s.frames).sum();
        assert_eq!(frames, 1000);
        assert_eq!(spans.last().unwrap().frames, 100);
        assert_relative_eq!(clock.current_time(), 2.0);
        assert!(clock.is_finished());
    }

    #[test]
    fn test_looped_pass_wraps_and_counts() {
        let mut clock = StreamClock::new(PlayMode::Looped, 0.5, 1.5, RATE).unwrap();
        let mut played = 0u64;
        while played < clock.pass_frames() {
            played += clock.advance(128).frames as u64;
        }
        assert_eq!(clock.passes(), 1);
        assert_relative_eq!(clock.current_time(), 0.5);

        let next = clock.advance(10);
        assert!(next.jump);
        assert_eq!(next.pass, 1);
    }

    /// One pass of warped play lasts the warped length, then wraps to start.
    #[test]
    fn test_looped_with_warp_fixed_real_length() {
        let warp =
            TimeWarp::new(vec![WarpPoint::new(0.0, 1.0), WarpPoint::new(4.0, 2.0)]).unwrap();
        let mut clock = StreamClock::new(PlayMode::Looped, 0.0, 4.0, RATE)
            .unwrap()
            .with_warp(warp.clone())
            .unwrap();

        let expected_real = warp.real_duration(0.0, 4.0);
        assert_relative_eq!(clock.warped_total(), expected_real, epsilon = 1.0 / RATE);

        let frames = clock.pass_frames() as usize;
        let span = clock.advance(frames - 1);
        assert!(span.end < 4.0);
        let last = clock.advance(64);
        assert_eq!(last.frames, 1);
        assert_relative_eq!(last.end, 4.0);
        assert_eq!(clock.passes(), 1);
        assert_eq!(clock.current_time(), 0.0);
        assert_eq!(clock.warped_elapsed(), 0.0);
    }

    #[test]
    fn test_cut_gap_is_skipped() {
        let mut clock = StreamClock::new(PlayMode::Straight, 0.0, 3.0, RATE)
            .unwrap()
            .with_cut_gap(CutGap {
                start: 1.0,
                length: 1.0,
            })
            .unwrap();
        assert_eq!(clock.pass_frames(), 2000);

        let spans = drain(&mut clock, 700);
        let after_gap = spans.iter().find(|s| s.jump).unwrap();
        assert_relative_eq!(after_gap.start, 2.0);
        assert!(spans.iter().all(|s| s.end <= 1.0 || s.start >= 2.0));
    }

    /// The span that reaches a gap ends at the gap and keeps unit speed.
    #[test]
    fn test_span_before_gap_stops_at_gap() {
        let mut clock = StreamClock::new(PlayMode::Straight, 0.0, 3.0, RATE)
            .unwrap()
            .with_cut_gap(CutGap {
                start: 1.0,
                length: 1.0,
            })
            .unwrap();

        clock.advance(700);
        let tail = clock.advance(700);
        assert_eq!(tail.frames, 300);
        assert_relative_eq!(tail.start, 0.7);
        assert_relative_eq!(tail.end, 1.0);
        assert_relative_eq!(tail.speed(RATE), 1.0, epsilon = 1e-9);
        assert_relative_eq!(clock.current_time(), 2.0);

        let resumed = clock.advance(700);
        assert!(resumed.jump);
        assert_relative_eq!(resumed.start, 2.0);
        assert_relative_eq!(resumed.end, 2.7);
    }

    #[test]
    fn test_seek_relative_and_clamped() {
        let mut clock = StreamClock::new(PlayMode::Straight, 0.0, 10.0, RATE).unwrap();
        clock.advance(1000);
        assert_relative_eq!(clock.seek(2.5), 3.5);
        let span = clock.advance(10);
        assert!(span.jump);
        assert_relative_eq!(span.start, 3.5);

        assert_relative_eq!(clock.seek(-100.0), 0.0);
        assert_relative_eq!(clock.seek(100.0), 10.0);
        assert!(clock.is_finished());
    }

    #[test]
    fn test_scrub_without_requests_is_silent() {
        let (mut queue, feed) =
            ScrubQueue::new(ScrubOptions::default(), RATE, (0.0, 10.0), 4.0).unwrap();
        let mut clock = StreamClock::new(PlayMode::Scrub, 0.0, 10.0, RATE)
            .unwrap()
            .with_scrub(feed);
        clock.seek(0.0);

        // a stutter shorter than the minimum changes nothing
        assert!(!queue.enqueue(ScrubTarget::Position(5.0), 0.01));
        let before = clock.current_time();
        let span = clock.advance(64);
        assert!(span.silent);
        assert_eq!(span.frames, 64);
        assert_eq!(clock.current_time(), before);
    }

    #[test]
    fn test_scrub_follows_interval() {
        let (mut queue, feed) =
            ScrubQueue::new(ScrubOptions::default(), RATE, (0.0, 10.0), 4.0).unwrap();
        let mut clock = StreamClock::new(PlayMode::Scrub, 0.0, 10.0, RATE)
            .unwrap()
            .with_scrub(feed);

        assert!(queue.enqueue(ScrubTarget::Position(3.0), 0.5));
        let first = clock.advance(200);
        assert!(first.jump);
        assert_relative_eq!(first.start, 4.0);
        assert_relative_eq!(first.end, 3.6);
        assert!(first.track_step() < 0.0);

        let rest = clock.advance(1000);
        assert_eq!(rest.frames, 300);
        assert_relative_eq!(clock.current_time(), 3.0);
    }
}
