//! Per-stream options and notifications.

use duplex_core::{
    CutGap, LatencyCorrection, LostInterval, PlayMode, ScrubOptions, TimeWarp,
};
use std::fmt;
use std::sync::Arc;

/// Identifies one stream started by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamToken(pub u64);

/// Receives stream lifecycle notifications. Never called from the device
/// callback.
pub trait StreamListener: Send + Sync {
    fn on_stream_started(&self, _token: StreamToken) {}

    fn on_stream_stopped(&self, _token: StreamToken, _lost: &[LostInterval]) {}

    /// The I/O worker failed and the device was closed. Called from the
    /// supervisor thread; `on_stream_stopped` follows once the controller
    /// has reaped the stream.
    fn on_stream_failed(&self, _token: StreamToken) {}

    fn on_paused(&self, _paused: bool) {}
}

/// How to run one stream.
#[derive(Clone)]
pub struct StreamOptions {
    pub mode: PlayMode,
    /// Preferred device rate; the best supported rate is used otherwise.
    pub rate: Option<f64>,
    pub warp: Option<TimeWarp>,
    pub scrub: ScrubOptions,
    /// Skip this region while playing, e.g. to preview a cut.
    pub cut_preview: Option<CutGap>,
    /// Mix the input into the output.
    pub playthrough: bool,
    pub detect_dropouts: bool,
    /// Also count driver-reported overflows and underflows as dropouts.
    pub detect_upstream_dropouts: bool,
    pub latency_correction: LatencyCorrection,
    pub output_volume: f32,
    pub listener: Option<Arc<dyn StreamListener>>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            mode: PlayMode::Straight,
            rate: None,
            warp: None,
            scrub: ScrubOptions::default(),
            cut_preview: None,
            playthrough: false,
            detect_dropouts: true,
            detect_upstream_dropouts: false,
            latency_correction: LatencyCorrection::default(),
            output_volume: 1.0,
            listener: None,
        }
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("mode", &self.mode)
            .field("rate", &self.rate)
            .field("warp", &self.warp)
            .field("scrub", &self.scrub)
            .field("cut_preview", &self.cut_preview)
            .field("playthrough", &self.playthrough)
            .field("detect_dropouts", &self.detect_dropouts)
            .field("detect_upstream_dropouts", &self.detect_upstream_dropouts)
            .field("latency_correction", &self.latency_correction)
            .field("output_volume", &self.output_volume)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl StreamOptions {
    pub fn looped() -> Self {
        Self {
            mode: PlayMode::Looped,
            ..Self::default()
        }
    }

    pub fn scrub(options: ScrubOptions) -> Self {
        Self {
            mode: PlayMode::Scrub,
            scrub: options,
            ..Self::default()
        }
    }

    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn warp(mut self, warp: TimeWarp) -> Self {
        self.warp = Some(warp);
        self
    }

    pub fn cut_preview(mut self, gap: CutGap) -> Self {
        self.cut_preview = Some(gap);
        self
    }

    pub fn playthrough(mut self, enabled: bool) -> Self {
        self.playthrough = enabled;
        self
    }

    pub fn detect_upstream_dropouts(mut self, enabled: bool) -> Self {
        self.detect_upstream_dropouts = enabled;
        self
    }

    pub fn latency_correction(mut self, correction: LatencyCorrection) -> Self {
        self.latency_correction = correction;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StreamListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}
