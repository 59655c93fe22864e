//! Stream lifecycle.
//!
//! [`StreamController`] owns the driver and at most one stream. Starting a
//! stream negotiates a rate, sizes the rings, binds tracks, spawns the I/O
//! worker, waits for it to prime playback and starts the device. Stopping
//! drains capture, closes the device, applies latency correction and hands
//! back the dropout record.
//!
//! ```ignore
//! use duplex_stream::{StreamController, SimulatedDriver, SimulatedConfig};
//!
//! let (driver, device) = SimulatedDriver::new(SimulatedConfig::default());
//! let mut controller = StreamController::builder().driver(driver).build()?;
//! let token = controller.start_stream(playback, capture, 0.0, 5.0, StreamOptions::default())?;
//! device.run_cycles(100);
//! controller.stop_stream()?;
//! ```

use crate::callback::{CallbackSetup, CaptureLane, DeviceCallback, PositionMarker};
use crate::capabilities::DeviceCapabilities;
use crate::driver::{AudioDriver, DeviceInfo, DeviceRequest, StreamDirection};
use crate::error::{Error, Result};
use crate::metrics::{IoMetrics, IoMetricsSnapshot};
use crate::mixer::{CaptureTrack, MixBus, PlaybackMixer, PlaybackTrack, TrackFeed};
use crate::options::{StreamListener, StreamOptions, StreamToken};
use crate::resample::ConverterQuality;
use crate::scheduler::ClockSource;
use crate::shared::{PauseControl, PauseSource, StreamShared};
use crate::storage::SharedTrack;
use crate::supervisor::{SharedDriver, StreamSupervisor};
use crate::worker::{CaptureSink, DrainOutcome, IoWorker, WorkerSetup};
use duplex_core::{
    dropout_log, BufferConfig, DropoutKinds, DropoutLog, Error as CoreError, LatencyCalibration,
    LostInterval, PlayMode, RingObserver, SampleRingBuffer, ScrubQueue, ScrubTarget, StreamClock,
};
use parking_lot::Mutex;
use ringbuf::traits::Split;
use ringbuf::HeapRb;
use std::sync::Arc;

/// Position markers buffered between worker and callback.
const MARKER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveKind {
    /// Input metering and playthrough only.
    Monitoring,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Starting,
    Active(ActiveKind),
    Stopping,
}

/// Ring fill levels of the active stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatus {
    /// Frames queued in the emptiest playback ring, `None` without playback.
    pub playback_readable_frames: Option<usize>,
    /// Free frames in the fullest capture ring, `None` without capture.
    pub capture_writable_frames: Option<usize>,
    /// The worker has rendered the end of straight play.
    pub fill_complete: bool,
}

struct ActiveStream {
    token: StreamToken,
    kind: ActiveKind,
    shared: Arc<StreamShared>,
    worker: Option<IoWorker>,
    supervisor: Option<StreamSupervisor>,
    dropouts: DropoutLog,
    scrub: Option<ScrubQueue>,
    capture: Vec<(SharedTrack, u64)>,
    playback_observers: Vec<RingObserver>,
    capture_observers: Vec<RingObserver>,
    info: DeviceInfo,
    options: StreamOptions,
    start: f64,
    end: f64,
}

impl ActiveStream {
    fn listener(&self) -> Option<Arc<dyn StreamListener>> {
        self.options.listener.clone()
    }

    fn failed(&self) -> bool {
        self.shared.worker_failed.get()
    }
}

#[derive(Default)]
pub struct StreamControllerBuilder {
    driver: Option<Box<dyn AudioDriver>>,
    config: BufferConfig,
    calibration: LatencyCalibration,
    quality: ConverterQuality,
}

impl StreamControllerBuilder {
    pub fn driver(mut self, driver: impl AudioDriver + 'static) -> Self {
        self.driver = Some(Box::new(driver));
        self
    }

    pub fn boxed_driver(mut self, driver: Box<dyn AudioDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn buffer_config(mut self, config: BufferConfig) -> Self {
        self.config = config;
        self
    }

    pub fn calibration(mut self, calibration: LatencyCalibration) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn converter_quality(mut self, quality: ConverterQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn build(self) -> Result<StreamController> {
        let driver = self.driver.ok_or_else(|| {
            Error::Core(CoreError::InvalidConfig("no audio driver given".into()))
        })?;
        self.config.validate()?;
        Ok(StreamController {
            driver: Arc::new(Mutex::new(driver)),
            capabilities: DeviceCapabilities::new(),
            config: self.config,
            calibration: self.calibration,
            quality: self.quality,
            state: StreamState::Idle,
            next_token: 0,
            metrics: Arc::new(IoMetrics::new()),
            pause: Arc::new(PauseControl::new()),
            active: None,
            last_lost: Vec::new(),
            failure: None,
        })
    }
}

/// Owns the device and runs one stream at a time.
pub struct StreamController {
    driver: SharedDriver,
    capabilities: DeviceCapabilities,
    config: BufferConfig,
    calibration: LatencyCalibration,
    quality: ConverterQuality,
    state: StreamState,
    next_token: u64,
    metrics: Arc<IoMetrics>,
    pause: Arc<PauseControl>,
    active: Option<ActiveStream>,
    last_lost: Vec<LostInterval>,
    /// Error of a failed stream reaped outside `stop_stream`.
    failure: Option<Error>,
}

impl StreamController {
    pub fn builder() -> StreamControllerBuilder {
        StreamControllerBuilder::default()
    }

    /// A stream whose worker failed reads as stopping until the controller
    /// reaps it.
    pub fn state(&self) -> StreamState {
        if self.active.as_ref().is_some_and(ActiveStream::failed) {
            return StreamState::Stopping;
        }
        self.state
    }

    pub fn buffer_config(&self) -> &BufferConfig {
        &self.config
    }

    /// Takes effect from the next stream.
    pub fn set_buffer_config(&mut self, config: BufferConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    fn issue_token(&mut self) -> StreamToken {
        self.next_token += 1;
        StreamToken(self.next_token)
    }

    /// Start playing `playback` and recording into `capture` between `start`
    /// and `end` track seconds.
    ///
    /// Returns [`Error::Busy`] unless idle or monitoring; monitoring is
    /// stopped first. A straight stream with `start == end` plays and records
    /// zero frames and returns a token that is already inactive. Straight
    /// capture stops at `end`.
    pub fn start_stream(
        &mut self,
        playback: Vec<PlaybackTrack>,
        capture: Vec<CaptureTrack>,
        start: f64,
        end: f64,
        options: StreamOptions,
    ) -> Result<StreamToken> {
        self.reap_failed();
        if self.state == StreamState::Active(ActiveKind::Monitoring) {
            self.stop_stream()?;
        }
        if self.state != StreamState::Idle {
            return Err(Error::Busy);
        }
        self.validate_request(&playback, &capture, start, end, &options)?;

        let token = self.issue_token();
        if options.mode == PlayMode::Straight && start == end {
            tracing::debug!("Empty selection, stream {} ends immediately", token.0);
            self.last_lost.clear();
            return Ok(token);
        }

        self.state = StreamState::Starting;
        match self.open_stream(token, playback, capture, start, end, options) {
            Ok(active) => {
                tracing::info!(
                    "Stream {} started at {} Hz on {}",
                    token.0,
                    active.info.sample_rate,
                    active.info.name
                );
                let listener = active.listener();
                self.active = Some(active);
                self.state = StreamState::Active(ActiveKind::Streaming);
                if let Some(listener) = listener {
                    listener.on_stream_started(token);
                }
                Ok(token)
            }
            Err(e) => {
                tracing::warn!("Failed to start stream: {}", e);
                self.driver.lock().close();
                self.state = StreamState::Idle;
                Err(e)
            }
        }
    }

    fn validate_request(
        &self,
        playback: &[PlaybackTrack],
        capture: &[CaptureTrack],
        start: f64,
        end: f64,
        options: &StreamOptions,
    ) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Core(CoreError::InvalidConfig(msg.into())));

        if !(start.is_finite() && end.is_finite()) || end < start {
            return Err(Error::Core(CoreError::InvalidBounds { start, end }));
        }
        if playback.is_empty() && capture.is_empty() {
            return invalid("nothing to play or record");
        }
        if !capture.is_empty() && options.mode != PlayMode::Straight {
            return invalid("recording needs straight play");
        }
        if options.mode == PlayMode::Scrub {
            if options.warp.is_some() {
                return invalid("scrubbing cannot be time warped");
            }
            options.scrub.validate()?;
        }
        if !(options.output_volume.is_finite() && options.output_volume >= 0.0) {
            return invalid("output volume must be non-negative");
        }
        Ok(())
    }

    fn open_stream(
        &mut self,
        token: StreamToken,
        playback: Vec<PlaybackTrack>,
        capture: Vec<CaptureTrack>,
        start: f64,
        end: f64,
        options: StreamOptions,
    ) -> Result<ActiveStream> {
        let needs_output = !playback.is_empty() || options.playthrough;
        let rate = self.capabilities.best_rate(
            &**self.driver.lock(),
            !capture.is_empty(),
            needs_output,
            options.rate,
        )?;

        let input_channels = capture
            .iter()
            .map(CaptureTrack::channels_needed)
            .max()
            .unwrap_or(0);
        let max_in = self.driver.lock().max_channels(StreamDirection::Input)?;
        if input_channels > max_in {
            return Err(Error::Device(format!(
                "recording needs {input_channels} input channels, device has {max_in}"
            )));
        }
        let output_channels = if needs_output {
            let max_out = self.driver.lock().max_channels(StreamDirection::Output)?;
            if max_out == 0 {
                return Err(Error::Device("device has no output channels".into()));
            }
            max_out.min(2)
        } else {
            0
        };

        self.metrics.reset();
        self.pause.clear();
        let shared = Arc::new(StreamShared::new(start, input_channels, output_channels));
        shared.output_volume.set(options.output_volume);
        let (detector, dropouts) = dropout_log(self.config.dropout_capacity);

        // playback side
        let mut scrub = None;
        let mut clock = None;
        let mut feeds = Vec::with_capacity(playback.len());
        let mut consumers = Vec::with_capacity(playback.len());
        let mut playback_observers = Vec::with_capacity(playback.len());
        let mut bus_tracks = Vec::with_capacity(playback.len());
        let (marker_prod, marker_cons) = if playback.is_empty() {
            (None, None)
        } else {
            let (p, c) = HeapRb::<PositionMarker>::new(MARKER_CAPACITY).split();
            (Some(p), Some(c))
        };

        if !playback.is_empty() {
            let mut c = StreamClock::new(options.mode, start, end, rate)?;
            if let Some(warp) = options.warp.clone() {
                c = c.with_warp(warp)?;
            }
            if let Some(gap) = options.cut_preview {
                c = c.with_cut_gap(gap)?;
            }
            if options.mode == PlayMode::Scrub {
                let (queue, feed) = ScrubQueue::new(options.scrub, rate, (start, end), start)?;
                c = c.with_scrub(feed);
                scrub = Some(queue);
            }
            clock = Some(c);

            let variable_speed = match (&options.warp, options.mode) {
                (_, PlayMode::Scrub) => Some(options.scrub.max_speed),
                (Some(warp), _) => Some(
                    warp.points()
                        .iter()
                        .map(|p| p.speed.max(1.0 / p.speed))
                        .fold(1.0, f64::max),
                ),
                (None, _) => None,
            };

            for track in &playback {
                let channels = track.storage.lock().channels();
                let ring = SampleRingBuffer::with_seconds(
                    self.config.playback_seconds,
                    rate,
                    channels,
                )?;
                playback_observers.push(ring.observer());
                let (producer, consumer) = ring.split();
                feeds.push(TrackFeed::new(
                    Arc::clone(&track.storage),
                    producer,
                    rate,
                    start,
                    variable_speed,
                    self.quality,
                    self.config.chunk_frames,
                )?);
                consumers.push(consumer);
                bus_tracks.push((Arc::clone(&track.controls), channels));
            }
        }

        // capture side
        let mut lanes = Vec::with_capacity(capture.len());
        let mut sinks = Vec::with_capacity(capture.len());
        let mut capture_observers = Vec::with_capacity(capture.len());
        let mut capture_origins = Vec::with_capacity(capture.len());
        for track in &capture {
            let (channels, origin) = {
                let s = track.storage.lock();
                (s.channels(), s.len_frames())
            };
            let ring = SampleRingBuffer::with_seconds(self.config.capture_seconds, rate, channels)?;
            capture_observers.push(ring.observer());
            let (producer, consumer) = ring.split();
            lanes.push(CaptureLane {
                producer,
                first_channel: track.first_channel,
            });
            sinks.push(CaptureSink::new(
                consumer,
                Arc::clone(&track.storage),
                rate,
                self.quality,
                self.config.chunk_frames,
            )?);
            capture_origins.push((Arc::clone(&track.storage), origin));
        }
        let capture_bound = (options.mode == PlayMode::Straight && !capture.is_empty())
            .then(|| (((end - start) * rate).round() as u64, end));

        let callback = DeviceCallback::new(CallbackSetup {
            shared: Arc::clone(&shared),
            pause: Arc::clone(&self.pause),
            capture: lanes,
            playback: consumers,
            bus: MixBus::new(bus_tracks),
            markers: marker_cons,
            detector: options.detect_dropouts.then_some(detector),
            detect_upstream: options.detect_upstream_dropouts,
            playthrough: options.playthrough,
            device_rate: rate,
            max_block_frames: self.config.max_block_frames,
            start_time: start,
            capture_bound,
        });

        let info = self.open_device(rate, input_channels, output_channels, callback)?;

        let worker = IoWorker::spawn(WorkerSetup {
            clock,
            mixer: PlaybackMixer::new(feeds, self.config.parallel_io),
            markers: marker_prod,
            capture: sinks,
            shared: Arc::clone(&shared),
            metrics: Arc::clone(&self.metrics),
            config: self.config,
            device_rate: rate,
        })?;
        worker.wait_primed(self.config.prime_timeout())?;
        self.driver.lock().start()?;
        let supervisor = StreamSupervisor::spawn(
            token,
            Arc::clone(&shared),
            Arc::clone(&self.driver),
            options.listener.clone(),
        )?;

        Ok(ActiveStream {
            token,
            kind: ActiveKind::Streaming,
            shared,
            worker: Some(worker),
            supervisor: Some(supervisor),
            dropouts,
            scrub,
            capture: capture_origins,
            playback_observers,
            capture_observers,
            info,
            options,
            start,
            end,
        })
    }

    fn open_device(
        &mut self,
        rate: f64,
        input_channels: usize,
        output_channels: usize,
        callback: DeviceCallback,
    ) -> Result<DeviceInfo> {
        let request = DeviceRequest {
            sample_rate: rate,
            input_channels,
            output_channels,
            block_frames: None,
        };
        let info = self.driver.lock().open(&request, Box::new(callback))?;
        if info.sample_rate != rate {
            return Err(Error::Device(format!(
                "asked for {} Hz, device runs at {} Hz",
                rate, info.sample_rate
            )));
        }
        Ok(info)
    }

    /// Open the device for input metering and optional playthrough, without
    /// tracks.
    pub fn start_monitoring(
        &mut self,
        rate: Option<f64>,
        input_channels: usize,
        playthrough: bool,
    ) -> Result<StreamToken> {
        self.reap_failed();
        if self.state != StreamState::Idle {
            return Err(Error::Busy);
        }
        self.state = StreamState::Starting;
        let token = self.issue_token();

        let result = (|| {
            let rate = self
                .capabilities
                .best_rate(&**self.driver.lock(), true, playthrough, rate)?;
            let max_in = self.driver.lock().max_channels(StreamDirection::Input)?;
            let input_channels = input_channels.min(max_in);
            let output_channels = if playthrough {
                self.driver.lock().max_channels(StreamDirection::Output)?.min(2)
            } else {
                0
            };

            self.pause.clear();
            let shared = Arc::new(StreamShared::new(0.0, input_channels, output_channels));
            let (_, dropouts) = dropout_log(1);
            let callback = DeviceCallback::new(CallbackSetup {
                shared: Arc::clone(&shared),
                pause: Arc::clone(&self.pause),
                capture: Vec::new(),
                playback: Vec::new(),
                bus: MixBus::new(Vec::new()),
                markers: None,
                detector: None,
                detect_upstream: false,
                playthrough,
                device_rate: rate,
                max_block_frames: self.config.max_block_frames,
                start_time: 0.0,
                capture_bound: None,
            });
            let info = self.open_device(rate, input_channels, output_channels, callback)?;
            self.driver.lock().start()?;
            Ok(ActiveStream {
                token,
                kind: ActiveKind::Monitoring,
                shared,
                worker: None,
                supervisor: None,
                dropouts,
                scrub: None,
                capture: Vec::new(),
                playback_observers: Vec::new(),
                capture_observers: Vec::new(),
                info,
                options: StreamOptions::default(),
                start: 0.0,
                end: 0.0,
            })
        })();

        match result {
            Ok(active) => {
                tracing::info!("Monitoring {} at {} Hz", active.info.name, active.info.sample_rate);
                self.active = Some(active);
                self.state = StreamState::Active(ActiveKind::Monitoring);
                Ok(token)
            }
            Err(e) => {
                self.driver.lock().close();
                self.state = StreamState::Idle;
                Err(e)
            }
        }
    }

    /// Stop the active stream or monitor. Does nothing when idle.
    ///
    /// Returns the first fatal worker error of the stream, if any, after the
    /// stream has been torn down.
    pub fn stop_stream(&mut self) -> Result<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        self.state = StreamState::Stopping;
        active.shared.stopping.set(true);
        if let Some(supervisor) = active.supervisor.as_mut() {
            supervisor.stop();
        }

        let mut drained = true;
        let mut worker_lost = false;
        if let Some(worker) = active.worker.as_mut() {
            match worker.drain(self.config.drain_timeout()) {
                DrainOutcome::Completed => {}
                DrainOutcome::WorkerLost => {
                    tracing::error!("I/O worker exited without draining capture");
                    drained = false;
                    worker_lost = true;
                }
                DrainOutcome::TimedOut => {
                    drained = false;
                    let pending = active
                        .capture_observers
                        .iter()
                        .map(RingObserver::readable_frames)
                        .max()
                        .unwrap_or(0);
                    let device_time = active.shared.position.load().device_time;
                    tracing::warn!(
                        "I/O worker did not drain within {:?}, discarding {} frames",
                        self.config.drain_timeout(),
                        pending
                    );
                    active.dropouts.record(LostInterval {
                        start: device_time,
                        duration: pending as f64 / active.info.sample_rate,
                        kinds: DropoutKinds::DRAIN_TIMEOUT,
                    });
                }
            }
        }
        self.driver.lock().close();

        let lost = active.dropouts.finish();
        let mut result = Ok(());
        if drained && active.kind == ActiveKind::Streaming {
            result = self.finish_capture(&active);
        }
        if worker_lost {
            result = Err(Error::Worker("I/O worker exited without draining capture".into()));
        }
        if let Some(fatal) = active.shared.take_fatal() {
            result = Err(fatal);
        }

        if !lost.is_empty() {
            tracing::warn!("Stream {} lost {} interval(s)", active.token.0, lost.len());
        }
        tracing::info!("Stream {} stopped", active.token.0);
        self.pause.clear();
        self.last_lost = lost;
        self.state = StreamState::Idle;
        if let Some(listener) = active.listener() {
            listener.on_stream_stopped(active.token, &self.last_lost);
        }
        result
    }

    /// Shift newly captured audio by the latency correction and close the
    /// capture tracks.
    fn finish_capture(&self, active: &ActiveStream) -> Result<()> {
        if active.capture.is_empty() {
            return Ok(());
        }
        let observed = active.shared.observed_input_latency.get();
        let shift = active.options.latency_correction.shift_seconds(
            &self.calibration,
            active.info.input_latency,
            observed,
        );
        tracing::debug!("Capture latency correction {:.4} s", shift);

        for (storage, origin) in &active.capture {
            let mut storage = storage.lock();
            let frames = (shift * storage.sample_rate()).round() as i64;
            if frames != 0 {
                storage.shift_capture(*origin, frames)?;
            }
            storage.finish()?;
        }
        Ok(())
    }

    /// Whether a stream (not monitoring) is running, optionally a specific
    /// one. A stream whose worker failed is no longer active.
    pub fn is_stream_active(&self, token: Option<StreamToken>) -> bool {
        self.streaming()
            .is_some_and(|active| token.map_or(true, |t| t == active.token))
    }

    pub fn is_busy(&self) -> bool {
        self.state != StreamState::Idle
    }

    pub fn is_monitoring(&self) -> bool {
        self.state == StreamState::Active(ActiveKind::Monitoring)
    }

    fn streaming(&self) -> Option<&ActiveStream> {
        self.active
            .as_ref()
            .filter(|a| a.kind == ActiveKind::Streaming && !a.failed())
    }

    /// Track time being heard (or captured), or `None` without a stream.
    pub fn current_stream_time(&self) -> Option<f64> {
        self.streaming()
            .map(|a| a.shared.position.load().track_time)
    }

    /// Loop passes completed by the audible position.
    pub fn current_pass(&self) -> Option<u64> {
        self.streaming().map(|a| a.shared.position.load().pass)
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.set_paused_by(PauseSource::User, paused);
    }

    /// Pause on behalf of `source`; the stream runs when no source pauses it.
    pub fn set_paused_by(&mut self, source: PauseSource, paused: bool) {
        let was = self.pause.is_paused();
        let now = self.pause.set(source, paused);
        if was != now {
            tracing::debug!("Stream {}", if now { "paused" } else { "resumed" });
            if let Some(listener) = self.active.as_ref().and_then(ActiveStream::listener) {
                listener.on_paused(now);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Move playback by `delta` track seconds.
    pub fn seek_stream(&mut self, delta: f64) -> Result<()> {
        let active = self.streaming().ok_or(Error::NotActive)?;
        if let Some(worker) = &active.worker {
            worker.seek(delta);
        }
        Ok(())
    }

    /// Queue a scrub movement. Returns false when nothing was queued: the
    /// stream is not scrubbing, `duration` is below the minimum stutter, or
    /// the queue is full.
    pub fn enqueue_scrub(&mut self, target: ScrubTarget, duration: f64) -> bool {
        self.active
            .as_mut()
            .and_then(|a| a.scrub.as_mut())
            .is_some_and(|q| q.enqueue(target, duration))
    }

    pub fn last_time_in_scrub_queue(&self) -> Option<f64> {
        self.active
            .as_ref()
            .and_then(|a| a.scrub.as_ref())
            .map(ScrubQueue::last_time_in_queue)
    }

    /// Intervals lost so far in the active stream, or in the last stream
    /// once it has stopped.
    pub fn lost_capture_intervals(&mut self) -> Vec<LostInterval> {
        match self.active.as_mut() {
            Some(active) => active.dropouts.collect().to_vec(),
            None => self.last_lost.clone(),
        }
    }

    /// Release a stream whose worker failed. Its supervisor has already
    /// closed the device; this drains what is left and keeps the error for
    /// [`StreamController::check_health`].
    fn reap_failed(&mut self) {
        if !self.active.as_ref().is_some_and(ActiveStream::failed) {
            return;
        }
        let error = match self.stop_stream() {
            Err(e) => e,
            Ok(()) => Error::Worker("I/O worker failed".into()),
        };
        tracing::warn!("Reaped failed stream: {}", error);
        self.failure = Some(error);
    }

    /// Report the error of a stream that failed since the last call, after
    /// releasing it.
    pub fn check_health(&mut self) -> Result<()> {
        self.reap_failed();
        match self.failure.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Straight play has reached the end bound: everything rendered was
    /// heard and capture has recorded up to the end.
    pub fn is_playback_complete(&self) -> bool {
        self.streaming().is_some_and(|a| {
            (a.playback_observers.is_empty() || a.shared.playback_drained.get())
                && (a.capture.is_empty() || a.shared.capture_complete.get())
        })
    }

    /// Input peaks since the last call.
    pub fn input_levels(&self) -> Vec<f32> {
        self.active
            .as_ref()
            .map_or_else(Vec::new, |a| a.shared.input_meter.take())
    }

    /// Output peaks since the last call.
    pub fn output_levels(&self) -> Vec<f32> {
        self.active
            .as_ref()
            .map_or_else(Vec::new, |a| a.shared.output_meter.take())
    }

    pub fn set_output_volume(&mut self, volume: f32) {
        if let Some(active) = self.active.as_mut() {
            let volume = volume.max(0.0);
            active.shared.output_volume.set(volume);
            active.options.output_volume = volume;
        }
    }

    pub fn metrics(&self) -> IoMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn ring_status(&self) -> Option<RingStatus> {
        let active = self.streaming()?;
        Some(RingStatus {
            playback_readable_frames: active
                .playback_observers
                .iter()
                .map(RingObserver::readable_frames)
                .min(),
            capture_writable_frames: active
                .capture_observers
                .iter()
                .map(RingObserver::writable_frames)
                .min(),
            fill_complete: active.shared.fill_complete.get(),
        })
    }

    /// Published clock of the active stream, for an external scheduler.
    pub fn clock_source(&self) -> Option<ClockSource> {
        self.streaming().map(|a| {
            ClockSource::new(
                Arc::clone(&a.shared),
                Arc::clone(&self.pause),
                a.start,
                a.end,
                a.options.mode,
            )
        })
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.active.as_ref().map(|a| &a.info)
    }

    pub fn supported_rates(&mut self, direction: StreamDirection) -> Result<Vec<u32>> {
        self.capabilities
            .supported_rates(&**self.driver.lock(), direction)
    }

    /// Forget cached capabilities and stop whatever is running.
    pub fn handle_device_change(&mut self) -> Result<()> {
        tracing::info!("Audio devices changed");
        self.capabilities.invalidate();
        self.stop_stream()
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let Err(e) = self.stop_stream() {
            tracing::warn!("Stream stopped with error: {}", e);
        }
    }
}
