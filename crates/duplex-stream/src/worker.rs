//! The I/O worker thread.
//!
//! Keeps the playback rings topped up from track storage and drains the
//! capture rings into it. Everything that may block (storage locks, storage
//! I/O, rate conversion) happens here, never in the device callback. A worker
//! that falls behind shows up as callback dropouts; it is never waited on by
//! the callback.

use crate::callback::PositionMarker;
use crate::error::{Error, Result};
use crate::metrics::IoMetrics;
use crate::mixer::PlaybackMixer;
use crate::resample::{ConverterQuality, RateConverter};
use crate::shared::{StreamShared, WorkerPhase};
use crate::storage::SharedTrack;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use duplex_core::{BufferConfig, PlayMode, RingConsumer, StreamClock};
use ringbuf::traits::{Observer, Producer};
use ringbuf::HeapProd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thread_priority::ThreadPriority;

/// Commands sent to the worker thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum WorkerCommand {
    /// Move playback by this many track seconds.
    Seek(f64),
    /// Flush remaining capture, then exit.
    Drain,
    /// Exit without flushing.
    Abandon,
}

/// How a drain request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed,
    TimedOut,
    /// The worker thread died (panicked) before it could answer.
    WorkerLost,
}

/// Moves one capture ring into one track.
pub(crate) struct CaptureSink {
    consumer: RingConsumer,
    storage: SharedTrack,
    converter: RateConverter,
    device_rate: f64,
    /// Device frames taken from the ring so far.
    device_frames: u64,
    chunk_frames: usize,
    scratch: Vec<f32>,
    converted: Vec<f32>,
}

impl CaptureSink {
    pub fn new(
        consumer: RingConsumer,
        storage: SharedTrack,
        device_rate: f64,
        quality: ConverterQuality,
        chunk_frames: usize,
    ) -> Result<Self> {
        let (channels, track_rate) = {
            let s = storage.lock();
            (s.channels(), s.sample_rate())
        };
        if consumer.channels() != channels {
            return Err(Error::Worker(format!(
                "capture ring has {} channels, track has {}",
                consumer.channels(),
                channels
            )));
        }
        let chunk_frames = chunk_frames.max(1);
        Ok(Self {
            consumer,
            storage,
            converter: RateConverter::new(device_rate, track_rate, channels, quality)?,
            device_rate,
            device_frames: 0,
            chunk_frames,
            scratch: vec![0.0; chunk_frames * channels],
            converted: Vec::with_capacity(chunk_frames * channels * 2),
        })
    }

    fn pending_frames(&self) -> usize {
        self.consumer.readable_frames()
    }

    /// Append converted frames under the storage lock. Returns false if the
    /// stream was abandoned while waiting for the lock.
    fn append_converted(&mut self, capture_time: f64, shared: &StreamShared) -> Result<bool> {
        let frames = self.converter.available_frames();
        if frames == 0 {
            return Ok(true);
        }
        self.converted.resize(frames * self.converter.channels(), 0.0);
        let n = self.converter.pop(&mut self.converted);

        let mut storage = self.storage.lock();
        if shared.abandoned.get() {
            return Ok(false);
        }
        storage.append(&self.converted[..n], capture_time)?;
        Ok(true)
    }

    /// Move pending capture into storage. Below `min_frames` nothing moves
    /// unless `all` is set.
    fn drain(
        &mut self,
        min_frames: usize,
        all: bool,
        shared: &StreamShared,
        metrics: &IoMetrics,
    ) -> Result<()> {
        loop {
            let pending = self.pending_frames();
            if pending == 0 || (!all && pending < min_frames) {
                return Ok(());
            }
            let frames = pending.min(self.chunk_frames);
            let ch = self.consumer.channels();
            let read = self.consumer.read(&mut self.scratch[..frames * ch]) / ch;
            let capture_time = self.device_frames as f64 / self.device_rate;
            self.device_frames += read as u64;

            self.converter.push(&self.scratch[..read * ch])?;
            if !self.append_converted(capture_time, shared)? {
                return Ok(());
            }
            metrics.record_write(read as u64);
        }
    }

    /// Push the converter tail into storage.
    fn finish(&mut self, shared: &StreamShared) -> Result<()> {
        self.converter.flush()?;
        let capture_time = self.device_frames as f64 / self.device_rate;
        self.append_converted(capture_time, shared)?;
        Ok(())
    }
}

/// Everything the worker thread owns.
pub(crate) struct WorkerSetup {
    pub clock: Option<StreamClock>,
    pub mixer: PlaybackMixer,
    pub markers: Option<HeapProd<PositionMarker>>,
    pub capture: Vec<CaptureSink>,
    pub shared: Arc<StreamShared>,
    pub metrics: Arc<IoMetrics>,
    pub config: BufferConfig,
    pub device_rate: f64,
}

struct Worker {
    clock: Option<StreamClock>,
    mixer: PlaybackMixer,
    markers: Option<HeapProd<PositionMarker>>,
    capture: Vec<CaptureSink>,
    shared: Arc<StreamShared>,
    metrics: Arc<IoMetrics>,
    device_rate: f64,
    chunk_frames: usize,
    low_water_frames: usize,
    min_capture_frames: usize,
    interval: Duration,
}

impl Worker {
    fn new(setup: WorkerSetup) -> Self {
        let rate = setup.device_rate;
        Self {
            clock: setup.clock,
            mixer: setup.mixer,
            markers: setup.markers,
            capture: setup.capture,
            shared: setup.shared,
            metrics: setup.metrics,
            device_rate: rate,
            chunk_frames: setup.config.chunk_frames.max(1),
            low_water_frames: setup.config.low_water_frames(rate),
            min_capture_frames: setup.config.min_capture_frames(rate).max(1),
            interval: setup.config.worker_interval(),
        }
    }

    /// Render spans into the playback rings. With `fill` the rings are
    /// filled to capacity; otherwise only a ring below the low-water mark is
    /// topped up.
    fn refill(&mut self, fill: bool) -> Result<()> {
        let Some(clock) = self.clock.as_mut() else {
            return Ok(());
        };
        if self.mixer.is_empty() {
            return Ok(());
        }
        if clock.is_finished() {
            self.shared.fill_complete.set(true);
            return Ok(());
        }
        let readable = self.mixer.readable_frames();
        if !fill && readable >= self.low_water_frames {
            return Ok(());
        }
        if !fill {
            self.metrics.record_low_water();
        }

        // scrub only keeps a short lead so new targets are heard quickly
        let target = if clock.mode() == PlayMode::Scrub {
            self.low_water_frames.max(self.chunk_frames)
        } else {
            usize::MAX
        };

        loop {
            let room = self.mixer.writable_frames();
            let queued = self.mixer.readable_frames();
            if room == 0 || queued >= target || clock.is_finished() {
                break;
            }
            if self
                .markers
                .as_ref()
                .is_some_and(|m| m.vacant_len() == 0)
            {
                break;
            }
            let span = clock.advance(room.min(self.chunk_frames));
            if span.is_empty() {
                break;
            }
            if let Some(markers) = self.markers.as_mut() {
                let _ = markers.try_push(PositionMarker {
                    frame: self.mixer.frames_written(),
                    start: span.start,
                    end: span.end,
                    frames: span.frames,
                    pass: span.pass,
                });
            }
            self.mixer.render(&span, self.device_rate, &self.metrics)?;
        }

        if clock.is_finished() {
            self.shared.fill_complete.set(true);
        }
        Ok(())
    }

    fn drain_capture(&mut self, all: bool) -> Result<()> {
        for sink in &mut self.capture {
            sink.drain(self.min_capture_frames, all, &self.shared, &self.metrics)?;
        }
        Ok(())
    }

    fn seek(&mut self, delta: f64) {
        let Some(clock) = self.clock.as_mut() else {
            return;
        };
        let landed = clock.seek(delta);
        self.shared
            .flush_until
            .store(self.mixer.frames_written(), Ordering::Release);
        self.shared.fill_complete.set(false);
        self.shared.playback_drained.set(false);
        tracing::debug!("Seek by {:.3} s landed at {:.3} s", delta, landed);
    }

    fn finish(&mut self) -> Result<()> {
        self.drain_capture(true)?;
        for sink in &mut self.capture {
            sink.finish(&self.shared)?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.refill(false)?;
        self.drain_capture(false)
    }
}

/// Handle to the worker thread of one stream.
pub(crate) struct IoWorker {
    commands: Sender<WorkerCommand>,
    primed: Receiver<()>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<StreamShared>,
}

impl IoWorker {
    /// Start the worker. It primes the playback rings right away.
    pub fn spawn(setup: WorkerSetup) -> Result<Self> {
        let (command_tx, command_rx) = unbounded();
        let (primed_tx, primed_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let shared = Arc::clone(&setup.shared);

        let handle = thread::Builder::new()
            .name("duplex-io".into())
            .spawn(move || {
                if let Err(e) = thread_priority::set_current_thread_priority(ThreadPriority::Max)
                {
                    tracing::debug!("Could not raise I/O worker priority: {:?}", e);
                }
                worker_loop(Worker::new(setup), command_rx, primed_tx, done_tx);
            })?;

        Ok(Self {
            commands: command_tx,
            primed: primed_rx,
            done: done_rx,
            handle: Some(handle),
            shared,
        })
    }

    /// Wait until the playback rings are full.
    pub fn wait_primed(&self, timeout: Duration) -> Result<()> {
        match self.primed.recv_timeout(timeout) {
            Ok(()) => match self.shared.take_fatal() {
                Some(e) => Err(e),
                None => Ok(()),
            },
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::Worker("timed out priming playback".into()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self
                .shared
                .take_fatal()
                .unwrap_or_else(|| Error::Worker("worker exited while priming".into()))),
        }
    }

    pub fn seek(&self, delta: f64) {
        let _ = self.commands.send(WorkerCommand::Seek(delta));
    }

    /// Ask for a final flush and wait up to `timeout` for it. On timeout the
    /// worker is told to discard what it has not written yet.
    pub fn drain(&mut self, timeout: Duration) -> DrainOutcome {
        let _ = self.commands.send(WorkerCommand::Drain);
        match self.done.recv_timeout(timeout) {
            Ok(()) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                DrainOutcome::Completed
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        tracing::error!("I/O worker panicked");
                    }
                }
                DrainOutcome::WorkerLost
            }
            Err(RecvTimeoutError::Timeout) => {
                self.abandon();
                DrainOutcome::TimedOut
            }
        }
    }

    /// Stop without flushing. The thread is detached; it exits once any
    /// storage call it is stuck in returns.
    pub fn abandon(&mut self) {
        self.shared.abandoned.set(true);
        let _ = self.commands.send(WorkerCommand::Abandon);
        self.handle.take();
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.abandon();
        }
    }
}

fn worker_loop(
    mut worker: Worker,
    commands: Receiver<WorkerCommand>,
    primed: Sender<()>,
    done: Sender<()>,
) {
    let shared = Arc::clone(&worker.shared);

    shared.set_phase(WorkerPhase::Priming);
    if let Err(e) = worker.refill(true) {
        tracing::error!("Priming playback failed: {}", e);
        shared.fail(e);
    }
    let _ = primed.send(());
    if !shared.worker_failed.get() {
        shared.set_phase(WorkerPhase::Running);
    }

    loop {
        if shared.worker_failed.get() {
            wait_for_exit(&commands, &done);
            return;
        }

        match commands.recv_timeout(worker.interval) {
            Ok(WorkerCommand::Seek(delta)) => worker.seek(delta),
            Ok(WorkerCommand::Drain) => {
                shared.set_phase(WorkerPhase::Draining);
                if !shared.abandoned.get() {
                    if let Err(e) = worker.finish() {
                        tracing::error!("Final capture flush failed: {}", e);
                        shared.fail(e);
                    }
                }
                if !shared.worker_failed.get() {
                    shared.set_phase(WorkerPhase::Finished);
                }
                let _ = done.send(());
                return;
            }
            Ok(WorkerCommand::Abandon) | Err(RecvTimeoutError::Disconnected) => {
                shared.set_phase(WorkerPhase::Finished);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if shared.abandoned.get() {
            shared.set_phase(WorkerPhase::Finished);
            return;
        }
        if let Err(e) = worker.step() {
            tracing::error!("Stream I/O failed: {}", e);
            shared.fail(e);
        }
    }
}

/// After a fatal error only a drain or abandon request is honoured.
fn wait_for_exit(commands: &Receiver<WorkerCommand>, done: &Sender<()>) {
    loop {
        match commands.recv() {
            Ok(WorkerCommand::Seek(_)) => continue,
            Ok(WorkerCommand::Drain) => {
                let _ = done.send(());
                return;
            }
            Ok(WorkerCommand::Abandon) | Err(_) => return,
        }
    }
}
