//! State shared between the controller, the I/O worker and the device callback.

use crate::error::Error;
use crossbeam_channel::{bounded, Receiver, Sender};
use duplex_core::{PositionCell, SecondsCell, SharedLevel, SyncFlag};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Who asked for a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PauseSource {
    /// The host, through the controller.
    User,
    /// The external instrument clock.
    ExternalClock,
}

#[derive(Debug, Default)]
struct PauseRequests {
    user: bool,
    external: bool,
}

/// Pause state. Requests go through a lock so concurrent pausers agree on the
/// outcome; the callback only reads the published flag.
#[derive(Debug, Default)]
pub struct PauseControl {
    requests: Mutex<PauseRequests>,
    paused: SyncFlag,
}

impl PauseControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request and return whether the stream is now paused.
    pub fn set(&self, source: PauseSource, paused: bool) -> bool {
        let mut requests = self.requests.lock();
        match source {
            PauseSource::User => requests.user = paused,
            PauseSource::ExternalClock => requests.external = paused,
        }
        let effective = requests.user || requests.external;
        self.paused.set(effective);
        effective
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    pub fn is_paused_by(&self, source: PauseSource) -> bool {
        let requests = self.requests.lock();
        match source {
            PauseSource::User => requests.user,
            PauseSource::ExternalClock => requests.external,
        }
    }

    pub(crate) fn clear(&self) {
        let mut requests = self.requests.lock();
        *requests = PauseRequests::default();
        self.paused.set(false);
    }
}

/// Worker lifecycle, published for the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerPhase {
    Priming = 0,
    Running = 1,
    Draining = 2,
    Finished = 3,
    Failed = 4,
}

impl WorkerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerPhase::Priming,
            1 => WorkerPhase::Running,
            2 => WorkerPhase::Draining,
            3 => WorkerPhase::Finished,
            _ => WorkerPhase::Failed,
        }
    }
}

/// Per-channel peak meter. The callback raises peaks, readers take and reset them.
#[derive(Debug)]
pub struct LevelMeter {
    peaks: Box<[SharedLevel]>,
}

impl LevelMeter {
    pub fn new(channels: usize) -> Self {
        Self {
            peaks: (0..channels).map(|_| SharedLevel::new(0.0)).collect(),
        }
    }

    /// Fold an interleaved block into the peaks.
    #[inline]
    pub fn update(&self, block: &[f32], channels: usize) {
        if channels == 0 {
            return;
        }
        for (c, peak) in self.peaks.iter().enumerate().take(channels) {
            let mut max = 0.0f32;
            for frame in block.chunks_exact(channels) {
                max = max.max(frame[c].abs());
            }
            peak.raise(max);
        }
    }

    /// Peaks since the last call.
    pub fn take(&self) -> Vec<f32> {
        self.peaks.iter().map(SharedLevel::take).collect()
    }

    pub fn channels(&self) -> usize {
        self.peaks.len()
    }
}

pub(crate) struct StreamShared {
    pub position: PositionCell,
    /// Callback stops capturing and outputs silence.
    pub stopping: SyncFlag,
    /// Worker discards unflushed capture instead of writing it.
    pub abandoned: SyncFlag,
    /// Worker has rendered the last span of straight play.
    pub fill_complete: SyncFlag,
    /// Callback has played everything the worker rendered.
    pub playback_drained: SyncFlag,
    /// Callback has recorded up to the end bound.
    pub capture_complete: SyncFlag,
    /// Callback drops playback frames until this many have been consumed.
    pub flush_until: AtomicU64,
    pub observed_input_latency: SecondsCell,
    pub output_volume: SharedLevel,
    pub input_meter: LevelMeter,
    pub output_meter: LevelMeter,
    pub callbacks: AtomicU64,
    pub paused_frames: AtomicU64,
    pub worker_failed: SyncFlag,
    /// The device was closed after a worker failure.
    pub torn_down: SyncFlag,
    worker_phase: AtomicU8,
    fatal: Mutex<Option<Error>>,
    failed_tx: Sender<()>,
    failed_rx: Receiver<()>,
}

impl StreamShared {
    pub fn new(start_time: f64, input_channels: usize, output_channels: usize) -> Self {
        let (failed_tx, failed_rx) = bounded(1);
        Self {
            position: PositionCell::new(duplex_core::StreamPosition {
                device_time: 0.0,
                track_time: start_time,
                pass: 0,
            }),
            stopping: SyncFlag::new(false),
            abandoned: SyncFlag::new(false),
            fill_complete: SyncFlag::new(false),
            playback_drained: SyncFlag::new(false),
            capture_complete: SyncFlag::new(false),
            flush_until: AtomicU64::new(0),
            observed_input_latency: SecondsCell::empty(),
            output_volume: SharedLevel::new(1.0),
            input_meter: LevelMeter::new(input_channels),
            output_meter: LevelMeter::new(output_channels),
            callbacks: AtomicU64::new(0),
            paused_frames: AtomicU64::new(0),
            worker_failed: SyncFlag::new(false),
            torn_down: SyncFlag::new(false),
            worker_phase: AtomicU8::new(WorkerPhase::Priming as u8),
            fatal: Mutex::new(None),
            failed_tx,
            failed_rx,
        }
    }

    pub fn set_phase(&self, phase: WorkerPhase) {
        self.worker_phase.store(phase as u8, Ordering::Release);
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.worker_phase.load(Ordering::Acquire))
    }

    /// Keep the first fatal error; later ones are consequences of it.
    /// The first failure also stops the callback and posts one notice on
    /// [`StreamShared::failures`].
    pub fn fail(&self, error: Error) {
        let first = {
            let mut slot = self.fatal.lock();
            let first = slot.is_none() && !self.worker_failed.get();
            if slot.is_none() {
                *slot = Some(error);
            }
            first
        };
        self.worker_failed.set(true);
        self.set_phase(WorkerPhase::Failed);
        if first {
            self.stopping.set(true);
            let _ = self.failed_tx.try_send(());
        }
    }

    /// Receives one message after the worker fails.
    pub fn failures(&self) -> Receiver<()> {
        self.failed_rx.clone()
    }

    pub fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().take()
    }
}
