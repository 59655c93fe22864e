//! # duplex-stream
//!
//! Simultaneous capture and playback against a device callback. Three
//! contexts cooperate: the controller (start, stop, pause, seek), one I/O
//! worker thread per stream (track storage, rate conversion, ring refill and
//! drain) and the device callback (ring copies, mixing, metering, dropout
//! detection). The callback never locks, allocates or touches storage.
//!
//! - [`StreamController`] - owns the driver and the stream lifecycle
//! - [`AudioDriver`] / [`DeviceProcess`] - device seam
//! - [`SimulatedDriver`] - hand-driven device for tests and offline runs
//! - [`TrackStorage`] / [`MemoryTrack`] - track sample storage
//! - [`ClockScheduler`] - timed events following the audio clock
//!
//! Hardware I/O through CPAL is behind the `device-io` feature.

mod callback;
pub mod capabilities;
pub mod controller;
#[cfg(feature = "device-io")]
pub mod cpal_driver;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod mixer;
pub mod options;
pub mod resample;
pub mod scheduler;
pub mod shared;
pub mod simulated;
pub mod storage;
mod supervisor;
mod worker;

pub use capabilities::{DeviceCapabilities, STANDARD_RATES};
pub use controller::{
    ActiveKind, RingStatus, StreamController, StreamControllerBuilder, StreamState,
};
#[cfg(feature = "device-io")]
pub use cpal_driver::{CpalDriver, CpalDriverConfig};
pub use driver::{
    AudioDriver, CallbackIo, CallbackStatus, DeviceInfo, DeviceProcess, DeviceRequest,
    StreamDirection,
};
pub use error::{Error, Result};
pub use metrics::{IoMetrics, IoMetricsSnapshot};
pub use mixer::{CaptureTrack, MixBus, PlaybackTrack, TrackControls};
pub use options::{StreamListener, StreamOptions, StreamToken};
pub use resample::{ConverterQuality, RateConverter};
pub use scheduler::{ClockScheduler, ClockSink, ClockSource, ScheduledEvent, SchedulerConfig};
pub use shared::{LevelMeter, PauseControl, PauseSource, WorkerPhase};
pub use simulated::{InputSignal, SimulatedConfig, SimulatedDevice, SimulatedDriver};
pub use storage::{share, MemoryTrack, SharedTrack, TrackStorage};
pub use worker::DrainOutcome;
