//! # Duplex - Real-time Capture/Playback Streaming
//!
//! Streams samples between a sound device and track storage while a session
//! plays, records or monitors.
//!
//! ## Architecture
//!
//! Duplex is an umbrella crate that coordinates:
//! - **duplex-core** - Real-time primitives (rings, stream clock, time warp, scrub queue, dropout log)
//! - **duplex-stream** - The engine (device callback, I/O worker, rate conversion, controller)
//!
//! ## Quick Start
//!
//! ```ignore
//! use duplex::prelude::*;
//!
//! let (driver, device) = SimulatedDriver::new(SimulatedConfig::default());
//! let mut controller = StreamController::builder()
//!     .driver(driver)
//!     .buffer_config(BufferConfig::with_buffer_seconds(2.0))
//!     .build()?;
//!
//! let backing = share(MemoryTrack::load_wav("backing.wav")?);
//! let take = share(MemoryTrack::new(48000.0, 1));
//! let token = controller.start_stream(
//!     vec![PlaybackTrack::new(backing)],
//!     vec![CaptureTrack::new(take.clone())],
//!     0.0,
//!     5.0,
//!     StreamOptions::default(),
//! )?;
//!
//! // ... device runs ...
//! controller.stop_stream()?;
//! let lost = controller.lost_capture_intervals();
//! ```
//!
//! ## Feature Flags
//!
//! - `device-io` - Hardware I/O through CPAL

/// Re-export of duplex-core for direct access
pub use duplex_core as core;

/// Re-export of duplex-stream for direct access
pub use duplex_stream as stream;

// Core types
pub use duplex_core::{
    BufferConfig, CutGap, DropoutKinds, LatencyCalibration, LatencyCorrection, LostInterval,
    PlayMode, ScrubOptions, ScrubTarget, StreamPosition, TimeWarp, WarpPoint,
};

// Engine
pub use duplex_stream::{
    share, ActiveKind, AudioDriver, CaptureTrack, ClockScheduler, ClockSink, ClockSource,
    ConverterQuality, DeviceInfo, InputSignal, IoMetricsSnapshot, MemoryTrack, PauseSource,
    PlaybackTrack, RingStatus, ScheduledEvent, SchedulerConfig, SharedTrack, SimulatedConfig,
    SimulatedDevice, SimulatedDriver, StreamController, StreamControllerBuilder, StreamDirection,
    StreamListener, StreamOptions, StreamState, StreamToken, TrackControls, TrackStorage,
};

#[cfg(feature = "device-io")]
pub use duplex_stream::{CpalDriver, CpalDriverConfig};

mod error;
pub use error::{Error, Result};

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::{Error, Result};

    pub use crate::{
        share, BufferConfig, CaptureTrack, LostInterval, MemoryTrack, PlayMode, PlaybackTrack,
        ScrubOptions, ScrubTarget, SimulatedConfig, SimulatedDriver, StreamController,
        StreamOptions, StreamToken, TimeWarp, TrackStorage,
    };

    #[cfg(feature = "device-io")]
    pub use crate::{CpalDriver, CpalDriverConfig};
}
