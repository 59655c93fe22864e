//! # duplex-core
//!
//! Real-time building blocks for the duplex streaming engine. Nothing here
//! performs I/O or spawns threads; every type is safe to use from the device
//! callback unless its docs say otherwise.
//!
//! - [`SampleRingBuffer`] - SPSC interleaved sample ring with observer cursors
//! - [`StreamClock`] - maps device frames to track time (straight, looped, scrub)
//! - [`TimeWarp`] - speed envelope with exact warped-length integration
//! - [`ScrubQueue`] / [`ScrubFeed`] - bounded scrub interval queue
//! - [`DropoutDetector`] / [`DropoutLog`] - coalesced lost-interval records
//! - [`PositionCell`] - single-writer, many-reader published position
//! - [`BufferConfig`] - ring sizing and worker pacing

pub mod clock;
pub mod config;
pub mod dropout;
pub mod error;
pub mod lockfree;
pub mod ring;
pub mod scrub;
pub mod warp;

pub use clock::{CutGap, PlayMode, Span, StreamClock};
pub use config::{BufferConfig, LatencyCalibration, LatencyCorrection};
pub use dropout::{dropout_log, DropoutDetector, DropoutKinds, DropoutLog, LostInterval};
pub use error::{Error, Result};
pub use lockfree::{PositionCell, SecondsCell, SharedLevel, StreamPosition, SyncFlag};
pub use ring::{RingConsumer, RingObserver, RingProducer, SampleRingBuffer};
pub use scrub::{ScrubFeed, ScrubInterval, ScrubOptions, ScrubQueue, ScrubTarget};
pub use warp::{TimeWarp, WarpPoint, MIN_WARP_SPEED};
