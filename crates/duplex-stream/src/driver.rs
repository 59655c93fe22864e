//! Audio device abstraction.
//!
//! The engine never talks to a platform API directly. An [`AudioDriver`]
//! opens a full-duplex stream and calls a [`DeviceProcess`] once per device
//! block. [`crate::SimulatedDriver`] drives the callback by hand for tests;
//! the cpal driver (feature `device-io`) drives it from real hardware.

use crate::error::Result;

/// Status flags the device reports with a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackStatus {
    /// The device dropped input before this block.
    pub input_overflow: bool,
    /// The device ran out of output before this block.
    pub output_underflow: bool,
}

impl CallbackStatus {
    #[inline]
    pub fn is_clean(&self) -> bool {
        !self.input_overflow && !self.output_underflow
    }
}

/// One device block. Buffers are interleaved.
pub struct CallbackIo<'a> {
    pub input: Option<&'a [f32]>,
    pub output: Option<&'a mut [f32]>,
    pub input_channels: usize,
    pub output_channels: usize,
    pub frames: usize,
    pub status: CallbackStatus,
    /// Seconds between the sound reaching the device and `input` being delivered.
    pub input_latency: Option<f64>,
    /// Seconds between `output` being returned and it being heard.
    pub output_latency: Option<f64>,
}

/// Real-time block processor. Called from the device thread; must not block.
pub trait DeviceProcess: Send + 'static {
    fn process(&mut self, io: &mut CallbackIo<'_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Input,
    Output,
}

/// What the engine asks of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub sample_rate: f64,
    pub input_channels: usize,
    pub output_channels: usize,
    /// Preferred block size; `None` lets the device choose.
    pub block_frames: Option<u32>,
}

/// What the device agreed to.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub sample_rate: f64,
    pub input_channels: usize,
    pub output_channels: usize,
    /// Reported input latency in seconds.
    pub input_latency: f64,
    /// Reported output latency in seconds.
    pub output_latency: f64,
}

/// A full-duplex device.
///
/// `open` hands over the processor; `start` begins calling it; `close` stops
/// calling it and drops it. A driver holds at most one open stream.
pub trait AudioDriver: Send {
    /// Stable name, used to key the capability cache.
    fn name(&self) -> String;

    /// Rates the device accepts in `direction`.
    fn supported_rates(&self, direction: StreamDirection) -> Result<Vec<u32>>;

    fn max_channels(&self, direction: StreamDirection) -> Result<usize>;

    fn open(&mut self, request: &DeviceRequest, process: Box<dyn DeviceProcess>)
        -> Result<DeviceInfo>;

    fn start(&mut self) -> Result<()>;

    /// Stop and release the stream. Safe to call when nothing is open.
    fn close(&mut self);
}
