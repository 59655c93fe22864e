//! Deterministic driver for tests and offline runs.
//!
//! [`SimulatedDriver`] goes to the engine; the paired [`SimulatedDevice`]
//! stays with the caller, who advances the stream one block at a time with
//! [`SimulatedDevice::run_cycle`].

use crate::driver::{
    AudioDriver, CallbackIo, CallbackStatus, DeviceInfo, DeviceProcess, DeviceRequest,
    StreamDirection,
};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::f32::consts::TAU;
use std::sync::Arc;

/// Device description.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub name: String,
    pub rates: Vec<u32>,
    pub input_channels: usize,
    pub output_channels: usize,
    pub block_frames: usize,
    pub input_latency: f64,
    pub output_latency: f64,
    /// Keep every output block for inspection.
    pub record_output: bool,
    /// Make `open` fail, for error-path tests.
    pub fail_open: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            name: "Simulated".into(),
            rates: vec![44100, 48000],
            input_channels: 2,
            output_channels: 2,
            block_frames: 512,
            input_latency: 0.0,
            output_latency: 0.0,
            record_output: true,
            fail_open: false,
        }
    }
}

/// Signal fed to the input side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputSignal {
    Silence,
    Constant(f32),
    /// Sample `n` (counted across all channels) is `n * step`, wrapping at 1.0.
    Ramp(f32),
    Sine { frequency: f32, amplitude: f32 },
}

struct Stream {
    process: Box<dyn DeviceProcess>,
    info: DeviceInfo,
    block_frames: usize,
    running: bool,
}

struct Inner {
    config: SimulatedConfig,
    stream: Option<Stream>,
    signal: InputSignal,
    pending_status: CallbackStatus,
    frames_processed: u64,
    input_samples: u64,
    recorded: Vec<f32>,
    input: Vec<f32>,
    output: Vec<f32>,
}

/// Engine-side half.
pub struct SimulatedDriver {
    inner: Arc<Mutex<Inner>>,
}

/// Test-side half.
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedDriver {
    pub fn new(config: SimulatedConfig) -> (SimulatedDriver, SimulatedDevice) {
        let inner = Arc::new(Mutex::new(Inner {
            config,
            stream: None,
            signal: InputSignal::Silence,
            pending_status: CallbackStatus::default(),
            frames_processed: 0,
            input_samples: 0,
            recorded: Vec::new(),
            input: Vec::new(),
            output: Vec::new(),
        }));
        (
            SimulatedDriver {
                inner: Arc::clone(&inner),
            },
            SimulatedDevice { inner },
        )
    }
}

impl AudioDriver for SimulatedDriver {
    fn name(&self) -> String {
        self.inner.lock().config.name.clone()
    }

    fn supported_rates(&self, _direction: StreamDirection) -> Result<Vec<u32>> {
        Ok(self.inner.lock().config.rates.clone())
    }

    fn max_channels(&self, direction: StreamDirection) -> Result<usize> {
        let inner = self.inner.lock();
        Ok(match direction {
            StreamDirection::Input => inner.config.input_channels,
            StreamDirection::Output => inner.config.output_channels,
        })
    }

    fn open(
        &mut self,
        request: &DeviceRequest,
        process: Box<dyn DeviceProcess>,
    ) -> Result<DeviceInfo> {
        let mut inner = self.inner.lock();
        let config = &inner.config;
        if config.fail_open {
            return Err(Error::Device(format!("{} refused to open", config.name)));
        }
        if inner.stream.is_some() {
            return Err(Error::Device("stream already open".into()));
        }
        if !config
            .rates
            .iter()
            .any(|&r| r as f64 == request.sample_rate)
        {
            return Err(Error::Device(format!(
                "{} Hz not supported",
                request.sample_rate
            )));
        }
        if request.input_channels > config.input_channels
            || request.output_channels > config.output_channels
        {
            return Err(Error::Device("too many channels".into()));
        }

        let info = DeviceInfo {
            name: config.name.clone(),
            sample_rate: request.sample_rate,
            input_channels: request.input_channels,
            output_channels: request.output_channels,
            input_latency: config.input_latency,
            output_latency: config.output_latency,
        };
        let block_frames = request
            .block_frames
            .map_or(config.block_frames, |b| b as usize)
            .max(1);
        inner.stream = Some(Stream {
            process,
            info: info.clone(),
            block_frames,
            running: false,
        });
        Ok(info)
    }

    fn start(&mut self) -> Result<()> {
        match self.inner.lock().stream.as_mut() {
            Some(stream) => {
                stream.running = true;
                Ok(())
            }
            None => Err(Error::Device("no stream open".into())),
        }
    }

    fn close(&mut self) {
        self.inner.lock().stream = None;
    }
}

impl SimulatedDevice {
    /// Deliver one block. Returns false when no stream is running.
    pub fn run_cycle(&self) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(stream) = inner.stream.as_mut() else {
            return false;
        };
        if !stream.running {
            return false;
        }

        let frames = stream.block_frames;
        let in_ch = stream.info.input_channels;
        let out_ch = stream.info.output_channels;

        inner.input.resize(frames * in_ch, 0.0);
        inner.output.clear();
        inner.output.resize(frames * out_ch, 0.0);
        fill_signal(
            inner.signal,
            &mut inner.input,
            in_ch,
            stream.info.sample_rate,
            &mut inner.input_samples,
        );

        let mut io = CallbackIo {
            input: (in_ch > 0).then_some(inner.input.as_slice()),
            output: (out_ch > 0).then_some(inner.output.as_mut_slice()),
            input_channels: in_ch,
            output_channels: out_ch,
            frames,
            status: std::mem::take(&mut inner.pending_status),
            input_latency: Some(stream.info.input_latency),
            output_latency: Some(stream.info.output_latency),
        };
        stream.process.process(&mut io);

        inner.frames_processed += frames as u64;
        if inner.config.record_output {
            inner.recorded.extend_from_slice(&inner.output);
        }
        true
    }

    /// Run up to `cycles` blocks; returns how many ran.
    pub fn run_cycles(&self, cycles: usize) -> usize {
        (0..cycles).take_while(|_| self.run_cycle()).count()
    }

    pub fn recorded_output(&self) -> Vec<f32> {
        self.inner.lock().recorded.clone()
    }

    pub fn clear_recorded(&self) {
        self.inner.lock().recorded.clear();
    }

    pub fn set_input(&self, signal: InputSignal) {
        let mut inner = self.inner.lock();
        inner.signal = signal;
        inner.input_samples = 0;
    }

    /// Report `status` with the next block.
    pub fn inject_status(&self, status: CallbackStatus) {
        self.inner.lock().pending_status = status;
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lock()
            .stream
            .as_ref()
            .is_some_and(|s| s.running)
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().stream.is_some()
    }

    pub fn frames_processed(&self) -> u64 {
        self.inner.lock().frames_processed
    }

    /// Block size of the open stream.
    pub fn block_frames(&self) -> Option<usize> {
        self.inner.lock().stream.as_ref().map(|s| s.block_frames)
    }

    pub fn info(&self) -> Option<DeviceInfo> {
        self.inner.lock().stream.as_ref().map(|s| s.info.clone())
    }
}

fn fill_signal(signal: InputSignal, buf: &mut [f32], channels: usize, rate: f64, n: &mut u64) {
    match signal {
        InputSignal::Silence => buf.fill(0.0),
        InputSignal::Constant(v) => buf.fill(v),
        InputSignal::Ramp(step) => {
            for s in buf.iter_mut() {
                *s = (*n as f32 * step).fract();
                *n += 1;
            }
        }
        InputSignal::Sine {
            frequency,
            amplitude,
        } => {
            if channels == 0 {
                return;
            }
            for frame in buf.chunks_exact_mut(channels) {
                let t = (*n as f64 / rate) as f32;
                frame.fill(amplitude * (TAU * frequency * t).sin());
                *n += 1;
            }
        }
    }
}
