//! Hardware driver on top of CPAL.
//!
//! CPAL opens input and output as separate streams. When both are needed the
//! output callback drives the engine and the input callback feeds it through
//! a ring; a full ring is reported as an input overflow on the next block.

use crate::capabilities::STANDARD_RATES;
use crate::driver::{
    AudioDriver, CallbackIo, CallbackStatus, DeviceInfo, DeviceProcess, DeviceRequest,
    StreamDirection,
};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, SupportedStreamConfigRange};
use duplex_core::{SecondsCell, SyncFlag};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;

/// Seconds of input buffered between the input and output callbacks.
const BRIDGE_SECONDS: f64 = 0.5;

/// Wrapper to hold a `cpal::Stream` in a `Send` context.
///
/// `cpal::Stream` is `!Send` on some platforms. The driver only touches it
/// from the controller, which owns the driver exclusively.
struct StreamHandle(cpal::Stream);

// SAFETY: the stream is created, played and dropped by whoever owns the
// driver, never from two threads at once.
unsafe impl Send for StreamHandle {}

struct OpenStreams {
    input: Option<StreamHandle>,
    output: Option<StreamHandle>,
}

/// Devices are picked by name; `None` means the host default.
#[derive(Debug, Clone, Default)]
pub struct CpalDriverConfig {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

pub struct CpalDriver {
    config: CpalDriverConfig,
    streams: Option<OpenStreams>,
}

impl CpalDriver {
    pub fn new(config: CpalDriverConfig) -> Self {
        Self {
            config,
            streams: None,
        }
    }

    /// Names of the available devices in `direction`.
    pub fn list_devices(direction: StreamDirection) -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<cpal::Device> = match direction {
            StreamDirection::Input => host.input_devices()?.collect(),
            StreamDirection::Output => host.output_devices()?.collect(),
        };
        Ok(devices.iter().filter_map(|d| d.name().ok()).collect())
    }

    fn device(&self, direction: StreamDirection) -> Result<cpal::Device> {
        let host = cpal::default_host();
        let wanted = match direction {
            StreamDirection::Input => self.config.input_device.as_deref(),
            StreamDirection::Output => self.config.output_device.as_deref(),
        };
        match (wanted, direction) {
            (Some(name), StreamDirection::Input) => host
                .input_devices()?
                .find(|d| d.name().is_ok_and(|n| n == name))
                .ok_or_else(|| Error::DeviceNotFound(name.to_string())),
            (Some(name), StreamDirection::Output) => host
                .output_devices()?
                .find(|d| d.name().is_ok_and(|n| n == name))
                .ok_or_else(|| Error::DeviceNotFound(name.to_string())),
            (None, StreamDirection::Input) => host
                .default_input_device()
                .ok_or_else(|| Error::DeviceNotFound("default input".into())),
            (None, StreamDirection::Output) => host
                .default_output_device()
                .ok_or_else(|| Error::DeviceNotFound("default output".into())),
        }
    }

    fn config_ranges(
        device: &cpal::Device,
        direction: StreamDirection,
    ) -> Result<Vec<SupportedStreamConfigRange>> {
        Ok(match direction {
            StreamDirection::Input => device.supported_input_configs()?.collect(),
            StreamDirection::Output => device.supported_output_configs()?.collect(),
        })
    }

    /// The narrowest range with enough channels that covers `rate`.
    fn pick_config(
        device: &cpal::Device,
        direction: StreamDirection,
        channels: usize,
        rate: u32,
    ) -> Result<SupportedStreamConfigRange> {
        Self::config_ranges(device, direction)?
            .into_iter()
            .filter(|r| {
                r.channels() as usize >= channels
                    && r.min_sample_rate().0 <= rate
                    && rate <= r.max_sample_rate().0
            })
            .min_by_key(|r| (r.channels(), r.sample_format() != cpal::SampleFormat::F32))
            .ok_or_else(|| {
                Error::Device(format!(
                    "no {direction:?} config with {channels} channels at {rate} Hz"
                ))
            })
    }

    fn stream_config(
        range: &SupportedStreamConfigRange,
        rate: u32,
        block: Option<u32>,
    ) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: range.channels(),
            sample_rate: cpal::SampleRate(rate),
            buffer_size: block.map_or(cpal::BufferSize::Default, cpal::BufferSize::Fixed),
        }
    }
}

impl Default for CpalDriver {
    fn default() -> Self {
        Self::new(CpalDriverConfig::default())
    }
}

/// Input samples handed from the input callback to the output callback.
struct InputBridge {
    consumer: HeapCons<f32>,
    overflow: Arc<SyncFlag>,
    latency: Arc<SecondsCell>,
}

/// State owned by whichever callback drives the engine.
struct Engine {
    process: Box<dyn DeviceProcess>,
    input: Vec<f32>,
    output: Vec<f32>,
}

impl Engine {
    fn new(process: Box<dyn DeviceProcess>) -> Self {
        Self {
            process,
            input: Vec::new(),
            output: Vec::new(),
        }
    }
}

fn grow(buf: &mut Vec<f32>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0.0);
    }
}

fn input_latency(info: &cpal::InputCallbackInfo) -> Option<f64> {
    let ts = info.timestamp();
    ts.callback.duration_since(&ts.capture).map(|d| d.as_secs_f64())
}

fn output_latency(info: &cpal::OutputCallbackInfo) -> Option<f64> {
    let ts = info.timestamp();
    ts.playback.duration_since(&ts.callback).map(|d| d.as_secs_f64())
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut engine: Engine,
    mut bridge: Option<(InputBridge, usize)>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let out_ch = config.channels as usize;
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], info: &cpal::OutputCallbackInfo| {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let frames = data.len() / out_ch.max(1);
                grow(&mut engine.output, data.len());
                let output = &mut engine.output[..data.len()];
                output.fill(0.0);

                let mut status = CallbackStatus::default();
                let (input, in_ch, in_latency) = match bridge.as_mut() {
                    Some((bridge, in_ch)) => {
                        let len = frames * *in_ch;
                        grow(&mut engine.input, len);
                        let input = &mut engine.input[..len];
                        let got = bridge.consumer.pop_slice(input);
                        input[got..].fill(0.0);
                        status.input_overflow = bridge.overflow.take();
                        (Some(&*input), *in_ch, bridge.latency.get())
                    }
                    None => (None, 0, None),
                };

                let mut io = CallbackIo {
                    input,
                    output: Some(output),
                    input_channels: in_ch,
                    output_channels: out_ch,
                    frames,
                    status,
                    input_latency: in_latency,
                    output_latency: output_latency(info),
                };
                engine.process.process(&mut io);

                for (dst, src) in data.iter_mut().zip(engine.output.iter()) {
                    *dst = T::from_sample(*src);
                }
            }));

            if result.is_err() {
                for sample in data.iter_mut() {
                    *sample = T::from_sample(0.0);
                }
            }
        },
        |err| tracing::warn!("Output stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

/// Input stream that drives the engine itself (capture without output).
fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut engine: Engine,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let in_ch = config.channels as usize;
    let stream = device.build_input_stream(
        config,
        move |data: &[T], info: &cpal::InputCallbackInfo| {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                grow(&mut engine.input, data.len());
                let input = &mut engine.input[..data.len()];
                for (dst, src) in input.iter_mut().zip(data) {
                    *dst = f32::from_sample(*src);
                }
                let mut io = CallbackIo {
                    input: Some(&*input),
                    output: None,
                    input_channels: in_ch,
                    output_channels: 0,
                    frames: data.len() / in_ch.max(1),
                    status: CallbackStatus::default(),
                    input_latency: input_latency(info),
                    output_latency: None,
                };
                engine.process.process(&mut io);
            }));
        },
        |err| tracing::warn!("Input stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

/// Input stream that only feeds the bridge to the output callback.
fn build_bridge<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProd<f32>,
    overflow: Arc<SyncFlag>,
    latency: Arc<SecondsCell>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], info: &cpal::InputCallbackInfo| {
            let pushed = producer.push_iter(data.iter().map(|s| f32::from_sample(*s)));
            if pushed < data.len() {
                overflow.set(true);
            }
            if let Some(l) = input_latency(info) {
                latency.set(l);
            }
        },
        |err| tracing::warn!("Input stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

macro_rules! dispatch_format {
    ($format:expr, $build:ident, $($arg:expr),*) => {
        match $format {
            cpal::SampleFormat::F32 => $build::<f32>($($arg),*),
            cpal::SampleFormat::I16 => $build::<i16>($($arg),*),
            cpal::SampleFormat::U16 => $build::<u16>($($arg),*),
            cpal::SampleFormat::I32 => $build::<i32>($($arg),*),
            format => Err(Error::Device(format!("unsupported sample format {:?}", format))),
        }
    };
}

impl AudioDriver for CpalDriver {
    fn name(&self) -> String {
        format!(
            "cpal:{}/{}",
            self.config.input_device.as_deref().unwrap_or("default"),
            self.config.output_device.as_deref().unwrap_or("default")
        )
    }

    fn supported_rates(&self, direction: StreamDirection) -> Result<Vec<u32>> {
        let device = self.device(direction)?;
        let ranges = Self::config_ranges(&device, direction)?;
        Ok(STANDARD_RATES
            .iter()
            .copied()
            .filter(|&rate| {
                ranges
                    .iter()
                    .any(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
            })
            .collect())
    }

    fn max_channels(&self, direction: StreamDirection) -> Result<usize> {
        let device = match self.device(direction) {
            Ok(device) => device,
            Err(Error::DeviceNotFound(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        Ok(Self::config_ranges(&device, direction)?
            .iter()
            .map(|r| r.channels() as usize)
            .max()
            .unwrap_or(0))
    }

    fn open(
        &mut self,
        request: &DeviceRequest,
        process: Box<dyn DeviceProcess>,
    ) -> Result<DeviceInfo> {
        if self.streams.is_some() {
            return Err(Error::Device("stream already open".into()));
        }
        let rate = request.sample_rate.round() as u32;
        let engine = Engine::new(process);
        let mut info = DeviceInfo {
            name: String::new(),
            sample_rate: rate as f64,
            input_channels: 0,
            output_channels: 0,
            input_latency: 0.0,
            output_latency: 0.0,
        };
        let block_latency = request
            .block_frames
            .map_or(0.0, |b| b as f64 / rate as f64);

        let input = if request.input_channels > 0 {
            let device = self.device(StreamDirection::Input)?;
            let range =
                Self::pick_config(&device, StreamDirection::Input, request.input_channels, rate)?;
            let config = Self::stream_config(&range, rate, request.block_frames);
            info.input_channels = config.channels as usize;
            info.input_latency = block_latency;
            info.name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            Some((device, range.sample_format(), config))
        } else {
            None
        };

        let streams = if request.output_channels > 0 {
            let device = self.device(StreamDirection::Output)?;
            let range = Self::pick_config(
                &device,
                StreamDirection::Output,
                request.output_channels,
                rate,
            )?;
            let config = Self::stream_config(&range, rate, request.block_frames);
            info.output_channels = config.channels as usize;
            info.output_latency = block_latency;
            let out_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            info.name = if info.name.is_empty() {
                out_name
            } else {
                format!("{} / {}", info.name, out_name)
            };

            let (input_stream, bridge) = match input {
                Some((in_device, format, in_config)) => {
                    let in_ch = in_config.channels as usize;
                    let capacity = (BRIDGE_SECONDS * rate as f64) as usize * in_ch;
                    let (producer, consumer) = HeapRb::<f32>::new(capacity.max(in_ch)).split();
                    let overflow = Arc::new(SyncFlag::new(false));
                    let latency = Arc::new(SecondsCell::empty());
                    let stream = dispatch_format!(
                        format,
                        build_bridge,
                        &in_device,
                        &in_config,
                        producer,
                        Arc::clone(&overflow),
                        Arc::clone(&latency)
                    )?;
                    let bridge = InputBridge {
                        consumer,
                        overflow,
                        latency,
                    };
                    (Some(StreamHandle(stream)), Some((bridge, in_ch)))
                }
                None => (None, None),
            };
            let output_stream = dispatch_format!(
                range.sample_format(),
                build_output,
                &device,
                &config,
                engine,
                bridge
            )?;
            OpenStreams {
                input: input_stream,
                output: Some(StreamHandle(output_stream)),
            }
        } else {
            let Some((device, format, config)) = input else {
                return Err(Error::Device("nothing to open".into()));
            };
            let stream = dispatch_format!(format, build_input, &device, &config, engine)?;
            OpenStreams {
                input: Some(StreamHandle(stream)),
                output: None,
            }
        };

        tracing::info!(
            "Opened {} at {} Hz ({} in, {} out)",
            info.name,
            rate,
            info.input_channels,
            info.output_channels
        );
        self.streams = Some(streams);
        Ok(info)
    }

    fn start(&mut self) -> Result<()> {
        let streams = self
            .streams
            .as_ref()
            .ok_or_else(|| Error::Device("no stream open".into()))?;
        if let Some(input) = &streams.input {
            input.0.play()?;
        }
        if let Some(output) = &streams.output {
            output.0.play()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(streams) = self.streams.take() {
            if let Some(output) = &streams.output {
                let _ = output.0.pause();
            }
            if let Some(input) = &streams.input {
                let _ = input.0.pause();
            }
            tracing::debug!("Closed audio streams");
        }
    }
}
