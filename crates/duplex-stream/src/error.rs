//! Error types.

use thiserror::Error;

/// Error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration or primitive misuse.
    #[error(transparent)]
    Core(#[from] duplex_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Track storage failed to read or append.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stream is already starting, running, or stopping.
    #[error("Audio I/O is busy")]
    Busy,

    /// The operation needs an active stream.
    #[error("No active stream")]
    NotActive,

    /// The device cannot run at any usable sample rate.
    #[error("No supported sample rate for {0}")]
    NoSupportedRate(String),

    /// Device refused the request or failed while running.
    #[error("Audio device error: {0}")]
    Device(String),

    /// Device not found.
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// I/O worker thread failed.
    #[error("I/O worker error: {0}")]
    Worker(String),

    /// Resampler could not be built.
    #[error("Failed to build resampler: {0}")]
    ResamplerConstruction(#[from] rubato::ResamplerConstructionError),

    /// Resampler failed while processing.
    #[error("Resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),

    /// Hound error.
    #[error("Hound error: {0}")]
    Hound(#[from] hound::Error),

    /// Failed to enumerate devices.
    #[cfg(feature = "device-io")]
    #[error("Failed to enumerate audio devices")]
    Devices(#[from] cpal::DevicesError),

    /// Failed to query device configurations.
    #[cfg(feature = "device-io")]
    #[error("Failed to query audio device configs")]
    SupportedConfigs(#[from] cpal::SupportedStreamConfigsError),

    /// Failed to get device config.
    #[cfg(feature = "device-io")]
    #[error("Failed to get audio device config")]
    DeviceConfig(#[from] cpal::DefaultStreamConfigError),

    /// Failed to build stream.
    #[cfg(feature = "device-io")]
    #[error("Failed to build audio stream")]
    BuildStream(#[from] cpal::BuildStreamError),

    /// Failed to play stream.
    #[cfg(feature = "device-io")]
    #[error("Failed to play audio stream")]
    PlayStream(#[from] cpal::PlayStreamError),
}

/// Result type.
pub type Result<T> = std::result::Result<T, Error>;
