//! Error types for duplex-core.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Stream bounds are not finite or out of order.
    #[error("Invalid stream bounds: start {start}, end {end}")]
    InvalidBounds { start: f64, end: f64 },

    /// Sample rate conversion ratio is unusable.
    #[error("Invalid rate ratio: {input_rate} Hz -> {output_rate} Hz")]
    InvalidRatio { input_rate: f64, output_rate: f64 },

    /// Time warp map is malformed.
    #[error("Invalid time warp: {0}")]
    InvalidWarp(String),

    /// Ring buffer could not be created with the requested geometry.
    #[error("Invalid ring buffer: {0}")]
    InvalidRing(String),
}

/// Result type for duplex-core.
pub type Result<T> = core::result::Result<T, Error>;
