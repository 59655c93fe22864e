//! Centralized error type for the duplex umbrella crate.
//!
//! Wraps all subsystem errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] duplex_core::Error),

    #[error(transparent)]
    Stream(#[from] duplex_stream::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The stream could not start because another one is running.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Stream(duplex_stream::Error::Busy))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
