//! Cached device capability lookups.
//!
//! Probing rates can be slow on real hardware, so answers are kept per
//! device and direction until [`DeviceCapabilities::invalidate`] is called,
//! typically after the host reports a device change.

use crate::driver::{AudioDriver, StreamDirection};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Rates probed on drivers that only report ranges.
pub const STANDARD_RATES: [u32; 17] = [
    8000, 9600, 11025, 12000, 15000, 16000, 22050, 24000, 32000, 44100, 48000, 88200, 96000,
    176400, 192000, 352800, 384000,
];

/// Preferred fallbacks when the requested rate is unavailable, in order.
const PREFERRED_RATES: [u32; 2] = [44100, 48000];

#[derive(Debug, Default)]
pub struct DeviceCapabilities {
    rates: HashMap<(String, StreamDirection), Vec<u32>>,
}

impl DeviceCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supported rates of `driver` in `direction`, sorted ascending.
    pub fn supported_rates(
        &mut self,
        driver: &dyn AudioDriver,
        direction: StreamDirection,
    ) -> Result<Vec<u32>> {
        let key = (driver.name(), direction);
        if let Some(rates) = self.rates.get(&key) {
            return Ok(rates.clone());
        }
        let mut rates = driver.supported_rates(direction)?;
        rates.sort_unstable();
        rates.dedup();
        tracing::debug!(
            "{} {:?} rates: {:?}",
            key.0,
            direction,
            rates
        );
        self.rates.insert(key, rates.clone());
        Ok(rates)
    }

    /// Rates usable for a stream that captures and/or plays.
    pub fn duplex_rates(
        &mut self,
        driver: &dyn AudioDriver,
        capture: bool,
        playback: bool,
    ) -> Result<Vec<u32>> {
        match (capture, playback) {
            (true, true) => {
                let input = self.supported_rates(driver, StreamDirection::Input)?;
                let output = self.supported_rates(driver, StreamDirection::Output)?;
                Ok(input.into_iter().filter(|r| output.contains(r)).collect())
            }
            (true, false) => self.supported_rates(driver, StreamDirection::Input),
            _ => self.supported_rates(driver, StreamDirection::Output),
        }
    }

    /// The requested rate if the device supports it, else 44.1 kHz, else
    /// 48 kHz, else the highest supported rate.
    pub fn best_rate(
        &mut self,
        driver: &dyn AudioDriver,
        capture: bool,
        playback: bool,
        requested: Option<f64>,
    ) -> Result<f64> {
        let rates = self.duplex_rates(driver, capture, playback)?;
        if let Some(requested) = requested {
            if rates.iter().any(|&r| r as f64 == requested) {
                return Ok(requested);
            }
        }
        PREFERRED_RATES
            .iter()
            .find(|r| rates.contains(r))
            .or_else(|| rates.last())
            .map(|&r| r as f64)
            .ok_or_else(|| Error::NoSupportedRate(driver.name()))
    }

    /// Forget everything, e.g. after devices were added or removed.
    pub fn invalidate(&mut self) {
        self.rates.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}
