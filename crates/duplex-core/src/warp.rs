//! Time warp: a speed envelope over track time.
//!
//! Speed is piecewise linear between [`WarpPoint`]s and held constant outside
//! them. A speed of 2.0 plays two seconds of track per real second. Real
//! durations are the integral of `1 / speed`, which has a closed form on each
//! linear piece, so both directions of the mapping are exact.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Slowest speed a warp map may hold.
pub const MIN_WARP_SPEED: f64 = 0.01;

const FLAT_SLOPE: f64 = 1e-12;

/// A speed breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarpPoint {
    pub time: f64,
    pub speed: f64,
}

impl WarpPoint {
    pub fn new(time: f64, speed: f64) -> Self {
        Self { time, speed }
    }
}

/// Track-time speed map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWarp {
    points: Vec<WarpPoint>,
}

impl TimeWarp {
    /// Build from breakpoints. Points are sorted by time; speeds must be finite
    /// and at least [`MIN_WARP_SPEED`].
    pub fn new(mut points: Vec<WarpPoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(Error::InvalidWarp("no breakpoints".into()));
        }
        for p in &points {
            if !p.time.is_finite() {
                return Err(Error::InvalidWarp(format!("non-finite time {}", p.time)));
            }
            if !(p.speed.is_finite() && p.speed >= MIN_WARP_SPEED) {
                return Err(Error::InvalidWarp(format!(
                    "speed {} at {} s is below {MIN_WARP_SPEED}",
                    p.speed, p.time
                )));
            }
        }
        points.sort_by(|a, b| a.time.total_cmp(&b.time));
        points.dedup_by(|b, a| a.time == b.time);
        Ok(Self { points })
    }

    /// Uniform speed everywhere.
    pub fn constant(speed: f64) -> Result<Self> {
        Self::new(vec![WarpPoint::new(0.0, speed)])
    }

    pub fn points(&self) -> &[WarpPoint] {
        &self.points
    }

    /// Speed at track time `t`.
    pub fn speed_at(&self, t: f64) -> f64 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if t <= first.time {
            return first.speed;
        }
        if t >= last.time {
            return last.speed;
        }
        let idx = self.points.partition_point(|p| p.time <= t);
        let a = self.points[idx - 1];
        let b = self.points[idx];
        a.speed + (b.speed - a.speed) * (t - a.time) / (b.time - a.time)
    }

    /// Slope of the speed envelope on the piece containing `t` (zero outside
    /// the breakpoints).
    fn slope_after(&self, t: f64) -> f64 {
        let idx = self.points.partition_point(|p| p.time <= t);
        if idx == 0 || idx >= self.points.len() {
            return 0.0;
        }
        let a = self.points[idx - 1];
        let b = self.points[idx];
        (b.speed - a.speed) / (b.time - a.time)
    }

    /// Next breakpoint strictly after `t`, if any.
    fn next_break(&self, t: f64) -> Option<f64> {
        let idx = self.points.partition_point(|p| p.time <= t);
        self.points.get(idx).map(|p| p.time)
    }

    /// Real seconds needed to play track time `t0..t1`. Negative when `t1 < t0`.
    pub fn real_duration(&self, t0: f64, t1: f64) -> f64 {
        if t1 < t0 {
            return -self.real_duration(t1, t0);
        }
        let mut total = 0.0;
        let mut x0 = t0;
        while x0 < t1 {
            let x1 = self.next_break(x0).map_or(t1, |b| b.min(t1));
            total += piece_real(self.speed_at(x0), self.slope_after(x0), x1 - x0);
            x0 = x1;
        }
        total
    }

    /// Track time reached after playing `real` seconds forward from `t0`.
    pub fn track_time_after(&self, t0: f64, real: f64) -> f64 {
        if real <= 0.0 {
            return t0;
        }
        let mut remaining = real;
        let mut x0 = t0;
        loop {
            let s0 = self.speed_at(x0);
            let k = self.slope_after(x0);
            match self.next_break(x0) {
                Some(x1) => {
                    let span = piece_real(s0, k, x1 - x0);
                    if remaining <= span {
                        return x0 + piece_track(s0, k, remaining);
                    }
                    remaining -= span;
                    x0 = x1;
                }
                None => return x0 + piece_track(s0, k, remaining),
            }
        }
    }
}

/// Real time to cover `len` track seconds starting at speed `s0` with slope `k`.
fn piece_real(s0: f64, k: f64, len: f64) -> f64 {
    if k.abs() < FLAT_SLOPE {
        len / s0
    } else {
        ((s0 + k * len) / s0).ln() / k
    }
}

/// Track seconds covered in `real` seconds starting at speed `s0` with slope `k`.
fn piece_track(s0: f64, k: f64, real: f64) -> f64 {
    if k.abs() < FLAT_SLOPE {
        real * s0
    } else {
        s0 * ((k * real).exp() - 1.0) / k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rejects_bad_points() {
        assert!(TimeWarp::new(vec![]).is_err());
        assert!(TimeWarp::constant(0.0).is_err());
        assert!(TimeWarp::new(vec![WarpPoint::new(f64::NAN, 1.0)]).is_err());
    }

    #[test]
    fn test_constant_speed() {
        let warp = TimeWarp::constant(2.0).unwrap();
        assert_relative_eq!(warp.real_duration(0.0, 10.0), 5.0);
        assert_relative_eq!(warp.track_time_after(0.0, 5.0), 10.0);
        assert_relative_eq!(warp.real_duration(4.0, 2.0), -1.0);
    }

    #[test]
    fn test_linear_ramp_integral() {
        // speed 1 -> 2 over 10 s of track: real = ln(2) / 0.1
        let warp =
            TimeWarp::new(vec![WarpPoint::new(0.0, 1.0), WarpPoint::new(10.0, 2.0)]).unwrap();
        let expected = 2f64.ln() / 0.1;
        assert_relative_eq!(warp.real_duration(0.0, 10.0), expected, epsilon = 1e-9);
        assert_relative_eq!(warp.track_time_after(0.0, expected), 10.0, epsilon = 1e-9);
        assert_relative_eq!(warp.speed_at(5.0), 1.5);
    }

    #[test]
    fn test_inverse_across_breakpoints() {
        let warp = TimeWarp::new(vec![
            WarpPoint::new(1.0, 0.5),
            WarpPoint::new(3.0, 1.5),
            WarpPoint::new(6.0, 1.5),
            WarpPoint::new(8.0, 0.75),
        ])
        .unwrap();
        for &(t0, t1) in &[(0.0, 9.0), (2.0, 7.0), (3.5, 4.0), (0.5, 1.0)] {
            let real = warp.real_duration(t0, t1);
            assert!(real > 0.0);
            assert_relative_eq!(warp.track_time_after(t0, real), t1, epsilon = 1e-9);
        }
    }
}
