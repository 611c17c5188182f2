//! Velocity-adaptive smoothing
//!
//! Derives the smoothing factor from instantaneous velocity magnitude:
//!
//! ```text
//! s = max_smoothing - (max_smoothing - min_smoothing) · min(1, |v| / velocity_threshold)
//! ```
//!
//! Slow motion gets heavy smoothing (jitter dominates), fast motion gets
//! nearly none (intent dominates). Position smoothing itself is delegated to
//! the EMA algorithm with α = 1 - s.

use crate::filter::ema::EmaFilter;
use crate::filter::{delta_seconds, SmoothedSample, SmoothingAlgorithm, SmoothingFilter, SmoothingSettings};
use std::time::Instant;
use tracing::trace;

pub struct AdaptiveFilter {
    min_smoothing: f64,
    max_smoothing: f64,
    velocity_threshold: f64,
    inner: EmaFilter,
    last_raw: Option<(f64, f64, u64)>,
    current_factor: f64,
}

impl AdaptiveFilter {
    pub fn new(settings: &SmoothingSettings) -> Self {
        Self {
            min_smoothing: settings.min_smoothing,
            max_smoothing: settings.max_smoothing,
            velocity_threshold: settings.velocity_threshold,
            inner: EmaFilter::new(settings),
            last_raw: None,
            current_factor: settings.max_smoothing,
        }
    }

    /// Smoothing factor derived for the given velocity magnitude
    pub fn factor_for_velocity(&self, velocity: f64) -> f64 {
        let normalized = (velocity.abs() / self.velocity_threshold).min(1.0);
        self.max_smoothing - (self.max_smoothing - self.min_smoothing) * normalized
    }

    /// Smoothing factor applied on the most recent call
    pub fn current_smoothing_factor(&self) -> f64 {
        self.current_factor
    }
}

impl SmoothingFilter for AdaptiveFilter {
    fn smooth(&mut self, x: f64, y: f64, timestamp_ns: u64) -> SmoothedSample {
        let start = Instant::now();

        let velocity = match self.last_raw {
            None => 0.0,
            Some((px, py, pts)) => {
                let dt = delta_seconds(pts, timestamp_ns);
                ((x - px).powi(2) + (y - py).powi(2)).sqrt() / dt
            }
        };
        self.last_raw = Some((x, y, timestamp_ns));

        self.current_factor = self.factor_for_velocity(velocity);
        trace!(velocity, factor = self.current_factor, "adaptive smoothing step");

        // High smoothing factor means low EMA responsiveness.
        self.inner.set_alpha(1.0 - self.current_factor);
        let mut sample = self.inner.smooth(x, y, timestamp_ns);
        sample.processing_time = start.elapsed();
        sample
    }

    fn reset(&mut self) {
        self.inner.reset();
        self.last_raw = None;
        self.current_factor = self.max_smoothing;
    }

    fn algorithm(&self) -> SmoothingAlgorithm {
        SmoothingAlgorithm::Adaptive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SmoothingSettings {
        SmoothingSettings {
            min_smoothing: 0.1,
            max_smoothing: 0.8,
            velocity_threshold: 500.0,
            ..SmoothingSettings::default()
        }
    }

    #[test]
    fn zero_velocity_uses_max_smoothing() {
        let mut filter = AdaptiveFilter::new(&settings());
        filter.smooth(5.0, 5.0, 1_000_000);
        // Identical position one tick later: velocity 0.
        filter.smooth(5.0, 5.0, 2_000_000);
        assert!((filter.current_smoothing_factor() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn threshold_velocity_uses_min_smoothing() {
        let mut filter = AdaptiveFilter::new(&settings());
        filter.smooth(0.0, 0.0, 0);
        // 1 unit in 1ms -> 1000 units/s, well over the 500 threshold.
        filter.smooth(1.0, 0.0, 1_000_000);
        assert!((filter.current_smoothing_factor() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn factor_interpolates_between_bounds() {
        let filter = AdaptiveFilter::new(&settings());
        // Half the threshold velocity sits halfway between the bounds.
        let factor = filter.factor_for_velocity(250.0);
        assert!((factor - 0.45).abs() < 1e-12);
        // Beyond the threshold the factor saturates.
        assert!((filter.factor_for_velocity(10_000.0) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn fast_motion_tracks_input_closely() {
        let mut filter = AdaptiveFilter::new(&settings());
        let mut out = filter.smooth(0.0, 0.0, 0);
        for i in 1..10u64 {
            // 2 units per ms -> 2000 units/s, min smoothing applies.
            out = filter.smooth(i as f64 * 2.0, 0.0, i * 1_000_000);
        }
        let input = 18.0;
        assert!((out.x - input).abs() < input * 0.2);
    }
}
