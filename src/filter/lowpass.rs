//! First-order exponential low-pass filter
//!
//! `filtered = α·x + (1-α)·prev` with α taken from the configured cutoff in
//! `[0, 1]`. A cutoff of 1.0 passes input through untouched, 0.0 freezes the
//! output on the first sample.

use crate::filter::{delta_seconds, SmoothedSample, SmoothingAlgorithm, SmoothingFilter, SmoothingSettings};
use std::time::Instant;

pub struct LowPassFilter {
    alpha: f64,
    prev: Option<(f64, f64, u64)>,
    samples_seen: u64,
}

impl LowPassFilter {
    pub fn new(settings: &SmoothingSettings) -> Self {
        Self {
            alpha: settings.smoothing_factor.clamp(0.0, 1.0),
            prev: None,
            samples_seen: 0,
        }
    }
}

impl SmoothingFilter for LowPassFilter {
    fn smooth(&mut self, x: f64, y: f64, timestamp_ns: u64) -> SmoothedSample {
        let start = Instant::now();
        self.samples_seen += 1;

        let (out_x, out_y, vx, vy) = match self.prev {
            None => (x, y, 0.0, 0.0),
            Some((px, py, pts)) => {
                let fx = self.alpha * x + (1.0 - self.alpha) * px;
                let fy = self.alpha * y + (1.0 - self.alpha) * py;
                let dt = delta_seconds(pts, timestamp_ns);
                ((fx), (fy), (fx - px) / dt, (fy - py) / dt)
            }
        };
        self.prev = Some((out_x, out_y, timestamp_ns));

        SmoothedSample {
            x: out_x,
            y: out_y,
            vx,
            vy,
            // Certainty grows as the recursive estimate accumulates history.
            confidence: (self.samples_seen as f64 / 10.0).min(1.0),
            processing_time: start.elapsed(),
        }
    }

    fn reset(&mut self) {
        self.prev = None;
        self.samples_seen = 0;
    }

    fn algorithm(&self) -> SmoothingAlgorithm {
        SmoothingAlgorithm::LowPass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(alpha: f64) -> SmoothingSettings {
        SmoothingSettings {
            smoothing_factor: alpha,
            ..SmoothingSettings::default()
        }
    }

    #[test]
    fn second_sample_is_weighted_average() {
        let mut filter = LowPassFilter::new(&settings(0.25));
        filter.smooth(0.0, 0.0, 0);
        let out = filter.smooth(8.0, -4.0, 1_000_000);
        assert!((out.x - 2.0).abs() < 1e-12);
        assert!((out.y - -1.0).abs() < 1e-12);
    }

    #[test]
    fn unit_alpha_is_passthrough() {
        let mut filter = LowPassFilter::new(&settings(1.0));
        filter.smooth(1.0, 1.0, 0);
        let out = filter.smooth(5.0, 6.0, 1_000_000);
        assert_eq!(out.x, 5.0);
        assert_eq!(out.y, 6.0);
    }

    #[test]
    fn converges_toward_constant_input() {
        let mut filter = LowPassFilter::new(&settings(0.5));
        let mut out = filter.smooth(0.0, 0.0, 0);
        for i in 1..40u64 {
            out = filter.smooth(10.0, 10.0, i * 1_000_000);
        }
        assert!((out.x - 10.0).abs() < 1e-3);
        assert!((out.y - 10.0).abs() < 1e-3);
    }
}
