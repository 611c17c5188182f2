//! Exponential moving average with a separately smoothed velocity estimate
//!
//! Position is smoothed with `smoothing_factor`, velocity (Δposition/Δtime of
//! the raw input) with `velocity_alpha`.

use crate::filter::{delta_seconds, SmoothedSample, SmoothingAlgorithm, SmoothingFilter, SmoothingSettings};
use std::time::Instant;

pub struct EmaFilter {
    alpha: f64,
    velocity_alpha: f64,
    position: Option<(f64, f64)>,
    velocity: (f64, f64),
    last_raw: Option<(f64, f64, u64)>,
    samples_seen: u64,
}

impl EmaFilter {
    pub fn new(settings: &SmoothingSettings) -> Self {
        Self {
            alpha: settings.smoothing_factor.clamp(0.0, 1.0),
            velocity_alpha: settings.velocity_alpha.clamp(0.0, 1.0),
            position: None,
            velocity: (0.0, 0.0),
            last_raw: None,
            samples_seen: 0,
        }
    }

    /// Overrides the position smoothing factor for the next call onward
    ///
    /// Used by the adaptive filter, which derives α from velocity each sample.
    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha.clamp(0.0, 1.0);
    }
}

impl SmoothingFilter for EmaFilter {
    fn smooth(&mut self, x: f64, y: f64, timestamp_ns: u64) -> SmoothedSample {
        let start = Instant::now();
        self.samples_seen += 1;

        let (out_x, out_y) = match self.position {
            None => (x, y),
            Some((px, py)) => (
                self.alpha * x + (1.0 - self.alpha) * px,
                self.alpha * y + (1.0 - self.alpha) * py,
            ),
        };

        if let Some((rx, ry, rts)) = self.last_raw {
            let dt = delta_seconds(rts, timestamp_ns);
            let raw_vx = (x - rx) / dt;
            let raw_vy = (y - ry) / dt;
            self.velocity = (
                self.velocity_alpha * raw_vx + (1.0 - self.velocity_alpha) * self.velocity.0,
                self.velocity_alpha * raw_vy + (1.0 - self.velocity_alpha) * self.velocity.1,
            );
        }

        self.position = Some((out_x, out_y));
        self.last_raw = Some((x, y, timestamp_ns));

        SmoothedSample {
            x: out_x,
            y: out_y,
            vx: self.velocity.0,
            vy: self.velocity.1,
            confidence: (self.samples_seen as f64 / 10.0).min(1.0),
            processing_time: start.elapsed(),
        }
    }

    fn reset(&mut self) {
        self.position = None;
        self.velocity = (0.0, 0.0);
        self.last_raw = None;
        self.samples_seen = 0;
    }

    fn algorithm(&self) -> SmoothingAlgorithm {
        SmoothingAlgorithm::Ema
    }
}
