//! Gaussian kernel convolution over a fixed-size history window
//!
//! The kernel is centered on the most recent sample and normalized so its
//! weights sum to one. Until the window fills, samples are returned raw.

use crate::filter::{delta_seconds, SmoothedSample, SmoothingAlgorithm, SmoothingFilter, SmoothingSettings};
use std::collections::VecDeque;
use std::time::Instant;

pub struct GaussianFilter {
    kernel: Vec<f64>,
    window: usize,
    history: VecDeque<(f64, f64)>,
    prev_output: Option<(f64, f64, u64)>,
}

impl GaussianFilter {
    pub fn new(settings: &SmoothingSettings) -> Self {
        let window = settings.gaussian_window.max(2);
        Self {
            kernel: build_kernel(window, settings.gaussian_sigma),
            window,
            history: VecDeque::with_capacity(window),
            prev_output: None,
        }
    }
}

/// Causal kernel: index `window - 1` (most recent sample) carries the peak
fn build_kernel(window: usize, sigma: f64) -> Vec<f64> {
    let mut weights: Vec<f64> = (0..window)
        .map(|i| {
            let distance = (window - 1 - i) as f64;
            (-distance * distance / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = weights.iter().sum();
    for w in &mut weights {
        *w /= sum;
    }
    weights
}

impl SmoothingFilter for GaussianFilter {
    fn smooth(&mut self, x: f64, y: f64, timestamp_ns: u64) -> SmoothedSample {
        let start = Instant::now();

        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back((x, y));

        let (out_x, out_y) = if self.history.len() < self.window {
            (x, y)
        } else {
            let mut sx = 0.0;
            let mut sy = 0.0;
            for (weight, (hx, hy)) in self.kernel.iter().zip(self.history.iter()) {
                sx += weight * hx;
                sy += weight * hy;
            }
            (sx, sy)
        };

        let (vx, vy) = match self.prev_output {
            None => (0.0, 0.0),
            Some((px, py, pts)) => {
                let dt = delta_seconds(pts, timestamp_ns);
                ((out_x - px) / dt, (out_y - py) / dt)
            }
        };
        self.prev_output = Some((out_x, out_y, timestamp_ns));

        SmoothedSample {
            x: out_x,
            y: out_y,
            vx,
            vy,
            // Full certainty only once the kernel sees a complete window.
            confidence: self.history.len() as f64 / self.window as f64,
            processing_time: start.elapsed(),
        }
    }

    fn reset(&mut self) {
        self.history.clear();
        self.prev_output = None;
    }

    fn algorithm(&self) -> SmoothingAlgorithm {
        SmoothingAlgorithm::Gaussian
    }
}
