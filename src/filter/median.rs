//! Median filter over the last N samples per axis
//!
//! Rejects single-sample spikes outright; a lone outlier never reaches the
//! output once the window holds at least three samples.

use crate::filter::{delta_seconds, SmoothedSample, SmoothingAlgorithm, SmoothingFilter, SmoothingSettings};
use std::collections::VecDeque;
use std::time::Instant;

pub struct MedianFilter {
    window: usize,
    history: VecDeque<(f64, f64)>,
    prev_output: Option<(f64, f64, u64)>,
}

impl MedianFilter {
    pub fn new(settings: &SmoothingSettings) -> Self {
        let window = settings.median_window.max(2);
        Self {
            window,
            history: VecDeque::with_capacity(window),
            prev_output: None,
        }
    }
}

fn median(values: &mut Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

impl SmoothingFilter for MedianFilter {
    fn smooth(&mut self, x: f64, y: f64, timestamp_ns: u64) -> SmoothedSample {
        let start = Instant::now();

        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back((x, y));

        let mut xs: Vec<f64> = self.history.iter().map(|(hx, _)| *hx).collect();
        let mut ys: Vec<f64> = self.history.iter().map(|(_, hy)| *hy).collect();
        let out_x = median(&mut xs);
        let out_y = median(&mut ys);

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
            confidence: self.history.len() as f64 / self.window as f64,
            processing_time: start.elapsed(),
        }
    }

    fn reset(&mut self) {
        self.history.clear();
        self.prev_output = None;
    }

    fn algorithm(&self) -> SmoothingAlgorithm {
        SmoothingAlgorithm::Median
    }
}
