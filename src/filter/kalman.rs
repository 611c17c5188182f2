//! 1-D-per-axis constant-velocity Kalman filter
//!
//! Each axis carries scalar state (position, velocity, covariance). Per step:
//!
//! ```text
//! x_pred = x + vx·dt        P += Q·dt
//! k = P / (P + R)
//! x = x_pred + k·(z - x_pred)
//! P *= (1 - k)
//! ```

use crate::filter::{delta_seconds, SmoothedSample, SmoothingAlgorithm, SmoothingFilter, SmoothingSettings};
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct AxisState {
    position: f64,
    velocity: f64,
    covariance: f64,
}

impl AxisState {
    fn new(measurement: f64, initial_covariance: f64) -> Self {
        Self {
            position: measurement,
            velocity: 0.0,
            covariance: initial_covariance,
        }
    }

    fn step(&mut self, measurement: f64, dt: f64, q: f64, r: f64) {
        let predicted = self.position + self.velocity * dt;
        self.covariance += q * dt;

        let gain = self.covariance / (self.covariance + r);
        let innovation = measurement - predicted;

        let corrected = predicted + gain * innovation;
        self.velocity += gain * innovation / dt;
        self.position = corrected;
        self.covariance *= 1.0 - gain;
    }
}

pub struct KalmanFilter {
    process_noise: f64,
    measurement_noise: f64,
    axes: Option<(AxisState, AxisState)>,
    last_timestamp_ns: u64,
}

impl KalmanFilter {
    const INITIAL_COVARIANCE: f64 = 1.0;

    pub fn new(settings: &SmoothingSettings) -> Self {
        Self {
            process_noise: settings.kalman_process_noise,
            measurement_noise: settings.kalman_measurement_noise,
            axes: None,
            last_timestamp_ns: 0,
        }
    }
}

impl SmoothingFilter for KalmanFilter {
    fn smooth(&mut self, x: f64, y: f64, timestamp_ns: u64) -> SmoothedSample {
        let start = Instant::now();

        let (out, confidence) = match &mut self.axes {
            None => {
                self.axes = Some((
                    AxisState::new(x, Self::INITIAL_COVARIANCE),
                    AxisState::new(y, Self::INITIAL_COVARIANCE),
                ));
                ((x, y, 0.0, 0.0), 0.0)
            }
            Some((ax, ay)) => {
                let dt = delta_seconds(self.last_timestamp_ns, timestamp_ns);
                ax.step(x, dt, self.process_noise, self.measurement_noise);
                ay.step(y, dt, self.process_noise, self.measurement_noise);

                // Low covariance means the estimate has converged.
                let mean_covariance = (ax.covariance + ay.covariance) / 2.0;
                (
                    (ax.position, ay.position, ax.velocity, ay.velocity),
                    1.0 / (1.0 + mean_covariance),
                )
            }
        };
        self.last_timestamp_ns = timestamp_ns;

        SmoothedSample {
            x: out.0,
            y: out.1,
            vx: out.2,
            vy: out.3,
            confidence,
            processing_time: start.elapsed(),
        }
    }

    fn reset(&mut self) {
        self.axes = None;
        self.last_timestamp_ns = 0;
    }

    fn algorithm(&self) -> SmoothingAlgorithm {
        SmoothingAlgorithm::Kalman
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SmoothingSettings {
        SmoothingSettings {
            kalman_process_noise: 0.01,
            kalman_measurement_noise: 0.1,
            ..SmoothingSettings::default()
        }
    }

    #[test]
    fn gain_follows_scalar_kalman_equations() {
        let mut filter = KalmanFilter::new(&settings());
        filter.smooth(0.0, 0.0, 0);
        let out = filter.smooth(10.0, 0.0, 1_000_000);

        // dt = 1ms: P = 1.0 + 0.01*0.001, k = P/(P+0.1), x = k*10
        let p = 1.0 + 0.01 * 0.001;
        let k = p / (p + 0.1);
        assert!((out.x - k * 10.0).abs() < 1e-9);
        assert_eq!(out.y, 0.0);
    }

    #[test]
    fn covariance_shrinks_and_confidence_grows() {
        let mut filter = KalmanFilter::new(&settings());
        let mut last_confidence = 0.0;
        for i in 0..20u64 {
            let out = filter.smooth(5.0, 5.0, (i + 1) * 1_000_000);
            if i > 1 {
                assert!(out.confidence >= last_confidence);
            }
            last_confidence = out.confidence;
        }
        assert!(last_confidence > 0.8);
    }

    #[test]
    fn tracks_constant_velocity_motion() {
        let mut filter = KalmanFilter::new(&settings());
        let mut out = filter.smooth(0.0, 0.0, 0);
        for i in 1..100u64 {
            // 1 unit per ms along x
            out = filter.smooth(i as f64, 0.0, i * 1_000_000);
        }
        assert!((out.x - 99.0).abs() < 1.0);
        assert!(out.vx > 0.0);
    }
}
