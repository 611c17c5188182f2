//! Polling loop tasks and their controller
//!
//! Each device class gets one tokio task that calls a [`PollHandler`] at the
//! configured cadence, measures per-cycle latency, and republishes a
//! [`PollingState`] snapshot every monitoring interval. Rate and mode updates
//! arrive over watch channels and take effect on the next iteration.

use crate::polling::{
    DeviceClass, PollingError, PollingMode, PollingState, MAX_RATE, MIN_RATE, POWER_SAVE_CEILING,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work performed on every poll tick
///
/// Implementations drain pending raw samples, run them through the transform
/// chain, and enqueue the results. A returned error is counted and logged;
/// the loop continues at the next scheduled tick.
pub trait PollHandler: Send + 'static {
    /// Runs one poll cycle, returning the number of samples handled
    fn poll(&mut self) -> Result<usize, PollingError>;
}

/// Per-loop tuning
#[derive(Debug, Clone)]
pub struct PollingSettings {
    /// Initial target rate in Hz, within `[125, 8000]`
    pub rate: u32,
    pub mode: PollingMode,
    /// Smoothed-load value above which the adaptive loop backs off
    pub adaptive_threshold: f64,
    /// Feedback and snapshot cadence
    pub monitor_interval: Duration,
    /// Bounded latency history length
    pub history_size: usize,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            rate: 1000,
            mode: PollingMode::Fixed,
            adaptive_threshold: 0.75,
            monitor_interval: Duration::from_millis(100),
            history_size: 256,
        }
    }
}

/// Validates a requested polling rate
pub fn validate_rate(rate: u32) -> Result<(), PollingError> {
    if (MIN_RATE..=MAX_RATE).contains(&rate) {
        Ok(())
    } else {
        Err(PollingError::InvalidRate { rate })
    }
}

/// Rate actually driven for the given mode
pub fn effective_rate(rate: u32, mode: PollingMode) -> u32 {
    match mode {
        PollingMode::Gaming => MAX_RATE,
        PollingMode::PowerSave => rate.min(POWER_SAVE_CEILING),
        PollingMode::Fixed | PollingMode::Adaptive => rate,
    }
}

/// One multiplicative feedback step of the adaptive controller
///
/// Over threshold the rate backs off by 20%, under it grows by 10%; both
/// directions stay within `[125, 8000]`. The caller feeds a smoothed load
/// estimate, not an instantaneous sample, to avoid oscillation.
pub fn adaptive_step(rate: u32, smoothed_load: f64, threshold: f64) -> u32 {
    let adjusted = if smoothed_load > threshold {
        (rate as f64 * 0.8).round() as u32
    } else {
        (rate as f64 * 1.1).round() as u32
    };
    adjusted.clamp(MIN_RATE, MAX_RATE)
}

/// Handle for one spawned polling loop
pub struct PollingLoopHandle {
    device_class: DeviceClass,
    rate_tx: watch::Sender<u32>,
    mode_tx: watch::Sender<PollingMode>,
    state_rx: watch::Receiver<PollingState>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingLoopHandle {
    /// Spawns the polling loop for one device class
    pub fn spawn<H: PollHandler>(
        device_class: DeviceClass,
        settings: PollingSettings,
        handler: H,
        cancel: CancellationToken,
    ) -> Result<Self, PollingError> {
        validate_rate(settings.rate)?;
        info!(
            "Spawning {} polling loop at {}Hz ({} mode)",
            device_class, settings.rate, settings.mode
        );

        let (rate_tx, rate_rx) = watch::channel(settings.rate);
        let (mode_tx, mode_rx) = watch::channel(settings.mode);
        let (state_tx, state_rx) = watch::channel(PollingState::new(
            device_class,
            settings.rate,
            settings.mode,
        ));

        let task_handle = tokio::spawn(run_polling_loop(
            device_class,
            settings,
            handler,
            rate_rx,
            mode_rx,
            state_tx,
            cancel,
        ));

        Ok(Self {
            device_class,
            rate_tx,
            mode_tx,
            state_rx,
            task_handle: Mutex::new(Some(task_handle)),
        })
    }

    pub fn device_class(&self) -> DeviceClass {
        self.device_class
    }

    /// Requests a new target rate, applied on the next loop iteration
    pub fn set_rate(&self, rate: u32) -> Result<(), PollingError> {
        validate_rate(rate)?;
        self.rate_tx
            .send(rate)
            .map_err(|_| PollingError::ChannelClosed(self.device_class))
    }

    /// Switches the polling mode, applied on the next loop iteration
    pub fn set_mode(&self, mode: PollingMode) -> Result<(), PollingError> {
        self.mode_tx
            .send(mode)
            .map_err(|_| PollingError::ChannelClosed(self.device_class))
    }

    /// Latest published state snapshot
    pub fn state(&self) -> PollingState {
        self.state_rx.borrow().clone()
    }

    /// Waits for the loop task to finish after cancellation
    pub async fn join(&self, timeout: Duration) -> Result<(), PollingError> {
        let handle = {
            let mut guard = match self.task_handle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        let Some(handle) = handle else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_err)) => Err(PollingError::LoopPanicked(
                self.device_class,
                join_err.to_string(),
            )),
            Err(_) => Err(PollingError::JoinTimeout(self.device_class)),
        }
    }
}

/// Groups the per-device polling loops behind one control surface
pub struct PollingController {
    loops: HashMap<DeviceClass, PollingLoopHandle>,
}

impl PollingController {
    pub fn new() -> Self {
        Self {
            loops: HashMap::new(),
        }
    }

    /// Spawns and registers a loop for the given device class
    pub fn spawn_loop<H: PollHandler>(
        &mut self,
        device_class: DeviceClass,
        settings: PollingSettings,
        handler: H,
        cancel: CancellationToken,
    ) -> Result<(), PollingError> {
        let handle = PollingLoopHandle::spawn(device_class, settings, handler, cancel)?;
        self.loops.insert(device_class, handle);
        Ok(())
    }

    /// Sets the target rate for one device class
    pub fn set_rate(&self, device_class: DeviceClass, rate: u32) -> Result<(), PollingError> {
        self.loops
            .get(&device_class)
            .ok_or(PollingError::UnknownDeviceClass(device_class))?
            .set_rate(rate)
    }

    /// Switches every loop to the given mode
    pub fn set_mode(&self, mode: PollingMode) -> Result<(), PollingError> {
        for handle in self.loops.values() {
            handle.set_mode(mode)?;
        }
        Ok(())
    }

    /// Latest state snapshot for one device class
    pub fn state(&self, device_class: DeviceClass) -> Option<PollingState> {
        self.loops.get(&device_class).map(|h| h.state())
    }

    /// Joins all loops after cancellation, with a bounded timeout each
    pub async fn join_all(&self, timeout: Duration) -> Result<(), PollingError> {
        for handle in self.loops.values() {
            handle.join(timeout).await?;
        }
        Ok(())
    }
}

impl Default for PollingController {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_polling_loop<H: PollHandler>(
    device_class: DeviceClass,
    settings: PollingSettings,
    mut handler: H,
    mut rate_rx: watch::Receiver<u32>,
    mut mode_rx: watch::Receiver<PollingMode>,
    state_tx: watch::Sender<PollingState>,
    cancel: CancellationToken,
) {
    const LOAD_EMA_ALPHA: f64 = 0.2;

    let mut target_rate = settings.rate;
    let mut mode = settings.mode;
    let mut latency_history: VecDeque<Duration> = VecDeque::with_capacity(settings.history_size);
    let mut smoothed_load = 0.0_f64;
    let mut poll_errors = 0u64;
    let mut max_latency_us = 0u64;
    let mut cycles_in_window = 0u32;
    let mut monitor_start = Instant::now();

    // Periodic throughput log, matching the cadence of the other loops.
    let mut stats_events = 0usize;
    let mut last_stats_log = chrono::Local::now();
    let stats_interval = chrono::Duration::seconds(30);

    info!("{} polling loop entering main cycle", device_class);
    loop {
        if cancel.is_cancelled() {
            info!("{} polling loop observed stop signal", device_class);
            break;
        }

        // Control updates take effect from this iteration on.
        if rate_rx.has_changed().unwrap_or(false) {
            target_rate = *rate_rx.borrow_and_update();
            debug!("{} target rate updated to {}Hz", device_class, target_rate);
        }
        if mode_rx.has_changed().unwrap_or(false) {
            mode = *mode_rx.borrow_and_update();
            info!("{} polling mode updated to {}", device_class, mode);
        }

        let driven_rate = effective_rate(target_rate, mode);
        let interval = Duration::from_nanos(1_000_000_000 / u64::from(driven_rate.max(1)));

        let cycle_start = Instant::now();
        match handler.poll() {
            Ok(handled) => stats_events += handled,
            Err(e) => {
                poll_errors += 1;
                warn!("{} poll cycle failed: {}", device_class, e);
            }
        }
        let elapsed = cycle_start.elapsed();
        cycles_in_window += 1;

        if latency_history.len() == settings.history_size {
            latency_history.pop_front();
        }
        latency_history.push_back(elapsed);
        let elapsed_us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        if elapsed_us > max_latency_us {
            max_latency_us = elapsed_us;
        }

        let instantaneous_load = elapsed.as_secs_f64() / interval.as_secs_f64();
        smoothed_load = LOAD_EMA_ALPHA * instantaneous_load + (1.0 - LOAD_EMA_ALPHA) * smoothed_load;

        let window = monitor_start.elapsed();
        if window >= settings.monitor_interval {
            if mode == PollingMode::Adaptive {
                let next = adaptive_step(target_rate, smoothed_load, settings.adaptive_threshold);
                if next != target_rate {
                    debug!(
                        "{} adaptive rate {} -> {}Hz (load {:.3})",
                        device_class, target_rate, next, smoothed_load
                    );
                    target_rate = next;
                }
            }

            let avg_latency_us = if latency_history.is_empty() {
                0.0
            } else {
                latency_history
                    .iter()
                    .map(|d| d.as_secs_f64() * 1e6)
                    .sum::<f64>()
                    / latency_history.len() as f64
            };
            let actual_rate = (f64::from(cycles_in_window) / window.as_secs_f64()).round() as u32;

            state_tx.send_replace(PollingState {
                device_class,
                target_rate,
                actual_rate,
                mode,
                avg_latency_us,
                max_latency_us,
                poll_errors,
            });

            cycles_in_window = 0;
            monitor_start = Instant::now();
        }

        let now = chrono::Local::now();
        if now - last_stats_log > stats_interval {
            info!(
                "{} polling stats: {} samples in last {}s, target {}Hz, load {:.3}",
                device_class,
                stats_events,
                stats_interval.num_seconds(),
                target_rate,
                smoothed_load
            );
            stats_events = 0;
            last_stats_log = now;
        }

        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        } else {
            // Overrun: yield so cancellation and other tasks stay responsive.
            tokio::task::yield_now().await;
        }
    }

    if poll_errors > 0 {
        error!(
            "{} polling loop exited with {} accumulated poll errors",
            device_class, poll_errors
        );
    } else {
        info!("{} polling loop exited cleanly", device_class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn rate_validation_enforces_bounds() {
        assert!(validate_rate(MIN_RATE).is_ok());
        assert!(validate_rate(MAX_RATE).is_ok());
        assert!(validate_rate(1000).is_ok());
        assert!(matches!(
            validate_rate(MIN_RATE - 1),
            Err(PollingError::InvalidRate { rate: 124 })
        ));
        assert!(matches!(
            validate_rate(MAX_RATE + 1),
            Err(PollingError::InvalidRate { .. })
        ));
    }

    #[test]
    fn adaptive_step_backs_off_under_load() {
        // Sustained load above threshold: 4000Hz -> 3200Hz.
        assert_eq!(adaptive_step(4000, 0.9, 0.75), 3200);
        // Under threshold: grow by 10%.
        assert_eq!(adaptive_step(4000, 0.2, 0.75), 4400);
    }

    #[test]
    fn adaptive_step_never_leaves_valid_range() {
        assert_eq!(adaptive_step(MIN_RATE, 1.0, 0.5), MIN_RATE);
        assert_eq!(adaptive_step(150, 1.0, 0.5), MIN_RATE);
        assert_eq!(adaptive_step(MAX_RATE, 0.0, 0.5), MAX_RATE);
        assert_eq!(adaptive_step(7900, 0.0, 0.5), MAX_RATE);
    }

    #[test]
    fn modes_clamp_the_driven_rate() {
        assert_eq!(effective_rate(2000, PollingMode::Gaming), MAX_RATE);
        assert_eq!(effective_rate(4000, PollingMode::PowerSave), POWER_SAVE_CEILING);
        assert_eq!(effective_rate(500, PollingMode::PowerSave), 500);
        assert_eq!(effective_rate(2000, PollingMode::Fixed), 2000);
        assert_eq!(effective_rate(2000, PollingMode::Adaptive), 2000);
    }

    struct CountingHandler(Arc<AtomicUsize>);

    impl PollHandler for CountingHandler {
        fn poll(&mut self) -> Result<usize, PollingError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loop_polls_and_stops_on_cancel() {
        let polls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let handle = PollingLoopHandle::spawn(
            DeviceClass::Mouse,
            PollingSettings {
                rate: 1000,
                ..PollingSettings::default()
            },
            CountingHandler(polls.clone()),
            cancel.clone(),
        )
        .expect("spawn polling loop");

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        handle.join(Duration::from_secs(2)).await.expect("join");

        // At 1000Hz over 150ms the loop must have run a healthy number of cycles.
        assert!(polls.load(Ordering::SeqCst) > 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_rate_leaves_loop_running() {
        let polls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let handle = PollingLoopHandle::spawn(
            DeviceClass::Keyboard,
            PollingSettings::default(),
            CountingHandler(polls.clone()),
            cancel.clone(),
        )
        .expect("spawn polling loop");

        assert!(matches!(
            handle.set_rate(9000),
            Err(PollingError::InvalidRate { rate: 9000 })
        ));
        assert!(handle.set_rate(2000).is_ok());

        cancel.cancel();
        handle.join(Duration::from_secs(2)).await.expect("join");
    }

    #[test]
    fn spawn_rejects_invalid_initial_rate() {
        // Needs a runtime only on success; invalid settings fail before spawn.
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let _guard = runtime.enter();
        let result = PollingLoopHandle::spawn(
            DeviceClass::Mouse,
            PollingSettings {
                rate: 50,
                ..PollingSettings::default()
            },
            CountingHandler(Arc::new(AtomicUsize::new(0))),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(PollingError::InvalidRate { rate: 50 })));
    }
}
