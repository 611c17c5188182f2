//! Pipeline coordinator with statum state machine for lifecycle control
//!
//! Implements a 5-state lifecycle for the whole pipeline with compile-time
//! state safety. The drain loop runs in its own tokio task and delivers
//! queued events to registered handlers according to the active queue mode.
//!
//! # State Machine
//!
//! ```text
//! Initializing ──► Configured ──► Active ──► Deactivating ──► Deactivated
//!                                    │            ▲
//!                                    └────────────┘
//!                                      (shutdown)
//! ```

use crate::config::PipelineConfig;
use crate::filter::{SmoothingAlgorithm, SmoothingSettings};
use crate::pipeline::dispatcher::EventDispatcher;
use crate::pipeline::worker::{KeyboardWorker, PointerWorker, TransformSettings};
use crate::pipeline::{EventKind, KeySample, PipelineError, PipelineEvent, RawSample};
use crate::polling::{
    DeviceClass, PollingController, PollingMode, PollingSettings, PollingState,
};
use crate::queue::{EventQueue, QueueMode, QueueStats, QueuedEvent};
use crate::scaler::{ScalerError, ScalerMode, MAX_DPI, MIN_DPI};
use statum::{machine, state};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on every shutdown join
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// States for pipeline lifecycle using statum
#[state]
#[derive(Debug, Clone)]
pub enum PipelineLifecycle {
    Initializing, // Validating configuration
    Configured,   // Transform chain wired up
    Active,       // Drain loop delivering events
    Deactivating, // Flushing the queue
    Deactivated,  // Fully stopped
}

/// Pipeline drain coordinator with compile-time state safety via statum
///
/// Owns the consumer side of the event queue. Producers (the poll workers)
/// only hold the queue `Arc`; delivery order and retry policy live here.
#[machine]
pub struct PipelineCoordinator<S: PipelineLifecycle> {
    config: PipelineConfig,
    queue: Arc<EventQueue>,
    dispatcher: Arc<EventDispatcher>,
}

impl PipelineCoordinator<Initializing> {
    pub fn create(
        config: PipelineConfig,
        queue: Arc<EventQueue>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::ConfigError(e.to_string()))?;
        info!("Initializing pipeline coordinator");
        Ok(Self::new(config, queue, dispatcher))
    }

    pub fn configure(self) -> PipelineCoordinator<Configured> {
        info!(
            "Pipeline configured: {} queue mode, {} max retries",
            self.queue.mode(),
            self.config.max_retries
        );
        self.transition()
    }
}

impl PipelineCoordinator<Configured> {
    pub fn activate(self) -> PipelineCoordinator<Active> {
        info!("Activating pipeline drain loop");
        self.transition()
    }
}

impl<S: PipelineLifecycle> PipelineCoordinator<S> {
    /// Delivers one drained batch, applying the retry policy per event
    ///
    /// Failed events go back into the queue until their retry budget is
    /// spent, then they are discarded and counted. Returns the number of
    /// events delivered to at least the per-event handlers.
    fn process_batch(&mut self, batch: Vec<QueuedEvent>) -> usize {
        let mut delivered: Vec<PipelineEvent> = Vec::with_capacity(batch.len());
        for queued in batch {
            let start = Instant::now();
            match self.dispatcher.dispatch(&queued) {
                Ok(()) => {
                    self.queue.record_processed(start.elapsed());
                    delivered.push(queued.event);
                }
                Err(e) => {
                    self.queue.record_handler_error();
                    if queued.retry_count < self.config.max_retries {
                        debug!(
                            "Re-enqueueing event {} after failure (attempt {}): {}",
                            queued.event_id,
                            queued.retry_count + 1,
                            e
                        );
                        let mut retry = queued;
                        retry.retry_count += 1;
                        // A rejected re-enqueue is already counted as a drop
                        // by the queue itself.
                        let _ = self.queue.enqueue(retry);
                    } else {
                        warn!(
                            "Discarding event {} after {} attempts: {}",
                            queued.event_id, self.config.max_retries, e
                        );
                        self.queue.record_discarded();
                    }
                }
            }
        }
        self.dispatcher.dispatch_batch(&delivered);
        delivered.len()
    }
}

impl PipelineCoordinator<Active> {
    /// Runs one drain cycle according to the current queue mode
    pub fn drain_cycle(&mut self) -> usize {
        let tuning = self.config.drain.clone();
        match self.queue.mode() {
            QueueMode::Realtime => {
                let batch = self.queue.dequeue_batch(tuning.drain_budget);
                self.process_batch(batch)
            }
            QueueMode::Batch => {
                let batch = self.queue.dequeue_batch(tuning.batch_size);
                self.process_batch(batch)
            }
            QueueMode::Adaptive => {
                // Back off to small batches when the queue runs hot, open the
                // budget wide when it drains below the low watermark.
                let occupancy = self.queue.occupancy();
                let budget = if occupancy >= tuning.high_watermark {
                    tuning.reduced_batch_size
                } else if occupancy <= tuning.low_watermark {
                    tuning.drain_budget
                } else {
                    tuning.batch_size
                };
                let batch = self.queue.dequeue_batch(budget);
                self.process_batch(batch)
            }
            QueueMode::Throttled => {
                let deadline = Instant::now() + tuning.throttle_budget();
                let mut total = 0;
                while Instant::now() < deadline {
                    let batch = self.queue.dequeue_batch(tuning.reduced_batch_size);
                    if batch.is_empty() {
                        break;
                    }
                    total += self.process_batch(batch);
                }
                total
            }
        }
    }

    /// Main drain loop with graceful shutdown support
    ///
    /// Runs until the shutdown signal arrives. Individual handler failures
    /// never stop the loop; they feed the retry policy instead.
    pub async fn run_until_shutdown(
        mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<PipelineCoordinator<Deactivating>, PipelineError> {
        info!("Pipeline drain loop entering main cycle");

        let idle_sleep = self.config.drain.idle_sleep();
        let busy_sleep = self.config.drain.busy_sleep();
        let mut sleep_for = idle_sleep;

        let mut stats_events = 0usize;
        let mut last_stats_log = chrono::Local::now();
        let stats_interval = chrono::Duration::seconds(30);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received by drain loop");
                    break;
                }

                _ = tokio::time::sleep(sleep_for) => {
                    let drained = self.drain_cycle();
                    stats_events += drained;
                    sleep_for = if drained == 0 { idle_sleep } else { busy_sleep };

                    let now = chrono::Local::now();
                    if now - last_stats_log > stats_interval {
                        let stats = self.queue.stats();
                        info!(
                            "Pipeline stats: {} events in last {}s, queue {}/{}, {} dropped, {} handler errors",
                            stats_events,
                            stats_interval.num_seconds(),
                            stats.current_size,
                            self.queue.capacity(),
                            stats.total_dropped,
                            stats.handler_errors
                        );
                        stats_events = 0;
                        last_stats_log = now;
                    }
                }
            }
        }

        info!("Transitioning pipeline to Deactivating state");
        Ok(self.transition())
    }
}

impl PipelineCoordinator<Deactivating> {
    /// Flushes every remaining queued event through normal dispatch, then
    /// transitions to Deactivated
    ///
    /// The retry budget still applies during the flush, so events whose
    /// handlers keep failing are discarded rather than looping forever.
    pub async fn shutdown(mut self) -> PipelineCoordinator<Deactivated> {
        info!("Flushing {} remaining queued events", self.queue.len());

        let mut flushed = 0usize;
        loop {
            let batch = self.queue.dequeue_batch(self.config.drain.batch_size);
            if batch.is_empty() {
                break;
            }
            flushed += self.process_batch(batch);
        }

        info!("Pipeline shut down, {} events flushed", flushed);
        self.transition()
    }
}

impl PipelineCoordinator<Deactivated> {}

/// Public control surface of a running pipeline
///
/// Spawns the polling loops and the drain loop, then exposes runtime
/// controls. All setters validate before publishing; rejected values leave
/// the running configuration untouched.
pub struct PipelineHandle {
    pointer_tx: mpsc::Sender<RawSample>,
    key_tx: mpsc::Sender<KeySample>,
    control_tx: watch::Sender<TransformSettings>,
    queue: Arc<EventQueue>,
    dispatcher: Arc<EventDispatcher>,
    polling: PollingController,
    cancel: CancellationToken,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<Result<(), PipelineError>>>,
}

impl PipelineHandle {
    /// Builds the whole pipeline and spawns its tasks
    ///
    /// Must be called from within a tokio runtime. One polling loop per
    /// device class plus the drain loop are spawned; the returned handle is
    /// the only way to stop them.
    pub fn spawn(config: PipelineConfig) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::ConfigError(e.to_string()))?;

        let queue = Arc::new(
            EventQueue::new(config.queue_max_size, config.queue_mode)
                .with_degraded_ceiling(config.degraded_ceiling, config.degraded_window()),
        );
        let dispatcher = Arc::new(EventDispatcher::new());
        let cancel = CancellationToken::new();

        let (pointer_tx, pointer_rx) = mpsc::channel(config.channel_capacity);
        let (key_tx, key_rx) = mpsc::channel(config.channel_capacity);
        let (control_tx, control_rx) = watch::channel(TransformSettings::from(&config));

        let pointer_worker =
            PointerWorker::new(pointer_rx, control_rx, queue.clone(), &config)?;
        let keyboard_worker = KeyboardWorker::new(key_rx, queue.clone());

        let mut polling = PollingController::new();
        polling.spawn_loop(
            DeviceClass::Mouse,
            PollingSettings {
                rate: config.mouse_polling_rate,
                mode: config.polling_mode,
                adaptive_threshold: config.adaptive_threshold,
                ..PollingSettings::default()
            },
            pointer_worker,
            cancel.clone(),
        )?;
        polling.spawn_loop(
            DeviceClass::Keyboard,
            PollingSettings {
                rate: config.keyboard_polling_rate,
                mode: config.polling_mode,
                adaptive_threshold: config.adaptive_threshold,
                ..PollingSettings::default()
            },
            keyboard_worker,
            cancel.clone(),
        )?;

        let coordinator =
            PipelineCoordinator::create(config, queue.clone(), dispatcher.clone())?
                .configure()
                .activate();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_handle = tokio::spawn(async move {
            match coordinator.run_until_shutdown(shutdown_rx).await {
                Ok(deactivating) => {
                    let _ = deactivating.shutdown().await;
                    Ok(())
                }
                Err(e) => {
                    error!("Pipeline drain loop failed: {}", e);
                    Err(e)
                }
            }
        });

        info!("Pipeline spawned");
        Ok(Self {
            pointer_tx,
            key_tx,
            control_tx,
            queue,
            dispatcher,
            polling,
            cancel,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        })
    }

    /// Sender the pointer-device listener feeds raw samples into
    pub fn pointer_sender(&self) -> mpsc::Sender<RawSample> {
        self.pointer_tx.clone()
    }

    /// Sender the keyboard listener feeds raw samples into
    pub fn key_sender(&self) -> mpsc::Sender<KeySample> {
        self.key_tx.clone()
    }

    /// Registers a handler for one event variant
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on(kind, handler);
    }

    /// Registers a handler receiving every drained batch as a group
    pub fn on_batch<F>(&self, handler: F)
    where
        F: Fn(&[PipelineEvent]) + Send + Sync + 'static,
    {
        self.dispatcher.on_batch(handler);
    }

    /// Registers a callback for handler failures
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&PipelineError, &crate::pipeline::ErrorContext) + Send + Sync + 'static,
    {
        self.dispatcher.on_error(handler);
    }

    /// Sets the target virtual DPI, applied by the pointer worker on its
    /// next poll cycle
    pub fn set_dpi(&self, dpi: u32) -> Result<(), PipelineError> {
        if !(MIN_DPI..=MAX_DPI).contains(&dpi) {
            return Err(ScalerError::InvalidDpi { dpi }.into());
        }
        self.control_tx.send_modify(|s| s.target_dpi = dpi);
        Ok(())
    }

    pub fn set_scaler_mode(&self, mode: ScalerMode) {
        self.control_tx.send_modify(|s| s.scaler_mode = mode);
    }

    pub fn set_pre_smoothing(&self, enabled: bool) {
        self.control_tx.send_modify(|s| s.pre_smoothing = enabled);
    }

    pub fn set_smoothing_algorithm(&self, algorithm: SmoothingAlgorithm) {
        self.control_tx.send_modify(|s| s.algorithm = algorithm);
    }

    /// Replaces the smoothing parameters after validation
    pub fn set_smoothing_settings(&self, settings: SmoothingSettings) -> Result<(), PipelineError> {
        settings.validate()?;
        self.control_tx.send_modify(|s| s.smoothing = settings);
        Ok(())
    }

    /// Sets the target polling rate for one device class
    pub fn set_polling_rate(&self, device_class: DeviceClass, rate: u32) -> Result<(), PipelineError> {
        self.polling.set_rate(device_class, rate)?;
        Ok(())
    }

    /// Switches every polling loop to the given mode
    pub fn set_polling_mode(&self, mode: PollingMode) -> Result<(), PipelineError> {
        self.polling.set_mode(mode)?;
        Ok(())
    }

    /// Switches the queue draining strategy
    pub fn set_queue_mode(&self, mode: QueueMode) {
        self.queue.set_mode(mode);
    }

    /// Current queue statistics snapshot
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Latest polling state snapshot for one device class
    pub fn polling_state(&self, device_class: DeviceClass) -> Option<PollingState> {
        self.polling.state(device_class)
    }

    /// Stops the pipeline: cancels the polling loops, then asks the drain
    /// loop to flush and exit
    ///
    /// Every join is bounded by a 2 second timeout; a task that fails to
    /// stop in time surfaces as an error instead of hanging the caller.
    pub async fn shutdown(&mut self) -> Result<(), PipelineError> {
        info!("Shutting down pipeline");
        self.cancel.cancel();
        self.polling.join_all(SHUTDOWN_TIMEOUT).await?;

        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Drain loop already terminated");
            }
        }

        if let Some(handle) = self.task_handle.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(result)) => result?,
                Ok(Err(join_err)) => {
                    return Err(PipelineError::LifecycleError(format!(
                        "drain loop panicked: {join_err}"
                    )));
                }
                Err(_) => {
                    return Err(PipelineError::LifecycleError(
                        "drain loop failed to stop within the shutdown timeout".to_string(),
                    ));
                }
            }
        }

        info!("Pipeline shut down cleanly");
        Ok(())
    }
}
