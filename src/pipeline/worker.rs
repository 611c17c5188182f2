//! Per-device poll workers
//!
//! One worker per device class, owned by its polling loop task. Workers
//! drain pending raw samples, run the scale-then-smooth transform chain, and
//! enqueue the results. Transform state (scaler history, filter history,
//! accumulated positions) is single-writer by construction.

use crate::config::PipelineConfig;
use crate::filter::{FilterBank, SmoothingAlgorithm, SmoothingSettings};
use crate::pipeline::{DeviceId, KeySample, PipelineError, PipelineEvent, RawSample};
use crate::polling::{DeviceClass, PollHandler, PollingError};
use crate::queue::{EventQueue, Priority, QueuedEvent};
use crate::scaler::{DpiScaler, ScalerMode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Bound on samples handled per poll cycle, so one device cannot starve the
/// loop's timing
const MAX_SAMPLES_PER_CYCLE: usize = 64;

/// Transform parameters shared over a watch channel
///
/// The pipeline handle validates and publishes updates; workers apply them
/// at the start of their next poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformSettings {
    pub base_dpi: u32,
    pub target_dpi: u32,
    pub scaler_mode: ScalerMode,
    pub pre_smoothing: bool,
    pub algorithm: SmoothingAlgorithm,
    pub smoothing: SmoothingSettings,
}

impl From<&PipelineConfig> for TransformSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            base_dpi: config.base_dpi,
            target_dpi: config.target_dpi,
            scaler_mode: config.scaler_mode,
            pre_smoothing: config.pre_smoothing,
            algorithm: config.smoothing_algorithm,
            smoothing: config.smoothing.clone(),
        }
    }
}

/// Poll worker for pointer devices
pub struct PointerWorker {
    receiver: mpsc::Receiver<RawSample>,
    control_rx: watch::Receiver<TransformSettings>,
    scaler: DpiScaler,
    filters: FilterBank,
    queue: Arc<EventQueue>,
    /// Accumulated smoothing input position per channel
    positions: HashMap<DeviceId, (f64, f64)>,
    last_buttons: HashMap<DeviceId, u32>,
    last_timestamp: HashMap<DeviceId, u64>,
    channel_closed: bool,
}

impl PointerWorker {
    pub fn new(
        receiver: mpsc::Receiver<RawSample>,
        control_rx: watch::Receiver<TransformSettings>,
        queue: Arc<EventQueue>,
        config: &PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let mut scaler = DpiScaler::new(config.base_dpi)?;
        scaler.set_mode(config.scaler_mode);
        scaler.set_pre_smoothing(config.pre_smoothing);
        scaler.set_dpi(config.target_dpi)?;

        Ok(Self {
            receiver,
            control_rx,
            scaler,
            filters: FilterBank::new(config.smoothing_algorithm, config.smoothing.clone()),
            queue,
            positions: HashMap::new(),
            last_buttons: HashMap::new(),
            last_timestamp: HashMap::new(),
            channel_closed: false,
        })
    }

    fn apply_control_updates(&mut self) {
        if !self.control_rx.has_changed().unwrap_or(false) {
            return;
        }
        let settings = self.control_rx.borrow_and_update().clone();
        debug!("Pointer worker applying transform update: {:?}", settings);

        if settings.base_dpi != self.scaler.base_dpi() {
            match DpiScaler::new(settings.base_dpi) {
                Ok(scaler) => self.scaler = scaler,
                Err(e) => {
                    warn!("Ignoring base DPI update: {}", e);
                }
            }
        }
        self.scaler.set_mode(settings.scaler_mode);
        self.scaler.set_pre_smoothing(settings.pre_smoothing);
        if settings.target_dpi != self.scaler.current_dpi() {
            if let Err(e) = self.scaler.set_dpi(settings.target_dpi) {
                warn!("Ignoring target DPI update: {}", e);
            }
        }

        self.filters.set_algorithm(settings.algorithm);
        if let Err(e) = self.filters.set_settings(settings.smoothing) {
            warn!("Ignoring smoothing settings update: {}", e);
        }
    }

    fn process(&mut self, sample: RawSample) {
        // Per-source timestamps must be strictly increasing; late or
        // duplicate samples are counted and discarded.
        if let Some(&last) = self.last_timestamp.get(&sample.source) {
            if sample.timestamp_ns <= last {
                self.queue.record_out_of_order();
                debug!(
                    "Discarding out-of-order sample from {} ({} <= {})",
                    sample.source, sample.timestamp_ns, last
                );
                return;
            }
        }
        self.last_timestamp.insert(sample.source, sample.timestamp_ns);

        let previous_buttons = self
            .last_buttons
            .insert(sample.source, sample.buttons)
            .unwrap_or(0);
        if previous_buttons != sample.buttons {
            let event = PipelineEvent::ButtonChange {
                source: sample.source,
                buttons: sample.buttons,
                pressed_mask: sample.buttons & !previous_buttons,
                released_mask: previous_buttons & !sample.buttons,
                timestamp_ns: sample.timestamp_ns,
            };
            if !self.queue.enqueue(QueuedEvent::new(event, Priority::High)) {
                debug!("Button change from {} rejected by queue", sample.source);
            }
        }

        if sample.dx == 0 && sample.dy == 0 {
            return;
        }

        let scaled = self.scaler.scale(sample.dx, sample.dy);
        let position = self.positions.entry(sample.source).or_insert((0.0, 0.0));
        position.0 += scaled.dx;
        position.1 += scaled.dy;
        let (px, py) = *position;

        let smoothed = self
            .filters
            .smooth(sample.source, px, py, sample.timestamp_ns);

        let event = PipelineEvent::PointerMotion {
            source: sample.source,
            x: smoothed.x,
            y: smoothed.y,
            vx: smoothed.vx,
            vy: smoothed.vy,
            dx: scaled.dx,
            dy: scaled.dy,
            confidence: smoothed.confidence,
            timestamp_ns: sample.timestamp_ns,
        };
        if !self.queue.enqueue(QueuedEvent::new(event, Priority::Normal)) {
            debug!("Pointer motion from {} rejected by queue", sample.source);
        }
    }
}

impl PollHandler for PointerWorker {
    fn poll(&mut self) -> Result<usize, PollingError> {
        self.apply_control_updates();

        let mut handled = 0;
        while handled < MAX_SAMPLES_PER_CYCLE {
            match self.receiver.try_recv() {
                Ok(sample) => {
                    self.process(sample);
                    handled += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !self.channel_closed {
                        self.channel_closed = true;
                        return Err(PollingError::ChannelClosed(DeviceClass::Mouse));
                    }
                    break;
                }
            }
        }
        Ok(handled)
    }
}

/// Poll worker for keyboard devices
pub struct KeyboardWorker {
    receiver: mpsc::Receiver<KeySample>,
    queue: Arc<EventQueue>,
    last_timestamp: HashMap<DeviceId, u64>,
    channel_closed: bool,
}

impl KeyboardWorker {
    pub fn new(receiver: mpsc::Receiver<KeySample>, queue: Arc<EventQueue>) -> Self {
        Self {
            receiver,
            queue,
            last_timestamp: HashMap::new(),
            channel_closed: false,
        }
    }

    fn process(&mut self, sample: KeySample) {
        if let Some(&last) = self.last_timestamp.get(&sample.source) {
            if sample.timestamp_ns <= last {
                self.queue.record_out_of_order();
                debug!(
                    "Discarding out-of-order key sample from {} ({} <= {})",
                    sample.source, sample.timestamp_ns, last
                );
                return;
            }
        }
        self.last_timestamp.insert(sample.source, sample.timestamp_ns);

        let event = PipelineEvent::KeyInput {
            source: sample.source,
            key_id: sample.key_id,
            pressed: sample.pressed,
            timestamp_ns: sample.timestamp_ns,
        };
        if !self.queue.enqueue(QueuedEvent::new(event, Priority::High)) {
            debug!("Key input from {} rejected by queue", sample.source);
        }
    }
}

impl PollHandler for KeyboardWorker {
    fn poll(&mut self) -> Result<usize, PollingError> {
        let mut handled = 0;
        while handled < MAX_SAMPLES_PER_CYCLE {
            match self.receiver.try_recv() {
                Ok(sample) => {
                    self.process(sample);
                    handled += 1;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !self.channel_closed {
                        self.channel_closed = true;
                        return Err(PollingError::ChannelClosed(DeviceClass::Keyboard));
                    }
                    break;
                }
            }
        }
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueMode;

    struct PointerRig {
        sample_tx: mpsc::Sender<RawSample>,
        control_tx: watch::Sender<TransformSettings>,
        worker: PointerWorker,
        queue: Arc<EventQueue>,
    }

    fn pointer_setup(config: &PipelineConfig) -> PointerRig {
        let queue = Arc::new(EventQueue::new(config.queue_max_size, config.queue_mode));
        let (sample_tx, sample_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = watch::channel(TransformSettings::from(config));
        let worker = PointerWorker::new(sample_rx, control_rx, queue.clone(), config)
            .expect("pointer worker");
        PointerRig {
            sample_tx,
            control_tx,
            worker,
            queue,
        }
    }

    fn raw(dx: i32, dy: i32, buttons: u32, ts: u64) -> RawSample {
        RawSample {
            dx,
            dy,
            buttons,
            timestamp_ns: ts,
            source: DeviceId(7),
        }
    }

    #[test]
    fn motion_samples_become_scaled_pointer_events() {
        let mut config = PipelineConfig::default();
        config.base_dpi = 800;
        config.target_dpi = 1600;
        let mut rig = pointer_setup(&config);

        rig.sample_tx.try_send(raw(10, -5, 0, 1_000_000)).expect("send");
        let handled = rig.worker.poll().expect("poll");
        assert_eq!(handled, 1);

        let events = rig.queue.dequeue_batch(10);
        assert_eq!(events.len(), 1);
        match &events[0].event {
            PipelineEvent::PointerMotion { dx, dy, x, y, .. } => {
                assert_eq!(*dx, 20.0);
                assert_eq!(*dy, -10.0);
                // First sample: smoothing passes the accumulated position through.
                assert_eq!(*x, 20.0);
                assert_eq!(*y, -10.0);
            }
            other => panic!("expected PointerMotion, got {other:?}"),
        }
    }

    #[test]
    fn button_transitions_emit_high_priority_events() {
        let config = PipelineConfig::default();
        let mut rig = pointer_setup(&config);

        rig.sample_tx.try_send(raw(0, 0, 0b01, 1_000)).expect("send");
        rig.sample_tx.try_send(raw(0, 0, 0b10, 2_000)).expect("send");
        rig.worker.poll().expect("poll");

        let events = rig.queue.dequeue_batch(10);
        assert_eq!(events.len(), 2);
        for event in &events {
            assert_eq!(event.priority, Priority::High);
        }
        match &events[1].event {
            PipelineEvent::ButtonChange {
                pressed_mask,
                released_mask,
                ..
            } => {
                assert_eq!(*pressed_mask, 0b10);
                assert_eq!(*released_mask, 0b01);
            }
            other => panic!("expected ButtonChange, got {other:?}"),
        }
    }

    #[test]
    fn out_of_order_samples_are_discarded() {
        let config = PipelineConfig::default();
        let mut rig = pointer_setup(&config);

        rig.sample_tx.try_send(raw(1, 1, 0, 5_000)).expect("send");
        rig.sample_tx.try_send(raw(2, 2, 0, 4_000)).expect("send");
        rig.sample_tx.try_send(raw(3, 3, 0, 5_000)).expect("send");
        rig.worker.poll().expect("poll");

        // Only the first sample survives the monotonic timestamp check, and
        // both discards show up in the stats snapshot.
        assert_eq!(rig.queue.dequeue_batch(10).len(), 1);
        assert_eq!(rig.queue.stats().out_of_order_discards, 2);
    }

    #[test]
    fn keyboard_worker_enqueues_key_events() {
        let queue = Arc::new(EventQueue::new(16, QueueMode::Realtime));
        let (tx, rx) = mpsc::channel(16);
        let mut worker = KeyboardWorker::new(rx, queue.clone());

        tx.try_send(KeySample {
            key_id: 30,
            pressed: true,
            timestamp_ns: 1_000,
            source: DeviceId(2),
        })
        .expect("send");
        tx.try_send(KeySample {
            key_id: 30,
            pressed: false,
            timestamp_ns: 2_000,
            source: DeviceId(2),
        })
        .expect("send");
        // Stale timestamp: discarded and counted, not enqueued.
        tx.try_send(KeySample {
            key_id: 31,
            pressed: true,
            timestamp_ns: 1_500,
            source: DeviceId(2),
        })
        .expect("send");

        assert_eq!(worker.poll().expect("poll"), 3);
        let events = queue.dequeue_batch(10);
        assert_eq!(events.len(), 2);
        match &events[0].event {
            PipelineEvent::KeyInput { pressed, .. } => assert!(*pressed),
            other => panic!("expected KeyInput, got {other:?}"),
        }
        assert_eq!(queue.stats().out_of_order_discards, 1);
    }

    #[test]
    fn control_updates_apply_before_the_next_cycle() {
        let config = PipelineConfig::default();
        let mut rig = pointer_setup(&config);

        let mut settings = TransformSettings::from(&config);
        settings.target_dpi = 3200;
        rig.control_tx.send(settings).expect("control send");

        rig.sample_tx.try_send(raw(10, 0, 0, 1_000)).expect("send");
        rig.worker.poll().expect("poll");

        let events = rig.queue.dequeue_batch(10);
        assert_eq!(events.len(), 1);
        match &events[0].event {
            PipelineEvent::PointerMotion { dx, .. } => assert_eq!(*dx, 40.0),
            other => panic!("expected PointerMotion, got {other:?}"),
        }
    }

    #[test]
    fn zero_delta_samples_produce_no_motion_event() {
        let config = PipelineConfig::default();
        let mut rig = pointer_setup(&config);
        rig.sample_tx.try_send(raw(0, 0, 0, 1_000)).expect("send");
        rig.worker.poll().expect("poll");
        assert!(rig.queue.dequeue_batch(10).is_empty());
    }
}
