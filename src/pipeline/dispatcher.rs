//! Typed handler registration and event delivery
//!
//! Consumers register per-variant callbacks with [`EventDispatcher::on`],
//! grouped delivery with [`on_batch`](EventDispatcher::on_batch), and failure
//! callbacks with [`on_error`](EventDispatcher::on_error). Handler panics are
//! caught per event, forwarded to the error handlers with context, and never
//! abort the drain loop.

use crate::pipeline::{EventKind, PipelineError, PipelineEvent};
use crate::queue::QueuedEvent;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::RwLock;
use tracing::{debug, error, warn};

pub type EventHandler = Box<dyn Fn(&PipelineEvent) + Send + Sync>;
pub type BatchHandler = Box<dyn Fn(&[PipelineEvent]) + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(&PipelineError, &ErrorContext) + Send + Sync>;

/// Context delivered alongside a handler failure
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub event_id: String,
    pub kind: EventKind,
    pub retry_count: u32,
}

/// Handler registry and dispatch engine
///
/// Registration takes a short write lock; dispatch runs under a read lock so
/// consumers can register at any time without stalling delivery.
pub struct EventDispatcher {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
    batch_handlers: RwLock<Vec<BatchHandler>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            batch_handlers: RwLock::new(Vec::new()),
            error_handlers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a handler for one event variant
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        debug!("Registering handler for {} events", kind);
        match self.handlers.write() {
            Ok(mut map) => map.entry(kind).or_default().push(Box::new(handler)),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(kind)
                .or_default()
                .push(Box::new(handler)),
        }
    }

    /// Registers a handler receiving every drained batch as a group
    pub fn on_batch<F>(&self, handler: F)
    where
        F: Fn(&[PipelineEvent]) + Send + Sync + 'static,
    {
        debug!("Registering batch handler");
        match self.batch_handlers.write() {
            Ok(mut list) => list.push(Box::new(handler)),
            Err(poisoned) => poisoned.into_inner().push(Box::new(handler)),
        }
    }

    /// Registers a callback for handler failures
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&PipelineError, &ErrorContext) + Send + Sync + 'static,
    {
        debug!("Registering error handler");
        match self.error_handlers.write() {
            Ok(mut list) => list.push(Box::new(handler)),
            Err(poisoned) => poisoned.into_inner().push(Box::new(handler)),
        }
    }

    /// Delivers one event to every handler registered for its variant
    ///
    /// Each handler failure is isolated, reported through the error
    /// handlers, and reflected in the returned result so the drain loop can
    /// apply its retry policy. Remaining handlers still run.
    pub fn dispatch(&self, queued: &QueuedEvent) -> Result<(), PipelineError> {
        let kind = queued.event.kind();
        let mut failures = 0u32;

        let guard = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handlers) = guard.get(&kind) {
            for handler in handlers {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&queued.event))) {
                    failures += 1;
                    let failure = PipelineError::HandlerError {
                        event_id: queued.event_id.clone(),
                        message: panic_message(&panic),
                    };
                    warn!("Handler failed for {} event: {}", kind, failure);
                    self.notify_error(
                        &failure,
                        &ErrorContext {
                            event_id: queued.event_id.clone(),
                            kind,
                            retry_count: queued.retry_count,
                        },
                    );
                }
            }
        }
        drop(guard);

        if failures == 0 {
            Ok(())
        } else {
            Err(PipelineError::HandlerError {
                event_id: queued.event_id.clone(),
                message: format!("{failures} handler(s) failed"),
            })
        }
    }

    /// Delivers a drained batch to every batch handler
    pub fn dispatch_batch(&self, events: &[PipelineEvent]) {
        if events.is_empty() {
            return;
        }
        let guard = match self.batch_handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handler in guard.iter() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(events))) {
                let failure = PipelineError::HandlerError {
                    event_id: "batch".to_string(),
                    message: panic_message(&panic),
                };
                error!("Batch handler failed: {}", failure);
                self.notify_error(
                    &failure,
                    &ErrorContext {
                        event_id: "batch".to_string(),
                        kind: events[0].kind(),
                        retry_count: 0,
                    },
                );
            }
        }
    }

    /// Forwards a failure to every registered error handler
    pub fn notify_error(&self, failure: &PipelineError, context: &ErrorContext) {
        let guard = match self.error_handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handler in guard.iter() {
            // An error handler that panics is dropped on the floor; there is
            // nobody left to report it to.
            let _ = catch_unwind(AssertUnwindSafe(|| handler(failure, context)));
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DeviceId;
    use crate::queue::Priority;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn key_event() -> QueuedEvent {
        QueuedEvent::new(
            PipelineEvent::KeyInput {
                source: DeviceId(3),
                key_id: 17,
                pressed: true,
                timestamp_ns: 1_000,
            },
            Priority::High,
        )
    }

    #[test]
    fn handlers_receive_matching_variant_only() {
        let dispatcher = EventDispatcher::new();
        let key_calls = Arc::new(AtomicU32::new(0));
        let motion_calls = Arc::new(AtomicU32::new(0));

        let counter = key_calls.clone();
        dispatcher.on(EventKind::KeyInput, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = motion_calls.clone();
        dispatcher.on(EventKind::PointerMotion, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(&key_event()).expect("dispatch");
        assert_eq!(key_calls.load(Ordering::SeqCst), 1);
        assert_eq!(motion_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_handler_reaches_error_handlers() {
        let dispatcher = EventDispatcher::new();
        let errors = Arc::new(AtomicU32::new(0));
        let survivors = Arc::new(AtomicU32::new(0));

        dispatcher.on(EventKind::KeyInput, |_| panic!("boom"));
        let counter = survivors.clone();
        dispatcher.on(EventKind::KeyInput, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = errors.clone();
        dispatcher.on_error(move |failure, context| {
            assert!(matches!(failure, PipelineError::HandlerError { .. }));
            assert_eq!(context.kind, EventKind::KeyInput);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = dispatcher.dispatch(&key_event());
        assert!(result.is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        // The panic did not prevent the second handler from running.
        assert_eq!(survivors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_handlers_see_whole_batches() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        dispatcher.on_batch(move |events| {
            counter.fetch_add(events.len() as u32, Ordering::SeqCst);
        });

        let events: Vec<PipelineEvent> = (0..4)
            .map(|i| PipelineEvent::KeyInput {
                source: DeviceId(1),
                key_id: i,
                pressed: false,
                timestamp_ns: u64::from(i),
            })
            .collect();
        dispatcher.dispatch_batch(&events);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn dispatch_without_handlers_is_ok() {
        let dispatcher = EventDispatcher::new();
        assert!(dispatcher.dispatch(&key_event()).is_ok());
        dispatcher.dispatch_batch(&[]);
    }
}
