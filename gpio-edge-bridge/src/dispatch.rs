//! Dispatch bridge: daemon notification thread -> consumer callback
//!
//! [`DispatchBridge`] is the [`EdgeSink`] every watch reports to. For each
//! native notification it resolves the handle through the registry, builds a
//! normalized [`EdgeEvent`] and hands it to the consumer, either inline or via
//! a bounded queue drained by a dedicated worker thread.
//!
//! # Failure isolation
//!
//! Consumer errors and panics are caught with [`std::panic::catch_unwind`],
//! logged, and pushed onto the optional failure queue as
//! [`DispatchFailure`]. They never reach the daemon's call stack.
//!
//! # Non-blocking
//!
//! The daemon thread never waits on the consumer in worker mode: when the
//! queue is full the event is dropped and counted.

use crate::config::{BridgeConfig, DispatchMode};
use crate::daemon::EdgeSink;
use crate::registry::{CallbackRegistry, Registration, ResolvedRegistration};
use crate::types::{BridgeError, EdgeEvent, Handle, Level, PinId, Result, Tick};
use chrono::Utc;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

/// Counters describing what happened to native notifications
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Consumer callbacks that returned `Ok`
    pub delivered: u64,
    /// Notifications whose handle did not resolve (teardown races)
    pub dropped_unknown: u64,
    /// Notifications with a bad level or a pin that didn't match the registration
    pub dropped_invalid: u64,
    /// Events dropped because the worker queue was full
    pub dropped_queue_full: u64,
    /// Events dropped because the worker had been shut down
    pub dropped_shutdown: u64,
    /// Consumer callbacks that returned an error or panicked
    pub failed: u64,
}

/// A consumer callback failure, reported out of band
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub handle: Handle,
    pub pin: PinId,
    pub tick: Tick,
    pub message: String,
}

impl From<DispatchFailure> for BridgeError {
    fn from(failure: DispatchFailure) -> Self {
        BridgeError::ConsumerCallbackFailed {
            handle: failure.handle,
            message: failure.message,
        }
    }
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped_unknown: AtomicU64,
    dropped_invalid: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_shutdown: AtomicU64,
    failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared between the bridge and its worker thread
struct DispatchShared {
    counters: Counters,
    failures: Option<SyncSender<DispatchFailure>>,
}

impl DispatchShared {
    /// Run the consumer with every failure contained
    fn invoke(&self, registration: &Registration, event: &EdgeEvent) {
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| registration.callback().on_edge(event)));

        let message = match outcome {
            Ok(Ok(())) => {
                bump(&self.counters.delivered);
                return;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        bump(&self.counters.failed);
        log::error!(
            "Consumer callback for {} (GPIO {}, tick {}) failed: {}",
            event.handle,
            event.pin,
            event.tick,
            message
        );

        if let Some(failures) = &self.failures {
            let failure = DispatchFailure {
                handle: event.handle,
                pin: event.pin,
                tick: event.tick,
                message,
            };
            if let Err(TrySendError::Full(_)) = failures.try_send(failure) {
                log::debug!("Failure queue full; failure for {} only logged", event.handle);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// An event waiting for the worker, still counted as in flight
struct QueuedEdge {
    registration: ResolvedRegistration,
    event: EdgeEvent,
}

/// Resolves native notifications and delivers them to consumers
pub struct DispatchBridge {
    registry: Arc<CallbackRegistry>,
    mode: DispatchMode,
    shared: Arc<DispatchShared>,
    queue: RwLock<Option<SyncSender<QueuedEdge>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    failure_receiver: Mutex<Option<Receiver<DispatchFailure>>>,
}

impl DispatchBridge {
    /// Create a bridge over `registry`, starting the worker thread if the
    /// configuration asks for one
    pub fn new(registry: Arc<CallbackRegistry>, config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let (failures, failure_receiver) = match config.failure_queue_capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::sync_channel(capacity);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let shared = Arc::new(DispatchShared {
            counters: Counters::default(),
            failures,
        });

        let (queue, worker) = match config.dispatch_mode {
            DispatchMode::Inline => (None, None),
            DispatchMode::Worker => {
                let (tx, rx) = mpsc::sync_channel::<QueuedEdge>(config.queue_capacity);
                let worker_shared = Arc::clone(&shared);
                let worker = thread::Builder::new()
                    .name("gpio-edge-dispatch".to_string())
                    .spawn(move || {
                        for QueuedEdge {
                            registration,
                            event,
                        } in rx
                        {
                            worker_shared.invoke(&registration, &event);
                        }
                        log::debug!("Dispatch worker stopped");
                    })
                    .map_err(|e| {
                        BridgeError::ResourceExhausted(format!(
                            "failed to spawn dispatch worker: {}",
                            e
                        ))
                    })?;
                (Some(tx), Some(worker))
            }
        };

        log::debug!(
            "Dispatch bridge ready ({:?} mode, queue capacity {})",
            config.dispatch_mode,
            config.queue_capacity
        );

        Ok(Self {
            registry,
            mode: config.dispatch_mode,
            shared,
            queue: RwLock::new(queue),
            worker: Mutex::new(worker),
            failure_receiver: Mutex::new(failure_receiver),
        })
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Take the receiving end of the failure queue (once)
    pub fn take_failure_receiver(&self) -> Option<Receiver<DispatchFailure>> {
        self.failure_receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Snapshot of the dispatch counters
    pub fn stats(&self) -> DispatchStats {
        let c = &self.shared.counters;
        DispatchStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped_unknown: c.dropped_unknown.load(Ordering::Relaxed),
            dropped_invalid: c.dropped_invalid.load(Ordering::Relaxed),
            dropped_queue_full: c.dropped_queue_full.load(Ordering::Relaxed),
            dropped_shutdown: c.dropped_shutdown.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Handle one native notification.
    ///
    /// Never blocks on the consumer in worker mode and never panics.
    pub fn dispatch(&self, pin: PinId, raw_level: u32, tick: u32, handle: Handle) {
        let registration = match self.registry.resolve(handle) {
            Ok(registration) => registration,
            Err(_) => {
                bump(&self.shared.counters.dropped_unknown);
                log::trace!("Dropping GPIO {} event for unknown handle {}", pin, handle);
                return;
            }
        };

        if registration.pin() != pin {
            bump(&self.shared.counters.dropped_invalid);
            log::warn!(
                "Dropping event for {}: daemon reported GPIO {}, registered GPIO {}",
                handle,
                pin,
                registration.pin()
            );
            return;
        }

        let Some(level) = Level::from_raw(raw_level) else {
            bump(&self.shared.counters.dropped_invalid);
            log::warn!("Dropping GPIO {} event with unknown level {}", pin, raw_level);
            return;
        };

        let event = EdgeEvent {
            handle,
            pin,
            level,
            tick: Tick(tick),
            received_at: Utc::now(),
        };
        log::trace!("GPIO {} -> {} at tick {} ({})", pin, level, tick, handle);

        match self.mode {
            DispatchMode::Inline => self.shared.invoke(&registration, &event),
            DispatchMode::Worker => self.enqueue(QueuedEdge {
                registration,
                event,
            }),
        }
    }

    fn enqueue(&self, queued: QueuedEdge) {
        let queue = self.queue.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = queue.as_ref() else {
            bump(&self.shared.counters.dropped_shutdown);
            log::debug!("Dispatch worker stopped; dropping event for {}", queued.event.handle);
            return;
        };

        match sender.try_send(queued) {
            Ok(()) => {}
            Err(TrySendError::Full(queued)) => {
                bump(&self.shared.counters.dropped_queue_full);
                log::warn!(
                    "Dispatch queue full; dropping GPIO {} event at tick {}",
                    queued.event.pin,
                    queued.event.tick
                );
            }
            Err(TrySendError::Disconnected(queued)) => {
                bump(&self.shared.counters.dropped_shutdown);
                log::debug!("Dispatch worker gone; dropping event for {}", queued.event.handle);
            }
        }
    }

    /// Stop accepting queued events, let the worker finish what is queued and
    /// join it. Safe to call more than once.
    pub fn shutdown(&self) {
        self.queue
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                log::error!("Dispatch worker panicked during shutdown");
            }
        }
    }
}

impl EdgeSink for DispatchBridge {
    fn on_native_edge(&self, _connection: i32, pin: PinId, level: u32, tick: u32, context: Handle) {
        self.dispatch(pin, level, tick, context);
    }
}

impl Drop for DispatchBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::EdgeCallback;
    use crate::types::Edge;
    use std::time::Duration;

    fn bridge(config: BridgeConfig) -> (Arc<CallbackRegistry>, DispatchBridge) {
        let registry = Arc::new(CallbackRegistry::new());
        let bridge = DispatchBridge::new(Arc::clone(&registry), &config).unwrap();
        (registry, bridge)
    }

    fn active(registry: &CallbackRegistry, pin: PinId, callback: impl EdgeCallback) -> Handle {
        let handle = registry.register(pin, Edge::Either, Arc::new(callback)).unwrap();
        registry.activate(handle).unwrap();
        handle
    }

    #[test]
    fn test_inline_delivery() {
        let (registry, bridge) = bridge(BridgeConfig::new().with_dispatch_mode(DispatchMode::Inline));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = active(&registry, 17, move |event: &EdgeEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });

        bridge.dispatch(17, 1, 1000, handle);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].pin, 17);
        assert_eq!(seen[0].level, Level::High);
        assert_eq!(seen[0].tick, Tick(1000));
        assert_eq!(seen[0].handle, handle);
        assert_eq!(bridge.stats().delivered, 1);
    }

    #[test]
    fn test_worker_without_queue_is_rejected() {
        let registry = Arc::new(CallbackRegistry::new());
        let config = BridgeConfig::new().with_queue_capacity(0);
        let result = DispatchBridge::new(registry, &config);
        assert!(matches!(result, Err(BridgeError::InvalidArgument(_))));
    }

    #[test]
    fn test_unknown_handle_is_dropped_silently() {
        let (_registry, bridge) = bridge(BridgeConfig::new().with_dispatch_mode(DispatchMode::Inline));
        bridge.dispatch(17, 1, 1000, Handle::from_raw(42));
        let stats = bridge.stats();
        assert_eq!(stats.dropped_unknown, 1);
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn test_invalid_level_and_pin_mismatch() {
        let (registry, bridge) = bridge(BridgeConfig::new().with_dispatch_mode(DispatchMode::Inline));
        let handle = active(&registry, 6, |_: &EdgeEvent| -> anyhow::Result<()> {
            panic!("must not be called")
        });

        bridge.dispatch(6, 7, 10, handle);
        bridge.dispatch(9, 1, 10, handle);
        assert_eq!(bridge.stats().dropped_invalid, 2);
        assert_eq!(bridge.stats().failed, 0);
    }

    #[test]
    fn test_consumer_failures_are_contained() {
        let config = BridgeConfig::new()
            .with_dispatch_mode(DispatchMode::Inline)
            .with_failure_queue(8);
        let (registry, bridge) = bridge(config);
        let failures = bridge.take_failure_receiver().unwrap();
        assert!(bridge.take_failure_receiver().is_none());

        let erroring = active(&registry, 1, |_: &EdgeEvent| -> anyhow::Result<()> {
            anyhow::bail!("sensor offline")
        });
        let panicking = active(&registry, 2, |_: &EdgeEvent| -> anyhow::Result<()> {
            panic!("consumer bug")
        });

        bridge.dispatch(1, 1, 5, erroring);
        bridge.dispatch(2, 0, 6, panicking);

        assert_eq!(bridge.stats().failed, 2);
        let first = failures.try_recv().unwrap();
        assert_eq!(first.handle, erroring);
        assert_eq!(first.message, "sensor offline");
        let second = failures.try_recv().unwrap();
        assert_eq!(second.pin, 2);
        assert!(second.message.contains("consumer bug"));

        let error: BridgeError = second.into();
        assert!(matches!(error, BridgeError::ConsumerCallbackFailed { .. }));
    }

    #[test]
    fn test_worker_delivery() {
        let (registry, bridge) = bridge(BridgeConfig::new());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handle = active(&registry, 27, move |event: &EdgeEvent| -> anyhow::Result<()> {
            tx.lock().unwrap().send(event.tick)?;
            Ok(())
        });

        bridge.dispatch(27, 1, 10, handle);
        bridge.dispatch(27, 0, 20, handle);

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((first, second), (Tick(10), Tick(20)));

        bridge.shutdown();
        assert_eq!(bridge.stats().delivered, 2);

        bridge.dispatch(27, 1, 30, handle);
        assert_eq!(bridge.stats().dropped_shutdown, 1);
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let (registry, bridge) = bridge(BridgeConfig::new().with_queue_capacity(1));
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let gate_rx = Mutex::new(gate_rx);
        let handle = active(&registry, 3, move |_: &EdgeEvent| -> anyhow::Result<()> {
            started_tx.lock().unwrap().send(())?;
            gate_rx.lock().unwrap().recv()?;
            Ok(())
        });

        bridge.dispatch(3, 1, 1, handle);
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Worker is busy: one event fits in the queue, the next is dropped.
        bridge.dispatch(3, 0, 2, handle);
        bridge.dispatch(3, 1, 3, handle);
        assert_eq!(bridge.stats().dropped_queue_full, 1);

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        bridge.shutdown();
        assert_eq!(bridge.stats().delivered, 2);
    }
}
