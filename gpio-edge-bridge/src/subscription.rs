//! Edge subscriptions
//!
//! [`EdgeSubscriber`] ties a daemon connection, a [`CallbackRegistry`] and a
//! [`DispatchBridge`] together. Each call to [`EdgeSubscriber::subscribe`]
//! yields an [`EdgeSubscription`] that owns one registry handle and one
//! daemon watch.

use crate::callback::EdgeCallback;
use crate::config::BridgeConfig;
use crate::daemon::{EdgeSink, GpioDaemon, WatchId};
use crate::dispatch::{DispatchBridge, DispatchStats};
use crate::registry::CallbackRegistry;
use crate::types::{Edge, GpioMode, Handle, Level, PinId, Pull, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Entry point for subscribing to edge events on one daemon connection
pub struct EdgeSubscriber {
    daemon: Arc<dyn GpioDaemon>,
    registry: Arc<CallbackRegistry>,
    bridge: Arc<DispatchBridge>,
    drain_timeout: Duration,
}

impl EdgeSubscriber {
    /// Create a subscriber with its own registry
    ///
    /// # Example
    /// ```
    /// use gpio_edge_bridge::{BridgeConfig, Edge, EdgeEvent, EdgeSubscriber, SimulatedDaemon};
    /// use std::sync::Arc;
    ///
    /// let daemon = Arc::new(SimulatedDaemon::new());
    /// let subscriber = EdgeSubscriber::new(daemon.clone(), &BridgeConfig::new()).unwrap();
    ///
    /// let subscription = subscriber
    ///     .subscribe(17, Edge::Rising, |event: &EdgeEvent| -> anyhow::Result<()> {
    ///         println!("GPIO {} went {} at tick {}", event.pin, event.level, event.tick);
    ///         Ok(())
    ///     })
    ///     .unwrap();
    ///
    /// daemon.toggle(17, 1000);
    /// subscription.unsubscribe().unwrap();
    /// ```
    pub fn new(daemon: Arc<dyn GpioDaemon>, config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(CallbackRegistry::with_max_handles(config.max_handles));
        Self::with_registry(daemon, registry, config)
    }

    /// Create a subscriber over an existing registry
    pub fn with_registry(
        daemon: Arc<dyn GpioDaemon>,
        registry: Arc<CallbackRegistry>,
        config: &BridgeConfig,
    ) -> Result<Self> {
        let bridge = Arc::new(DispatchBridge::new(Arc::clone(&registry), config)?);
        Ok(Self {
            daemon,
            registry,
            bridge,
            drain_timeout: config.drain_timeout(),
        })
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<DispatchBridge> {
        &self.bridge
    }

    pub fn daemon(&self) -> &Arc<dyn GpioDaemon> {
        &self.daemon
    }

    pub fn stats(&self) -> DispatchStats {
        self.bridge.stats()
    }

    /// Number of live subscriptions
    pub fn active_subscriptions(&self) -> usize {
        self.registry.len()
    }

    /// Subscribe `callback` to `edge` transitions on `pin`.
    ///
    /// The registration is rolled back if the daemon refuses the watch, so
    /// a failed call leaves the registry as it found it.
    pub fn subscribe(
        &self,
        pin: PinId,
        edge: Edge,
        callback: impl EdgeCallback,
    ) -> Result<EdgeSubscription> {
        let handle = self.registry.register(pin, edge, Arc::new(callback))?;
        let sink: Arc<dyn EdgeSink> = self.bridge.clone();

        let watch = match self.daemon.start_watching(pin, edge, sink, handle) {
            Ok(watch) => watch,
            Err(e) => {
                self.registry.rollback(handle);
                log::warn!("Daemon refused watch on GPIO {}: {}", pin, e);
                return Err(e);
            }
        };

        if let Err(e) = self.registry.activate(handle) {
            // Handle was removed behind our back; don't leave the watch running.
            if let Err(stop) = self.daemon.stop_watching(watch) {
                log::warn!("Failed to stop orphaned watch on GPIO {}: {}", pin, stop);
            }
            return Err(e);
        }

        log::info!("Subscribed to {} edges on GPIO {} as {}", edge, pin, handle);
        Ok(EdgeSubscription {
            handle,
            pin,
            edge,
            watch,
            daemon: Arc::clone(&self.daemon),
            registry: Arc::clone(&self.registry),
            drain_timeout: self.drain_timeout,
            released: false,
        })
    }

    pub fn set_mode(&self, pin: PinId, mode: GpioMode) -> Result<()> {
        self.daemon.set_mode(pin, mode)
    }

    pub fn mode(&self, pin: PinId) -> Result<GpioMode> {
        self.daemon.mode(pin)
    }

    pub fn set_pull(&self, pin: PinId, pull: Pull) -> Result<()> {
        self.daemon.set_pull(pin, pull)
    }

    pub fn read(&self, pin: PinId) -> Result<Level> {
        self.daemon.read(pin)
    }

    pub fn write(&self, pin: PinId, level: Level) -> Result<()> {
        self.daemon.write(pin, level)
    }

    pub fn set_watchdog(&self, pin: PinId, timeout_ms: u32) -> Result<()> {
        self.daemon.set_watchdog(pin, timeout_ms)
    }
}

/// One active subscription.
///
/// Dropping it unsubscribes; call [`EdgeSubscription::unsubscribe`] to see
/// teardown errors.
pub struct EdgeSubscription {
    handle: Handle,
    pin: PinId,
    edge: Edge,
    watch: WatchId,
    daemon: Arc<dyn GpioDaemon>,
    registry: Arc<CallbackRegistry>,
    drain_timeout: Duration,
    released: bool,
}

impl EdgeSubscription {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn pin(&self) -> PinId {
        self.pin
    }

    pub fn edge(&self) -> Edge {
        self.edge
    }

    /// Stop the daemon watch, remove the registration and wait (up to the
    /// configured drain timeout) for in-flight callbacks to finish.
    ///
    /// Calling this from inside the subscription's own callback waits out
    /// the full drain timeout.
    pub fn unsubscribe(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Stop new events first, then cut the lookup.
        let stopped = self.daemon.stop_watching(self.watch);
        if let Err(e) = &stopped {
            log::warn!("Failed to stop watch on GPIO {} ({}): {}", self.pin, self.handle, e);
        }

        let registration = self.registry.unregister(self.handle)?;
        if !self.drain_timeout.is_zero() && !registration.drain(self.drain_timeout) {
            log::warn!(
                "{} still has {} in-flight callback(s) after {:?}",
                self.handle,
                registration.in_flight(),
                self.drain_timeout
            );
        }

        log::info!("Unsubscribed {} from GPIO {}", self.handle, self.pin);
        stopped
    }
}

impl Drop for EdgeSubscription {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Error while dropping subscription {}: {}", self.handle, e);
        }
    }
}

impl fmt::Debug for EdgeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeSubscription")
            .field("handle", &self.handle)
            .field("pin", &self.pin)
            .field("edge", &self.edge)
            .field("watch", &self.watch)
            .field("released", &self.released)
            .finish()
    }
}
