//! GPIO Edge Bridge Library
//!
//! Subscribes to edge events on a GPIO daemon (pigpiod or an in-process
//! simulation) and dispatches them to consumer callbacks.
//!
//! # Architecture
//!
//! - The daemon calls back on its own thread with `(pi, gpio, level, tick)`
//!   plus an opaque context. The context is never a pointer into consumer
//!   state: it is a [`Handle`] looked up in the [`CallbackRegistry`].
//! - The [`DispatchBridge`] resolves the handle, validates the notification
//!   and invokes the consumer, either inline on the daemon thread or on a
//!   dedicated worker thread behind a bounded queue.
//! - [`EdgeSubscription`] owns one registration and one daemon watch. After
//!   `unsubscribe` returns, late notifications for its handle are dropped.
//!
//! Consumer failures never reach the daemon thread: errors and panics are
//! contained, logged and counted.
//!
//! # Example Usage
//!
//! ```
//! use gpio_edge_bridge::{BridgeConfig, DispatchMode, Edge, EdgeEvent, EdgeSubscriber, SimulatedDaemon};
//! use std::sync::Arc;
//!
//! let daemon = Arc::new(SimulatedDaemon::new());
//! let config = BridgeConfig::new().with_dispatch_mode(DispatchMode::Inline);
//! let subscriber = EdgeSubscriber::new(daemon.clone(), &config).unwrap();
//!
//! let subscription = subscriber
//!     .subscribe(17, Edge::Either, |event: &EdgeEvent| -> anyhow::Result<()> {
//!         println!("GPIO {} -> {} at tick {}", event.pin, event.level, event.tick);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! daemon.toggle(17, 250);
//! assert_eq!(subscriber.stats().delivered, 1);
//!
//! subscription.unsubscribe().unwrap();
//! ```

// Public modules
pub mod callback;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod registry;
pub mod subscription;
pub mod types;

// Re-export main types for convenience
pub use callback::EdgeCallback;
pub use config::{BridgeConfig, DispatchMode};
pub use daemon::{
    ConnectionPool, EdgeSink, GpioDaemon, PigpiodDaemon, SimulatedDaemon, WatchId,
    DEFAULT_LIBRARY,
};
pub use dispatch::{DispatchBridge, DispatchFailure, DispatchStats};
pub use registry::{CallbackRegistry, Registration, RegistrationState, ResolvedRegistration};
pub use subscription::{EdgeSubscriber, EdgeSubscription};
pub use types::{
    BridgeError, Edge, EdgeEvent, GpioMode, Handle, Level, PinId, Pull, Result, Tick,
    Timestamp,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_subscriber_creation() {
        let daemon = Arc::new(SimulatedDaemon::new());
        let subscriber = EdgeSubscriber::new(daemon, &BridgeConfig::default()).unwrap();
        assert_eq!(subscriber.active_subscriptions(), 0);
        assert_eq!(subscriber.bridge().mode(), DispatchMode::Worker);
    }
}
