//! GPIO daemon boundary
//!
//! The daemon owns the hardware and calls back on its own thread whenever a
//! watched pin changes. This module describes that boundary as two traits:
//! [`GpioDaemon`] for the calls the bridge makes into the daemon, and
//! [`EdgeSink`] for the notifications the daemon makes back.

use crate::types::{Edge, GpioMode, Handle, Level, PinId, Pull, Result};
use std::sync::Arc;

pub mod pigpiod;
mod pigpiod_ffi; // libpigpiod_if2 symbol table (private module)
pub mod sim;

pub use pigpiod::{ConnectionPool, PigpiodDaemon, DEFAULT_LIBRARY};
pub use sim::SimulatedDaemon;

/// Daemon-assigned identifier of one active watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u32);

/// Receiver of native edge notifications.
///
/// Called on a daemon-owned thread with the raw values the daemon produced
/// and the opaque context handed to [`GpioDaemon::start_watching`]. Must
/// return quickly and must not panic.
pub trait EdgeSink: Send + Sync {
    fn on_native_edge(&self, connection: i32, pin: PinId, level: u32, tick: u32, context: Handle);
}

/// Operations the bridge needs from a GPIO daemon connection
pub trait GpioDaemon: Send + Sync {
    /// Daemon-side connection identifier (the pigpio `pi` number)
    fn connection_id(&self) -> i32;

    /// Start delivering edges on `pin` to `sink`, tagged with `context`
    fn start_watching(
        &self,
        pin: PinId,
        edge: Edge,
        sink: Arc<dyn EdgeSink>,
        context: Handle,
    ) -> Result<WatchId>;

    /// Stop a watch started by [`GpioDaemon::start_watching`]
    fn stop_watching(&self, watch: WatchId) -> Result<()>;

    fn set_mode(&self, pin: PinId, mode: GpioMode) -> Result<()>;

    fn mode(&self, pin: PinId) -> Result<GpioMode>;

    fn set_pull(&self, pin: PinId, pull: Pull) -> Result<()>;

    fn read(&self, pin: PinId) -> Result<Level>;

    fn write(&self, pin: PinId, level: Level) -> Result<()>;

    /// Emit a no-change notification when `pin` is quiet for `timeout_ms`
    /// (0 disables the watchdog)
    fn set_watchdog(&self, pin: PinId, timeout_ms: u32) -> Result<()>;
}
