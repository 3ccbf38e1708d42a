//! In-process simulated GPIO daemon
//!
//! Behaves like a pigpio daemon with 54 GPIOs (0-31 watchable) and no
//! hardware behind it. Edges are delivered synchronously on the thread that
//! calls [`SimulatedDaemon::fire`] or [`SimulatedDaemon::toggle`], which
//! stands in for the daemon's notification thread.

use super::{EdgeSink, GpioDaemon, WatchId};
use crate::types::{BridgeError, Edge, GpioMode, Handle, Level, PinId, Pull, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Highest GPIO accepted for edge watches
pub const MAX_USER_GPIO: PinId = 31;
/// Highest GPIO accepted for mode and level operations
pub const MAX_GPIO: PinId = 53;

struct SimWatch {
    pin: PinId,
    edge: Edge,
    sink: Arc<dyn EdgeSink>,
    context: Handle,
}

#[derive(Debug, Clone, Copy)]
struct PinState {
    mode: GpioMode,
    pull: Pull,
    level: Level,
    watchdog_ms: u32,
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            mode: GpioMode::Input,
            pull: Pull::Off,
            level: Level::Low,
            watchdog_ms: 0,
        }
    }
}

struct SimState {
    available: bool,
    fail_next_start: Option<BridgeError>,
    next_watch: u32,
    watches: HashMap<WatchId, SimWatch>,
    pins: HashMap<PinId, PinState>,
    tick: u32,
}

/// A daemon that lives entirely in the current process
pub struct SimulatedDaemon {
    connection: i32,
    state: Mutex<SimState>,
}

impl SimulatedDaemon {
    pub fn new() -> Self {
        Self::with_connection_id(0)
    }

    pub fn with_connection_id(connection: i32) -> Self {
        Self {
            connection,
            state: Mutex::new(SimState {
                available: true,
                fail_next_start: None,
                next_watch: 0,
                watches: HashMap::new(),
                pins: HashMap::new(),
                tick: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn available(&self) -> Result<MutexGuard<'_, SimState>> {
        let state = self.state();
        if state.available {
            Ok(state)
        } else {
            Err(BridgeError::DaemonUnavailable(
                "simulated daemon connection lost".to_string(),
            ))
        }
    }

    /// Simulate losing (or regaining) the daemon connection
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Make the next `start_watching` call fail with `error`
    pub fn fail_next_start(&self, error: BridgeError) {
        self.state().fail_next_start = Some(error);
    }

    /// Number of active watches
    pub fn watch_count(&self) -> usize {
        self.state().watches.len()
    }

    /// Whether any watch is active on `pin`
    pub fn is_watching(&self, pin: PinId) -> bool {
        self.state().watches.values().any(|watch| watch.pin == pin)
    }

    /// Current simulated tick
    pub fn tick(&self) -> u32 {
        self.state().tick
    }

    /// Deliver a level change on `pin` at `tick` to every matching watch.
    ///
    /// Returns the number of sinks notified. Sinks run on the calling thread
    /// with no daemon lock held.
    pub fn fire(&self, pin: PinId, level: Level, tick: u32) -> usize {
        let targets: Vec<(Arc<dyn EdgeSink>, Handle)> = {
            let mut state = self.state();
            if !state.available {
                return 0;
            }
            state.tick = tick;
            if level != Level::NoChange {
                state.pins.entry(pin).or_default().level = level;
            }
            state
                .watches
                .values()
                .filter(|watch| watch.pin == pin && watch.edge.accepts(level))
                .map(|watch| (Arc::clone(&watch.sink), watch.context))
                .collect()
        };

        for (sink, context) in &targets {
            sink.on_native_edge(self.connection, pin, level.as_raw(), tick, *context);
        }
        targets.len()
    }

    /// Flip the level of `pin` after `elapsed_us` microseconds
    pub fn toggle(&self, pin: PinId, elapsed_us: u32) -> usize {
        let (level, tick) = {
            let state = self.state();
            let current = state.pins.get(&pin).copied().unwrap_or_default().level;
            let next = if current.is_high() { Level::Low } else { Level::High };
            (next, state.tick.wrapping_add(elapsed_us))
        };
        self.fire(pin, level, tick)
    }

    /// Emit a watchdog timeout on `pin` if a watchdog is configured
    pub fn expire_watchdog(&self, pin: PinId, elapsed_us: u32) -> usize {
        let tick = {
            let state = self.state();
            let watchdog = state.pins.get(&pin).map(|p| p.watchdog_ms).unwrap_or(0);
            if watchdog == 0 {
                return 0;
            }
            state.tick.wrapping_add(elapsed_us)
        };
        self.fire(pin, Level::NoChange, tick)
    }

    fn check_gpio(pin: PinId) -> Result<()> {
        if pin > MAX_GPIO {
            Err(BridgeError::InvalidPin(pin))
        } else {
            Ok(())
        }
    }
}

impl Default for SimulatedDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioDaemon for SimulatedDaemon {
    fn connection_id(&self) -> i32 {
        self.connection
    }

    fn start_watching(
        &self,
        pin: PinId,
        edge: Edge,
        sink: Arc<dyn EdgeSink>,
        context: Handle,
    ) -> Result<WatchId> {
        let mut state = self.available()?;
        if let Some(error) = state.fail_next_start.take() {
            return Err(error);
        }
        if pin > MAX_USER_GPIO {
            return Err(BridgeError::InvalidPin(pin));
        }

        state.next_watch += 1;
        let watch = WatchId(state.next_watch);
        state.watches.insert(
            watch,
            SimWatch {
                pin,
                edge,
                sink,
                context,
            },
        );
        Ok(watch)
    }

    fn stop_watching(&self, watch: WatchId) -> Result<()> {
        let mut state = self.available()?;
        match state.watches.remove(&watch) {
            Some(_) => Ok(()),
            None => Err(BridgeError::Daemon {
                code: -2010,
                message: format!("callback {} not found", watch.0),
            }),
        }
    }

    fn set_mode(&self, pin: PinId, mode: GpioMode) -> Result<()> {
        Self::check_gpio(pin)?;
        self.available()?.pins.entry(pin).or_default().mode = mode;
        Ok(())
    }

    fn mode(&self, pin: PinId) -> Result<GpioMode> {
        Self::check_gpio(pin)?;
        let state = self.available()?;
        Ok(state.pins.get(&pin).copied().unwrap_or_default().mode)
    }

    fn set_pull(&self, pin: PinId, pull: Pull) -> Result<()> {
        Self::check_gpio(pin)?;
        let mut state = self.available()?;
        let pin_state = state.pins.entry(pin).or_default();
        pin_state.pull = pull;
        // A floating input settles to its pull.
        if pin_state.mode == GpioMode::Input {
            match pull {
                Pull::Up => pin_state.level = Level::High,
                Pull::Down => pin_state.level = Level::Low,
                Pull::Off => {}
            }
        }
        Ok(())
    }

    fn read(&self, pin: PinId) -> Result<Level> {
        Self::check_gpio(pin)?;
        let state = self.available()?;
        Ok(state.pins.get(&pin).copied().unwrap_or_default().level)
    }

    fn write(&self, pin: PinId, level: Level) -> Result<()> {
        Self::check_gpio(pin)?;
        if level == Level::NoChange {
            return Err(BridgeError::InvalidArgument(
                "cannot write the watchdog level".to_string(),
            ));
        }
        let (changed, tick) = {
            let mut state = self.available()?;
            let pin_state = state.pins.entry(pin).or_default();
            pin_state.mode = GpioMode::Output;
            let changed = pin_state.level != level;
            (changed, state.tick.wrapping_add(1))
        };
        if changed {
            self.fire(pin, level, tick);
        }
        Ok(())
    }

    fn set_watchdog(&self, pin: PinId, timeout_ms: u32) -> Result<()> {
        if pin > MAX_USER_GPIO {
            return Err(BridgeError::InvalidPin(pin));
        }
        self.available()?.pins.entry(pin).or_default().watchdog_ms = timeout_ms;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(PinId, u32, u32, Handle)>>);

    impl EdgeSink for Collect {
        fn on_native_edge(&self, _connection: i32, pin: PinId, level: u32, tick: u32, context: Handle) {
            self.0.lock().unwrap().push((pin, level, tick, context));
        }
    }

    #[test]
    fn test_fire_respects_edge_filter() {
        let daemon = SimulatedDaemon::new();
        let sink = Arc::new(Collect::default());
        daemon
            .start_watching(17, Edge::Rising, sink.clone(), Handle::from_raw(1))
            .unwrap();

        assert_eq!(daemon.fire(17, Level::High, 100), 1);
        assert_eq!(daemon.fire(17, Level::Low, 200), 0);
        assert_eq!(daemon.fire(18, Level::High, 300), 0);

        assert_eq!(*sink.0.lock().unwrap(), vec![(17, 1, 100, Handle::from_raw(1))]);
    }

    #[test]
    fn test_stop_watching() {
        let daemon = SimulatedDaemon::new();
        let sink = Arc::new(Collect::default());
        let watch = daemon
            .start_watching(4, Edge::Either, sink.clone(), Handle::from_raw(2))
            .unwrap();
        assert!(daemon.is_watching(4));

        daemon.stop_watching(watch).unwrap();
        assert!(!daemon.is_watching(4));
        assert_eq!(daemon.fire(4, Level::High, 10), 0);
        assert!(daemon.stop_watching(watch).is_err());
    }

    #[test]
    fn test_invalid_pin_and_unavailable() {
        let daemon = SimulatedDaemon::new();
        let sink: Arc<dyn EdgeSink> = Arc::new(Collect::default());
        assert!(matches!(
            daemon.start_watching(40, Edge::Either, sink.clone(), Handle::from_raw(1)),
            Err(BridgeError::InvalidPin(40))
        ));
        assert!(matches!(daemon.set_mode(60, GpioMode::Input), Err(BridgeError::InvalidPin(60))));

        daemon.set_available(false);
        assert!(matches!(
            daemon.start_watching(4, Edge::Either, sink, Handle::from_raw(1)),
            Err(BridgeError::DaemonUnavailable(_))
        ));
    }

    #[test]
    fn test_pin_configuration() {
        let daemon = SimulatedDaemon::new();
        daemon.set_mode(22, GpioMode::Alt0).unwrap();
        assert_eq!(daemon.mode(22).unwrap(), GpioMode::Alt0);

        daemon.set_mode(23, GpioMode::Input).unwrap();
        daemon.set_pull(23, Pull::Up).unwrap();
        assert_eq!(daemon.read(23).unwrap(), Level::High);

        daemon.write(24, Level::High).unwrap();
        assert_eq!(daemon.mode(24).unwrap(), GpioMode::Output);
        assert_eq!(daemon.read(24).unwrap(), Level::High);
    }

    #[test]
    fn test_toggle_and_watchdog() {
        let daemon = SimulatedDaemon::new();
        let sink = Arc::new(Collect::default());
        daemon
            .start_watching(5, Edge::Either, sink.clone(), Handle::from_raw(3))
            .unwrap();

        daemon.toggle(5, 100);
        daemon.toggle(5, 50);
        assert_eq!(daemon.expire_watchdog(5, 10), 0);
        daemon.set_watchdog(5, 20).unwrap();
        assert_eq!(daemon.expire_watchdog(5, 20_000), 1);

        let seen = sink.0.lock().unwrap();
        let levels: Vec<u32> = seen.iter().map(|(_, level, _, _)| *level).collect();
        let ticks: Vec<u32> = seen.iter().map(|(_, _, tick, _)| *tick).collect();
        assert_eq!(levels, vec![1, 0, 2]);
        assert_eq!(ticks, vec![100, 150, 20_150]);
    }
}
