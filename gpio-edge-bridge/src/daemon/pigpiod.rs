//! pigpiod client backend
//!
//! Talks to a running pigpio daemon through libpigpiod_if2. Edge callbacks
//! arrive on the library's notification thread and enter Rust through
//! [`edge_trampoline`], which forwards them to the [`EdgeSink`] recorded in
//! the native userdata.
//!
//! The userdata is a boxed [`TrampolineContext`] holding only the registry
//! handle and the sink; no consumer state crosses the boundary. pigpiod_if2
//! may still be running a callback when `callback_cancel` returns, so a
//! cancelled context is retired rather than freed and only released when the
//! connection is closed (pigpio_stop joins the notification thread).

use super::pigpiod_ffi::PigpiodLibrary;
use super::{EdgeSink, GpioDaemon, WatchId};
use crate::types::{BridgeError, Edge, GpioMode, Handle, Level, PinId, Pull, Result};
use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::raw::{c_int, c_uint, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Client library name resolved through the dynamic loader
pub const DEFAULT_LIBRARY: &str = "libpigpiod_if2.so";

/// Retired contexts between backlog warnings
const RETIRED_WARN_THRESHOLD: usize = 1024;

/// Native userdata passed to `callback_ex`
struct TrampolineContext {
    handle: Handle,
    sink: Arc<dyn EdgeSink>,
}

/// Park a cancelled context until the connection closes; returns the backlog size
fn retire(retired: &Mutex<Vec<Box<TrampolineContext>>>, context: Box<TrampolineContext>) -> usize {
    let handle = context.handle;
    let mut retired = retired.lock().unwrap_or_else(PoisonError::into_inner);
    retired.push(context);
    let count = retired.len();

    log::debug!("Retired callback context for {} ({} held)", handle, count);
    if count % RETIRED_WARN_THRESHOLD == 0 {
        log::warn!(
            "{} cancelled callback contexts held until the pigpiod connection closes; \
             reconnect to release them",
            count
        );
    }
    count
}

/// Entry point for pigpiod_if2 edge callbacks.
///
/// Nothing may unwind out of this function: a panicking sink is caught and
/// logged here.
unsafe extern "C" fn edge_trampoline(
    pi: c_int,
    user_gpio: c_uint,
    level: c_uint,
    tick: u32,
    userdata: *mut c_void,
) {
    if userdata.is_null() {
        return;
    }
    // SAFETY: userdata is a live TrampolineContext; contexts are only freed
    // after the connection (and its notification thread) has stopped.
    let context = &*(userdata as *const TrampolineContext);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        context
            .sink
            .on_native_edge(pi, user_gpio, level, tick, context.handle)
    }));
    if result.is_err() {
        log::error!(
            "Edge sink panicked for {} (GPIO {}); event discarded",
            context.handle,
            user_gpio
        );
    }
}

/// One connection to a pigpio daemon
pub struct PigpiodDaemon {
    library: Arc<PigpiodLibrary>,
    pi: c_int,
    endpoint: String,
    watches: Mutex<HashMap<WatchId, Box<TrampolineContext>>>,
    retired: Mutex<Vec<Box<TrampolineContext>>>,
}

impl PigpiodDaemon {
    /// Load the client library and connect to `address:port`
    ///
    /// # Example
    /// ```no_run
    /// use gpio_edge_bridge::daemon::{PigpiodDaemon, DEFAULT_LIBRARY};
    ///
    /// let daemon = PigpiodDaemon::connect(DEFAULT_LIBRARY, "127.0.0.1", "8888").unwrap();
    /// println!("connected to {}", daemon.endpoint());
    /// ```
    pub fn connect(library: impl AsRef<OsStr>, address: &str, port: &str) -> Result<Self> {
        let library = Arc::new(PigpiodLibrary::load(library)?);
        Self::connect_with(library, address, port)
    }

    pub(crate) fn connect_with(
        library: Arc<PigpiodLibrary>,
        address: &str,
        port: &str,
    ) -> Result<Self> {
        let endpoint = endpoint(address, port);
        let c_address = CString::new(address)
            .map_err(|e| BridgeError::InvalidArgument(format!("daemon address: {}", e)))?;
        let c_port = CString::new(port)
            .map_err(|e| BridgeError::InvalidArgument(format!("daemon port: {}", e)))?;

        log::info!("Connecting to pigpiod at {}", endpoint);
        // SAFETY: both strings are valid NUL-terminated C strings.
        let pi = unsafe { (library.pigpio_start)(c_address.as_ptr(), c_port.as_ptr()) };
        if pi < 0 {
            return Err(BridgeError::DaemonUnavailable(format!(
                "failed to connect to pigpiod at {}: {}",
                endpoint,
                library.error_text(pi)
            )));
        }

        log::info!("Connected to pigpiod at {} (pi {})", endpoint, pi);
        Ok(Self {
            library,
            pi,
            endpoint,
            watches: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        })
    }

    /// `address:port` of the daemon
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Version of the loaded pigpiod_if2 client library
    pub fn client_version(&self) -> u32 {
        // SAFETY: no arguments, returns a constant.
        unsafe { (self.library.pigpiod_if_version)() }
    }

    /// Cancelled callback contexts waiting for the connection to close
    pub fn retired_contexts(&self) -> usize {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn check(&self, status: c_int, pin: Option<PinId>) -> Result<c_int> {
        if status < 0 {
            Err(self.library.status_error(status, pin))
        } else {
            Ok(status)
        }
    }
}

impl GpioDaemon for PigpiodDaemon {
    fn connection_id(&self) -> i32 {
        self.pi
    }

    fn start_watching(
        &self,
        pin: PinId,
        edge: Edge,
        sink: Arc<dyn EdgeSink>,
        context: Handle,
    ) -> Result<WatchId> {
        let context = Box::new(TrampolineContext {
            handle: context,
            sink,
        });
        let userdata = &*context as *const TrampolineContext as *mut c_void;

        // SAFETY: userdata stays valid until the connection is closed.
        let status = unsafe {
            (self.library.callback_ex)(self.pi, pin, edge.code(), edge_trampoline, userdata)
        };
        let watch = WatchId(self.check(status, Some(pin))? as u32);

        self.watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(watch, context);
        log::debug!("pigpiod callback {} watching GPIO {} ({} edge)", watch.0, pin, edge);
        Ok(watch)
    }

    fn stop_watching(&self, watch: WatchId) -> Result<()> {
        // SAFETY: plain integer argument.
        let status = unsafe { (self.library.callback_cancel)(watch.0) };

        let context = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&watch);
        if let Some(context) = context {
            retire(&self.retired, context);
        }

        self.check(status, None)?;
        log::debug!("pigpiod callback {} cancelled", watch.0);
        Ok(())
    }

    fn set_mode(&self, pin: PinId, mode: GpioMode) -> Result<()> {
        // SAFETY: plain integer arguments.
        let status = unsafe { (self.library.set_mode)(self.pi, pin, mode.code()) };
        self.check(status, Some(pin)).map(|_| ())
    }

    fn mode(&self, pin: PinId) -> Result<GpioMode> {
        // SAFETY: plain integer arguments.
        let status = unsafe { (self.library.get_mode)(self.pi, pin) };
        let code = self.check(status, Some(pin))?;
        GpioMode::from_code(code as u32).ok_or_else(|| BridgeError::Daemon {
            code,
            message: format!("unknown mode {} on GPIO {}", code, pin),
        })
    }

    fn set_pull(&self, pin: PinId, pull: Pull) -> Result<()> {
        // SAFETY: plain integer arguments.
        let status = unsafe { (self.library.set_pull_up_down)(self.pi, pin, pull.code()) };
        self.check(status, Some(pin)).map(|_| ())
    }

    fn read(&self, pin: PinId) -> Result<Level> {
        // SAFETY: plain integer arguments.
        let status = unsafe { (self.library.gpio_read)(self.pi, pin) };
        self.check(status, Some(pin)).map(|level| Level::from(level > 0))
    }

    fn write(&self, pin: PinId, level: Level) -> Result<()> {
        if level == Level::NoChange {
            return Err(BridgeError::InvalidArgument(
                "cannot write the watchdog level".to_string(),
            ));
        }
        // SAFETY: plain integer arguments.
        let status = unsafe { (self.library.gpio_write)(self.pi, pin, level.as_raw()) };
        self.check(status, Some(pin)).map(|_| ())
    }

    fn set_watchdog(&self, pin: PinId, timeout_ms: u32) -> Result<()> {
        // SAFETY: plain integer arguments.
        let status = unsafe { (self.library.set_watchdog)(self.pi, pin, timeout_ms) };
        self.check(status, Some(pin)).map(|_| ())
    }
}

impl Drop for PigpiodDaemon {
    fn drop(&mut self) {
        // SAFETY: pi came from a successful pigpio_start and is stopped once.
        unsafe { (self.library.pigpio_stop)(self.pi) };
        let active = self
            .watches
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let retired = self
            .retired
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        log::info!(
            "Disconnected from pigpiod at {} ({} active, {} retired callback contexts released)",
            self.endpoint,
            active,
            retired
        );
    }
}

fn endpoint(address: &str, port: &str) -> String {
    format!("{}:{}", address, port)
}

/// Shares one daemon connection per `address:port`.
///
/// A connection stays open while any returned `Arc` is alive and is closed
/// when the last one is dropped.
pub struct ConnectionPool {
    library_path: OsString,
    library: Mutex<Option<Arc<PigpiodLibrary>>>,
    connections: Mutex<HashMap<String, Weak<PigpiodDaemon>>>,
}

impl ConnectionPool {
    pub fn new(library_path: impl AsRef<OsStr>) -> Self {
        Self {
            library_path: library_path.as_ref().to_os_string(),
            library: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Return the open connection to `address:port`, or open one
    pub fn connect(&self, address: &str, port: &str) -> Result<Arc<PigpiodDaemon>> {
        let key = endpoint(address, port);
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(daemon) = connections.get(&key).and_then(Weak::upgrade) {
            log::debug!("Reusing pigpiod connection {}", key);
            return Ok(daemon);
        }

        let library = self.library()?;
        let daemon = Arc::new(PigpiodDaemon::connect_with(library, address, port)?);
        connections.retain(|_, existing| existing.strong_count() > 0);
        connections.insert(key, Arc::downgrade(&daemon));
        Ok(daemon)
    }

    /// Number of connections currently open through this pool
    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|daemon| daemon.strong_count() > 0)
            .count()
    }

    fn library(&self) -> Result<Arc<PigpiodLibrary>> {
        let mut library = self.library.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(library) = library.as_ref() {
            return Ok(Arc::clone(library));
        }
        let loaded = Arc::new(PigpiodLibrary::load(&self.library_path)?);
        *library = Some(Arc::clone(&loaded));
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(i32, PinId, u32, u32, Handle)>>,
    }

    impl EdgeSink for RecordingSink {
        fn on_native_edge(&self, connection: i32, pin: PinId, level: u32, tick: u32, context: Handle) {
            self.seen
                .lock()
                .unwrap()
                .push((connection, pin, level, tick, context));
        }
    }

    struct PanickingSink;

    impl EdgeSink for PanickingSink {
        fn on_native_edge(&self, _: i32, _: PinId, _: u32, _: u32, _: Handle) {
            panic!("sink failure");
        }
    }

    #[test]
    fn test_trampoline_forwards_context_handle() {
        let sink = Arc::new(RecordingSink::default());
        let context = Box::new(TrampolineContext {
            handle: Handle::from_raw(9),
            sink: sink.clone(),
        });
        let userdata = &*context as *const TrampolineContext as *mut c_void;

        unsafe { edge_trampoline(0, 17, 1, 1000, userdata) };

        let seen = sink.seen.lock().unwrap();
        assert_eq!(*seen, vec![(0, 17, 1, 1000, Handle::from_raw(9))]);
    }

    #[test]
    fn test_trampoline_contains_panics() {
        let context = Box::new(TrampolineContext {
            handle: Handle::from_raw(1),
            sink: Arc::new(PanickingSink),
        });
        let userdata = &*context as *const TrampolineContext as *mut c_void;

        // Must return normally instead of unwinding.
        unsafe { edge_trampoline(0, 4, 0, 5, userdata) };
        unsafe { edge_trampoline(0, 4, 0, 5, std::ptr::null_mut()) };
    }

    #[test]
    fn test_retired_contexts_accumulate() {
        let retired = Mutex::new(Vec::new());
        let sink: Arc<dyn EdgeSink> = Arc::new(RecordingSink::default());

        for raw in 1..=3 {
            let context = Box::new(TrampolineContext {
                handle: Handle::from_raw(raw),
                sink: Arc::clone(&sink),
            });
            assert_eq!(retire(&retired, context), raw as usize);
        }

        let retired = retired.into_inner().unwrap();
        let handles: Vec<Handle> = retired.iter().map(|context| context.handle).collect();
        assert_eq!(handles, (1..=3).map(Handle::from_raw).collect::<Vec<_>>());
    }

    #[test]
    fn test_connect_without_library() {
        let result = PigpiodDaemon::connect("/nonexistent/libpigpiod_if2.so", "127.0.0.1", "8888");
        assert!(matches!(result, Err(BridgeError::LibraryLoad(_))));

        let pool = ConnectionPool::new("/nonexistent/libpigpiod_if2.so");
        assert!(matches!(
            pool.connect("127.0.0.1", "8888"),
            Err(BridgeError::LibraryLoad(_))
        ));
        assert_eq!(pool.open_connections(), 0);
    }
}
