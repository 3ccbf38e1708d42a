//! Runtime bindings to libpigpiod_if2
//!
//! The client library is opened with `libloading` so the bridge builds and
//! runs on hosts without pigpio installed; only `PigpiodDaemon::connect`
//! needs the library.

use crate::types::{BridgeError, PinId, Result};
use libloading::Library;
use std::ffi::{CStr, OsStr};
use std::os::raw::{c_char, c_int, c_uint, c_void};

/// `CBFuncEx_t`: (pi, user_gpio, level, tick, userdata)
pub type CallbackFn =
    unsafe extern "C" fn(pi: c_int, user_gpio: c_uint, level: c_uint, tick: u32, userdata: *mut c_void);

type PigpioStartFn = unsafe extern "C" fn(addr: *const c_char, port: *const c_char) -> c_int;
type PigpioStopFn = unsafe extern "C" fn(pi: c_int);
type CallbackExFn = unsafe extern "C" fn(
    pi: c_int,
    user_gpio: c_uint,
    edge: c_uint,
    f: CallbackFn,
    userdata: *mut c_void,
) -> c_int;
type CallbackCancelFn = unsafe extern "C" fn(callback_id: c_uint) -> c_int;
type PinArgFn = unsafe extern "C" fn(pi: c_int, gpio: c_uint, arg: c_uint) -> c_int;
type PinFn = unsafe extern "C" fn(pi: c_int, gpio: c_uint) -> c_int;
type ErrorFn = unsafe extern "C" fn(errnum: c_int) -> *const c_char;
type VersionFn = unsafe extern "C" fn() -> c_uint;

// pigpio.h status codes
pub const PI_BAD_USER_GPIO: c_int = -2;
pub const PI_BAD_GPIO: c_int = -3;

// pigpiod_if2.h status codes
pub const PIGIF_BAD_SEND: c_int = -2000;
pub const PIGIF_BAD_NOIB: c_int = -2005;
pub const PIGIF_DUPLICATE_CALLBACK: c_int = -2006;
pub const PIGIF_BAD_MALLOC: c_int = -2007;
pub const PIGIF_UNCONNECTED_PI: c_int = -2011;
pub const PIGIF_TOO_MANY_PIS: c_int = -2012;

/// Loaded libpigpiod_if2 entry points
///
/// The function pointers stay valid for as long as `_library` is alive.
pub struct PigpiodLibrary {
    pub pigpio_start: PigpioStartFn,
    pub pigpio_stop: PigpioStopFn,
    pub callback_ex: CallbackExFn,
    pub callback_cancel: CallbackCancelFn,
    pub set_mode: PinArgFn,
    pub get_mode: PinFn,
    pub set_pull_up_down: PinArgFn,
    pub gpio_read: PinFn,
    pub gpio_write: PinArgFn,
    pub set_watchdog: PinArgFn,
    pub pigpio_error: ErrorFn,
    pub pigpiod_if_version: VersionFn,
    _library: Library,
}

macro_rules! symbol {
    ($library:expr, $name:literal, $ty:ty) => {
        *$library
            .get::<$ty>(concat!($name, "\0").as_bytes())
            .map_err(|e| BridgeError::LibraryLoad(format!("missing symbol {}: {}", $name, e)))?
    };
}

impl PigpiodLibrary {
    /// Open the client library and resolve every symbol the bridge uses
    pub fn load(path: impl AsRef<OsStr>) -> Result<Self> {
        let path = path.as_ref();
        // SAFETY: libpigpiod_if2 has no library constructors with
        // preconditions; symbols are checked against the signatures above.
        unsafe {
            let library = Library::new(path).map_err(|e| {
                BridgeError::LibraryLoad(format!("{}: {}", path.to_string_lossy(), e))
            })?;

            // Copy the pointers out before `library` moves into the struct.
            let pigpio_start = symbol!(library, "pigpio_start", PigpioStartFn);
            let pigpio_stop = symbol!(library, "pigpio_stop", PigpioStopFn);
            let callback_ex = symbol!(library, "callback_ex", CallbackExFn);
            let callback_cancel = symbol!(library, "callback_cancel", CallbackCancelFn);
            let set_mode = symbol!(library, "set_mode", PinArgFn);
            let get_mode = symbol!(library, "get_mode", PinFn);
            let set_pull_up_down = symbol!(library, "set_pull_up_down", PinArgFn);
            let gpio_read = symbol!(library, "gpio_read", PinFn);
            let gpio_write = symbol!(library, "gpio_write", PinArgFn);
            let set_watchdog = symbol!(library, "set_watchdog", PinArgFn);
            let pigpio_error = symbol!(library, "pigpio_error", ErrorFn);
            let pigpiod_if_version = symbol!(library, "pigpiod_if_version", VersionFn);

            Ok(Self {
                pigpio_start,
                pigpio_stop,
                callback_ex,
                callback_cancel,
                set_mode,
                get_mode,
                set_pull_up_down,
                gpio_read,
                gpio_write,
                set_watchdog,
                pigpio_error,
                pigpiod_if_version,
                _library: library,
            })
        }
    }

    /// Human-readable text for a daemon status code
    pub fn error_text(&self, code: c_int) -> String {
        // SAFETY: pigpio_error returns a pointer to a static string table.
        unsafe {
            let ptr = (self.pigpio_error)(code);
            if ptr.is_null() {
                return String::from("Unknown error");
            }
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }

    /// Map a negative daemon status to a bridge error
    pub fn status_error(&self, code: c_int, pin: Option<PinId>) -> BridgeError {
        status_to_error(code, pin, self.error_text(code))
    }
}

/// Map a negative daemon status and its message to a bridge error
pub fn status_to_error(code: c_int, pin: Option<PinId>, message: String) -> BridgeError {
    match code {
        PI_BAD_USER_GPIO | PI_BAD_GPIO => match pin {
            Some(pin) => BridgeError::InvalidPin(pin),
            None => BridgeError::Daemon { code, message },
        },
        PIGIF_BAD_NOIB..=PIGIF_BAD_SEND | PIGIF_UNCONNECTED_PI => {
            BridgeError::DaemonUnavailable(message)
        }
        PIGIF_DUPLICATE_CALLBACK => match pin {
            Some(pin) => BridgeError::AlreadySubscribed(pin),
            None => BridgeError::Daemon { code, message },
        },
        PIGIF_BAD_MALLOC | PIGIF_TOO_MANY_PIS => BridgeError::ResourceExhausted(message),
        _ => BridgeError::Daemon { code, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_to_error(PI_BAD_USER_GPIO, Some(40), String::new()),
            BridgeError::InvalidPin(40)
        ));
        assert!(matches!(
            status_to_error(-2003, Some(4), "connect failed".into()),
            BridgeError::DaemonUnavailable(_)
        ));
        assert!(matches!(
            status_to_error(PIGIF_UNCONNECTED_PI, None, String::new()),
            BridgeError::DaemonUnavailable(_)
        ));
        assert!(matches!(
            status_to_error(PIGIF_DUPLICATE_CALLBACK, Some(17), String::new()),
            BridgeError::AlreadySubscribed(17)
        ));
        assert!(matches!(
            status_to_error(PIGIF_TOO_MANY_PIS, None, String::new()),
            BridgeError::ResourceExhausted(_)
        ));
        assert!(matches!(
            status_to_error(-41, Some(4), String::new()),
            BridgeError::Daemon { code: -41, .. }
        ));
    }

    #[test]
    fn test_load_missing_library() {
        let result = PigpiodLibrary::load("/nonexistent/libpigpiod_if2.so");
        assert!(matches!(result, Err(BridgeError::LibraryLoad(_))));
    }
}
