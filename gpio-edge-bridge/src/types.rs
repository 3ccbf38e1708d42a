//! Core types for the GPIO edge bridge
//!
//! This module defines the values that cross the bridge: handles, edge
//! filters, levels, ticks and the normalized edge event handed to consumers,
//! plus the error type shared by every operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wall-clock timestamp type used for received events
pub type Timestamp = DateTime<Utc>;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Broadcom GPIO number as understood by the daemon
pub type PinId = u32;

/// Opaque token identifying one registration in a [`CallbackRegistry`].
///
/// Handles travel through the daemon as the native callback context instead
/// of a pointer to consumer state. Handle 0 is never issued.
///
/// [`CallbackRegistry`]: crate::registry::CallbackRegistry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Wrap a raw handle value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw value passed across the native boundary
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which transitions a subscription wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    /// Low to high
    Rising,
    /// High to low
    Falling,
    /// Any transition
    Either,
}

impl Edge {
    /// Daemon wire code (RISING_EDGE, FALLING_EDGE, EITHER_EDGE)
    pub fn code(self) -> u32 {
        match self {
            Edge::Rising => 0,
            Edge::Falling => 1,
            Edge::Either => 2,
        }
    }

    /// Whether a level reported by the daemon passes this filter
    ///
    /// Watchdog ticks are always accepted; the daemon emits them regardless
    /// of the requested edge.
    pub fn accepts(self, level: Level) -> bool {
        match (self, level) {
            (_, Level::NoChange) => true,
            (Edge::Either, _) => true,
            (Edge::Rising, Level::High) => true,
            (Edge::Falling, Level::Low) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Rising => write!(f, "rising"),
            Edge::Falling => write!(f, "falling"),
            Edge::Either => write!(f, "either"),
        }
    }
}

/// Pin level carried by an edge event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    High,
    /// Watchdog timeout: no transition happened within the watchdog period
    NoChange,
}

impl Level {
    /// Normalize a raw daemon level (0, 1 or 2 for a watchdog timeout)
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Level::Low),
            1 => Some(Level::High),
            2 => Some(Level::NoChange),
            _ => None,
        }
    }

    /// Raw daemon encoding of this level
    pub fn as_raw(self) -> u32 {
        match self {
            Level::Low => 0,
            Level::High => 1,
            Level::NoChange => 2,
        }
    }

    /// True for [`Level::High`]
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "0"),
            Level::High => write!(f, "1"),
            Level::NoChange => write!(f, "-"),
        }
    }
}

/// Daemon microsecond tick. Wraps roughly every 71.6 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tick(pub u32);

impl Tick {
    /// Microseconds elapsed since `earlier`, accounting for one wraparound
    pub fn since(self, earlier: Tick) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pin function as configured on the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioMode {
    Input,
    Output,
    Alt0,
    Alt1,
    Alt2,
    Alt3,
    Alt4,
    Alt5,
}

impl GpioMode {
    /// Daemon wire code (PI_INPUT, PI_OUTPUT, PI_ALT*)
    pub fn code(self) -> u32 {
        match self {
            GpioMode::Input => 0,
            GpioMode::Output => 1,
            GpioMode::Alt0 => 4,
            GpioMode::Alt1 => 5,
            GpioMode::Alt2 => 6,
            GpioMode::Alt3 => 7,
            GpioMode::Alt4 => 3,
            GpioMode::Alt5 => 2,
        }
    }

    /// Decode a daemon mode code
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(GpioMode::Input),
            1 => Some(GpioMode::Output),
            4 => Some(GpioMode::Alt0),
            5 => Some(GpioMode::Alt1),
            6 => Some(GpioMode::Alt2),
            7 => Some(GpioMode::Alt3),
            3 => Some(GpioMode::Alt4),
            2 => Some(GpioMode::Alt5),
            _ => None,
        }
    }
}

/// Internal pull resistor setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
    Off,
    Down,
    Up,
}

impl Pull {
    /// Daemon wire code (PI_PUD_OFF, PI_PUD_DOWN, PI_PUD_UP)
    pub fn code(self) -> u32 {
        match self {
            Pull::Off => 0,
            Pull::Down => 1,
            Pull::Up => 2,
        }
    }
}

/// A normalized edge notification, as seen by consumer callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeEvent {
    /// Registration the event was resolved through
    pub handle: Handle,
    /// GPIO that changed
    pub pin: PinId,
    /// New level, or the watchdog sentinel
    pub level: Level,
    /// Daemon tick at which the change was seen
    pub tick: Tick,
    /// Host time at which the bridge received the notification
    pub received_at: Timestamp,
}

/// Errors that can occur while subscribing, unsubscribing or dispatching
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("GPIO daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("Invalid pin: GPIO {0}")]
    InvalidPin(PinId),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("GPIO {0} already has an active subscription")]
    AlreadySubscribed(PinId),

    #[error("Registration not found: {0}")]
    NotFound(Handle),

    #[error("Consumer callback for {handle} failed: {message}")]
    ConsumerCallbackFailed { handle: Handle, message: String },

    #[error("Daemon error {code}: {message}")]
    Daemon { code: i32, message: String },

    #[error("Failed to load GPIO client library: {0}")]
    LibraryLoad(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
