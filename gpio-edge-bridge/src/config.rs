//! Bridge configuration types
//!
//! This module defines the knobs of the dispatch layer. Connection details
//! (daemon address, client library) belong to whoever constructs the daemon
//! and are not part of this configuration.

use crate::types::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the dispatch bridge hands events to consumer callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Run the consumer directly on the daemon's notification thread
    Inline,
    /// Queue the event to a dedicated worker thread
    #[default]
    Worker,
}

/// Configuration for the edge bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Where consumer callbacks run
    #[serde(default)]
    pub dispatch_mode: DispatchMode,

    /// Capacity of the worker queue (worker mode only)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Largest handle the registry may issue
    #[serde(default = "default_max_handles")]
    pub max_handles: u32,

    /// How long `unsubscribe` waits for in-flight dispatches (0 = don't wait)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// Optional: keep consumer failures on a bounded queue of this size
    #[serde(default)]
    pub failure_queue_capacity: Option<usize>,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_handles() -> u32 {
    i32::MAX as u32
}

fn default_drain_timeout() -> u64 {
    1000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::default(),
            queue_capacity: default_queue_capacity(),
            max_handles: default_max_handles(),
            drain_timeout_ms: default_drain_timeout(),
            failure_queue_capacity: None,
        }
    }
}

impl BridgeConfig {
    /// Create a new bridge configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the dispatch mode
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Builder method: set the worker queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Builder method: limit the handle space
    pub fn with_max_handles(mut self, max_handles: u32) -> Self {
        self.max_handles = max_handles;
        self
    }

    /// Builder method: set the unsubscribe drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: enable the failure queue
    pub fn with_failure_queue(mut self, capacity: usize) -> Self {
        self.failure_queue_capacity = Some(capacity);
        self
    }

    /// Drain timeout as a `Duration`
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dispatch_mode == DispatchMode::Worker && self.queue_capacity == 0 {
            return Err(BridgeError::InvalidArgument(
                "queue_capacity must be at least 1 in worker mode".to_string(),
            ));
        }
        if self.max_handles == 0 {
            return Err(BridgeError::InvalidArgument(
                "max_handles must be at least 1".to_string(),
            ));
        }
        // Handles travel through the daemon as a C int.
        if self.max_handles > i32::MAX as u32 {
            return Err(BridgeError::InvalidArgument(format!(
                "max_handles must not exceed {}",
                i32::MAX
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_config_builder() {
        let config = BridgeConfig::new()
            .with_dispatch_mode(DispatchMode::Inline)
            .with_queue_capacity(16)
            .with_max_handles(8)
            .with_drain_timeout(Duration::from_millis(250))
            .with_failure_queue(4);

        assert_eq!(config.dispatch_mode, DispatchMode::Inline);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.max_handles, 8);
        assert_eq!(config.drain_timeout(), Duration::from_millis(250));
        assert_eq!(config.failure_queue_capacity, Some(4));
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.dispatch_mode, DispatchMode::Worker);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.max_handles, i32::MAX as u32);
        assert_eq!(config.drain_timeout_ms, 1000);
        assert!(config.failure_queue_capacity.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unusable_limits() {
        let empty_queue = BridgeConfig::new().with_queue_capacity(0);
        assert!(matches!(
            empty_queue.validate(),
            Err(BridgeError::InvalidArgument(msg)) if msg.contains("queue_capacity")
        ));

        // Inline mode never touches the queue.
        let inline = empty_queue.with_dispatch_mode(DispatchMode::Inline);
        inline.validate().unwrap();

        let no_handles = BridgeConfig::new().with_max_handles(0);
        assert!(matches!(
            no_handles.validate(),
            Err(BridgeError::InvalidArgument(msg)) if msg.contains("max_handles")
        ));

        let too_many = BridgeConfig::new().with_max_handles(u32::MAX);
        assert!(too_many.validate().is_err());
    }
}
