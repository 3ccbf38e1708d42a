//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use gpio_edge_bridge::{BridgeConfig, Edge, PinId, Pull};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub watch: Vec<WatchConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: String,
    /// Path to libpigpiod_if2 (default: resolved by the dynamic loader)
    pub library: Option<PathBuf>,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> String {
    "8888".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            library: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WatchConfig {
    pub pin: PinId,
    #[serde(default = "default_edge")]
    pub edge: Edge,
    pub pull: Option<Pull>,
    pub watchdog_ms: Option<u32>,
}

fn default_edge() -> Edge {
    Edge::Either
}

impl AppConfig {
    /// Add a watch, replacing any existing entry for the same pin
    pub fn upsert_watch(&mut self, watch: WatchConfig) {
        self.watch.retain(|existing| existing.pin != watch.pin);
        self.watch.push(watch);
    }

    /// Reject configurations the bridge would refuse later on
    pub fn validate(&self) -> Result<()> {
        let mut pins = HashSet::new();
        for watch in &self.watch {
            if !pins.insert(watch.pin) {
                bail!("GPIO {} is listed more than once in [[watch]]", watch.pin);
            }
        }
        self.bridge.validate().context("Invalid [bridge] section")?;
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {:?}", path))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpio_edge_bridge::DispatchMode;
    use std::io::Write;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [daemon]
            address = "raspberrypi.local"

            [bridge]
            dispatch_mode = "inline"
            drain_timeout_ms = 250

            [[watch]]
            pin = 17
            edge = "rising"
            pull = "up"

            [[watch]]
            pin = 27
            watchdog_ms = 500
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.daemon.address, "raspberrypi.local");
        assert_eq!(config.daemon.port, "8888");
        assert_eq!(config.bridge.dispatch_mode, DispatchMode::Inline);
        assert_eq!(config.bridge.drain_timeout_ms, 250);
        assert_eq!(config.bridge.queue_capacity, 1024);
        assert_eq!(config.watch.len(), 2);
        assert_eq!(config.watch[0].edge, Edge::Rising);
        assert_eq!(config.watch[0].pull, Some(Pull::Up));
        assert_eq!(config.watch[1].edge, Edge::Either);
        assert_eq!(config.watch[1].watchdog_ms, Some(500));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.daemon.address, "127.0.0.1");
        assert!(config.daemon.library.is_none());
        assert_eq!(config.bridge.dispatch_mode, DispatchMode::Worker);
        assert!(config.watch.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_duplicate_pins_rejected() {
        let mut config = AppConfig::default();
        config.watch.push(WatchConfig {
            pin: 4,
            edge: Edge::Either,
            pull: None,
            watchdog_ms: None,
        });
        config.watch.push(WatchConfig {
            pin: 4,
            edge: Edge::Rising,
            pull: None,
            watchdog_ms: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upsert_replaces_existing_pin() {
        let mut config = AppConfig::default();
        config.upsert_watch(WatchConfig {
            pin: 4,
            edge: Edge::Either,
            pull: None,
            watchdog_ms: None,
        });
        config.upsert_watch(WatchConfig {
            pin: 4,
            edge: Edge::Falling,
            pull: Some(Pull::Down),
            watchdog_ms: None,
        });
        assert_eq!(config.watch.len(), 1);
        assert_eq!(config.watch[0].edge, Edge::Falling);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[watch]]\npin = 22\nedge = \"falling\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.watch[0].pin, 22);
        assert_eq!(config.watch[0].edge, Edge::Falling);
    }

    #[test]
    fn test_load_config_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[watch]]\npin = \"seventeen\"").unwrap();

        let err = load_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_worker_queue_must_hold_events() {
        let config: AppConfig = toml::from_str("[bridge]\nqueue_capacity = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("queue_capacity"));

        let config: AppConfig =
            toml::from_str("[bridge]\ndispatch_mode = \"inline\"\nqueue_capacity = 0").unwrap();
        config.validate().unwrap();
    }
}
