//! Edge event output
//!
//! Prints one line per event, in text or JSON, with the tick delta since the
//! previous event on the same pin.

use anyhow::Result;
use gpio_edge_bridge::{DispatchStats, EdgeEvent, Level, PinId, Tick};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct EventLine<'a> {
    #[serde(flatten)]
    event: &'a EdgeEvent,
    /// Microseconds since the previous event on this pin
    delta_us: Option<u32>,
}

#[derive(Serialize)]
struct SummaryLine<'a> {
    events: u64,
    #[serde(flatten)]
    stats: &'a DispatchStats,
}

/// Formats edge events and keeps per-pin tick history
pub struct EdgeMonitor {
    format: OutputFormat,
    last_tick: Mutex<HashMap<PinId, Tick>>,
    events: AtomicU64,
    out: Mutex<Box<dyn Write + Send>>,
}

impl EdgeMonitor {
    /// Monitor writing to stdout
    pub fn new(format: OutputFormat) -> Self {
        Self::with_writer(format, Box::new(io::stdout()))
    }

    pub fn with_writer(format: OutputFormat, out: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            last_tick: Mutex::new(HashMap::new()),
            events: AtomicU64::new(0),
            out: Mutex::new(out),
        }
    }

    /// Number of events recorded so far
    pub fn events_seen(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Print one event
    pub fn record(&self, event: &EdgeEvent) -> Result<()> {
        let delta = {
            let mut last_tick = self.last_tick.lock().unwrap_or_else(PoisonError::into_inner);
            last_tick
                .insert(event.pin, event.tick)
                .map(|previous| event.tick.since(previous))
        };

        let line = self.format_event(event, delta)?;
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{}", line)?;
        out.flush()?;

        self.events.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn format_event(&self, event: &EdgeEvent, delta: Option<u32>) -> Result<String> {
        match self.format {
            OutputFormat::Json => Ok(serde_json::to_string(&EventLine {
                event,
                delta_us: delta,
            })?),
            OutputFormat::Text => {
                let delta = match delta {
                    Some(us) => format!("{:>10}us", us),
                    None => format!("{:>12}", "-"),
                };
                let kind = if event.level == Level::NoChange {
                    " (watchdog)"
                } else {
                    ""
                };
                Ok(format!(
                    "{}  GPIO {:>2}  level {}  tick {:>10}  delta {}  {}{}",
                    event.received_at.format("%H:%M:%S%.6f"),
                    event.pin,
                    event.level,
                    event.tick,
                    delta,
                    event.handle,
                    kind
                ))
            }
        }
    }

    /// Print the dispatch summary
    pub fn summary(&self, stats: &DispatchStats) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        match self.format {
            OutputFormat::Json => {
                let line = serde_json::to_string(&SummaryLine {
                    events: self.events_seen(),
                    stats,
                })?;
                writeln!(out, "{}", line)?;
            }
            OutputFormat::Text => {
                writeln!(out)?;
                writeln!(out, "Edge events:    {}", self.events_seen())?;
                writeln!(out, "  delivered:    {}", stats.delivered)?;
                writeln!(out, "  failed:       {}", stats.failed)?;
                writeln!(out, "  unknown:      {}", stats.dropped_unknown)?;
                writeln!(out, "  invalid:      {}", stats.dropped_invalid)?;
                writeln!(out, "  queue full:   {}", stats.dropped_queue_full)?;
                writeln!(out, "  after stop:   {}", stats.dropped_shutdown)?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use gpio_edge_bridge::Handle;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn event(pin: PinId, level: Level, tick: u32) -> EdgeEvent {
        EdgeEvent {
            handle: Handle::from_raw(3),
            pin,
            level,
            tick: Tick(tick),
            received_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_text_output_tracks_delta_per_pin() {
        let buf = SharedBuf::default();
        let monitor = EdgeMonitor::with_writer(OutputFormat::Text, Box::new(buf.clone()));

        monitor.record(&event(17, Level::High, 1_000)).unwrap();
        monitor.record(&event(27, Level::High, 1_200)).unwrap();
        monitor.record(&event(17, Level::Low, 1_750)).unwrap();

        let lines = buf.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("12:30:00.000000  GPIO 17  level 1"));
        assert!(lines[0].contains("delta            -"));
        assert!(lines[2].contains("delta        750us"));
        assert!(lines[2].ends_with("#3"));
        assert_eq!(monitor.events_seen(), 3);
    }

    #[test]
    fn test_delta_across_tick_wraparound() {
        let buf = SharedBuf::default();
        let monitor = EdgeMonitor::with_writer(OutputFormat::Json, Box::new(buf.clone()));

        monitor.record(&event(5, Level::High, u32::MAX - 99)).unwrap();
        monitor.record(&event(5, Level::NoChange, 100)).unwrap();

        let lines = buf.lines();
        let second: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(second["delta_us"], 200);
        assert_eq!(second["level"], "no_change");
        assert_eq!(second["pin"], 5);
        assert_eq!(second["handle"], 3);

        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert!(first["delta_us"].is_null());
    }

    #[test]
    fn test_json_summary() {
        let buf = SharedBuf::default();
        let monitor = EdgeMonitor::with_writer(OutputFormat::Json, Box::new(buf.clone()));
        let stats = DispatchStats {
            delivered: 4,
            dropped_unknown: 1,
            ..Default::default()
        };

        monitor.summary(&stats).unwrap();
        let summary: serde_json::Value = serde_json::from_str(&buf.lines()[0]).unwrap();
        assert_eq!(summary["events"], 0);
        assert_eq!(summary["delivered"], 4);
        assert_eq!(summary["dropped_unknown"], 1);
    }
}
