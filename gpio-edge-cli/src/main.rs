//! GPIO Edge Monitor CLI
//!
//! Command-line front end for the gpio-edge-bridge library:
//! - Connects to pigpiod (or an in-process simulated daemon)
//! - Configures pull resistors and watchdogs
//! - Subscribes to edges on one or more pins
//! - Prints every event with its tick delta and a dispatch summary on exit

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gpio_edge_bridge::{
    ConnectionPool, Edge, EdgeEvent, EdgeSubscriber, GpioDaemon, GpioMode, PinId, Pull,
    SimulatedDaemon, DEFAULT_LIBRARY,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

mod config;
mod monitor;

use config::{AppConfig, WatchConfig};
use monitor::{EdgeMonitor, OutputFormat};

/// Wake-ups for the main thread while it waits for events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Edge,
    Interrupted,
}

/// Interval between simulated level changes
const SIMULATION_PERIOD: Duration = Duration::from_millis(200);

/// GPIO Edge Monitor - Print edge events from pigpiod
#[derive(Parser, Debug)]
#[command(name = "gpio-edge-cli")]
#[command(about = "Subscribe to GPIO edge events and print them", long_about = None)]
#[command(version)]
struct Args {
    /// Daemon host name or address
    #[arg(long, value_name = "HOST")]
    address: Option<String>,

    /// Daemon port
    #[arg(long, value_name = "PORT")]
    port: Option<String>,

    /// Path to libpigpiod_if2
    #[arg(long, value_name = "FILE")]
    library: Option<PathBuf>,

    /// GPIO to watch (can be repeated)
    #[arg(short, long = "pin", value_name = "GPIO")]
    pins: Vec<PinId>,

    /// Edge to watch on the --pin GPIOs
    #[arg(short, long, value_enum, default_value_t = EdgeArg::Either)]
    edge: EdgeArg,

    /// Pull resistor for the --pin GPIOs
    #[arg(long, value_enum)]
    pull: Option<PullArg>,

    /// Report a no-change event after this many quiet milliseconds
    #[arg(long, value_name = "MS")]
    watchdog_ms: Option<u32>,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use an in-process simulated daemon that toggles the watched pins
    #[arg(long)]
    simulate: bool,

    /// Exit after this many events
    #[arg(long, value_name = "COUNT")]
    count: Option<u64>,

    /// Exit after this many seconds
    #[arg(long, value_name = "SECS")]
    duration_secs: Option<u64>,

    /// Print events and the summary as JSON lines
    #[arg(long)]
    json: bool,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EdgeArg {
    Rising,
    Falling,
    Either,
}

impl From<EdgeArg> for Edge {
    fn from(arg: EdgeArg) -> Self {
        match arg {
            EdgeArg::Rising => Edge::Rising,
            EdgeArg::Falling => Edge::Falling,
            EdgeArg::Either => Edge::Either,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PullArg {
    Off,
    Down,
    Up,
}

impl From<PullArg> for Pull {
    fn from(arg: PullArg) -> Self {
        match arg {
            PullArg::Off => Pull::Off,
            PullArg::Down => Pull::Down,
            PullArg::Up => Pull::Up,
        }
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("GPIO Edge Monitor v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using bridge library v{}", gpio_edge_bridge::VERSION);

    let config = build_config(&args)?;
    if config.watch.is_empty() {
        println!("GPIO Edge Monitor - No pins specified");
        println!("\nQuick Start:");
        println!("  gpio-edge-cli --pin 17 --edge rising");
        println!("  gpio-edge-cli --simulate --pin 17 --pin 27 --count 10");
        println!("\nWith a configuration file:");
        println!("  gpio-edge-cli --config config.toml");
        println!("\nUse --help for more options");
        return Ok(());
    }

    run(&args, &config)
}

/// Merge the config file (if any) with command-line overrides
fn build_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    if let Some(address) = &args.address {
        config.daemon.address = address.clone();
    }
    if let Some(port) = &args.port {
        config.daemon.port = port.clone();
    }
    if let Some(library) = &args.library {
        config.daemon.library = Some(library.clone());
    }
    for &pin in &args.pins {
        config.upsert_watch(WatchConfig {
            pin,
            edge: args.edge.into(),
            pull: args.pull.map(Pull::from),
            watchdog_ms: args.watchdog_ms,
        });
    }

    config.validate()?;
    Ok(config)
}

fn run(args: &Args, config: &AppConfig) -> Result<()> {
    let simulation = args.simulate.then(|| Arc::new(SimulatedDaemon::new()));
    let daemon: Arc<dyn GpioDaemon> = match &simulation {
        Some(simulated) => {
            log::info!("Using simulated daemon");
            simulated.clone() as Arc<dyn GpioDaemon>
        }
        None => {
            let library = config
                .daemon
                .library
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LIBRARY));
            let pool = ConnectionPool::new(&library);
            let daemon = pool
                .connect(&config.daemon.address, &config.daemon.port)
                .with_context(|| {
                    format!(
                        "Failed to connect to pigpiod at {}:{}",
                        config.daemon.address, config.daemon.port
                    )
                })?;
            log::info!(
                "Connected to pigpiod at {} (client v{})",
                daemon.endpoint(),
                daemon.client_version()
            );
            daemon as Arc<dyn GpioDaemon>
        }
    };

    let subscriber = EdgeSubscriber::new(daemon, &config.bridge)?;
    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let monitor = Arc::new(EdgeMonitor::new(format));

    let (tx, rx) = mpsc::channel::<Wake>();
    let mut subscriptions = Vec::with_capacity(config.watch.len());
    for watch in &config.watch {
        configure_pin(&subscriber, watch)?;

        let monitor = Arc::clone(&monitor);
        let tx = Mutex::new(tx.clone());
        let subscription = subscriber
            .subscribe(watch.pin, watch.edge, move |event: &EdgeEvent| -> anyhow::Result<()> {
                monitor.record(event)?;
                // Main thread may already be gone during shutdown.
                let _ = tx.lock().map(|tx| tx.send(Wake::Edge));
                Ok(())
            })
            .with_context(|| format!("Failed to subscribe to GPIO {}", watch.pin))?;
        subscriptions.push(subscription);
    }
    spawn_interrupt_listener(tx)?;

    let stop = Arc::new(AtomicBool::new(false));
    let simulator = simulation.map(|simulated| {
        let pins = config.watch.iter().map(|watch| watch.pin).collect();
        spawn_simulation(simulated, pins, Arc::clone(&stop))
    });

    wait_for_events(&rx, args.count, args.duration_secs.map(Duration::from_secs));

    stop.store(true, Ordering::Relaxed);
    if let Some(simulator) = simulator {
        if simulator.join().is_err() {
            log::error!("Simulation thread panicked");
        }
    }

    for subscription in subscriptions {
        let pin = subscription.pin();
        if let Err(e) = subscription.unsubscribe() {
            log::warn!("Failed to unsubscribe GPIO {}: {}", pin, e);
        }
    }
    subscriber.bridge().shutdown();

    if !args.quiet {
        monitor.summary(&subscriber.stats())?;
    }
    Ok(())
}

/// Apply the per-pin settings from a [[watch]] entry
fn configure_pin(subscriber: &EdgeSubscriber, watch: &WatchConfig) -> Result<()> {
    subscriber
        .set_mode(watch.pin, GpioMode::Input)
        .with_context(|| format!("Failed to set GPIO {} as input", watch.pin))?;
    if let Some(pull) = watch.pull {
        subscriber
            .set_pull(watch.pin, pull)
            .with_context(|| format!("Failed to set pull on GPIO {}", watch.pin))?;
    }
    if let Some(timeout_ms) = watch.watchdog_ms {
        subscriber
            .set_watchdog(watch.pin, timeout_ms)
            .with_context(|| format!("Failed to set watchdog on GPIO {}", watch.pin))?;
    }
    log::debug!("Configured GPIO {} ({:?})", watch.pin, watch);
    Ok(())
}

/// Send `Wake::Interrupted` on Ctrl-C so the normal shutdown path runs
fn spawn_interrupt_listener(tx: mpsc::Sender<Wake>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;

    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || match runtime.block_on(tokio::signal::ctrl_c()) {
            Ok(()) => {
                log::info!("Interrupted; unsubscribing");
                let _ = tx.send(Wake::Interrupted);
            }
            Err(e) => log::warn!("Cannot listen for Ctrl-C: {}", e),
        })
        .context("Failed to spawn Ctrl-C listener")?;
    Ok(())
}

/// Block until `count` events arrived, `duration` elapsed, Ctrl-C was
/// pressed, or every subscription went away
fn wait_for_events(rx: &mpsc::Receiver<Wake>, count: Option<u64>, duration: Option<Duration>) {
    let deadline = duration.map(|duration| Instant::now() + duration);
    let mut seen = 0u64;

    loop {
        if count.is_some_and(|limit| seen >= limit) {
            break;
        }
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => break,
            },
            None => Duration::from_secs(60),
        };
        match rx.recv_timeout(wait) {
            Ok(Wake::Edge) => seen += 1,
            Ok(Wake::Interrupted) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("Stopped waiting after {} event(s)", seen);
}

/// Toggle the watched pins round-robin until `stop` is set
fn spawn_simulation(
    daemon: Arc<SimulatedDaemon>,
    pins: Vec<PinId>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut step: u32 = 0;
        while !stop.load(Ordering::Relaxed) {
            let pin = pins[step as usize % pins.len()];
            // Irregular but deterministic spacing between edges.
            let elapsed_us = 1_000 + step.wrapping_mul(7_919) % 50_000;
            daemon.toggle(pin, elapsed_us);
            step = step.wrapping_add(1);
            thread::sleep(SIMULATION_PERIOD);
        }
    })
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
