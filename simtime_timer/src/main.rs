//! # simtime runner
//!
//! Drives one calibrated clock channel from a synthetic simulation loop so
//! the calibration and idle behaviour can be observed on the real host.
//!
//! The loop owns a remaining-cycle counter and a small event queue holding
//! one idle-tolerant clock event. Every iteration either "executes" one
//! simulated cycle or idles the host; every clock event recalibrates the
//! channel and reschedules itself with the returned delay. On exit the final
//! channel state is printed as JSON.

use clap::Parser;
use serde::Serialize;
use simtime_common::consts::DEFAULT_CONFIG_PATH;
use simtime_common::prelude::*;
use simtime_timer::config::{SimtimeConfig, load_config};
use simtime_timer::{
    ChannelSnapshot, EventQueue, HostClock, IdleControl, MonotonicClock, TimerSubsystem, UnitFlags,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Unit id of the calibrated clock in the runner's event queue.
const CLOCK_UNIT: u8 = 0;

/// Event queue capacity.
const QUEUE_SLOTS: usize = 8;

/// simtime: clock calibration and idle detection runner
#[derive(Parser, Debug)]
#[command(name = "simtime")]
#[command(version)]
#[command(about = "Paces a simulated clock against wall time and idles the host when possible")]
struct Args {
    /// Path to the runner configuration TOML.
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Wall-clock run duration [s].
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// Enable idling with this stability threshold [s].
    #[arg(long, value_name = "SECS", conflicts_with = "no_idle")]
    idle: Option<u32>,

    /// Disable idling even if the configuration enables it.
    #[arg(long)]
    no_idle: bool,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

/// Counters collected by the loop.
#[derive(Debug, Default, Serialize)]
struct RunStats {
    ticks: u64,
    idles: u64,
    cycles: u64,
}

/// Final report printed on exit.
#[derive(Debug, Serialize)]
struct RunReport {
    service: String,
    idle: String,
    sleep_resolution_ms: u32,
    stats: RunStats,
    channel: Option<ChannelSnapshot>,
}

fn main() {
    let args = Args::parse();
    let loaded = match load_config(&args.config) {
        Ok(config) => Ok(Some(config)),
        Err(ConfigError::FileNotFound) => Ok(None),
        Err(e) => Err(e),
    };
    let log_level = match &loaded {
        Ok(Some(config)) => config.shared.log_level,
        _ => LogLevel::default(),
    };
    setup_tracing(&args, log_level);

    let config = match loaded {
        Ok(Some(config)) => config,
        Ok(None) => {
            warn!("No config at '{}', using defaults", args.config.display());
            SimtimeConfig::default()
        }
        Err(e) => {
            error!("FATAL: {e}");
            process::exit(1);
        }
    };

    info!("{} v{} starting...", config.shared.service_name, env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args, config) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("simtime shutdown complete");
}

fn run(args: &Args, mut config: SimtimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(secs) = args.idle {
        config.idle.enabled = true;
        config.idle.stability_secs = secs;
    }
    if args.no_idle {
        config.idle.enabled = false;
    }

    let channel = config.timer.channel;
    let ticks_per_second = config.timer.ticks_per_second;

    let mut sys = TimerSubsystem::new(MonotonicClock::new())
        .with_sleep_ceiling(config.idle.max_sleep_resolution_ms);
    let supported = sys.timer_startup();
    info!(
        "Host sleep resolution {}ms (idle {})",
        sys.idle().sleep_resolution(),
        if supported { "available" } else { "unavailable" }
    );

    if config.idle.enabled {
        if let Err(e) = sys.idle_enable(Some(config.idle.stability_secs)) {
            warn!("{e}. Continuing without idle.");
        }
    }
    info!("{}", sys.idle_status());

    // Setup signal handler for graceful shutdown.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut queue: EventQueue<QUEUE_SLOTS> = EventQueue::new();
    let delay = sys.timer_init(config.timer.initial_delay, channel);
    queue.schedule(CLOCK_UNIT, UnitFlags::IDLE | UnitFlags::CLOCK, delay)?;
    let mut remaining = cycles_to_next(&queue);

    info!(
        "Channel {channel} at {ticks_per_second} Hz, initial delay {delay}, running {}s",
        args.seconds
    );

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let start_ms = sys.clock().now_ms();
    let mut stats = RunStats::default();

    loop {
        if remaining <= 0 {
            let Some(event) = queue.pop_next() else {
                break;
            };
            if event.unit == CLOCK_UNIT {
                stats.ticks += 1;
                let delay = sys.timer_calibrate(ticks_per_second, channel);
                queue.schedule(CLOCK_UNIT, event.flags, delay)?;
                if !running.load(Ordering::SeqCst) || Instant::now() >= deadline {
                    break;
                }
            }
            remaining = cycles_to_next(&queue);
            continue;
        }

        if sys.idle_tick(channel, true, &queue, &mut remaining) {
            stats.idles += 1;
        } else {
            stats.cycles += 1;
        }
    }

    let wall_ms = sys.clock().now_ms().wrapping_sub(start_ms);
    info!(
        "{} ticks in {wall_ms}ms wall ({} idles, {} cycles)",
        stats.ticks, stats.idles, stats.cycles
    );

    let report = build_report(&config.shared.service_name, &sys, channel, stats);
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn build_report<C: HostClock>(
    service: &str,
    sys: &TimerSubsystem<C>,
    channel: usize,
    stats: RunStats,
) -> RunReport {
    RunReport {
        service: service.to_string(),
        idle: sys.idle_status(),
        sleep_resolution_ms: sys.idle().sleep_resolution(),
        stats,
        channel: sys.snapshot(channel),
    }
}

/// Cycles until the next queued event, as the loop's signed counter.
fn cycles_to_next<const N: usize>(queue: &EventQueue<N>) -> i32 {
    queue
        .cycles_to_next()
        .map_or(0, |cycles| cycles.min(i32::MAX as u64) as i32)
}

/// Setup tracing subscriber based on CLI arguments and configured level.
fn setup_tracing(args: &Args, configured: LogLevel) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        match configured {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
