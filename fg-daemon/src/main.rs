//! Fanguard Daemon (fanguardd)
//!
//! BMC thermal management service: fan presence detection, zone-based fan
//! control, and threshold-alarm shutdown protection over one shared bus
//! connection on a single-threaded cooperative runtime.
//!
//! # Signals
//! - SIGHUP: reload configuration (candidate built fully before swap)
//! - SIGUSR1: write a JSON state dump (flight recorder, zones, alarms)
//! - SIGTERM/SIGINT: orderly shutdown
//!
//! # Environment
//! - `FANGUARD_LOG`: log filter (trace, debug, info, warn, error)
//! - `FANGUARD_CONFIG_DIR` / `FANGUARD_PERSIST_DIR`: path overrides

mod reload;

use std::path::PathBuf;

use tracing::{error, info, warn};

use fg_core::constants::paths;
use fg_core::{BusFacade, Context, PowerSource, PowerState};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Options {
    config_dir: PathBuf,
    persist_dir: PathBuf,
    power_source: PowerSource,
}

fn print_help() {
    eprintln!("fanguardd {} - BMC thermal management daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    fanguardd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config-dir PATH    Configuration directory (default /etc/fanguard)");
    eprintln!("    -p, --persist-dir PATH   Persisted state directory (default /var/lib/fanguard)");
    eprintln!("    -s, --power-source SRC   Power signal: 'host' or 'pgood' (default host)");
    eprintln!("    -v, --version            Print version");
    eprintln!("    -h, --help               Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    FANGUARD_LOG             Log level (trace, debug, info, warn, error)");
}

fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        config_dir: paths::config_root(),
        persist_dir: paths::persist_root(),
        power_source: PowerSource::HostState,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                println!("fanguardd {}", VERSION);
                std::process::exit(0);
            }
            "-c" | "--config-dir" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config-dir requires a path argument");
                    std::process::exit(1);
                }
                options.config_dir = PathBuf::from(&args[i]);
            }
            "-p" | "--persist-dir" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --persist-dir requires a path argument");
                    std::process::exit(1);
                }
                options.persist_dir = PathBuf::from(&args[i]);
            }
            "-s" | "--power-source" => {
                i += 1;
                match args.get(i).map(|s| s.as_str()) {
                    Some("host") => options.power_source = PowerSource::HostState,
                    Some("pgood") => options.power_source = PowerSource::PGood,
                    other => {
                        eprintln!("Error: unknown power source {:?}", other);
                        std::process::exit(1);
                    }
                }
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    options
}

fn init_logging() {
    let log_level = std::env::var("FANGUARD_LOG").unwrap_or_else(|_| "info".to_string());

    // Prefer the systemd journal; fall back to stdout off-target.
    let mut use_journald = std::path::Path::new("/run/systemd/journal/socket").exists();

    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
                use_journald = false;
                tracing_subscriber::fmt()
                    .with_target(false)
                    .with_level(true)
                    .with_env_filter(&log_level)
                    .init();
            }
        }
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_level(true)
            .with_env_filter(&log_level)
            .init();
    }

    info!(
        "STARTUP: logging to {}",
        if use_journald { "systemd journal" } else { "stdout" }
    );
}

async fn write_state_dump(ctx: &Context, engines: &reload::Engines) {
    let dump = engines.snapshot(ctx).await;
    match serde_json::to_string_pretty(&dump) {
        Ok(json) => {
            if let Err(e) = std::fs::write(paths::DUMP_FILE, json) {
                error!(path = paths::DUMP_FILE, error = %e, "state dump write failed");
            } else {
                info!(path = paths::DUMP_FILE, "state dump written");
            }
        }
        Err(e) => error!(error = %e, "state dump serialization failed"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // A panic escaping a handler would tear down the loop with the fans in
    // an unknown state; log it loudly first.
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("PANIC at {}: {}", location, panic_info);
    }));

    let options = parse_args();

    init_logging();
    info!("STARTUP: fanguardd {} starting", VERSION);
    info!("STARTUP: config dir: {}", options.config_dir.display());
    info!("STARTUP: persist dir: {}", options.persist_dir.display());
    info!("STARTUP: PID: {}", std::process::id());

    // SAFETY: geteuid just returns the process's effective uid.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        warn!("not running as root; GPIO and sysfs access will degrade");
    }

    // No valid configuration on first boot is fatal.
    let configs = match reload::load_configs(&options.config_dir) {
        Ok(configs) => configs,
        Err(e) => {
            error!(error = %e, "initial configuration load failed");
            std::process::exit(1);
        }
    };

    let bus = BusFacade::new().await?;
    let power = PowerState::new(bus.clone(), options.power_source).await;
    let ctx = Context::new(bus, power);

    let mut engines = reload::Engines::build(&ctx, &configs, &options.persist_dir).await?;
    engines.start().await;
    info!("STARTUP: all subsystems running");

    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut sigusr1 =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                reload::reload(&ctx, &options.config_dir, &options.persist_dir, &mut engines).await;
            }
            _ = sigusr1.recv() => {
                info!("SIGUSR1: writing state dump");
                write_state_dump(&ctx, &engines).await;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM: shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT: shutting down");
                break;
            }
        }
    }

    engines.shutdown().await;
    ctx.power.shutdown().await;
    info!("SHUTDOWN: fanguardd terminated");
    Ok(())
}
