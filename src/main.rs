use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::runtime::Runtime;

mod alarm;
mod config;
mod error;
mod hardware;
mod kiosk;
mod manager;
mod messages;
mod mqtt;
mod scanner;
mod shutdown;
mod storage;

/// Time left to blocking reads (stdin, serial port) once a node has stopped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Exit alarm for the device loan counter
#[derive(Parser, Debug)]
#[command(name = "loan-alarm", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Role {
    /// Read tags at the exit and publish them
    Rfid,
    /// Decide on alarms and drive the relay
    Alarm,
    /// Operator console: alerts, deactivation and loans
    Kiosk,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut logger = pretty_env_logger::formatted_timed_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => logger.parse_filters(&filters),
        Err(_) => logger.parse_filters(&args.log_level),
    };
    logger.init();

    let runtime = build_runtime().context("building tokio runtime")?;
    let result = runtime.block_on(run(args));
    shutdown_runtime(runtime);
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config_contents = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("reading {}", args.config))?;
    let config = config::AppConfig::from_toml(&config_contents)
        .with_context(|| format!("parsing {}", args.config))?;

    info!("Starting {:?} node, broker {}", args.role, config.mqtt.host);

    let manager = manager::Manager::new(config);
    match args.role {
        Role::Rfid => manager.run_rfid().await,
        Role::Alarm => manager.run_alarm().await,
        Role::Kiosk => manager.run_kiosk().await,
    }
}

fn build_runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

/// Stops the runtime without waiting on reads that can never be cancelled.
fn shutdown_runtime(runtime: Runtime) {
    let started = std::time::Instant::now();
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    if started.elapsed() >= SHUTDOWN_GRACE {
        warn!("Abandoned a blocking read at shutdown");
    }
}
