// proxima: desktop proximity sensor
//
// Runs the sensing engine against the local Bluetooth adapter and logs what
// it sees. Cross-platform (macOS, Linux, Windows) through btleplug.

mod config;
mod delegate;
mod logging;
mod radio;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use proxima_core::{
    radio_channel, PayloadData, ReceiveOnlyTransmitter, ReceiverHandle, SensorReceiver,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "proxima")]
#[command(about = "Proxima: BLE proximity sensing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan and exchange payloads with nearby peers until Ctrl-C
    Start {
        /// Identity payload as hex, overriding the configured one
        #[arg(short, long)]
        payload: Option<String>,
        /// Also write JSON logs to the log directory
        #[arg(long)]
        log_file: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { payload, log_file } => cmd_start(payload, log_file).await,
        Commands::Config { action } => {
            logging::init("warn", None)?;
            cmd_config(action)
        }
    }
}

async fn cmd_start(payload: Option<String>, log_file: bool) -> Result<()> {
    let config = config::Config::load()?;

    let log_dir = if log_file {
        Some(logging::log_directory(
            config.log_dir.as_deref(),
            &config::Config::data_dir()?,
        ))
    } else {
        None
    };
    let _guard = logging::init(&config.log_level, log_dir.as_deref())?;

    let payload = match payload {
        Some(hex_payload) => {
            PayloadData::new(hex::decode(&hex_payload).context("Invalid payload hex")?)
        }
        None => config.payload()?,
    };

    println!("{}", "Proxima starting...".bold());
    println!();
    println!("Payload: {}", hex::encode(payload.as_bytes()).bright_cyan());
    println!(
        "Duty cycle: {}ms on / {}ms off",
        config.sensor.scan_on_ms, config.sensor.scan_off_ms
    );
    if let Some(dir) = &log_dir {
        println!("Logs: {}", dir.display().to_string().bright_cyan());
    }
    println!();

    let (link, feed) = radio_channel();
    let radio = Arc::new(radio::BtleRadio::open(link).await?);
    println!("{} Bluetooth adapter ready", "✓".green());

    let transmitter = Arc::new(ReceiveOnlyTransmitter::new(payload));
    let (mut receiver, handle) = SensorReceiver::new(config.sensor.clone(), radio, transmitter, feed)
        .context("Failed to create sensor receiver")?;
    let delegate = Arc::new(delegate::LoggingDelegate::new());
    receiver.add_delegate(delegate.clone());
    let task = receiver.spawn();

    println!("{} Sensor running (Ctrl-C to stop)", "✓".green());
    println!();

    let mut ticker = tokio::time::interval(Duration::from_secs(config.snapshot_interval_secs.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = log_snapshot(&handle).await {
                    warn!(error = %e, "Snapshot failed");
                    break;
                }
            }
        }
    }

    println!();
    println!("Shutting down...");
    if handle.shutdown().await.is_ok() {
        task.await.context("Sensor task panicked")?;
    }

    print_summary(&delegate);
    Ok(())
}

async fn log_snapshot(handle: &ReceiverHandle) -> Result<()> {
    let status = handle.status().await?;
    let records = handle.snapshot().await?;

    info!(
        scanner = ?status.scanner,
        cycles = status.cycles,
        peers = status.peers,
        anomalous = status.anomalous_sightings,
        "Registry snapshot"
    );
    if let Some(report) = status.last_dispatch {
        info!(
            attempted = report.attempted,
            completed = report.completed,
            timed_out = report.timed_out,
            failed = report.failed,
            deferred = report.deferred,
            "Last dispatch"
        );
    }
    for record in records {
        info!(
            peer = %record.identifier(),
            platform = %record.platform(),
            state = %record.connection_state(),
            rssi = ?record.rssi(),
            payload = ?record.payload().map(|p| p.short_name()),
            "Peer"
        );
    }
    Ok(())
}

fn print_summary(delegate: &delegate::LoggingDelegate) {
    let summary = delegate.summary();

    println!();
    println!("{}", "Peers seen".bold());
    if summary.is_empty() {
        println!("  {}", "(none)".dimmed());
        return;
    }
    for (peer, tally) in summary {
        let platform = tally
            .platform
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let rssi = tally
            .last_rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:<14} {:>8}  x{}  {}",
            peer.to_string().bright_cyan(),
            platform,
            rssi,
            tally.measurements,
            tally.payload.as_deref().unwrap_or("").bright_yellow()
        );
    }
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown or unset config key: {}", key),
        },

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<30} {}", key.bright_cyan(), value);
            }

            println!();
            println!(
                "Config file: {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }
    }

    Ok(())
}
