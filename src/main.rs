// Procvisor - Process Orchestrator
// Main entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use procvisor::config::Config;
use procvisor::signals::wait_for_shutdown_signal;
use procvisor::units::Registry;
use procvisor::version::{build_info, format_header};
use procvisor::Orchestrator;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "procvisor")]
#[command(author, about, long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Show version information
    #[arg(short = 'V', long)]
    version: bool,

    /// Show detailed build information
    #[arg(long)]
    build_info: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start all units and supervise them until SIGINT/SIGTERM (default)
    Run,
    /// Validate the config and print the start order
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version flag
    if cli.version {
        println!("{}", build_info().format_display());
        return Ok(());
    }

    // Handle build info flag
    if cli.build_info {
        println!("{}", build_info().format_display());
        println!("\n{}", build_info().format_build_info());
        return Ok(());
    }

    init_logging(cli.debug, cli.log_file.as_ref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cli.config).await,
        Command::Check => check(cli.config),
    }
}

fn init_logging(debug: bool, log_file: Option<&PathBuf>) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false) // Disable ANSI colors in log file
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(config_path)?;
    if config.units.is_empty() {
        tracing::warn!("No units configured; nothing to supervise");
    }

    tracing::info!("{}", format_header());
    let orchestrator = Orchestrator::new(config)?;

    let report = orchestrator
        .run(async {
            match wait_for_shutdown_signal().await {
                Ok(signal) => tracing::info!("Received {}, shutting down", signal),
                Err(e) => {
                    tracing::error!("Cannot listen for shutdown signals: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        })
        .await?;

    tracing::info!(
        "Procvisor exited ({} started, {} failed, {} blocked at startup)",
        report.started.len(),
        report.failed.len(),
        report.blocked.len()
    );
    Ok(())
}

fn check(config_path: Option<PathBuf>) -> Result<()> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };
    if !path.exists() {
        anyhow::bail!("Config file {} not found", path.display());
    }

    let config = Config::load(Some(path.clone()))?;
    let registry = Registry::new(config.units)?;
    let waves = registry.dependency_waves()?;

    println!("{}: {} units OK", path.display(), registry.len());
    for (i, wave) in waves.iter().enumerate() {
        println!("wave {}: {}", i + 1, wave.join(", "));
    }
    Ok(())
}
