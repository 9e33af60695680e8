//! CLI Entry Point for dic_daq
//!
//! Provides command-line interface for:
//! - Running an acquisition experiment (real controller or simulated rig)
//! - Validating a configuration file
//! - Listing serial ports for controller auto-detection
//!
//! # Usage
//!
//! Run an experiment:
//! ```bash
//! dic_daq run --config config/experiment.toml
//! dic_daq run --config config/experiment.toml --simulate --yes
//! ```
//!
//! Check a configuration:
//! ```bash
//! dic_daq check-config --config config/experiment.toml
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dic_daq::cancel::cancel_pair;
use dic_daq::config::ExperimentConfig;
use dic_daq::experiment::{Experiment, HardwareMode, Rig, StartGate};
use dic_daq::report::{FileReportSink, TerminationReason};
use dic_daq::status::StatusLine;
use std::path::{Path, PathBuf};
use tokio::signal;

#[derive(Parser)]
#[command(name = "dic_daq")]
#[command(about = "Signal-synchronized multi-camera acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment until its run budget is spent or Ctrl+C
    Run {
        /// Experiment configuration file (TOML format)
        #[arg(long)]
        config: PathBuf,

        /// Simulate the controller, the robot and the cameras
        #[arg(long)]
        simulate: bool,

        /// Use the real controller but simulated cameras
        #[arg(long, conflicts_with = "simulate")]
        simulate_cameras: bool,

        /// Start without the start/quit prompt
        #[arg(long)]
        yes: bool,
    },

    /// Validate a configuration file and print the resolved settings
    CheckConfig {
        /// Experiment configuration file (TOML format)
        #[arg(long)]
        config: PathBuf,
    },

    /// List serial ports (controller auto-detection candidates)
    ListPorts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            simulate,
            simulate_cameras,
            yes,
        } => {
            let mode = if simulate {
                HardwareMode::Simulated
            } else if simulate_cameras {
                HardwareMode::SimulatedCameras
            } else {
                HardwareMode::Physical
            };
            run_experiment(config, mode, yes).await
        }
        Commands::CheckConfig { config } => check_config(config),
        Commands::ListPorts => list_ports(),
    }
}

fn load_config(path: &Path) -> Result<ExperimentConfig> {
    let config = ExperimentConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn run_experiment(path: PathBuf, mode: HardwareMode, skip_prompt: bool) -> Result<()> {
    let config = load_config(&path)?;
    dic_daq::logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let (cancel, token) = cancel_pair();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current step");
            interrupt.cancel();
        }
    });

    let rig = match Rig::open(&config, mode).await {
        Ok(rig) => rig,
        Err(e) if mode == HardwareMode::Physical => {
            eprintln!("No camera driver is available in this build.");
            eprintln!("Use --simulate, or --simulate-cameras to test the controller handshake.");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    let sink = Box::new(FileReportSink::new(config.base_folder()));
    let experiment = Experiment::prepare(config, rig, sink)
        .await?
        .with_status_line(StatusLine::for_stdout());

    let gate = if skip_prompt {
        StartGate::Immediate
    } else {
        StartGate::stdin()
    };
    let outcome = experiment.run(gate, &token).await;

    for file in &outcome.report_files {
        println!("Report: {}", file.display());
    }
    match outcome.termination {
        TerminationReason::Failed { error } => Err(anyhow::anyhow!(error)),
        _ => Ok(()),
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    println!("Configuration OK: {}", path.display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("Output folder: {}", config.base_folder().display());
    match config.run_budget() {
        Some(runs) => println!("Runs: {runs}"),
        None => println!("Runs: until interrupted"),
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = dic_daq::hardware::firmata::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match port.vendor_id {
            Some(vid) => println!(
                "{}  VID={:04x} PID={:04x}  {}",
                port.name,
                vid,
                port.product_id.unwrap_or(0),
                port.product.as_deref().unwrap_or("")
            ),
            None => println!("{}", port.name),
        }
    }
    Ok(())
}
