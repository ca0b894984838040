//! figma-presence entrypoint.
//!
//! Keeps a Discord presence host in sync with whether Figma is running on
//! the local machine: a poll timer drives process detection, an
//! edge-triggered state machine decides when presence needs a publish or a
//! clear, and a reconnecting IPC session delivers it.
//!
//! ## Subcommands
//!
//! - `run`: foreground sync loop
//! - `check`: one-shot detection probe
//! - `setup`: write the configuration file

#![feature(unix_socket_peek)]

use clap::{Parser, Subcommand};
use tracing::error;

mod config;
mod detector;
mod logging;
mod payload;
mod session;
mod signals;
mod state_machine;
mod supervisor;

use config::Config;
use detector::{ProcessDetector, SystemProcessProbe};
use session::PresenceSession;
use supervisor::SyncSupervisor;

#[derive(Parser)]
#[command(name = "figma-presence")]
#[command(about = "Shows your Figma activity as Discord presence")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync loop in the foreground
    Run,

    /// Check once whether Figma is currently detected
    Check,

    /// Write the configuration file
    Setup {
        /// Presence host application id (from the Discord developer portal)
        #[arg(long)]
        client_id: String,

        /// First status line
        #[arg(long)]
        details: Option<String>,

        /// Second status line
        #[arg(long)]
        state: Option<String>,

        /// Poll interval in milliseconds
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Run => run(cli.debug),
        Commands::Check => check(cli.debug),
        Commands::Setup {
            client_id,
            details,
            state,
            poll_interval_ms,
        } => setup(cli.debug, client_id, details, state, poll_interval_ms),
    };
    std::process::exit(exit_code);
}

fn run(cli_debug: bool) -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            return 1;
        }
    };
    logging::init(cli_debug || config.debug);

    // A missing host id is a configuration fault; exit before any
    // connection attempt.
    if let Err(err) = config.validate() {
        error!(error = %err, "Invalid configuration");
        eprintln!("Error: {err}");
        return 1;
    }

    let shutdown = signals::install();
    let detector = ProcessDetector::new(Box::new(SystemProcessProbe::new()));
    let session = PresenceSession::new(&config.client_id);
    let mut supervisor = SyncSupervisor::new(config, detector, session, shutdown);

    match supervisor.run() {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "Failed to start presence sync");
            eprintln!("Error: {err}");
            1
        }
    }
}

fn check(debug: bool) -> i32 {
    logging::init(debug);
    let mut detector = ProcessDetector::new(Box::new(SystemProcessProbe::new()));
    detector.clear_cache();
    if detector.check() {
        println!("Figma is running");
        0
    } else {
        println!("Figma is not running");
        1
    }
}

fn setup(
    debug: bool,
    client_id: String,
    details: Option<String>,
    state: Option<String>,
    poll_interval_ms: Option<u64>,
) -> i32 {
    logging::init(debug);

    // Start from the existing file so setup can be re-run to adjust fields.
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            return 1;
        }
    };

    config.client_id = client_id;
    if let Some(details) = details {
        config.details = details;
    }
    if let Some(state) = state {
        config.state = state;
    }
    if let Some(interval) = poll_interval_ms {
        config.poll_interval_ms = interval;
    }

    match config.validate().and_then(|()| config.save()) {
        Ok(path) => {
            println!("Configuration written to {}", path.display());
            0
        }
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}
