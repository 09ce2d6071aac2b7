//! # Main: CLI Entry Point
//!
//! Routes subcommands to the worker pool, the dashboard and the local test
//! tools. Handles the shared concerns: `.env` loading, logging setup and
//! the rayon thread pool.
//!
//! ## Subcommands
//!
//! - `run`: start the worker pool and render progress until Ctrl-C/SIGTERM.
//! - `dashboard`: serve the local control plane.
//! - `selftest`: verify the arithmetic on exponents with known verdicts.
//! - `test <p>`: one-off Lucas–Lehmer verdict for 2^p − 1.
//! - `login`: validate and persist the username.
//!
//! ## Global Options
//!
//! - `--server` / `MERSENNE_SERVER`: coordinator base URL.
//! - `--username` / `MERSENNE_USERNAME`: credited user id.
//! - `--config`: config file (default `~/.mersenne/config.toml`).
//! - `--slots`, `--mode`: pool size and operating mode.
//! - `--backoff-secs`, `--max-errors`: worker failure policy.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mersenne_client::pool::PoolMode;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "mersenne-client",
    about = "Distributed Lucas-Lehmer worker for Mersenne prime search"
)]
struct Cli {
    /// Coordinator base URL (overrides the config file)
    #[arg(long, env = "MERSENNE_SERVER")]
    server: Option<String>,

    /// User id credited with results (overrides the config file)
    #[arg(long, env = "MERSENNE_USERNAME")]
    username: Option<String>,

    /// Path to the TOML config file (default: ~/.mersenne/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of worker slots (default: config file, else all cores)
    #[arg(long)]
    slots: Option<usize>,

    /// Pool mode: one task per slot, or one task shared by all slots
    #[arg(long, value_enum, default_value_t = PoolMode::Independent)]
    mode: PoolMode,

    /// Base back-off in seconds; the wait grows linearly with consecutive failures
    #[arg(long, default_value_t = 10)]
    backoff_secs: u64,

    /// Consecutive failures after which a slot stops permanently
    #[arg(long, default_value_t = 700)]
    max_errors: u32,

    /// Rayon thread pool size for the self test (0 = all cores)
    #[arg(long)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, test and submit tasks until interrupted
    Run,
    /// Serve the local control dashboard
    Dashboard {
        /// Port to listen on
        #[arg(long, default_value_t = 5000)]
        port: u16,
    },
    /// Verify both test paths against exponents with known verdicts
    Selftest {
        /// Pipeline stages per exponent
        #[arg(long, default_value_t = 4)]
        units: usize,
    },
    /// Test a single exponent locally (nothing is submitted)
    Test {
        /// Exponent p of 2^p - 1
        exponent: u64,
        /// Run through the range pipeline with this many stages
        #[arg(long)]
        units: Option<usize>,
    },
    /// Save the username to the config file
    Login {
        #[arg(long)]
        username: String,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for log shipping, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    cli::configure_rayon(cli.threads);

    match &cli.command {
        Commands::Run => cli::run_pool(&cli),
        Commands::Dashboard { port } => cli::run_dashboard(&cli, *port),
        Commands::Selftest { units } => cli::run_selftest(*units),
        Commands::Test { exponent, units } => cli::run_test(*exponent, *units),
        Commands::Login { username } => cli::run_login(&cli, username),
    }
}
