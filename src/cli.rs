//! # CLI Execution Functions
//!
//! Execution logic for each subcommand, kept out of `main.rs`. Resolves the
//! effective settings (flags over config file over defaults) and hands plain
//! values to the library.

use anyhow::{Context, Result};
use mersenne_client::config::{self, ClientConfig};
use mersenne_client::coordinator::{Coordinator, HttpCoordinator};
use mersenne_client::dashboard::{self, AppState};
use mersenne_client::pool::{PoolConfig, WorkerPool};
use mersenne_client::progress::{self, ProgressReporter};
use mersenne_client::worker::WorkerSettings;
use mersenne_client::{is_probably_prime, lucas_lehmer, run_pipelined, selftest};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::Cli;

// ── Settings Resolution ─────────────────────────────────────────

fn config_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => config::default_path(),
    }
}

fn load_config(cli: &Cli) -> Result<(PathBuf, ClientConfig)> {
    let path = config_path(cli)?;
    let mut config = ClientConfig::load(&path)?;
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    if let Some(slots) = cli.slots {
        config.slots = slots;
    }
    if let Some(username) = &cli.username {
        config.username = Some(username.clone());
    }
    Ok((path, config))
}

fn worker_settings(cli: &Cli, user_id: &str) -> WorkerSettings {
    WorkerSettings {
        backoff_base: Duration::from_secs(cli.backoff_secs),
        max_consecutive_errors: cli.max_errors,
        ..WorkerSettings::new(user_id)
    }
}

// ── Worker Pool ─────────────────────────────────────────────────

/// Spawn a thread that raises `stop` on SIGINT/SIGTERM.
fn install_stop_handler(stop: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let sig_rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "signal handler runtime unavailable");
                return;
            }
        };
        sig_rt.block_on(async {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        tokio::select! {
                            _ = ctrl_c => {},
                            _ = sigterm.recv() => {},
                        }
                    }
                    Err(_) => {
                        let _ = ctrl_c.await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            stop.store(true, Ordering::Relaxed);
        });
    });
}

/// Run the pool with a progress reporter until interrupted or until every
/// slot has stopped on its own.
pub fn run_pool(cli: &Cli) -> Result<()> {
    let (path, mut config) = load_config(cli)?;
    let user_id = config.username.clone().ok_or_else(|| {
        anyhow::anyhow!("No username configured. Run `mersenne-client login --username NAME` or pass --username.")
    })?;
    config::validate_username(&user_id)?;
    if config.slots == 0 {
        anyhow::bail!("--slots must be at least 1");
    }

    let coordinator: Arc<dyn Coordinator> = Arc::new(HttpCoordinator::new(&config.server_url));
    if let Err(e) = coordinator.ping() {
        warn!(server = %config.server_url, error = %e, "coordinator probe failed, starting anyway");
    }

    info!(
        server = %config.server_url,
        user = %user_id,
        slots = config.slots,
        mode = %cli.mode,
        "mersenne client starting"
    );
    let pool = WorkerPool::start(
        PoolConfig {
            slots: config.slots,
            mode: cli.mode,
            settings: worker_settings(cli, &user_id),
        },
        coordinator,
    )?;
    let mut reporter =
        ProgressReporter::start(pool.shared(), user_id.clone(), progress::DEFAULT_INTERVAL);

    let stop = Arc::new(AtomicBool::new(false));
    install_stop_handler(Arc::clone(&stop));

    while !stop.load(Ordering::Relaxed) && !pool.is_finished() {
        std::thread::sleep(Duration::from_millis(200));
    }
    let interrupted = stop.load(Ordering::Relaxed);
    if interrupted {
        info!("shutdown requested, waiting for workers to reach a safe point");
    }

    reporter.stop();
    let summary = pool.shutdown();

    config.tasks_completed += summary.tasks_completed;
    if let Err(e) = config.save(&path) {
        warn!(path = %path.display(), error = %e, "failed to save config");
    }

    info!(
        tasks_completed = summary.tasks_completed,
        primes_found = summary.primes_found,
        lifetime_tasks = config.tasks_completed,
        "mersenne client finished"
    );
    if !interrupted && !summary.worker_errors.is_empty() {
        anyhow::bail!(
            "all worker slots stopped: {}",
            summary
                .worker_errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        );
    }
    Ok(())
}

// ── Dashboard ───────────────────────────────────────────────────

pub fn run_dashboard(cli: &Cli, port: u16) -> Result<()> {
    let (path, config) = load_config(cli)?;
    let coordinator: Arc<dyn Coordinator> = Arc::new(HttpCoordinator::new(&config.server_url));
    let user_id = config.username.clone().unwrap_or_default();
    let state = AppState::new(
        config,
        coordinator,
        Some(path),
        cli.mode,
        worker_settings(cli, &user_id),
    );
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(dashboard::run(port, state))
}

// ── Local Tools ─────────────────────────────────────────────────

pub fn run_selftest(units: usize) -> Result<()> {
    if units == 0 {
        anyhow::bail!("--units must be at least 1");
    }
    let report = selftest::run(units);
    let failures = report.failures();
    println!(
        "self test: {}/{} passed in {:.2}s",
        report.cases.len() - failures.len(),
        report.cases.len(),
        report.elapsed.as_secs_f64()
    );
    if !failures.is_empty() {
        for case in &failures {
            println!(
                "  M{}: expected {}, sequential {:?}, pipelined {:?}",
                case.exponent, case.expected, case.sequential, case.pipelined
            );
        }
        anyhow::bail!("self test failed for {} exponent(s)", failures.len());
    }
    Ok(())
}

pub fn run_test(exponent: u64, units: Option<usize>) -> Result<()> {
    if !is_probably_prime(exponent) {
        println!("M{} is composite (exponent is not prime)", exponent);
        return Ok(());
    }
    let started = Instant::now();
    let prime = match units {
        None => lucas_lehmer(exponent)?,
        Some(n) => run_pipelined(exponent, n, Duration::from_secs(24 * 60 * 60))?
            .verdict
            .is_prime(),
    };
    println!(
        "M{} is {} ({:.3}s)",
        exponent,
        if prime { "prime" } else { "composite" },
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

pub fn run_login(cli: &Cli, username: &str) -> Result<()> {
    let username = username.trim();
    config::validate_username(username)?;
    let path = config_path(cli)?;
    let mut config = ClientConfig::load(&path)?;
    config.username = Some(username.to_string());
    config
        .save(&path)
        .with_context(|| format!("saving {}", path.display()))?;
    println!("Logged in as {} (saved to {})", username, path.display());
    Ok(())
}

// ── Rayon Configuration ─────────────────────────────────────────

/// Configure the rayon global thread pool with an optional thread count.
pub fn configure_rayon(threads: Option<usize>) {
    let num_threads = threads.unwrap_or(0);
    if num_threads > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()
        {
            warn!(error = %e, "Could not configure rayon thread pool");
        }
    }
}
