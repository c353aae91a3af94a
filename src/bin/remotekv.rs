//! remotekv operator binary
//!
//! Loads and validates engine configuration and runs a self-check of the
//! engine against the in-process memory node.
//!
//! # Examples
//!
//! ```bash
//! # Print the effective configuration
//! remotekv --config remotekv.toml show-config
//!
//! # Write, read back and delete 10k keys from 8 threads
//! remotekv check --threads 8 --keys 10000 --value-size 200
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use remotekv::{Engine, EngineConfig, MemoryTransport, KEY_SIZE};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// remotekv - compute-side engine of a disaggregated key-value store
#[derive(Parser, Debug)]
#[command(name = "remotekv")]
#[command(version = remotekv::VERSION)]
#[command(about = "Compute-side engine of a disaggregated key-value store", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "REMOTEKV_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "REMOTEKV_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a write/read/delete pass against the in-process memory node
    Check(CheckArgs),

    /// Print the effective configuration as TOML
    ShowConfig,

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Keys written by each thread
    #[arg(short, long, default_value = "1000")]
    keys: usize,

    /// Largest value size in bytes; sizes cycle from 1 up to this
    #[arg(long, default_value = "200")]
    value_size: usize,

    /// Memory node address
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Memory node port
    #[arg(long, default_value = "7471")]
    port: u16,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_tracing(&cli)?;

    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Check(args) => check_command(config, args),
        Commands::ShowConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Version => {
            println!("remotekv {}", remotekv::VERSION);
            Ok(())
        }
    }
}

/// Compact stderr output plus a daily `remotekv.log` written off-thread
///
/// The returned guard flushes the file writer when dropped.
fn init_tracing(cli: &Cli) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&cli.log_dir)
        .with_context(|| format!("creating log directory {}", cli.log_dir.display()))?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(rolling::daily(&cli.log_dir, "remotekv.log"));

    // --log-level accepts full directives such as "remotekv=debug,warn"
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(!cli.no_color);
    let file = fmt::layer()
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(guard)
}

fn check_key(thread: usize, n: usize) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    key[..8].copy_from_slice(&(thread as u64).to_be_bytes());
    key[8..].copy_from_slice(&(n as u64).to_be_bytes());
    key
}

fn check_value(thread: usize, n: usize, max: usize) -> Vec<u8> {
    let len = 1 + (thread * 7 + n) % max.max(1);
    vec![(thread + n) as u8; len]
}

/// Check command - exercise the engine end to end
fn check_command(config: EngineConfig, args: CheckArgs) -> anyhow::Result<()> {
    if args.value_size > config.max_value_size {
        bail!(
            "--value-size {} exceeds configured max_value_size {}",
            args.value_size,
            config.max_value_size
        );
    }

    info!(version = %remotekv::VERSION, "remotekv self-check starting");
    let engine = Engine::new(config, Arc::new(MemoryTransport::new()))?;
    engine.start(&args.address, args.port)?;

    let started = Instant::now();
    let failures: usize = std::thread::scope(|s| {
        let workers: Vec<_> = (0..args.threads)
            .map(|thread| {
                let engine = &engine;
                let args = &args;
                s.spawn(move || -> remotekv::error::Result<usize> {
                    for n in 0..args.keys {
                        engine.write(&check_key(thread, n), &check_value(thread, n, args.value_size))?;
                    }
                    let mut mismatches = 0;
                    let mut buf = Vec::new();
                    for n in 0..args.keys {
                        let found = engine.read_into(&check_key(thread, n), &mut buf)?;
                        if !found || buf != check_value(thread, n, args.value_size) {
                            mismatches += 1;
                        }
                    }
                    Ok(mismatches)
                })
            })
            .collect();

        workers
            .into_iter()
            .map(|w| match w.join() {
                Ok(Ok(mismatches)) => mismatches,
                Ok(Err(e)) => {
                    error!(error = %e, "Worker failed");
                    args.keys
                }
                Err(_) => {
                    error!("Worker panicked");
                    args.keys
                }
            })
            .sum()
    });
    let elapsed = started.elapsed();

    let stats = engine.stats();
    info!(
        keys = stats.keys,
        pages = stats.pool.pages,
        slots_in_use = stats.pool.slots_in_use,
        cache_hit_rate = format_args!("{:.3}", stats.cache.hit_rate()),
        evictions = stats.cache.evictions,
        elapsed_ms = elapsed.as_millis() as u64,
        "Write/read pass complete"
    );

    for thread in 0..args.threads {
        for n in 0..args.keys {
            engine.delete(&check_key(thread, n))?;
        }
    }
    let remaining = engine.len();
    engine.stop()?;

    if failures > 0 || remaining > 0 {
        bail!(
            "self-check failed: {} mismatched reads, {} keys left after delete",
            failures,
            remaining
        );
    }
    println!(
        "ok: {} keys across {} threads in {:?}",
        args.threads * args.keys,
        args.threads,
        elapsed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_writes_daily_log_file() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("remotekv_logs_{}", std::process::id()));
        let cli = Cli::try_parse_from([
            "remotekv",
            "--log-dir",
            dir.to_str().context("temp dir is not UTF-8")?,
            "--log-level",
            "remotekv=debug,warn",
            "version",
        ])?;

        let guard = init_tracing(&cli)?;
        info!("log file check");
        drop(guard);

        let written = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name().to_string_lossy().starts_with("remotekv.log"));
        assert!(written);

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }
}
