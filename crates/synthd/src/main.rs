//! synthd — the synthgrid scheduler daemon.
//!
//! Loads and validates scheduler configuration, and drives a simulated
//! generation engine under synthetic load to exercise admission control:
//! - Per-client rate limiting
//! - Cost budgeting and the bounded wait queue
//! - Queue and execution deadlines
//! - Transient-failure retries
//!
//! # Usage
//!
//! ```text
//! synthd check-config --config synthgrid.toml
//! synthd simulate --config synthgrid.toml --clients 4 --requests 8 --json
//! ```

mod sim;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use synthgrid_core::config::format_duration;
use synthgrid_core::SchedulerConfig;
use synthgrid_scheduler::{CostEstimator, Scheduler};

use crate::sim::{Load, SimulatedEngine};

#[derive(Parser)]
#[command(name = "synthd", about = "synthgrid scheduler daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate a config file, then print the effective settings.
    CheckConfig {
        /// Path to a TOML config. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run synthetic load against a simulated engine.
    Simulate {
        /// Path to a TOML config. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of concurrent clients.
        #[arg(long, default_value = "4")]
        clients: usize,

        /// Requests sent by each client.
        #[arg(long, default_value = "8")]
        requests: usize,

        /// Simulated time per denoising step in milliseconds.
        #[arg(long, default_value = "5")]
        step_delay_ms: u64,

        /// Inject a transient engine failure on every Nth engine call.
        #[arg(long)]
        fail_every: Option<u64>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::CheckConfig { config } => check_config(config.as_deref()),
        Command::Simulate {
            config,
            clients,
            requests,
            step_delay_ms,
            fail_every,
            json,
        } => {
            let load = Load {
                clients,
                requests_per_client: requests,
            };
            simulate(
                config.as_deref(),
                load,
                Duration::from_millis(step_delay_ms),
                fail_every,
                json,
            )
            .await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,synthd=debug,synthgrid=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SchedulerConfig> {
    let config = match path {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SchedulerConfig::default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn check_config(path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let estimator = CostEstimator::new(config.cost.clone(), config.scheduler.budget_capacity)
        .context("cost bounds exceed the budget")?;

    let s = &config.scheduler;
    println!("budget capacity:    {} units", s.budget_capacity);
    println!("worst-case cost:    {} units", estimator.worst_case());
    println!("queue capacity:     {}", s.queue_capacity);
    println!("engine pool size:   {}", s.pool_size);
    println!("queue timeout:      {}", format_duration(s.queue_timeout));
    println!("execution timeout:  {}", format_duration(s.execution_timeout));

    let r = &config.rate_limit;
    if r.enabled {
        let hourly = match r.requests_per_hour {
            0 => "unlimited".to_string(),
            n => n.to_string(),
        };
        println!(
            "rate limit:         burst {}, {}/min, {} per hour",
            r.burst, r.requests_per_minute, hourly
        );
    } else {
        println!("rate limit:         disabled");
    }
    println!();
    println!("{}", config.to_toml_string()?);
    Ok(())
}

async fn simulate(
    path: Option<&Path>,
    load: Load,
    step_delay: Duration,
    fail_every: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let engine = SimulatedEngine::new(step_delay, fail_every);
    let scheduler = Scheduler::new(config, engine)?;

    info!(
        clients = load.clients,
        requests_per_client = load.requests_per_client,
        step_delay_ms = step_delay.as_millis() as u64,
        "simulation starting"
    );

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run_reaper(shutdown_rx).await }
    });

    let mut run = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { sim::run(&scheduler, load).await }
    });

    // Ctrl-C stops admission; outstanding requests still resolve.
    let report = tokio::select! {
        report = &mut run => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, shutting down scheduler");
            scheduler.shutdown();
            run.await?
        }
    };

    let _ = shutdown_tx.send(true);
    let _ = reaper.await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("elapsed: {} ms", report.elapsed_ms);
        for (code, count) in &report.outcomes {
            println!("{code:<26} {count}");
        }
        let stats = &report.stats;
        println!();
        println!(
            "admitted {} | retries {} | rate limited {} | overloaded {}",
            stats.counters.admitted,
            stats.counters.retries,
            stats.counters.rejected_rate_limited,
            stats.counters.rejected_overloaded
        );
    }

    scheduler.shutdown();
    info!("synthd stopped");
    Ok(())
}
