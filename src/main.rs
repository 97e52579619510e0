use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{Clock, Limiter, Sweeper, SystemClock};
use tollgate::simulate::{self, SimulationPlan};

/// Per-key token bucket admission control.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `tollgate=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a burst-pause-burst request pattern for one key
    Simulate(SimulateArgs),
    /// Validate the configuration and print the effective values
    CheckConfig,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Caller key to send every request under
    #[arg(long, default_value = "10")]
    key: String,

    /// Number of requests to send
    #[arg(long, default_value_t = 200)]
    requests: usize,

    /// Index of the request to pause before
    #[arg(long, default_value_t = 101)]
    pause_at: usize,

    /// Seconds to pause
    #[arg(long, default_value_t = 10.0)]
    pause_secs: f64,

    /// Maximum random delay between requests, in milliseconds
    #[arg(long, default_value_t = 0)]
    jitter_ms: u64,

    /// Print the full report as JSON instead of one line per request
    #[arg(long)]
    json: bool,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        let plan = SimulationPlan::default();
        Self {
            key: plan.key,
            requests: plan.requests,
            pause_at: plan.pause_at.unwrap_or(0),
            pause_secs: plan.pause.as_secs_f64(),
            jitter_ms: 0,
            json: false,
        }
    }
}

impl SimulateArgs {
    fn plan(&self) -> anyhow::Result<SimulationPlan> {
        let pause = Duration::try_from_secs_f64(self.pause_secs)
            .map_err(|e| anyhow::anyhow!("invalid --pause-secs {}: {}", self.pause_secs, e))?;

        Ok(SimulationPlan {
            key: self.key.clone(),
            requests: self.requests,
            pause_at: Some(self.pause_at),
            pause,
            jitter: Duration::from_millis(self.jitter_ms),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TollgateConfig::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.json = true;
    }

    init_tracing(&config.logging);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(Command::CheckConfig) => check_config(&config),
        Some(Command::Simulate(args)) => run_simulation(&config, &args).await,
        None => run_simulation(&config, &SimulateArgs::default()).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

fn check_config(config: &TollgateConfig) -> anyhow::Result<()> {
    let params = config.limiter.validate()?;

    print!("{}", serde_yaml::to_string(config)?);
    println!("# refill_per_sec: {}", params.refill_per_sec);
    println!("# idle_ttl_secs: {}", params.idle_ttl.as_secs_f64());

    info!("Configuration is valid");
    Ok(())
}

async fn run_simulation(config: &TollgateConfig, args: &SimulateArgs) -> anyhow::Result<()> {
    let plan = args.plan()?;

    let limiter: Arc<Limiter> = Arc::new(Limiter::new(config.limiter.clone())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let sweeper = config.sweeper.enabled.then(|| {
        Sweeper::start(limiter.clone(), clock.clone(), config.sweeper.interval())
    });

    let report = tokio::select! {
        report = simulate::run(&limiter, &plan, clock.as_ref()) => Some(report),
        _ = shutdown_signal() => None,
    };

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }

    let Some(report) = report else {
        warn!("Simulation interrupted before completion");
        return Ok(());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for outcome in &report.outcomes {
            println!("{} {}", outcome.index, outcome.allowed);
        }
        println!(
            "allowed={} denied={} tracked_keys={}",
            report.allowed,
            report.denied,
            limiter.len()
        );
    }

    info!("Tollgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
