//! dbm-collectord - PostgreSQL query telemetry daemon.
//!
//! Plays the role of the agent check: invokes every collection job on a fixed
//! interval and lets each job run its routine at its own rate on the shared
//! worker pool. Metrics are logged through `tracing`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use dbm_telemetry::collector::pg::{ActivitySamplesJob, PgConnection, StatementMetricsJob};
use dbm_telemetry::{
    AsyncJob, CollectorConfig, JobRoutine, MetricsSink, TracingSink, WorkerPool,
};

/// Upper bound on how long shutdown waits for each job loop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL query telemetry daemon.
#[derive(Parser)]
#[command(name = "dbm-collectord", about = "PostgreSQL query telemetry daemon", version)]
struct Args {
    /// Check interval in seconds: how often every job is poked.
    #[arg(short, long, default_value = "1")]
    interval: f64,

    /// JSON configuration file. Missing settings use built-in defaults.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Maximum number of concurrently running job loops (overrides the config file).
    #[arg(long)]
    max_jobs: Option<usize>,

    /// Tag added to every submitted metric, e.g. `--tag env:prod`. Repeatable.
    #[arg(long = "tag", value_name = "KEY:VALUE")]
    tags: Vec<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// `RUST_LOG` directives take precedence over the command-line level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(args: &Args) -> Result<CollectorConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            CollectorConfig::from_file(path)?
        }
        None => CollectorConfig::default(),
    };
    if let Some(max_jobs) = args.max_jobs {
        config.pool.max_jobs = max_jobs;
    }
    if !args.interval.is_finite() || args.interval <= 0.0 {
        return Err(format!("invalid --interval {}: must be > 0", args.interval).into());
    }
    config.fit_check_interval(Duration::from_secs_f64(args.interval));
    config.validate()?;
    Ok(config)
}

/// Pokes one job, logging scheduler failures instead of aborting.
fn poke<R: JobRoutine>(job: &AsyncJob<R>, tags: &[String]) {
    if let Err(e) = job.run_job_loop(tags) {
        warn!(job = %job.config().job_name, error = %e, "failed to start job loop");
    }
}

fn stop<R: JobRoutine>(job: &AsyncJob<R>) {
    job.cancel();
    if job.wait(SHUTDOWN_TIMEOUT) {
        debug!(job = %job.config().job_name, "job stopped");
    } else {
        warn!(job = %job.config().job_name, "job did not stop within {:?}", SHUTDOWN_TIMEOUT);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let pool = WorkerPool::init_global(&config.pool)?;
    info!(
        "Config: interval={}s, max_jobs={}, tags={:?}",
        args.interval,
        pool.capacity(),
        args.tags
    );

    let sink: Arc<dyn MetricsSink> = Arc::new(TracingSink);

    let statements = AsyncJob::new(
        config.statement_metrics.clone(),
        StatementMetricsJob::new(
            PgConnection::from_env()?,
            &config.statement_engine,
            config.statement_metrics.metric_prefix.clone(),
            Arc::clone(&sink),
        ),
        Arc::clone(&sink),
    )?;
    let activity = AsyncJob::new(
        config.activity.clone(),
        ActivitySamplesJob::new(
            PgConnection::from_env()?,
            &config.activity_samples,
            config.activity.metric_prefix.clone(),
            Arc::clone(&sink),
        )?,
        Arc::clone(&sink),
    )?;

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    info!("Starting check loop");
    let interval = Duration::from_secs_f64(args.interval);
    while running.load(Ordering::SeqCst) {
        poke(&statements, &args.tags);
        poke(&activity, &args.tags);

        // Sleep with periodic checks for shutdown signal
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }

    info!("Shutting down...");
    stop(&statements);
    stop(&activity);
    info!("Shutdown complete");
    Ok(())
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);
    info!("dbm-collectord {} starting", env!("CARGO_PKG_VERSION"));

    match run(args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            std::process::ExitCode::FAILURE
        }
    }
}
