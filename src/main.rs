//! phantom: UDP load generator and echo bouncer
//!
//! Two roles share one binary:
//! - Server (`-s`): a bouncer that echoes every datagram carrying its key
//! - Client: a pool of workers that bounce datagrams off the server and
//!   count what comes back
//!
//! Features:
//! - Fixed client count with a per-client packet budget
//! - Ramp-up mode that adds clients until the first packet is lost
//! - Per-second throughput and round-trip estimates
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod error;
mod metrics;
mod packet;
mod ramp;
mod report;
mod server;
mod shutdown;
mod stats;

use config::{Config, LoadSettings, Mode, ServerSettings, Timing};
use error::PhantomError;
use metrics::Metrics;
use ramp::RampController;
use report::ExitReporter;
use server::EchoServer;
use shutdown::{ExitReason, Shutdown};
use stats::StatsAggregator;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(PhantomError::from(e).exit_code());
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runtime = match build_runtime(config.workers) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::from(PhantomError::Io(e).exit_code());
        }
    };

    let Some(summary) = runtime.block_on(run(config)) else {
        return ExitCode::SUCCESS;
    };
    info!(
        reason = %summary.reason,
        started_at = %summary.started_at,
        sent = summary.sent,
        received = summary.received,
        drops = summary.drops,
        "Run finished"
    );
    println!("{summary}");

    ExitCode::from(summary.exit_code())
}

fn build_runtime(workers: Option<usize>) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = workers.filter(|&w| w > 0) {
        builder.worker_threads(workers);
    }
    builder.enable_all().build()
}

/// Run the configured role and produce its summary
async fn run(config: Config) -> Option<report::Summary> {
    let metrics = Metrics::new();
    let shutdown = Shutdown::new();
    let reporter = ExitReporter::new(Arc::clone(&metrics), shutdown.clone());

    tokio::spawn(trap_interrupt(Arc::clone(&metrics), shutdown.clone()));

    match config.mode {
        Mode::Server(settings) => run_server(&settings, Arc::clone(&metrics), &shutdown).await,
        Mode::Client(settings) => {
            run_clients(settings, config.timing, Arc::clone(&metrics), shutdown.clone()).await
        }
    }

    reporter.finish()
}

async fn run_server(settings: &ServerSettings, metrics: Arc<Metrics>, shutdown: &Shutdown) {
    info!(port = settings.listen.port(), key = settings.key, "Starting server mode");

    let result = match EchoServer::bind(settings, metrics) {
        Ok(server) => server.run(shutdown).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!(error = %e, "Bouncer failed");
        shutdown.trigger(ExitReason::failed(&e), 0);
    }
}

async fn run_clients(
    settings: LoadSettings,
    timing: Timing,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
) {
    info!(
        clients = settings.clients,
        packets_per_client = ?settings.packets,
        packet_size = settings.packet_size,
        server = %settings.target,
        "Starting client mode"
    );

    let aggregator = StatsAggregator::new(Arc::clone(&metrics), timing.stats_interval);
    let stats = tokio::spawn(aggregator.run(shutdown.clone()));

    RampController::new(settings, timing, metrics, shutdown).run().await;

    if let Err(e) = stats.await {
        error!(error = %e, "Stats task failed");
    }
}

/// Turn ctrl-c / SIGTERM into an interrupt trigger
async fn trap_interrupt(metrics: Arc<Metrics>, shutdown: Shutdown) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = shutdown.cancelled() => return,
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Cannot listen for ctrl-c");
                return;
            }
        }
        _ = terminate => {}
    }

    info!("Interrupted, waiting for clients to finish");
    shutdown.trigger(ExitReason::Interrupted, metrics.active_clients());
}
