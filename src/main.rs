// Main entry point for imgproxy-server.
// Parses configuration, initializes structured logging, wires the
// collaborators into the route table, and runs the server until a shutdown
// signal or a fatal serve-loop error.

use clap::Parser;
use imgproxy_server::app;
use imgproxy_server::config::Config;
use imgproxy_server::engine::{NoopEngine, ProcessingEngine};
use imgproxy_server::metrics::{Disabled, Metrics, TimingLogger};
use imgproxy_server::report::{ErrorReporter, LogReporter};
use imgproxy_server::server::Server;
use imgproxy_server::shutdown::{shutdown_signal, Shutdown};
use std::sync::Arc;
use tracing::Level;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(true)
        .init();

    tracing::info!("Starting imgproxy-server...");

    if config.development_errors {
        tracing::warn!("Development errors mode is on; responses will carry diagnostic detail");
    }

    // The real transformation engine is an external collaborator; until one
    // is linked in, the placeholder keeps the front end fully operational.
    let engine: Arc<dyn ProcessingEngine> = Arc::new(NoopEngine);

    let metrics: Arc<dyn Metrics> = if config.request_timings {
        Arc::new(TimingLogger)
    } else {
        Arc::new(Disabled)
    };
    let reporter: Arc<dyn ErrorReporter> = Arc::new(LogReporter);

    let dispatcher = match app::build_dispatcher(&config, engine, metrics, reporter) {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(err) => {
            tracing::error!("FATAL: invalid configuration: {err}");
            eprintln!("FATAL: invalid configuration: {err}. Exiting.");
            std::process::exit(1);
        }
    };

    let shutdown = Shutdown::new();
    let server = match Server::start(&config, app::build_app(dispatcher), &shutdown).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!("FATAL: can't start server: {err}");
            eprintln!("FATAL: can't start server: {err}. Exiting.");
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on {}", server.bound_addr());

    let mut cancelled = shutdown.subscribe();
    tokio::select! {
        _ = shutdown_signal() => tracing::info!("Shutdown signal received"),
        _ = cancelled.recv() => tracing::info!("Serve loop exited"),
    }

    server.stop().await;

    tracing::info!("imgproxy-server has shut down.");
}
