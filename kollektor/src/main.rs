//! Process entry point: CLI parsing, logging init, runtime construction,
//! and the thin `tokio::signal::unix` wiring spec.md treats as an external
//! collaborator (SPEC_FULL.md §E). Everything else is deferred to the
//! library.

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::error;

use kollektor::config::Args;
use kollektor::server::Server;

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Some(metrics_addr) = config.metrics_addr {
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
        {
            Ok(()) => tracing::info!(%metrics_addr, "prometheus exporter installed"),
            Err(e) => error!("failed to install prometheus exporter: {e}"),
        }
    }

    let (server, handle) = match Server::start(&config).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("failed to start server: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGINT handler: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGUSR1 handler: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                server.shutdown();
                break;
            }
            _ = sigint.recv() => {
                server.shutdown();
                break;
            }
            _ = sigusr1.recv() => {
                server.dump_stats();
            }
        }
    }

    handle.join().await;
    std::process::ExitCode::SUCCESS
}
