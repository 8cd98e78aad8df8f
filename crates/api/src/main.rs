//! Process entry point: HTTP producers, the primary-queue worker, or both.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use api::runtime::{Backends, build_state, build_worker};
use saga::{InMemoryPaymentGateway, InMemoryVcsProvider};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(&config);
    tracing::info!(role = ?config.role, "starting");

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Connect backends
    let backends = Backends::connect(&config)
        .await
        .expect("failed to connect backends");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 4. Start the worker
    let worker = if config.role.runs_worker() {
        tracing::warn!("no provider or gateway clients configured, using in-memory services");
        let worker = build_worker(
            &config,
            &backends,
            Arc::new(InMemoryVcsProvider::new()),
            Arc::new(InMemoryPaymentGateway::new()),
        )
        .expect("failed to register consumers");
        Some(tokio::spawn(worker.run(shutdown_rx)))
    } else {
        None
    };

    // 5. Serve HTTP, or just wait for a signal
    if config.role.serves_http() {
        let state = build_state(&backends).expect("failed to register producers");
        let app = api::create_app(state, metrics_handle);

        let addr = config.addr();
        tracing::info!(%addr, "starting API server");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .expect("failed to bind address");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .expect("server error");
    } else {
        shutdown_signal().await;
    }

    // 6. Drain the worker
    let _ = shutdown_tx.send(true);
    if let Some(worker) = worker
        && let Err(err) = worker.await
    {
        tracing::error!(error = %err, "worker task failed");
    }

    tracing::info!("shut down gracefully");
}
