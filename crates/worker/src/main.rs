//! Worker process entry point.

use std::sync::Arc;
use std::time::Duration;

use fulfillment::endpoints::ALL_ENDPOINTS;
use fulfillment::{HubStatusPublisher, InMemoryStatusHub, OrderState, WorkerPool};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::config::Config;
use worker::{demo, spawn_status_logger};

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

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("invalid configuration");

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics exporter
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(config.metrics_addr)
        .install()
        .expect("failed to install Prometheus exporter");
    tracing::info!(addr = %config.metrics_addr, "metrics exporter listening");

    // 3. Collaborators and status hub
    let cancel = CancellationToken::new();
    let hub = Arc::new(InMemoryStatusHub::new());
    let status_logger = spawn_status_logger(&hub, cancel.clone());

    // 4. Start the worker pool
    let pool = WorkerPool::start(
        &config.fulfillment,
        demo::collaborators(),
        Arc::new(HubStatusPublisher::new(hub.clone())),
        cancel.clone(),
    )
    .expect("failed to start worker pool");

    // 5. Seed demo orders
    let seeder = tokio::spawn(demo::seed_orders(
        pool.intake(),
        config.demo_orders,
        Duration::from_millis(50),
        cancel.clone(),
    ));

    // 6. Run until signalled, then shut down
    shutdown_signal().await;
    seeder.abort();

    let board = pool.board().clone();
    let breakers = pool.breakers().clone();
    let dead_letters = pool.dead_letters().clone();
    let report = pool.shutdown(config.shutdown_grace).await;

    for endpoint in ALL_ENDPOINTS {
        let snapshot = breakers.snapshot(endpoint);
        tracing::info!(
            endpoint,
            state = %snapshot.state,
            recent_failures = snapshot.recent_failures,
            "circuit state at shutdown"
        );
    }
    tracing::info!(
        completed = board.count_in(OrderState::Completed),
        failed = board.count_in(OrderState::Failed),
        manual_review = board.count_in(OrderState::RequiresManualReview),
        cancelled = board.count_in(OrderState::Cancelled),
        dead_letters = dead_letters.len(),
        forced = report.forced,
        "worker shut down gracefully"
    );

    cancel.cancel();
    if let Err(e) = status_logger.await {
        tracing::error!(error = %e, "status logger failed");
    }
}
