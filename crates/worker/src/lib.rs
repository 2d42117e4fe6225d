//! Order fulfillment worker process.
//!
//! Wires the in-memory collaborators into a [`fulfillment::WorkerPool`],
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod demo;

use fulfillment::InMemoryStatusHub;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Logs every status event the hub broadcasts until `cancel` fires.
pub fn spawn_status_logger(hub: &InMemoryStatusHub, cancel: CancellationToken) -> JoinHandle<()> {
    let mut events = hub.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => tracing::info!(
                        order_id = %event.order_id,
                        state = %event.state,
                        sequence = event.sequence,
                        message = %event.message,
                        "status event"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "status logger lagging");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
