//! Delivery of metric batches to the backend collector.
//!
//! The [`Transmitter`] trait is the seam the agent talks to; the only
//! production implementation is [`websocket::WebSocketTransmitter`].

pub mod message;
pub mod websocket;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::types::MetricBatch;

pub use websocket::{WebSocketSettings, WebSocketTransmitter};

/// Errors surfaced by a transmitter
#[derive(Debug, Error)]
pub enum TransmitError {
    #[error("not connected to backend")]
    NotConnected,

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to register agent: {0}")]
    Registration(#[source] Box<TransmitError>),
}

/// A single logical connection to the backend
#[async_trait]
pub trait Transmitter: Send + Sync {
    /// Establish and register the connection. No-op when already connected.
    async fn connect(&self) -> Result<(), TransmitError>;

    /// Close the connection and stop its background tasks. No-op when not connected.
    async fn disconnect(&self) -> Result<(), TransmitError>;

    async fn is_connected(&self) -> bool;

    /// Send one batch. Fails immediately when not connected; never retries.
    async fn send(&self, batch: &MetricBatch) -> Result<(), TransmitError>;
}

/// Re-establish a dropped connection every `interval` until `cancel` fires.
///
/// There is no backoff and no attempt limit.
pub fn spawn_reconnect_loop(
    transmitter: Arc<dyn Transmitter>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Reconnect loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if transmitter.is_connected().await {
                        continue;
                    }
                    tracing::info!("Attempting to reconnect to backend");
                    match transmitter.connect().await {
                        Ok(()) => tracing::info!("Successfully reconnected to backend"),
                        Err(e) => tracing::error!(error = %e, "Failed to reconnect"),
                    }
                }
            }
        }
    })
}
