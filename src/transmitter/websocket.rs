use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::{self, Inbound, Outbound};
use super::{TransmitError, Transmitter};
use crate::config::TransmitterConfig;
use crate::types::{CloudLocation, MetricBatch};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Upper bound on waiting for the connection's background tasks at disconnect
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection timing
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    pub reconnect_interval: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self::from(&TransmitterConfig::default())
    }
}

impl From<&TransmitterConfig> for WebSocketSettings {
    fn from(config: &TransmitterConfig) -> Self {
        Self {
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
        }
    }
}

/// Transmitter over a single WebSocket connection to the backend.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct WebSocketTransmitter {
    inner: Arc<Shared>,
}

struct Shared {
    backend_url: String,
    agent_id: String,
    location: CloudLocation,
    settings: WebSocketSettings,
    conn: Mutex<ConnectionState>,
}

/// Everything owned by the live connection. Guarded by one lock.
#[derive(Default)]
struct ConnectionState {
    sink: Option<WsSink>,
    connected: bool,
    /// Bumped on every successful connect so tasks of an older
    /// connection never touch a newer one
    generation: u64,
    tasks: Option<ConnectionTasks>,
}

struct ConnectionTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ConnectionState {
    fn is_current(&self, generation: u64) -> bool {
        self.connected && self.generation == generation
    }

    fn mark_disconnected(&mut self) {
        self.connected = false;
        self.sink = None;
        if let Some(tasks) = &self.tasks {
            tasks.cancel.cancel();
        }
    }
}

impl WebSocketTransmitter {
    pub fn new(
        backend_url: impl Into<String>,
        agent_id: impl Into<String>,
        location: CloudLocation,
        settings: WebSocketSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                backend_url: backend_url.into(),
                agent_id: agent_id.into(),
                location,
                settings,
                conn: Mutex::new(ConnectionState::default()),
            }),
        }
    }

    pub fn settings(&self) -> &WebSocketSettings {
        &self.inner.settings
    }
}

#[async_trait]
impl Transmitter for WebSocketTransmitter {
    async fn connect(&self) -> Result<(), TransmitError> {
        let shared = &self.inner;
        let mut state = shared.conn.lock().await;
        if state.connected {
            return Ok(());
        }

        // leftovers of a connection that dropped on its own
        if let Some(stale) = state.tasks.take() {
            stale.cancel.cancel();
        }
        state.sink = None;

        let url = message::connect_url(&shared.backend_url, &shared.agent_id, &shared.location)?;
        info!(url = %url, "Connecting to backend");

        let handshake = shared.settings.handshake_timeout;
        let (stream, _response) = timeout(handshake, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| TransmitError::Timeout { operation: "handshake", timeout: handshake })??;
        let (mut sink, source) = stream.split();

        let registration = Outbound::registration(&shared.agent_id, &shared.location, Utc::now()).to_json()?;
        if let Err(e) = write_frame(&mut sink, Message::Text(registration), shared.settings.write_timeout).await {
            let _ = timeout(shared.settings.write_timeout, sink.close()).await;
            return Err(TransmitError::Registration(Box::new(e)));
        }

        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        let keepalive = tokio::spawn(keepalive_task(Arc::clone(shared), generation, cancel.clone()));
        let reader = tokio::spawn(read_task(Arc::clone(shared), source, generation, cancel.clone()));

        state.sink = Some(sink);
        state.connected = true;
        state.tasks = Some(ConnectionTasks {
            cancel,
            handles: vec![keepalive, reader],
        });

        info!(agent_id = %shared.agent_id, generation, "Successfully connected to backend");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransmitError> {
        let (sink, tasks, was_connected) = {
            let mut state = self.inner.conn.lock().await;
            let was_connected = state.connected;
            state.connected = false;
            (state.sink.take(), state.tasks.take(), was_connected)
        };

        if let Some(tasks) = &tasks {
            tasks.cancel.cancel();
        }

        if was_connected {
            info!("Disconnecting from backend");
        }

        if let Some(mut sink) = sink {
            let write_timeout = self.inner.settings.write_timeout;
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            if let Err(e) = write_frame(&mut sink, close, write_timeout).await {
                debug!(error = %e, "Failed to send close frame");
            }
            let _ = timeout(write_timeout, sink.close()).await;
        }

        if let Some(tasks) = tasks {
            let joined = timeout(TASK_SHUTDOWN_TIMEOUT, async {
                for handle in tasks.handles {
                    let _ = handle.await;
                }
            })
            .await;
            if joined.is_err() {
                warn!(timeout = ?TASK_SHUTDOWN_TIMEOUT, "Timeout waiting for connection tasks to stop");
            }
        }

        if was_connected {
            info!("Disconnected from backend");
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.inner.conn.lock().await.connected
    }

    async fn send(&self, batch: &MetricBatch) -> Result<(), TransmitError> {
        self.inner.send_outbound(&Outbound::Metrics(batch), None).await?;
        debug!(count = batch.metrics.len(), "Sent metrics batch");
        Ok(())
    }
}

impl Shared {
    /// Write one envelope on the live connection. With `generation` set the
    /// write only goes out if that connection is still the current one.
    async fn send_outbound(&self, msg: &Outbound<'_>, generation: Option<u64>) -> Result<(), TransmitError> {
        let text = msg.to_json()?;

        let mut state = self.conn.lock().await;
        let current = match generation {
            Some(g) => state.is_current(g),
            None => state.connected,
        };
        if !current {
            return Err(TransmitError::NotConnected);
        }
        let Some(sink) = state.sink.as_mut() else {
            return Err(TransmitError::NotConnected);
        };

        if let Err(e) = write_frame(sink, Message::Text(text), self.settings.write_timeout).await {
            error!(error = %e, "Failed to send message, marking connection down");
            state.mark_disconnected();
            return Err(e);
        }
        Ok(())
    }

    async fn handle_text(&self, text: &str, generation: u64) {
        match message::parse_inbound(text) {
            Ok(Inbound::Ping) => {
                if let Err(e) = self.send_outbound(&Outbound::pong(Utc::now()), Some(generation)).await {
                    warn!(error = %e, "Failed to answer ping");
                }
            }
            Ok(Inbound::ConfigUpdate(data)) => {
                info!(payload = %data, "Received configuration update");
            }
            Ok(Inbound::Command(data)) => {
                info!(payload = %data, "Received command");
            }
            Ok(Inbound::Unknown(kind)) => {
                debug!(kind = %kind, "Ignoring unknown message type");
            }
            Err(e) => {
                error!(error = %e, "Failed to parse message from backend");
            }
        }
    }
}

async fn write_frame(sink: &mut WsSink, frame: Message, limit: Duration) -> Result<(), TransmitError> {
    match timeout(limit, sink.send(frame)).await {
        Ok(result) => result.map_err(TransmitError::from),
        Err(_) => Err(TransmitError::Timeout {
            operation: "write",
            timeout: limit,
        }),
    }
}

/// Send a transport-level ping every `ping_interval`
async fn keepalive_task(shared: Arc<Shared>, generation: u64, cancel: CancellationToken) {
    let period = shared.settings.ping_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let mut state = shared.conn.lock().await;
                if !state.is_current(generation) {
                    return;
                }
                let Some(sink) = state.sink.as_mut() else {
                    return;
                };
                if let Err(e) = write_frame(sink, Message::Ping(Vec::new()), shared.settings.write_timeout).await {
                    error!(error = %e, "Failed to send keepalive ping");
                    state.mark_disconnected();
                    return;
                }
                debug!("Sent keepalive ping");
            }
        }
    }
}

/// Consume inbound frames until the connection fails, closes, or goes quiet
async fn read_task(shared: Arc<Shared>, mut source: WsSource, generation: u64, cancel: CancellationToken) {
    let read_timeout = shared.settings.read_timeout;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = timeout(read_timeout, source.next()) => next,
        };

        match next {
            Err(_) => {
                warn!(timeout = ?read_timeout, "No frames from backend within read timeout");
                break;
            }
            Ok(None) => {
                warn!("Backend connection closed");
                break;
            }
            Ok(Some(Err(e))) => {
                error!(error = %e, "WebSocket read error");
                break;
            }
            Ok(Some(Ok(frame))) => match frame {
                Message::Text(text) => shared.handle_text(&text, generation).await,
                Message::Ping(_) => debug!("Received ping frame"),
                Message::Pong(_) => debug!("Received pong frame"),
                Message::Close(frame) => {
                    info!(frame = ?frame, "Backend sent close frame");
                    break;
                }
                Message::Binary(data) => debug!(len = data.len(), "Ignoring binary frame"),
                Message::Frame(_) => {}
            },
        }
    }

    let mut state = shared.conn.lock().await;
    if state.is_current(generation) {
        state.mark_disconnected();
        info!(generation, "Connection marked down, waiting for reconnect");
    }
}
