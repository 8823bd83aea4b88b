//! Agent orchestrator: wires collectors, the metric queue and the
//! transmitter together and owns their lifecycle.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::Collector;
use crate::config::Config;
use crate::queue::{self, MetricReceiver, MetricSender};
use crate::transmitter::{self, TransmitError, Transmitter};
use crate::types::{CloudLocation, Metric, MetricBatch};

/// A partial batch is flushed after this long without filling up
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is already running")]
    AlreadyRunning,

    #[error("failed to connect to backend: {0}")]
    Connect(#[from] TransmitError),

    #[error("no collectors could be started")]
    NoCollectors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Stopped,
    Running,
}

/// Point-in-time report of the agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub agent_id: String,
    pub location: CloudLocation,
    pub backend_url: String,
    pub collect_interval_secs: u64,
    pub collectors: Vec<String>,
    pub connected: bool,
    pub dropped_metrics: u64,
    pub queued_metrics: usize,
}

/// A configured collector and whether it started for the current run
struct CollectorSlot {
    collector: Box<dyn Collector>,
    active: bool,
}

type SharedCollectors = Arc<Mutex<Vec<CollectorSlot>>>;

/// Handles owned while the agent is running
struct RunHandles {
    shutdown: CancellationToken,
    reconnect_cancel: CancellationToken,
    collection: JoinHandle<()>,
    transmission: JoinHandle<()>,
    reconnect: JoinHandle<()>,
    sender: MetricSender,
}

pub struct Agent {
    agent_id: String,
    location: CloudLocation,
    backend_url: String,
    collect_interval: Duration,
    batch_size: usize,
    queue_capacity: usize,
    reconnect_interval: Duration,
    collectors: SharedCollectors,
    active: Vec<String>,
    transmitter: Arc<dyn Transmitter>,
    run: Option<RunHandles>,
    dropped_at_stop: u64,
}

impl Agent {
    pub fn new(config: &Config, collectors: Vec<Box<dyn Collector>>, transmitter: Arc<dyn Transmitter>) -> Self {
        Self {
            agent_id: config.agent.agent_id.clone(),
            location: config.location.clone(),
            backend_url: config.agent.backend_url.clone(),
            collect_interval: config.agent.collect_interval(),
            batch_size: config.agent.batch_size.max(1),
            queue_capacity: config.queue_capacity(),
            reconnect_interval: Duration::from_secs(config.transmitter.reconnect_interval_secs),
            collectors: Arc::new(Mutex::new(
                collectors
                    .into_iter()
                    .map(|collector| CollectorSlot { collector, active: false })
                    .collect(),
            )),
            active: Vec::new(),
            transmitter,
            run: None,
            dropped_at_stop: 0,
        }
    }

    pub fn state(&self) -> AgentState {
        if self.run.is_some() {
            AgentState::Running
        } else {
            AgentState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == AgentState::Running
    }

    /// Connect, start collectors and launch the background loops.
    ///
    /// Collectors that fail to start are logged and left out of the run.
    pub async fn start(&mut self) -> Result<(), AgentError> {
        if self.run.is_some() {
            return Err(AgentError::AlreadyRunning);
        }

        info!(
            agent_id = %self.agent_id,
            provider = %self.location.provider,
            region = %self.location.region,
            "Starting agent"
        );

        self.transmitter.connect().await?;

        let reconnect_cancel = CancellationToken::new();
        let reconnect = transmitter::spawn_reconnect_loop(
            Arc::clone(&self.transmitter),
            self.reconnect_interval,
            reconnect_cancel.clone(),
        );

        let started = self.start_collectors().await;
        if started.is_empty() {
            reconnect_cancel.cancel();
            let _ = reconnect.await;
            if let Err(e) = self.transmitter.disconnect().await {
                warn!(error = %e, "Failed to disconnect after aborted start");
            }
            return Err(AgentError::NoCollectors);
        }
        self.active = started;

        let (sender, receiver) = queue::bounded(self.queue_capacity);
        let shutdown = CancellationToken::new();

        let collection = tokio::spawn(collection_loop(
            Arc::clone(&self.collectors),
            sender.clone(),
            self.collect_interval,
            shutdown.clone(),
        ));

        let batcher = Batcher {
            agent_id: self.agent_id.clone(),
            location: self.location.clone(),
            batch_size: self.batch_size,
            pending: Vec::with_capacity(self.batch_size),
            transmitter: Arc::clone(&self.transmitter),
        };
        let transmission = tokio::spawn(transmission_loop(receiver, batcher, shutdown.clone()));

        self.run = Some(RunHandles {
            shutdown,
            reconnect_cancel,
            collection,
            transmission,
            reconnect,
            sender,
        });

        info!(
            collectors = self.active.len(),
            interval_secs = self.collect_interval.as_secs(),
            batch_size = self.batch_size,
            "Agent started"
        );
        Ok(())
    }

    /// Start every configured collector. The ones that fail sit out this run
    /// and are retried on the next `start`. Returns the names that started.
    async fn start_collectors(&self) -> Vec<String> {
        let mut slots = self.collectors.lock().await;
        let mut names = Vec::with_capacity(slots.len());

        for slot in slots.iter_mut() {
            slot.active = match slot.collector.start().await {
                Ok(()) => {
                    info!(collector = slot.collector.name(), "Started collector");
                    names.push(slot.collector.name().to_string());
                    true
                }
                Err(e) => {
                    error!(collector = slot.collector.name(), error = %e, "Failed to start collector");
                    false
                }
            };
        }

        names
    }

    /// Stop the agent. Calling this while stopped does nothing.
    pub async fn stop(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        info!("Stopping agent");

        run.shutdown.cancel();

        {
            let mut slots = self.collectors.lock().await;
            for slot in slots.iter_mut().filter(|s| s.active) {
                slot.active = false;
                if let Err(e) = slot.collector.stop().await {
                    warn!(collector = slot.collector.name(), error = %e, "Failed to stop collector");
                }
            }
        }
        self.active.clear();

        if let Err(e) = run.collection.await {
            error!(error = %e, "Collection loop ended abnormally");
        }
        if let Err(e) = run.transmission.await {
            error!(error = %e, "Transmission loop ended abnormally");
        }

        run.reconnect_cancel.cancel();
        if let Err(e) = run.reconnect.await {
            error!(error = %e, "Reconnect loop ended abnormally");
        }

        if let Err(e) = self.transmitter.disconnect().await {
            error!(error = %e, "Failed to disconnect from backend");
        }

        self.dropped_at_stop = run.sender.dropped();
        drop(run.sender);

        info!(dropped_metrics = self.dropped_at_stop, "Agent stopped");
    }

    pub async fn status(&self) -> AgentStatus {
        let (dropped_metrics, queued_metrics) = match &self.run {
            Some(run) => (run.sender.dropped(), run.sender.queued()),
            None => (self.dropped_at_stop, 0),
        };
        AgentStatus {
            running: self.is_running(),
            agent_id: self.agent_id.clone(),
            location: self.location.clone(),
            backend_url: self.backend_url.clone(),
            collect_interval_secs: self.collect_interval.as_secs(),
            collectors: self.active.clone(),
            connected: self.transmitter.is_connected().await,
            dropped_metrics,
            queued_metrics,
        }
    }
}

/// Run every collector once per tick and offer the results to the queue
async fn collection_loop(
    collectors: SharedCollectors,
    sender: MetricSender,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => collect_once(&collectors, &sender).await,
        }
    }
    debug!("Collection loop stopped");
}

async fn collect_once(collectors: &SharedCollectors, sender: &MetricSender) {
    let mut slots = collectors.lock().await;
    for slot in slots.iter_mut().filter(|s| s.active) {
        let collector = &mut slot.collector;
        match collector.collect().await {
            Ok(metrics) => {
                let count = metrics.len();
                let mut accepted = 0usize;
                for metric in metrics {
                    if sender.offer(metric) {
                        accepted += 1;
                    }
                }
                debug!(collector = collector.name(), count, accepted, "Collected metrics");
            }
            Err(e) => {
                warn!(collector = collector.name(), error = %e, "Collection failed");
            }
        }
    }
}

/// Accumulates metrics into batches and hands full batches to the transmitter
struct Batcher {
    agent_id: String,
    location: CloudLocation,
    batch_size: usize,
    pending: Vec<Metric>,
    transmitter: Arc<dyn Transmitter>,
}

impl Batcher {
    /// Append one metric. Returns true when the batch is full.
    fn push(&mut self, metric: Metric) -> bool {
        self.pending.push(metric);
        self.pending.len() >= self.batch_size
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let metrics = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        let count = metrics.len();
        let batch = MetricBatch {
            agent_id: self.agent_id.clone(),
            timestamp: Utc::now(),
            metrics,
            location: self.location.clone(),
        };

        match self.transmitter.send(&batch).await {
            Ok(()) => debug!(count, "Flushed metrics batch"),
            Err(e) => error!(count, error = %e, "Failed to send metrics batch, dropping it"),
        }
    }
}

async fn transmission_loop(mut receiver: MetricReceiver, mut batcher: Batcher, shutdown: CancellationToken) {
    let timer = tokio::time::sleep(BATCH_TIMEOUT);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                batcher.flush().await;
                break;
            }
            next = receiver.recv() => match next {
                Some(metric) => {
                    if batcher.push(metric) {
                        batcher.flush().await;
                        timer.as_mut().reset(Instant::now() + BATCH_TIMEOUT);
                    }
                }
                None => {
                    batcher.flush().await;
                    break;
                }
            },
            _ = &mut timer => {
                batcher.flush().await;
                timer.as_mut().reset(Instant::now() + BATCH_TIMEOUT);
            }
        }
    }
    debug!("Transmission loop stopped");
}
