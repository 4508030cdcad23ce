/// Periodic liveness snapshots
///
/// The heartbeat runs as its own task next to the trading loop. Every
/// interval it awaits the metrics provider and hands the resulting snapshot
/// to each sink. Providers are always async; synchronous sources go through
/// `SyncMetricsProvider`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn, instrument};

use crate::execution::metrics::{LoopMetrics, LoopStatus};
use crate::execution::risk_guard::GuardSummary;
use crate::execution::trading_loop::LoopState;
use crate::transport::{EventEmitter, EventType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub state: LoopState,
    pub trading_paused: bool,
    pub metrics: LoopMetrics,
    pub guard: Option<GuardSummary>,
}

impl HeartbeatSnapshot {
    pub fn from_status(sequence: u64, uptime: Duration, status: LoopStatus) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            uptime_secs: uptime.as_secs(),
            state: status.state,
            trading_paused: status.trading_paused,
            metrics: status.metrics,
            guard: status.guard,
        }
    }
}

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn collect(&self) -> Result<LoopStatus>;
}

/// Adapts a plain closure into a `MetricsProvider`
pub struct SyncMetricsProvider<F> {
    collect_fn: F,
}

impl<F> SyncMetricsProvider<F>
where
    F: Fn() -> Result<LoopStatus> + Send + Sync,
{
    pub fn new(collect_fn: F) -> Self {
        Self { collect_fn }
    }
}

#[async_trait]
impl<F> MetricsProvider for SyncMetricsProvider<F>
where
    F: Fn() -> Result<LoopStatus> + Send + Sync,
{
    async fn collect(&self) -> Result<LoopStatus> {
        (self.collect_fn)()
    }
}

/// Reads the status the trading loop publishes after each tick
pub struct LoopStatusProvider {
    status: watch::Receiver<LoopStatus>,
}

impl LoopStatusProvider {
    pub fn new(status: watch::Receiver<LoopStatus>) -> Self {
        Self { status }
    }
}

#[async_trait]
impl MetricsProvider for LoopStatusProvider {
    async fn collect(&self) -> Result<LoopStatus> {
        Ok(self.status.borrow().clone())
    }
}

pub trait HeartbeatSink: Send + Sync {
    fn record(&self, snapshot: &HeartbeatSnapshot) -> Result<()>;
}

/// Delivers snapshots over an unbounded channel
pub struct ChannelHeartbeatSink {
    tx: mpsc::UnboundedSender<HeartbeatSnapshot>,
}

impl ChannelHeartbeatSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HeartbeatSnapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl HeartbeatSink for ChannelHeartbeatSink {
    fn record(&self, snapshot: &HeartbeatSnapshot) -> Result<()> {
        self.tx
            .send(snapshot.clone())
            .map_err(|_| anyhow::anyhow!("heartbeat channel closed"))
    }
}

/// Republishes snapshots as `heartbeat` events
pub struct EventHeartbeatSink {
    events: EventEmitter,
}

impl EventHeartbeatSink {
    pub fn new(events: EventEmitter) -> Self {
        Self { events }
    }
}

impl HeartbeatSink for EventHeartbeatSink {
    fn record(&self, snapshot: &HeartbeatSnapshot) -> Result<()> {
        self.events.emit_with(EventType::Heartbeat, snapshot);
        Ok(())
    }
}

pub struct HeartbeatManager {
    interval: Duration,
    provider: Arc<dyn MetricsProvider>,
    sinks: Vec<Arc<dyn HeartbeatSink>>,
    started: Instant,
    sequence: u64,
}

impl HeartbeatManager {
    pub fn new(interval: Duration, provider: Arc<dyn MetricsProvider>) -> Self {
        Self {
            interval,
            provider,
            sinks: Vec::new(),
            started: Instant::now(),
            sequence: 0,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn HeartbeatSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Collect one snapshot and hand it to every sink
    pub async fn beat(&mut self) -> Result<HeartbeatSnapshot> {
        let status = self.provider.collect().await?;
        self.sequence += 1;
        let snapshot = HeartbeatSnapshot::from_status(self.sequence, self.started.elapsed(), status);

        for sink in &self.sinks {
            if let Err(e) = sink.record(&snapshot) {
                warn!(sequence = snapshot.sequence, error = %e, "Heartbeat sink failed");
            }
        }

        debug!(
            sequence = snapshot.sequence,
            state = ?snapshot.state,
            executed = snapshot.metrics.interval.signals_executed,
            errors = snapshot.metrics.interval.error_count,
            "💓 Heartbeat"
        );
        Ok(snapshot)
    }

    /// Beat every interval until the task is cancelled
    #[instrument(skip(self), fields(interval_ms = self.interval.as_millis() as u64))]
    pub async fn run(mut self) {
        info!("💓 Heartbeat manager started");

        let mut ticker = interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.beat().await {
                warn!(error = %e, "Heartbeat metrics collection failed");
            }
        }
    }

    pub fn spawn(self) -> HeartbeatHandle {
        HeartbeatHandle {
            task: tokio::spawn(self.run()),
        }
    }
}

/// Owns the background heartbeat task
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Hard-cancel the task; safe at any point since a snapshot is self-contained
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the task to unwind
    pub async fn shutdown(self) {
        self.task.abort();
        match self.task.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => debug!("Heartbeat task cancelled"),
            Err(e) => warn!(error = %e, "Heartbeat task ended abnormally"),
        }
        info!("💓 Heartbeat manager stopped");
    }
}
