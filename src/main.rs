use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn, error, debug, instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marten::config::{LoggingSettings, RuntimeConfig};
use marten::core::{Signal, SignalSide};
use marten::execution::{LoopHandle, RiskGuard, TradingLoop};
use marten::monitoring::{HeartbeatHandle, HeartbeatManager, LoopStatusProvider};
use marten::paper::{AlertLog, ApprovalQueue, PaperBroker, PaperOrderService};
use marten::poll::{AdaptivePollProtocol, InMemoryPollStore, PollRequest, PollStatus};
use marten::transport::{EventCounter, EventEmitter, TracingSink};
use marten::util::ConsoleHeartbeatSink;

const DEFAULT_CONFIG_PATH: &str = "marten.toml";
const FEED_INTERVAL: Duration = Duration::from_secs(3);
const SYMBOLS: [&str; 4] = ["EURUSD", "GBPUSD", "XAUUSD", "US30"];

/// Wires the runtime against the paper collaborators and owns its tasks
struct RuntimeOrchestrator {
    config: RuntimeConfig,
    shutdown_tx: broadcast::Sender<()>,
    counter: Arc<EventCounter>,
    loop_handle: Option<LoopHandle>,
    loop_task: Option<JoinHandle<TradingLoop>>,
    heartbeat: Option<HeartbeatHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeOrchestrator {
    fn new(config: RuntimeConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            config,
            shutdown_tx,
            counter: Arc::new(EventCounter::new()),
            loop_handle: None,
            loop_task: None,
            heartbeat: None,
            tasks: Vec::new(),
        }
    }

    #[instrument(skip(self))]
    async fn start(&mut self) -> Result<()> {
        info!("🚀 Starting marten runtime (paper mode)");

        let events = EventEmitter::new();
        events.register(Arc::new(TracingSink));
        events.register(self.counter.clone());

        let broker = Arc::new(PaperBroker::new(self.config.paper.starting_equity));
        let queue = Arc::new(ApprovalQueue::new());
        let orders = Arc::new(PaperOrderService::new(broker.clone()).with_queue(queue.clone()));
        let alerts = Arc::new(AlertLog::new());

        let guard = RiskGuard::from_settings(&self.config.risk).context("invalid risk settings")?;
        let mut trading_loop = TradingLoop::builder()
            .settings(self.config.trading_loop.clone())
            .broker(broker.clone())
            .approvals(queue.clone())
            .orders(orders)
            .alerts(alerts)
            .risk_guard(guard)
            .events(events)
            .build()
            .context("failed to build trading loop")?;

        let status = trading_loop.subscribe_status();
        self.loop_handle = Some(trading_loop.handle());
        self.loop_task = Some(tokio::spawn(async move {
            trading_loop.run().await;
            trading_loop
        }));

        let mut heartbeat = HeartbeatManager::new(
            self.config.heartbeat.interval(),
            Arc::new(LoopStatusProvider::new(status)),
        );
        if self.config.heartbeat.console {
            heartbeat = heartbeat.with_sink(Arc::new(ConsoleHeartbeatSink));
        }
        self.heartbeat = Some(heartbeat.spawn());

        let feed = self.spawn_feed(broker, queue.clone());
        self.tasks.push(feed);

        let protocol = AdaptivePollProtocol::new(
            &self.config.poll,
            queue,
            Arc::new(InMemoryPollStore::new()),
        )
        .context("invalid poll settings")?;
        let poller = self.spawn_poller(Arc::new(protocol));
        self.tasks.push(poller);

        info!("✅ Trading loop, heartbeat, feed and poller started");
        Ok(())
    }

    /// Approves a signal and moves paper equity on a fixed schedule
    fn spawn_feed(&self, broker: Arc<PaperBroker>, queue: Arc<ApprovalQueue>) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let starting_equity = self.config.paper.starting_equity;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FEED_INTERVAL);
            let mut step: u64 = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => {
                        debug!("Paper feed stopping");
                        return;
                    }
                }
                step += 1;

                let side = if step % 2 == 0 { SignalSide::Sell } else { SignalSide::Buy };
                let symbol = SYMBOLS[(step as usize) % SYMBOLS.len()];
                queue.push(Signal::new(format!("paper-{}", step), symbol, side, 0.1));

                let equity = starting_equity * (1.0 + 0.08 * (step as f64 / 6.0).sin());
                broker.set_equity(equity);
                debug!(step = step, equity = equity, "📄 Paper feed step");
            }
        })
    }

    /// Plays a remote terminal polling for pending work
    fn spawn_poller(&self, protocol: Arc<AdaptivePollProtocol>) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut etag: Option<String> = None;
            loop {
                let mut request = PollRequest::new("paper-terminal").accept_encoding("zstd, br;q=0.8, gzip;q=0.5");
                if let Some(tag) = &etag {
                    request = request.if_none_match(tag.clone());
                }

                let response = protocol.handle(&request).await;
                match response.status {
                    PollStatus::Fresh => info!(
                        items = response.item_count,
                        has_more = response.has_more,
                        encoding = response.encoding.token(),
                        bytes = response.body.len(),
                        next_poll_secs = response.next_poll_after.as_secs(),
                        "📡 Poll served fresh batch"
                    ),
                    PollStatus::NotModified => debug!(
                        next_poll_secs = response.next_poll_after.as_secs(),
                        "📡 Poll unchanged"
                    ),
                    PollStatus::Deferred => warn!("📡 Poll deferred"),
                }
                if response.fingerprint.is_some() {
                    etag = response.fingerprint.clone();
                }

                tokio::select! {
                    _ = tokio::time::sleep(response.next_poll_after) => {}
                    _ = shutdown.recv() => {
                        debug!("Paper poller stopping");
                        return;
                    }
                }
            }
        })
    }

    #[instrument(skip(self))]
    async fn shutdown(&mut self) -> Result<()> {
        info!("🛑 Shutting down runtime");

        if let Some(handle) = self.loop_handle.take() {
            handle.stop();
        }
        if let Some(task) = self.loop_task.take() {
            match task.await {
                Ok(trading_loop) => {
                    let metrics = trading_loop.metrics();
                    info!(
                        ticks = metrics.ticks,
                        executed = metrics.lifetime.signals_executed,
                        errors = metrics.lifetime.error_count,
                        guard_failures = metrics.lifetime.guard_failures,
                        "✅ Trading loop drained"
                    );
                }
                Err(e) => error!(error = %e, "❌ Trading loop task failed"),
            }
        }

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.shutdown().await;
        }

        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "⚠️  Background task ended abnormally");
            }
        }

        for (event_type, count) in self.counter.snapshot() {
            info!(event_type = event_type.as_str(), count = count, "📊 Event total");
        }
        Ok(())
    }
}

fn init_tracing(settings: &LoggingSettings) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&settings.directory)
        .with_context(|| format!("failed to create log directory {}", settings.directory))?;

    let file_appender = tracing_appender::rolling::daily(&settings.directory, &settings.file_prefix);
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .json()
        .with_current_span(false)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.level)),
        )
        .init();

    Ok(guard)
}

/// Returns the config and the file it came from, if any
fn load_config() -> Result<(RuntimeConfig, Option<String>)> {
    let path = std::env::var("MARTEN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    if !Path::new(&path).exists() {
        let config = RuntimeConfig::default();
        config.validate()?;
        return Ok((config, None));
    }

    let config =
        RuntimeConfig::load_from_file(&path).with_context(|| format!("failed to load config from {}", path))?;
    Ok((config, Some(path)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, source) = load_config()?;
    let _log_guard = init_tracing(&config.logging)?;

    info!("🦫 Marten Trading Runtime");
    info!("========================");
    match &source {
        Some(path) => info!(path = %path, "📋 Configuration loaded"),
        None => warn!(
            path = DEFAULT_CONFIG_PATH,
            "⚠️  No configuration file found - using defaults (set MARTEN_CONFIG to override)"
        ),
    }

    let mut orchestrator = RuntimeOrchestrator::new(config);
    if let Err(e) = orchestrator.start().await {
        error!(error = %e, "Failed to start runtime");
        return Err(e);
    }
    info!("Press Ctrl+C to shutdown");

    match signal::ctrl_c().await {
        Ok(()) => info!("🛑 Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    orchestrator.shutdown().await?;
    info!("👋 Marten shutdown complete");
    Ok(())
}
