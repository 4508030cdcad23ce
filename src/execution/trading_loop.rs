/// Continuous fetch → execute → guard-check control loop
///
/// One tick fetches a bounded batch of approved signals, submits the ones
/// not executed before, then asks the `RiskGuard` to check the account.
/// Failures on a single signal are counted and logged; they never stop the
/// loop. `stop()` is cooperative: the tick in progress always completes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn, error, instrument};

use crate::config::{GuardFailurePolicy, LoopSettings};
use crate::core::{
    Alert, AlertSeverity, AlertSink, ApprovalsSource, BrokerClient, ConfigurationError, ExecutionError,
    ExecutionReport, OrderService, Signal,
};
use crate::monitoring::HeartbeatSnapshot;
use crate::transport::{EventEmitter, EventType};

use super::idempotency::ExecutedSignals;
use super::metrics::{LoopMetrics, LoopStatus};
use super::risk_guard::{GuardState, RiskGuard};

/// Fetches per tick while pages keep coming back full of executed signals
const MAX_FETCH_ROUNDS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LoopState {
    fn as_u8(self) -> u8 {
        match self {
            LoopState::Stopped => 0,
            LoopState::Starting => 1,
            LoopState::Running => 2,
            LoopState::Stopping => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Starting,
            2 => LoopState::Running,
            3 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

struct LoopControl {
    state: AtomicU8,
    wake: Notify,
}

impl LoopControl {
    fn load(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn store(&self, state: LoopState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Cloneable remote control for a running loop
#[derive(Clone)]
pub struct LoopHandle {
    control: Arc<LoopControl>,
}

impl LoopHandle {
    pub fn state(&self) -> LoopState {
        self.control.load()
    }

    /// Request a cooperative stop; returns false if the loop was not active
    pub fn stop(&self) -> bool {
        let requested = self.control.transition(LoopState::Running, LoopState::Stopping)
            || self.control.transition(LoopState::Starting, LoopState::Stopping);
        if requested {
            info!("🛑 Trading loop stop requested");
            self.control.wake.notify_one();
        }
        requested
    }
}

/// Outcome of one iteration
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub fetched: usize,
    pub executed: usize,
    pub failed: usize,
    pub duplicates_skipped: usize,
    pub fetch_failed: bool,
    pub trading_paused: bool,
    pub guard: Option<GuardState>,
    pub guard_error: Option<String>,
}

#[derive(Default)]
pub struct TradingLoopBuilder {
    settings: LoopSettings,
    broker: Option<Arc<dyn BrokerClient>>,
    approvals: Option<Arc<dyn ApprovalsSource>>,
    orders: Option<Arc<dyn OrderService>>,
    alerts: Option<Arc<dyn AlertSink>>,
    guard: Option<RiskGuard>,
    events: Option<EventEmitter>,
}

impl TradingLoopBuilder {
    pub fn settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn broker(mut self, broker: Arc<dyn BrokerClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn approvals(mut self, approvals: Arc<dyn ApprovalsSource>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn orders(mut self, orders: Arc<dyn OrderService>) -> Self {
        self.orders = Some(orders);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn risk_guard(mut self, guard: RiskGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Fails fast on any missing required collaborator
    pub fn build(self) -> Result<TradingLoop, ConfigurationError> {
        let broker = self.broker.ok_or(ConfigurationError::MissingDependency("broker"))?;
        let approvals = self.approvals.ok_or(ConfigurationError::MissingDependency("approvals"))?;
        let orders = self.orders.ok_or(ConfigurationError::MissingDependency("orders"))?;
        let guard = self.guard.ok_or(ConfigurationError::MissingDependency("risk_guard"))?;

        let settings = self.settings;
        if settings.batch_size == 0 {
            return Err(ConfigurationError::Invalid("batch_size must be > 0".into()));
        }
        if settings.tick_interval_ms == 0 {
            return Err(ConfigurationError::Invalid("tick_interval_ms must be > 0".into()));
        }

        // Collaborators already attached to the guard take precedence
        let events = self.events.unwrap_or_default();
        let mut guard = guard;
        if !guard.has_events() {
            guard = guard.with_events(events.clone());
        }
        if let (Some(alerts), false) = (&self.alerts, guard.has_alerts()) {
            guard = guard.with_alerts(alerts.clone());
        }

        let executed = ExecutedSignals::new(settings.idempotency_capacity, settings.idempotency_ttl());
        let (status_tx, _) = watch::channel(LoopStatus::default());

        info!(
            batch_size = settings.batch_size,
            tick_interval_ms = settings.tick_interval_ms,
            guard_failure_policy = ?settings.guard_failure_policy,
            alerts = self.alerts.is_some(),
            "🎯 Trading loop configured"
        );

        Ok(TradingLoop {
            settings,
            broker,
            approvals,
            orders,
            alerts: self.alerts,
            guard,
            events,
            executed,
            metrics: LoopMetrics::default(),
            control: Arc::new(LoopControl {
                state: AtomicU8::new(LoopState::Stopped.as_u8()),
                wake: Notify::new(),
            }),
            status_tx,
            trading_paused: false,
            started_at: Instant::now(),
            last_interval_roll: Instant::now(),
            heartbeat_sequence: 0,
        })
    }
}

pub struct TradingLoop {
    settings: LoopSettings,
    broker: Arc<dyn BrokerClient>,
    approvals: Arc<dyn ApprovalsSource>,
    orders: Arc<dyn OrderService>,
    alerts: Option<Arc<dyn AlertSink>>,
    guard: RiskGuard,
    events: EventEmitter,
    executed: ExecutedSignals,
    metrics: LoopMetrics,
    control: Arc<LoopControl>,
    status_tx: watch::Sender<LoopStatus>,
    trading_paused: bool,
    started_at: Instant,
    last_interval_roll: Instant,
    heartbeat_sequence: u64,
}

impl TradingLoop {
    pub fn builder() -> TradingLoopBuilder {
        TradingLoopBuilder::default()
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn state(&self) -> LoopState {
        self.control.load()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LoopStatus> {
        self.status_tx.subscribe()
    }

    pub fn metrics(&self) -> &LoopMetrics {
        &self.metrics
    }

    pub fn guard(&self) -> &RiskGuard {
        &self.guard
    }

    pub fn is_trading_paused(&self) -> bool {
        self.trading_paused
    }

    pub fn status(&self) -> LoopStatus {
        LoopStatus {
            state: self.state(),
            trading_paused: self.trading_paused,
            metrics: self.metrics.clone(),
            guard: Some(self.guard.summary()),
            updated_at: chrono::Utc::now(),
        }
    }

    /// Run until `LoopHandle::stop` is called
    ///
    /// The guard, idempotency set and lifetime metrics survive a stop, so a
    /// stopped loop can be run again.
    #[instrument(skip(self))]
    pub async fn run(&mut self) {
        if !self.control.transition(LoopState::Stopped, LoopState::Starting) {
            warn!(state = ?self.state(), "Trading loop already active - ignoring run()");
            return;
        }

        info!("🚀 Trading loop starting");
        self.events.emit_with(
            EventType::LoopStarted,
            &serde_json::json!({
                "batch_size": self.settings.batch_size,
                "tick_interval_ms": self.settings.tick_interval_ms,
                "guard_failure_policy": self.settings.guard_failure_policy,
            }),
        );

        if self.control.transition(LoopState::Starting, LoopState::Running) {
            self.publish_status();

            let mut ticker = interval(self.settings.tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while self.state() == LoopState::Running {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.control.wake.notified() => {}
                }
                if self.state() != LoopState::Running {
                    break;
                }
                self.tick().await;
            }
        }

        self.events.emit_with(
            EventType::LoopStopped,
            &serde_json::json!({
                "ticks": self.metrics.ticks,
                "lifetime": self.metrics.lifetime,
                "uptime_secs": self.started_at.elapsed().as_secs(),
            }),
        );
        self.control.store(LoopState::Stopped);
        self.publish_status();
        info!(ticks = self.metrics.ticks, "✅ Trading loop stopped");
    }

    /// Execute exactly one iteration: fetch, execute, guard check
    pub async fn tick(&mut self) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        if self.trading_paused {
            debug!("Trading paused after guard failure - skipping fetch/execute");
        } else {
            self.fetch_and_execute(&mut report).await;
        }

        self.check_guard(&mut report).await;
        report.trading_paused = self.trading_paused;

        self.metrics.record_tick(started.elapsed());
        self.maybe_roll_interval();
        self.publish_status();

        if report.fetched > 0 || report.failed > 0 {
            info!(
                fetched = report.fetched,
                executed = report.executed,
                failed = report.failed,
                duplicates = report.duplicates_skipped,
                duration_ms = self.metrics.last_tick_duration_ms,
                "📊 Tick complete"
            );
        }
        report
    }

    /// Up to `batch_size` approved signals that are not in the executed set
    ///
    /// Executed ids can stay approved in the source, so when a full page
    /// comes back short of fresh signals the limit grows and the source is
    /// asked again, until the batch fills or the source runs out.
    async fn fetch_fresh(&mut self, report: &mut TickReport) -> Result<Vec<Signal>, ExecutionError> {
        let batch_size = self.settings.batch_size;
        let mut limit = batch_size;
        let mut fresh = Vec::new();

        for round in 0..MAX_FETCH_ROUNDS {
            let signals = match self.approvals.fetch_approved_signals(limit).await {
                Ok(signals) => signals,
                Err(e) if round == 0 => return Err(ExecutionError::Fetch(e.to_string())),
                Err(e) => {
                    warn!(error = %e, round = round, "Follow-up fetch failed - executing what was found");
                    break;
                }
            };
            let exhausted = signals.len() < limit;

            fresh.clear();
            let mut known = 0;
            for signal in signals {
                if self.executed.contains(&signal.id) {
                    known += 1;
                } else if fresh.len() < batch_size {
                    fresh.push(signal);
                }
            }
            report.duplicates_skipped = known;

            if fresh.len() >= batch_size || exhausted {
                break;
            }
            limit = (known + batch_size).max(limit.saturating_mul(2));
            debug!(known = known, next_limit = limit, "Fetched page held executed signals - widening");
        }
        Ok(fresh)
    }

    async fn fetch_and_execute(&mut self, report: &mut TickReport) {
        let fresh = match self.fetch_fresh(report).await {
            Ok(fresh) => fresh,
            Err(err) => {
                error!(error = %err, "❌ Signal fetch failed");
                self.metrics.record_error();
                report.fetch_failed = true;
                self.events.emit_with(
                    EventType::ExecutionError,
                    &serde_json::json!({ "stage": "fetch", "error": err.to_string() }),
                );
                return;
            }
        };
        if fresh.is_empty() {
            return;
        }

        report.fetched = fresh.len();
        self.metrics.record_fetched(fresh.len());
        self.events.emit_with(
            EventType::SignalFetched,
            &serde_json::json!({
                "count": fresh.len(),
                "signal_ids": fresh.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            }),
        );

        for signal in fresh {
            // Recorded before submission: a failed attempt is not retried
            if !self.executed.insert(&signal.id) {
                report.duplicates_skipped += 1;
                continue;
            }

            match self.execute_one(&signal).await {
                Ok(execution) => {
                    report.executed += 1;
                    self.metrics.record_executed();
                    info!(
                        signal_id = %signal.id,
                        symbol = %signal.symbol,
                        order_id = ?execution.order_id,
                        execution_time_ms = execution.execution_time_ms,
                        "✅ Signal executed"
                    );
                    self.events.emit_with(
                        EventType::SignalExecuted,
                        &serde_json::json!({
                            "signal_id": signal.id,
                            "symbol": signal.symbol,
                            "order_id": execution.order_id,
                            "execution_time_ms": execution.execution_time_ms,
                        }),
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    self.metrics.record_error();
                    error!(signal_id = %signal.id, symbol = %signal.symbol, error = %err, "❌ Signal execution failed");
                    if let Err(e) = self.approvals.mark_failed(&signal.id, &err.to_string()).await {
                        warn!(signal_id = %signal.id, error = %e, "Failed to withdraw failed signal");
                    }
                    self.events.emit_with(
                        EventType::ExecutionError,
                        &serde_json::json!({
                            "stage": "execute",
                            "signal_id": signal.id,
                            "error": err.to_string(),
                        }),
                    );
                }
            }
        }
    }

    async fn execute_one(&self, signal: &Signal) -> Result<ExecutionReport, ExecutionError> {
        let execution = self.orders.execute(signal).await.map_err(|e| ExecutionError::Execute {
            signal_id: signal.id.clone(),
            reason: e.to_string(),
        })?;

        if !execution.success {
            return Err(ExecutionError::Rejected {
                signal_id: signal.id.clone(),
                reason: execution
                    .message
                    .clone()
                    .unwrap_or_else(|| "order service reported failure".to_string()),
            });
        }
        Ok(execution)
    }

    async fn check_guard(&mut self, report: &mut TickReport) {
        let broker = self.broker.as_ref();
        match self.guard.check_and_enforce(broker, broker, false).await {
            Ok(state) => {
                if self.trading_paused {
                    info!("🛡️  Risk guard healthy again - resuming trading");
                    self.trading_paused = false;
                }
                report.guard = Some(state);
            }
            Err(e) => {
                self.metrics.record_guard_failure();
                let policy = self.settings.guard_failure_policy;
                error!(error = %e, policy = ?policy, "🚨 Risk guard check failed");
                self.events.emit_with(
                    EventType::GuardDegraded,
                    &serde_json::json!({ "error": e.to_string(), "policy": policy }),
                );
                report.guard_error = Some(e.to_string());

                match policy {
                    GuardFailurePolicy::Continue => {
                        warn!("Guard degraded - trading continues per configured policy");
                    }
                    GuardFailurePolicy::Pause if !self.trading_paused => {
                        self.trading_paused = true;
                        warn!("⏸️  Guard degraded - trading paused until the next successful check");
                        self.alert(Alert::new(
                            AlertSeverity::Warning,
                            "Trading paused",
                            format!("Risk guard check failed: {}", e),
                        ))
                        .await;
                    }
                    GuardFailurePolicy::Pause => {}
                }
            }
        }
    }

    async fn alert(&self, alert: Alert) {
        if let Some(alerts) = &self.alerts {
            if let Err(e) = alerts.send_alert(&alert).await {
                warn!(error = %e, "Failed to deliver alert");
            }
        }
    }

    fn maybe_roll_interval(&mut self) {
        if self.last_interval_roll.elapsed() < self.settings.heartbeat_interval() {
            return;
        }

        self.heartbeat_sequence += 1;
        let snapshot =
            HeartbeatSnapshot::from_status(self.heartbeat_sequence, self.started_at.elapsed(), self.status());
        self.events.emit_with(EventType::Heartbeat, &snapshot);

        let closed = self.metrics.roll_interval();
        self.last_interval_roll = Instant::now();
        info!(
            fetched = closed.signals_fetched,
            executed = closed.signals_executed,
            errors = closed.error_count,
            guard_failures = closed.guard_failures,
            "💓 Loop interval closed"
        );
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AccountInfo, AccountInfoProvider, Position, PositionCloser, SignalSide};
    use crate::paper::{AlertLog, ApprovalQueue, PaperBroker, PaperOrderService};
    use crate::transport::{ChannelSink, EventCounter};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn settings() -> LoopSettings {
        LoopSettings {
            tick_interval_ms: 10,
            batch_size: 10,
            guard_failure_policy: GuardFailurePolicy::Pause,
            idempotency_capacity: 1_000,
            idempotency_ttl_secs: 3_600,
            heartbeat_interval_secs: 3_600,
        }
    }

    fn signal(id: &str) -> Signal {
        Signal::new(id, "EURUSD", SignalSide::Buy, 0.1)
    }

    /// Returns the same signals on every fetch
    struct RepeatingApprovals {
        signals: Vec<Signal>,
        fetches: AtomicUsize,
    }

    impl RepeatingApprovals {
        fn new(ids: &[&str]) -> Self {
            Self {
                signals: ids.iter().map(|id| signal(id)).collect(),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ApprovalsSource for RepeatingApprovals {
        async fn fetch_approved_signals(&self, batch_size: usize) -> Result<Vec<Signal>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.signals.iter().take(batch_size).cloned().collect())
        }
    }

    struct FailingApprovals;

    #[async_trait]
    impl ApprovalsSource for FailingApprovals {
        async fn fetch_approved_signals(&self, _batch_size: usize) -> Result<Vec<Signal>> {
            anyhow::bail!("approvals database unreachable")
        }
    }

    /// Fails every signal whose id starts with "bad"
    struct SelectiveOrders {
        submitted: Mutex<Vec<String>>,
        delay: Duration,
        started: Arc<Notify>,
    }

    impl SelectiveOrders {
        fn new() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                submitted: Mutex::new(Vec::new()),
                delay,
                started: Arc::new(Notify::new()),
            }
        }

        fn submitted(&self) -> Vec<String> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrderService for SelectiveOrders {
        async fn execute(&self, signal: &Signal) -> Result<ExecutionReport> {
            self.submitted.lock().unwrap().push(signal.id.clone());
            self.started.notify_one();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if signal.id.starts_with("bad-reject") {
                return Ok(ExecutionReport {
                    success: false,
                    order_id: None,
                    execution_time_ms: 1,
                    message: Some("invalid stops".into()),
                });
            }
            if signal.id.starts_with("bad") {
                anyhow::bail!("broker returned 10013 invalid request");
            }
            Ok(ExecutionReport {
                success: true,
                order_id: Some(format!("ord-{}", signal.id)),
                execution_time_ms: 3,
                message: None,
            })
        }
    }

    /// Broker that writes each guard call into a shared journal
    struct JournalBroker {
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AccountInfoProvider for JournalBroker {
        async fn get_account_info(&self) -> Result<AccountInfo> {
            self.journal.lock().unwrap().push("guard".into());
            Ok(AccountInfo { balance: 1_000.0, equity: 1_000.0 })
        }
    }

    #[async_trait]
    impl PositionCloser for JournalBroker {
        async fn get_positions(&self) -> Result<Vec<Position>> {
            Ok(Vec::new())
        }

        async fn close(&self, _position: &Position) -> Result<()> {
            Ok(())
        }
    }

    struct JournalApprovals {
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ApprovalsSource for JournalApprovals {
        async fn fetch_approved_signals(&self, _batch_size: usize) -> Result<Vec<Signal>> {
            self.journal.lock().unwrap().push("fetch".into());
            Ok(vec![signal("a"), signal("b")])
        }
    }

    struct JournalOrders {
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl OrderService for JournalOrders {
        async fn execute(&self, signal: &Signal) -> Result<ExecutionReport> {
            self.journal.lock().unwrap().push(format!("execute:{}", signal.id));
            Ok(ExecutionReport {
                success: true,
                order_id: Some("1".into()),
                execution_time_ms: 1,
                message: None,
            })
        }
    }

    fn build_loop(
        broker: Arc<dyn BrokerClient>,
        approvals: Arc<dyn ApprovalsSource>,
        orders: Arc<dyn OrderService>,
        settings: LoopSettings,
    ) -> TradingLoop {
        TradingLoop::builder()
            .settings(settings)
            .broker(broker)
            .approvals(approvals)
            .orders(orders)
            .risk_guard(RiskGuard::new(20.0, 100.0).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_missing_dependencies() {
        let broker: Arc<dyn BrokerClient> = Arc::new(PaperBroker::new(1_000.0));
        let approvals: Arc<dyn ApprovalsSource> = Arc::new(ApprovalQueue::new());
        let orders: Arc<dyn OrderService> = Arc::new(SelectiveOrders::new());

        let missing_broker = TradingLoop::builder()
            .approvals(approvals.clone())
            .orders(orders.clone())
            .risk_guard(RiskGuard::new(20.0, 100.0).unwrap())
            .build();
        assert!(matches!(missing_broker, Err(ConfigurationError::MissingDependency("broker"))));

        let missing_approvals = TradingLoop::builder()
            .broker(broker.clone())
            .orders(orders.clone())
            .risk_guard(RiskGuard::new(20.0, 100.0).unwrap())
            .build();
        assert!(matches!(missing_approvals, Err(ConfigurationError::MissingDependency("approvals"))));

        let missing_orders = TradingLoop::builder()
            .broker(broker.clone())
            .approvals(approvals.clone())
            .risk_guard(RiskGuard::new(20.0, 100.0).unwrap())
            .build();
        assert!(matches!(missing_orders, Err(ConfigurationError::MissingDependency("orders"))));

        let missing_guard = TradingLoop::builder()
            .broker(broker.clone())
            .approvals(approvals.clone())
            .orders(orders.clone())
            .build();
        assert!(matches!(missing_guard, Err(ConfigurationError::MissingDependency("risk_guard"))));

        // Alerts are optional
        assert!(TradingLoop::builder()
            .broker(broker)
            .approvals(approvals)
            .orders(orders)
            .risk_guard(RiskGuard::new(20.0, 100.0).unwrap())
            .build()
            .is_ok());
    }

    #[tokio::test]
    async fn test_refetched_signal_is_not_resubmitted() {
        let approvals = Arc::new(RepeatingApprovals::new(&["s1", "s2"]));
        let orders = Arc::new(SelectiveOrders::new());
        let mut trading_loop =
            build_loop(Arc::new(PaperBroker::new(1_000.0)), approvals.clone(), orders.clone(), settings());

        let first = trading_loop.tick().await;
        let second = trading_loop.tick().await;

        assert_eq!(first.executed, 2);
        assert_eq!(second.executed, 0);
        assert_eq!(second.duplicates_skipped, 2);
        assert_eq!(orders.submitted(), vec!["s1", "s2"]);
        assert_eq!(approvals.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(trading_loop.metrics().lifetime.signals_executed, 2);
    }

    #[tokio::test]
    async fn test_one_bad_signal_does_not_block_the_rest() {
        let approvals = Arc::new(RepeatingApprovals::new(&["s1", "s2", "bad-1", "s3", "s4"]));
        let orders = Arc::new(SelectiveOrders::new());
        let counter = Arc::new(EventCounter::new());
        let events = EventEmitter::new();
        events.register(counter.clone());

        let mut trading_loop = TradingLoop::builder()
            .settings(settings())
            .broker(Arc::new(PaperBroker::new(1_000.0)))
            .approvals(approvals)
            .orders(orders.clone())
            .risk_guard(RiskGuard::new(20.0, 100.0).unwrap())
            .events(events)
            .build()
            .unwrap();
        let handle = trading_loop.handle();

        let task = tokio::spawn(async move {
            trading_loop.run().await;
            trading_loop
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while orders.submitted().len() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("signals were not submitted");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.state(), LoopState::Running);

        assert!(handle.stop());
        let trading_loop = task.await.unwrap();

        assert_eq!(trading_loop.state(), LoopState::Stopped);
        assert_eq!(trading_loop.metrics().lifetime.signals_executed, 4);
        assert_eq!(trading_loop.metrics().lifetime.error_count, 1);
        assert!(trading_loop.metrics().ticks >= 2);
        assert_eq!(counter.count(EventType::SignalExecuted), 4);
        assert_eq!(counter.count(EventType::ExecutionError), 1);
        assert_eq!(counter.count(EventType::LoopStarted), 1);
        assert_eq!(counter.count(EventType::LoopStopped), 1);
    }

    #[tokio::test]
    async fn test_failed_head_signal_does_not_block_queue() {
        let broker = Arc::new(PaperBroker::new(1_000.0));
        let queue = Arc::new(ApprovalQueue::new());
        let orders = Arc::new(PaperOrderService::new(broker.clone()).with_queue(queue.clone()));
        let mut single = settings();
        single.batch_size = 1;
        let mut trading_loop = build_loop(broker.clone(), queue.clone(), orders, single);

        queue.push(Signal::new("bad", "EURUSD", SignalSide::Buy, 0.0));
        queue.push(signal("good"));

        let first = trading_loop.tick().await;
        assert_eq!(first.failed, 1);
        let second = trading_loop.tick().await;
        assert_eq!(second.executed, 1);

        for _ in 0..5 {
            trading_loop.tick().await;
        }
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(broker.open_position_count(), 1);
        assert_eq!(trading_loop.metrics().lifetime.signals_executed, 1);
        assert_eq!(trading_loop.metrics().lifetime.error_count, 1);
    }

    #[tokio::test]
    async fn test_fetch_widens_past_executed_signals() {
        // The source never withdraws anything, so executed ids stay at the head
        let approvals = Arc::new(RepeatingApprovals::new(&["bad-1", "s1", "s2"]));
        let orders = Arc::new(SelectiveOrders::new());
        let mut single = settings();
        single.batch_size = 1;
        let mut trading_loop =
            build_loop(Arc::new(PaperBroker::new(1_000.0)), approvals.clone(), orders.clone(), single);

        assert_eq!(trading_loop.tick().await.failed, 1);
        assert_eq!(trading_loop.tick().await.executed, 1);
        let third = trading_loop.tick().await;
        assert_eq!(third.executed, 1);
        assert_eq!(third.duplicates_skipped, 2);

        let drained = trading_loop.tick().await;
        assert_eq!(drained.fetched, 0);
        assert!(!drained.fetch_failed);

        assert_eq!(orders.submitted(), vec!["bad-1", "s1", "s2"]);
        assert_eq!(approvals.fetches.load(Ordering::SeqCst), 1 + 2 + 3 + 3);
    }

    #[tokio::test]
    async fn test_builder_keeps_guard_event_emitter() {
        let broker = Arc::new(PaperBroker::new(1_000.0));
        let guard_events = EventEmitter::new();
        let (channel, mut guard_rx) = ChannelSink::new();
        guard_events.register(Arc::new(channel));
        let loop_counter = Arc::new(EventCounter::new());
        let loop_events = EventEmitter::new();
        loop_events.register(loop_counter.clone());

        let mut trading_loop = TradingLoop::builder()
            .settings(settings())
            .broker(broker.clone())
            .approvals(Arc::new(ApprovalQueue::new()))
            .orders(Arc::new(SelectiveOrders::new()))
            .risk_guard(RiskGuard::new(20.0, 100.0).unwrap().with_events(guard_events))
            .events(loop_events)
            .build()
            .unwrap();

        trading_loop.tick().await;
        broker.set_equity(700.0);
        assert!(trading_loop.tick().await.guard.unwrap().cap_triggered);

        assert_eq!(guard_rx.try_recv().unwrap().event_type, EventType::DrawdownTriggered);
        assert_eq!(loop_counter.count(EventType::DrawdownTriggered), 0);
    }

    #[tokio::test]
    async fn test_rejected_report_counts_as_error() {
        let approvals = Arc::new(RepeatingApprovals::new(&["bad-reject-1", "ok-1"]));
        let orders = Arc::new(SelectiveOrders::new());
        let mut trading_loop = build_loop(Arc::new(PaperBroker::new(1_000.0)), approvals, orders, settings());

        let report = trading_loop.tick().await;
        assert_eq!(report.executed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(trading_loop.metrics().interval.error_count, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_counted_and_guard_still_runs() {
        let broker = Arc::new(PaperBroker::new(1_000.0));
        let mut trading_loop = build_loop(
            broker,
            Arc::new(FailingApprovals),
            Arc::new(SelectiveOrders::new()),
            settings(),
        );

        let first = trading_loop.tick().await;
        let second = trading_loop.tick().await;

        assert!(first.fetch_failed && second.fetch_failed);
        assert!(first.guard.is_some());
        assert_eq!(trading_loop.metrics().lifetime.error_count, 2);
        assert_eq!(trading_loop.guard().summary().checks, 2);
    }

    #[tokio::test]
    async fn test_fetch_execute_precede_guard_check() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut trading_loop = build_loop(
            Arc::new(JournalBroker { journal: journal.clone() }),
            Arc::new(JournalApprovals { journal: journal.clone() }),
            Arc::new(JournalOrders { journal: journal.clone() }),
            settings(),
        );

        trading_loop.tick().await;
        assert_eq!(*journal.lock().unwrap(), vec!["fetch", "execute:a", "execute:b", "guard"]);
    }

    #[tokio::test]
    async fn test_guard_failure_pauses_trading_until_recovery() {
        let broker = Arc::new(PaperBroker::new(1_000.0));
        let queue = Arc::new(ApprovalQueue::new());
        let orders = Arc::new(PaperOrderService::new(broker.clone()).with_queue(queue.clone()));
        let alerts = Arc::new(AlertLog::new());
        let events = EventEmitter::new();
        let (channel, mut rx) = ChannelSink::new();
        events.register(Arc::new(channel));

        let mut trading_loop = TradingLoop::builder()
            .settings(settings())
            .broker(broker.clone())
            .approvals(queue.clone())
            .orders(orders)
            .alerts(alerts.clone())
            .risk_guard(RiskGuard::new(20.0, 100.0).unwrap())
            .events(events)
            .build()
            .unwrap();

        broker.set_offline(true);
        let degraded = trading_loop.tick().await;
        assert!(degraded.guard_error.is_some());
        assert!(degraded.trading_paused);
        assert_eq!(alerts.alerts().len(), 1);

        queue.push(signal("while-paused"));
        let paused = trading_loop.tick().await;
        assert_eq!(paused.fetched, 0);
        assert_eq!(queue.pending_count(), 1);
        // Already paused: no second alert
        assert_eq!(alerts.alerts().len(), 1);

        broker.set_offline(false);
        let recovered = trading_loop.tick().await;
        assert!(recovered.guard.is_some());
        assert!(!recovered.trading_paused);
        assert!(!trading_loop.is_trading_paused());

        let resumed = trading_loop.tick().await;
        assert_eq!(resumed.executed, 1);
        assert_eq!(trading_loop.metrics().lifetime.guard_failures, 2);

        let degraded_events = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| e.event_type == EventType::GuardDegraded)
            .count();
        assert_eq!(degraded_events, 2);
    }

    #[tokio::test]
    async fn test_continue_policy_keeps_trading_when_guard_fails() {
        let broker = Arc::new(PaperBroker::new(1_000.0));
        broker.set_offline(true);
        let approvals = Arc::new(RepeatingApprovals::new(&["s1"]));
        let orders = Arc::new(SelectiveOrders::new());
        let mut continue_settings = settings();
        continue_settings.guard_failure_policy = GuardFailurePolicy::Continue;
        let mut trading_loop = build_loop(broker, approvals.clone(), orders.clone(), continue_settings);

        let first = trading_loop.tick().await;
        let second = trading_loop.tick().await;

        assert!(first.guard_error.is_some() && second.guard_error.is_some());
        assert!(!second.trading_paused);
        assert_eq!(approvals.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(orders.submitted(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_drawdown_closes_positions_within_tick() {
        let broker = Arc::new(PaperBroker::new(10_000.0));
        let queue = Arc::new(ApprovalQueue::new());
        let orders = Arc::new(PaperOrderService::new(broker.clone()).with_queue(queue.clone()));
        let mut trading_loop = build_loop(broker.clone(), queue.clone(), orders, settings());

        queue.push(signal("s1"));
        queue.push(signal("s2"));
        let first = trading_loop.tick().await;
        assert_eq!(first.executed, 2);
        assert_eq!(broker.open_position_count(), 2);

        broker.set_equity(7_500.0);
        let second = trading_loop.tick().await;
        let guard = second.guard.unwrap();
        assert!(guard.cap_triggered);
        assert_eq!(guard.positions_closed, 2);
        assert_eq!(broker.open_position_count(), 0);

        broker.set_equity(9_000.0);
        let third = trading_loop.tick().await;
        let guard = third.guard.unwrap();
        assert!(!guard.cap_triggered);
        assert_eq!(guard.peak_equity, 10_000.0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_execution() {
        let approvals = Arc::new(RepeatingApprovals::new(&["slow-1"]));
        let orders = Arc::new(SelectiveOrders::with_delay(Duration::from_millis(80)));
        let started = orders.started.clone();
        let mut trading_loop =
            build_loop(Arc::new(PaperBroker::new(1_000.0)), approvals, orders.clone(), settings());
        let handle = trading_loop.handle();

        let task = tokio::spawn(async move {
            trading_loop.run().await;
            trading_loop
        });

        tokio::time::timeout(Duration::from_secs(2), started.notified())
            .await
            .expect("execution never started");
        assert!(handle.stop());
        assert_eq!(handle.state(), LoopState::Stopping);

        let trading_loop = task.await.unwrap();
        assert_eq!(trading_loop.state(), LoopState::Stopped);
        assert_eq!(trading_loop.metrics().lifetime.signals_executed, 1);
        assert!(!handle.stop());
    }

    #[tokio::test]
    async fn test_status_channel_and_restart_keep_state() {
        let queue = Arc::new(ApprovalQueue::new());
        let broker = Arc::new(PaperBroker::new(1_000.0));
        let orders = Arc::new(PaperOrderService::new(broker.clone()).with_queue(queue.clone()));
        let mut trading_loop = build_loop(broker.clone(), queue.clone(), orders, settings());
        let status = trading_loop.subscribe_status();

        queue.push(signal("s1"));
        trading_loop.tick().await;
        {
            let latest = status.borrow();
            assert_eq!(latest.metrics.lifetime.signals_executed, 1);
            assert_eq!(latest.guard.as_ref().unwrap().peak_equity, Some(1_000.0));
        }

        for _ in 0..2 {
            let handle = trading_loop.handle();
            let task = tokio::spawn(async move {
                trading_loop.run().await;
                trading_loop
            });
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.stop();
            trading_loop = task.await.unwrap();
        }

        assert_eq!(trading_loop.state(), LoopState::Stopped);
        assert_eq!(trading_loop.guard().entry_equity(), Some(1_000.0));
        assert_eq!(trading_loop.metrics().lifetime.signals_executed, 1);
        assert_eq!(status.borrow().state, LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_heartbeat_boundary_rolls_interval() {
        let approvals = Arc::new(RepeatingApprovals::new(&["s1"]));
        let events = EventEmitter::new();
        let counter = Arc::new(EventCounter::new());
        events.register(counter.clone());
        let mut zero_interval = settings();
        zero_interval.heartbeat_interval_secs = 0;

        let mut trading_loop = TradingLoop::builder()
            .settings(zero_interval)
            .broker(Arc::new(PaperBroker::new(1_000.0)))
            .approvals(approvals)
            .orders(Arc::new(SelectiveOrders::new()))
            .risk_guard(RiskGuard::new(20.0, 100.0).unwrap())
            .events(events)
            .build()
            .unwrap();

        trading_loop.tick().await;
        assert_eq!(counter.count(EventType::Heartbeat), 1);
        assert_eq!(trading_loop.metrics().interval.signals_executed, 0);
        assert_eq!(trading_loop.metrics().lifetime.signals_executed, 1);
    }
}
