/// In-process paper trading collaborators
///
/// Used by the dry-run binary and throughout the test suite. Nothing here
/// talks to a real broker: fills are synthetic, and equity only moves when
/// `PaperBroker::set_equity` is called.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn, error};

use crate::core::{
    AccountInfo, AccountInfoProvider, Alert, AlertSeverity, AlertSink, ApprovalsSource, ExecutionReport,
    OrderService, PendingWorkSource, Position, PositionCloser, Signal, SignalSide,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
struct PaperAccount {
    balance: f64,
    equity: f64,
    positions: Vec<Position>,
    next_ticket: u64,
}

/// Simulated broker account holding equity and open positions
#[derive(Debug)]
pub struct PaperBroker {
    account: Mutex<PaperAccount>,
    offline: AtomicBool,
}

impl PaperBroker {
    pub fn new(starting_equity: f64) -> Self {
        Self {
            account: Mutex::new(PaperAccount {
                balance: starting_equity,
                equity: starting_equity,
                positions: Vec::new(),
                next_ticket: 1,
            }),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_equity(&self, equity: f64) {
        lock(&self.account).equity = equity;
    }

    pub fn equity(&self) -> f64 {
        lock(&self.account).equity
    }

    /// While offline every broker call fails, as a dropped terminal would
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn open_position(&self, symbol: &str, side: SignalSide, volume: f64, open_price: f64) -> Position {
        let mut account = lock(&self.account);
        let position = Position {
            ticket: account.next_ticket,
            symbol: symbol.to_string(),
            side,
            volume,
            open_price,
            profit: 0.0,
        };
        account.next_ticket += 1;
        account.positions.push(position.clone());
        position
    }

    pub fn open_position_count(&self) -> usize {
        lock(&self.account).positions.len()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("paper broker offline");
        }
        Ok(())
    }
}

#[async_trait]
impl AccountInfoProvider for PaperBroker {
    async fn get_account_info(&self) -> Result<AccountInfo> {
        self.ensure_online()?;
        let account = lock(&self.account);
        Ok(AccountInfo {
            balance: account.balance,
            equity: account.equity,
        })
    }
}

#[async_trait]
impl PositionCloser for PaperBroker {
    async fn get_positions(&self) -> Result<Vec<Position>> {
        self.ensure_online()?;
        Ok(lock(&self.account).positions.clone())
    }

    async fn close(&self, position: &Position) -> Result<()> {
        self.ensure_online()?;
        let mut account = lock(&self.account);
        let before = account.positions.len();
        account.positions.retain(|p| p.ticket != position.ticket);
        if account.positions.len() == before {
            anyhow::bail!("position {} not found", position.ticket);
        }
        account.balance += position.profit;
        debug!(ticket = position.ticket, symbol = %position.symbol, "📄 Paper position closed");
        Ok(())
    }
}

/// FIFO of approved signals
///
/// Fetching does not consume: a signal stays approved until
/// `mark_executed` or `mark_failed` removes it, so consumers must
/// deduplicate.
#[derive(Debug, Default)]
pub struct ApprovalQueue {
    pending: Mutex<VecDeque<Signal>>,
}

impl ApprovalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, signal: Signal) {
        debug!(signal_id = %signal.id, symbol = %signal.symbol, "Signal approved");
        lock(&self.pending).push_back(signal);
    }

    pub fn mark_executed(&self, signal_id: &str) -> bool {
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|s| s.id != signal_id);
        pending.len() != before
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn first(&self, limit: usize) -> Vec<Signal> {
        lock(&self.pending).iter().take(limit).cloned().collect()
    }
}

#[async_trait]
impl ApprovalsSource for ApprovalQueue {
    async fn fetch_approved_signals(&self, batch_size: usize) -> Result<Vec<Signal>> {
        Ok(self.first(batch_size))
    }

    async fn mark_failed(&self, signal_id: &str, reason: &str) -> Result<()> {
        if self.mark_executed(signal_id) {
            debug!(signal_id = %signal_id, reason = %reason, "Failed signal withdrawn");
        }
        Ok(())
    }
}

#[async_trait]
impl PendingWorkSource for ApprovalQueue {
    async fn pending_for(&self, _client_id: &str, limit: usize) -> Result<Vec<Signal>> {
        Ok(self.first(limit))
    }
}

/// Fills every signal immediately at a fixed simulated price
pub struct PaperOrderService {
    broker: Arc<PaperBroker>,
    queue: Option<Arc<ApprovalQueue>>,
    fill_price: f64,
    next_order: AtomicU64,
}

impl PaperOrderService {
    pub fn new(broker: Arc<PaperBroker>) -> Self {
        Self {
            broker,
            queue: None,
            fill_price: 1.0,
            next_order: AtomicU64::new(1),
        }
    }

    /// Remove executed signals from `queue`
    pub fn with_queue(mut self, queue: Arc<ApprovalQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_fill_price(mut self, fill_price: f64) -> Self {
        self.fill_price = fill_price;
        self
    }
}

#[async_trait]
impl OrderService for PaperOrderService {
    async fn execute(&self, signal: &Signal) -> Result<ExecutionReport> {
        let started = Instant::now();

        if !signal.volume.is_finite() || signal.volume <= 0.0 {
            return Ok(ExecutionReport {
                success: false,
                order_id: None,
                execution_time_ms: started.elapsed().as_millis() as u64,
                message: Some(format!("invalid volume {}", signal.volume)),
            });
        }

        self.broker.ensure_online()?;
        let position = self
            .broker
            .open_position(&signal.symbol, signal.side, signal.volume, self.fill_price);
        let order_id = format!("PAPER-{}", self.next_order.fetch_add(1, Ordering::SeqCst));

        if let Some(queue) = &self.queue {
            queue.mark_executed(&signal.id);
        }

        info!(
            signal_id = %signal.id,
            order_id = %order_id,
            ticket = position.ticket,
            side = ?signal.side,
            volume = signal.volume,
            "📄 Paper fill"
        );

        Ok(ExecutionReport {
            success: true,
            order_id: Some(order_id),
            execution_time_ms: started.elapsed().as_millis() as u64,
            message: Some("DRY_RUN_SIMULATION".to_string()),
        })
    }
}

/// Logs alerts and keeps them for inspection
#[derive(Debug, Default)]
pub struct AlertLog {
    alerts: Mutex<Vec<Alert>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        lock(&self.alerts).clone()
    }
}

#[async_trait]
impl AlertSink for AlertLog {
    async fn send_alert(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical => error!(title = %alert.title, message = %alert.message, "🚨 ALERT"),
            AlertSeverity::Warning => warn!(title = %alert.title, message = %alert.message, "⚠️  ALERT"),
            AlertSeverity::Info => info!(title = %alert.title, message = %alert.message, "ℹ️  ALERT"),
        }
        lock(&self.alerts).push(alert.clone());
        Ok(())
    }
}
