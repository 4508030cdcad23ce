/// Loop counters, reset per heartbeat interval and accumulated for the lifetime

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::risk_guard::GuardSummary;
use super::trading_loop::LoopState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopCounters {
    pub signals_fetched: u64,
    pub signals_executed: u64,
    pub error_count: u64,
    pub guard_failures: u64,
}

/// Owned and mutated only by the trading loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopMetrics {
    pub interval: LoopCounters,
    pub lifetime: LoopCounters,
    pub ticks: u64,
    pub last_tick_duration_ms: u64,
    pub interval_started_at: DateTime<Utc>,
}

impl Default for LoopMetrics {
    fn default() -> Self {
        Self {
            interval: LoopCounters::default(),
            lifetime: LoopCounters::default(),
            ticks: 0,
            last_tick_duration_ms: 0,
            interval_started_at: Utc::now(),
        }
    }
}

impl LoopMetrics {
    pub fn record_fetched(&mut self, count: usize) {
        self.interval.signals_fetched += count as u64;
        self.lifetime.signals_fetched += count as u64;
    }

    pub fn record_executed(&mut self) {
        self.interval.signals_executed += 1;
        self.lifetime.signals_executed += 1;
    }

    pub fn record_error(&mut self) {
        self.interval.error_count += 1;
        self.lifetime.error_count += 1;
    }

    pub fn record_guard_failure(&mut self) {
        self.interval.guard_failures += 1;
        self.lifetime.guard_failures += 1;
    }

    pub fn record_tick(&mut self, duration: Duration) {
        self.ticks += 1;
        self.last_tick_duration_ms = duration.as_millis() as u64;
    }

    /// Close the current interval, returning its counters
    pub fn roll_interval(&mut self) -> LoopCounters {
        self.interval_started_at = Utc::now();
        std::mem::take(&mut self.interval)
    }
}

/// Read-only view of the loop published after every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub trading_paused: bool,
    pub metrics: LoopMetrics,
    pub guard: Option<GuardSummary>,
    pub updated_at: DateTime<Utc>,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: LoopState::Stopped,
            trading_paused: false,
            metrics: LoopMetrics::default(),
            guard: None,
            updated_at: Utc::now(),
        }
    }
}
