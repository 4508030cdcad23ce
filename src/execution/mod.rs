/// Execution runtime: the trading loop and its risk guard

pub mod idempotency;
pub mod metrics;
pub mod risk_guard;
pub mod trading_loop;

pub use idempotency::ExecutedSignals;
pub use metrics::{LoopCounters, LoopMetrics, LoopStatus};
pub use risk_guard::{drawdown_percent, GuardState, GuardSummary, RiskGuard, TriggerReason};
pub use trading_loop::{LoopHandle, LoopState, TickReport, TradingLoop, TradingLoopBuilder};
