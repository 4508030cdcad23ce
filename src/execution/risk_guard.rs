/// Account-level drawdown and equity-floor enforcement
///
/// `RiskGuard` is stateful: the entry equity is captured on the first check
/// and the peak equity is carried across every later check for the lifetime
/// of the instance. Drawdown is always measured against that stored peak.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, error, instrument};

use crate::config::{validate_risk, RiskSettings};
use crate::core::{
    AccountInfoProvider, Alert, AlertSeverity, AlertSink, ConfigurationError, GuardError, PositionCloser,
};
use crate::transport::{EventEmitter, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Forced,
    MaxDrawdown,
    EquityFloor,
}

/// Result of a single check; never mutated after it is returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardState {
    pub entry_equity: f64,
    pub peak_equity: f64,
    pub current_equity: f64,
    pub drawdown_percent: f64,
    pub cap_triggered: bool,
    pub trigger: Option<TriggerReason>,
    pub positions_closed: u32,
    pub checked_at: DateTime<Utc>,
}

/// Guard status carried in heartbeats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardSummary {
    pub max_drawdown_percent: f64,
    pub min_equity_absolute: f64,
    pub entry_equity: Option<f64>,
    pub peak_equity: Option<f64>,
    pub last_drawdown_percent: Option<f64>,
    pub last_cap_triggered: bool,
    pub checks: u64,
    pub triggers: u64,
}

/// Peak-to-current decline in percent, clamped to [0, 100]
pub fn drawdown_percent(peak_equity: f64, current_equity: f64) -> f64 {
    if peak_equity <= 0.0 {
        return 0.0;
    }
    ((peak_equity - current_equity) / peak_equity * 100.0).clamp(0.0, 100.0)
}

pub struct RiskGuard {
    max_drawdown_percent: f64,
    min_equity_absolute: f64,
    entry_equity: Option<f64>,
    peak_equity: f64,
    last_state: Option<GuardState>,
    checks: u64,
    triggers: u64,
    alerts: Option<Arc<dyn AlertSink>>,
    events: Option<EventEmitter>,
}

impl RiskGuard {
    pub fn new(max_drawdown_percent: f64, min_equity_absolute: f64) -> Result<Self, ConfigurationError> {
        validate_risk(max_drawdown_percent, min_equity_absolute)?;

        info!(
            max_drawdown_percent = max_drawdown_percent,
            min_equity_absolute = min_equity_absolute,
            "🛡️  Risk guard armed"
        );

        Ok(Self {
            max_drawdown_percent,
            min_equity_absolute,
            entry_equity: None,
            peak_equity: 0.0,
            last_state: None,
            checks: 0,
            triggers: 0,
            alerts: None,
            events: None,
        })
    }

    pub fn from_settings(settings: &RiskSettings) -> Result<Self, ConfigurationError> {
        Self::new(settings.max_drawdown_percent, settings.min_equity_absolute)
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub(crate) fn has_alerts(&self) -> bool {
        self.alerts.is_some()
    }

    pub(crate) fn has_events(&self) -> bool {
        self.events.is_some()
    }

    pub fn entry_equity(&self) -> Option<f64> {
        self.entry_equity
    }

    pub fn peak_equity(&self) -> Option<f64> {
        self.entry_equity.map(|_| self.peak_equity)
    }

    pub fn last_state(&self) -> Option<&GuardState> {
        self.last_state.as_ref()
    }

    pub fn summary(&self) -> GuardSummary {
        GuardSummary {
            max_drawdown_percent: self.max_drawdown_percent,
            min_equity_absolute: self.min_equity_absolute,
            entry_equity: self.entry_equity,
            peak_equity: self.peak_equity(),
            last_drawdown_percent: self.last_state.as_ref().map(|s| s.drawdown_percent),
            last_cap_triggered: self.last_state.as_ref().map(|s| s.cap_triggered).unwrap_or(false),
            checks: self.checks,
            triggers: self.triggers,
        }
    }

    /// Check account health and close every position if a limit is breached
    ///
    /// With `force` the guard enforces unconditionally. The cap is evaluated
    /// per call: a later call with recovered equity reports
    /// `cap_triggered = false` again.
    ///
    /// Provider failures leave the stored entry/peak untouched and are
    /// returned to the caller.
    #[instrument(skip(self, account, closer))]
    pub async fn check_and_enforce<A, C>(
        &mut self,
        account: &A,
        closer: &C,
        force: bool,
    ) -> Result<GuardState, GuardError>
    where
        A: AccountInfoProvider + ?Sized,
        C: PositionCloser + ?Sized,
    {
        let info = account
            .get_account_info()
            .await
            .map_err(|e| GuardError::AccountInfo(e.to_string()))?;

        let current_equity = info.equity;
        // Negative equity is valid input; only NaN/inf are rejected
        if !current_equity.is_finite() {
            return Err(GuardError::InvalidEquity(current_equity));
        }

        let entry_equity = match self.entry_equity {
            Some(entry) => entry,
            None => {
                info!(equity = current_equity, "🛡️  Risk guard captured entry equity");
                self.entry_equity = Some(current_equity);
                self.peak_equity = current_equity;
                current_equity
            }
        };
        if current_equity > self.peak_equity {
            debug!(old_peak = self.peak_equity, new_peak = current_equity, "New equity peak");
            self.peak_equity = current_equity;
        }
        self.checks += 1;

        let drawdown = drawdown_percent(self.peak_equity, current_equity);
        let trigger = if force {
            Some(TriggerReason::Forced)
        } else if drawdown >= self.max_drawdown_percent {
            Some(TriggerReason::MaxDrawdown)
        } else if current_equity < self.min_equity_absolute {
            Some(TriggerReason::EquityFloor)
        } else {
            None
        };

        let mut state = GuardState {
            entry_equity,
            peak_equity: self.peak_equity,
            current_equity,
            drawdown_percent: drawdown,
            cap_triggered: trigger.is_some(),
            trigger,
            positions_closed: 0,
            checked_at: Utc::now(),
        };

        let Some(reason) = trigger else {
            self.last_state = Some(state.clone());
            return Ok(state);
        };

        self.triggers += 1;
        warn!(
            reason = ?reason,
            equity = current_equity,
            peak = self.peak_equity,
            drawdown_percent = drawdown,
            "🚨 Risk cap triggered - closing all positions"
        );

        let close_result = self.close_all(closer).await;
        let (closed, failed) = match &close_result {
            Ok(counts) => *counts,
            Err(_) => (0, 0),
        };
        state.positions_closed = closed;
        self.last_state = Some(state.clone());

        self.notify(&state, reason, failed).await;

        match close_result {
            Ok((closed, 0)) => {
                info!(positions_closed = closed, "🛡️  Risk cap enforced");
                Ok(state)
            }
            Ok((closed, failed)) => Err(GuardError::CloseFailed { closed, failed }),
            Err(e) => Err(e),
        }
    }

    /// Returns (closed, failed) counts
    async fn close_all<C: PositionCloser + ?Sized>(&self, closer: &C) -> Result<(u32, u32), GuardError> {
        let positions = closer
            .get_positions()
            .await
            .map_err(|e| GuardError::Positions(e.to_string()))?;

        let mut closed = 0;
        let mut failed = 0;
        for position in &positions {
            match closer.close(position).await {
                Ok(()) => {
                    closed += 1;
                    debug!(ticket = position.ticket, symbol = %position.symbol, "Closed position");
                }
                Err(e) => {
                    failed += 1;
                    error!(ticket = position.ticket, symbol = %position.symbol, error = %e, "Failed to close position");
                }
            }
        }
        Ok((closed, failed))
    }

    async fn notify(&self, state: &GuardState, reason: TriggerReason, failed: u32) {
        if let Some(events) = &self.events {
            events.emit_with(EventType::DrawdownTriggered, state);
        }

        let Some(alerts) = &self.alerts else {
            return;
        };

        let title = match reason {
            TriggerReason::Forced => "Forced position close",
            TriggerReason::MaxDrawdown => "Max drawdown reached",
            TriggerReason::EquityFloor => "Equity below minimum",
        };
        let mut message = format!(
            "Equity {:.2} (peak {:.2}, entry {:.2}), drawdown {:.2}% (limit {:.2}%), floor {:.2}. Closed {} positions.",
            state.current_equity,
            state.peak_equity,
            state.entry_equity,
            state.drawdown_percent,
            self.max_drawdown_percent,
            self.min_equity_absolute,
            state.positions_closed,
        );
        if failed > 0 {
            message.push_str(&format!(" {} positions failed to close.", failed));
        }

        let alert = Alert::new(AlertSeverity::Critical, title, message);
        if let Err(e) = alerts.send_alert(&alert).await {
            warn!(error = %e, "Failed to deliver risk alert");
        }
    }
}

impl std::fmt::Debug for RiskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGuard")
            .field("max_drawdown_percent", &self.max_drawdown_percent)
            .field("min_equity_absolute", &self.min_equity_absolute)
            .field("entry_equity", &self.entry_equity)
            .field("peak_equity", &self.peak_equity)
            .field("checks", &self.checks)
            .field("triggers", &self.triggers)
            .finish()
    }
}
