/// Terminal rendering of heartbeat snapshots

use anyhow::Result;
use colored::Colorize;

use crate::execution::LoopState;
use crate::monitoring::{HeartbeatSink, HeartbeatSnapshot};

pub fn render_heartbeat(snapshot: &HeartbeatSnapshot) -> String {
    let state = match snapshot.state {
        LoopState::Running if snapshot.trading_paused => "⏸️  PAUSED".yellow().bold(),
        LoopState::Running => "🟢 RUNNING".green().bold(),
        LoopState::Starting => "🟡 STARTING".yellow(),
        LoopState::Stopping => "🟠 STOPPING".yellow(),
        LoopState::Stopped => "🔴 STOPPED".red(),
    };

    let interval = &snapshot.metrics.interval;
    let errors = if interval.error_count > 0 {
        interval.error_count.to_string().red().bold()
    } else {
        interval.error_count.to_string().normal()
    };

    let mut out = format!(
        "{} #{} {} | up {}s | ticks {} | fetched {} | executed {} | errors {}",
        "💓",
        snapshot.sequence,
        state,
        snapshot.uptime_secs,
        snapshot.metrics.ticks,
        interval.signals_fetched,
        interval.signals_executed.to_string().green(),
        errors,
    );

    if let Some(guard) = &snapshot.guard {
        let drawdown = guard.last_drawdown_percent.unwrap_or(0.0);
        let drawdown_text = format!("{:.2}%", drawdown);
        let drawdown_colored = if guard.last_cap_triggered || drawdown >= guard.max_drawdown_percent {
            drawdown_text.red().bold()
        } else if drawdown >= guard.max_drawdown_percent / 2.0 {
            drawdown_text.yellow()
        } else {
            drawdown_text.green()
        };
        out.push_str(&format!(
            "\n   🛡️  peak {} | drawdown {} / {:.2}% | triggers {}",
            guard
                .peak_equity
                .map(|p| format!("{:.2}", p))
                .unwrap_or_else(|| "-".to_string()),
            drawdown_colored,
            guard.max_drawdown_percent,
            guard.triggers,
        ));
    }
    out
}

/// Prints each snapshot to stdout
#[derive(Debug, Default)]
pub struct ConsoleHeartbeatSink;

impl HeartbeatSink for ConsoleHeartbeatSink {
    fn record(&self, snapshot: &HeartbeatSnapshot) -> Result<()> {
        println!("{}", render_heartbeat(snapshot));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{GuardSummary, LoopStatus};
    use std::time::Duration;

    #[test]
    fn test_render_includes_counters_and_guard() {
        let mut status = LoopStatus::default();
        status.state = LoopState::Running;
        status.metrics.ticks = 42;
        status.metrics.interval.signals_executed = 7;
        status.guard = Some(GuardSummary {
            max_drawdown_percent: 20.0,
            min_equity_absolute: 100.0,
            entry_equity: Some(10_000.0),
            peak_equity: Some(10_500.0),
            last_drawdown_percent: Some(3.25),
            last_cap_triggered: false,
            checks: 42,
            triggers: 0,
        });

        let rendered = render_heartbeat(&HeartbeatSnapshot::from_status(3, Duration::from_secs(90), status));
        assert!(rendered.contains("#3"));
        assert!(rendered.contains("RUNNING"));
        assert!(rendered.contains("ticks 42"));
        assert!(rendered.contains("10500.00"));
        assert!(rendered.contains("3.25%"));
    }

    #[test]
    fn test_render_marks_paused() {
        let mut status = LoopStatus::default();
        status.state = LoopState::Running;
        status.trading_paused = true;
        let rendered = render_heartbeat(&HeartbeatSnapshot::from_status(1, Duration::ZERO, status));
        assert!(rendered.contains("PAUSED"));
    }
}
