/// Per-client poll history and the next-poll recommendation derived from it

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PollSettings;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollClientState {
    pub consecutive_empty: u32,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_work_at: Option<DateTime<Utc>>,
    pub total_polls: u64,
}

/// What one poll saw, applied atomically to the client's state
#[derive(Debug, Clone)]
pub struct PollObservation {
    pub pending: usize,
    pub at: DateTime<Utc>,
}

impl PollClientState {
    pub fn record(&mut self, observation: &PollObservation) {
        self.total_polls += 1;
        self.last_poll_at = Some(observation.at);

        if observation.pending > 0 {
            self.consecutive_empty = 0;
            self.last_work_at = Some(observation.at);
        } else {
            self.consecutive_empty = self.consecutive_empty.saturating_add(1);
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    fast: Duration,
    max: Duration,
    multiplier: f64,
    recent_work_window: Duration,
}

impl BackoffPolicy {
    pub fn new(fast: Duration, max: Duration, multiplier: f64, recent_work_window: Duration) -> Self {
        Self {
            fast,
            max: max.max(fast),
            multiplier: multiplier.max(1.0),
            recent_work_window,
        }
    }

    pub fn from_settings(settings: &PollSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.fast_delay_secs),
            Duration::from_secs(settings.max_delay_secs),
            settings.backoff_multiplier,
            Duration::from_secs(settings.recent_work_window_secs),
        )
    }

    pub fn fast(&self) -> Duration {
        self.fast
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Advisory delay before the client's next poll
    ///
    /// Fast while work is pending or was seen within the recent-work window;
    /// otherwise grows geometrically with the empty streak, capped at `max`.
    pub fn recommend(&self, state: &PollClientState, now: DateTime<Utc>) -> Duration {
        if state.consecutive_empty == 0 || self.saw_recent_work(state, now) {
            return self.fast;
        }

        let exponent = (state.consecutive_empty - 1).min(64) as i32;
        let secs = self.fast.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    fn saw_recent_work(&self, state: &PollClientState, now: DateTime<Utc>) -> bool {
        let Some(last_work) = state.last_work_at else {
            return false;
        };
        match (now - last_work).to_std() {
            Ok(elapsed) => elapsed <= self.recent_work_window,
            // Clock went backwards: treat as recent
            Err(_) => true,
        }
    }
}
