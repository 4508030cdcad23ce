/// Runtime configuration structures

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::ConfigurationError;
use crate::poll::ContentEncoding;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub trading_loop: LoopSettings,
    pub risk: RiskSettings,
    pub heartbeat: HeartbeatSettings,
    pub poll: PollSettings,
    pub logging: LoggingSettings,
    pub paper: PaperSettings,
}

/// What the loop does after the risk check itself fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardFailurePolicy {
    /// Keep fetching and executing signals while the guard is degraded
    Continue,
    /// Stop fetching and executing until a guard check succeeds again
    Pause,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoopSettings {
    pub tick_interval_ms: u64,
    pub batch_size: usize,
    pub guard_failure_policy: GuardFailurePolicy,
    pub idempotency_capacity: usize,
    pub idempotency_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            batch_size: 10,
            guard_failure_policy: GuardFailurePolicy::Pause,
            idempotency_capacity: 10_000,
            idempotency_ttl_secs: 86_400,
            heartbeat_interval_secs: 60,
        }
    }
}

impl LoopSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RiskSettings {
    pub max_drawdown_percent: f64,
    pub min_equity_absolute: f64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_drawdown_percent: 20.0,
            min_equity_absolute: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_secs: u64,
    pub console: bool,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            console: true,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollSettings {
    pub fast_delay_secs: u64,
    pub max_delay_secs: u64,
    pub backoff_multiplier: f64,
    pub recent_work_window_secs: u64,
    pub max_batch_size: usize,
    pub min_compress_bytes: usize,
    /// Encodings the server is willing to produce, e.g. `["zstd", "br", "gzip"]`
    pub encodings: Vec<String>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            fast_delay_secs: 10,
            max_delay_secs: 60,
            backoff_multiplier: 1.5,
            recent_work_window_secs: 30,
            max_batch_size: 50,
            min_compress_bytes: 1024,
            encodings: vec!["zstd".to_string(), "br".to_string(), "gzip".to_string()],
        }
    }
}

impl PollSettings {
    /// Parsed encoding list; unknown names are a configuration error
    pub fn enabled_encodings(&self) -> Result<Vec<ContentEncoding>, ConfigurationError> {
        self.encodings
            .iter()
            .map(|name| {
                ContentEncoding::from_token(name)
                    .ok_or_else(|| ConfigurationError::Invalid(format!("unknown poll encoding '{}'", name)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub directory: String,
    pub file_prefix: String,
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            file_prefix: "marten.log".to_string(),
            level: "info".to_string(),
        }
    }
}

/// Dry-run collaborators used by the binary
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PaperSettings {
    pub starting_equity: f64,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self { starting_equity: 10_000.0 }
    }
}

impl RuntimeConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_risk(self.risk.max_drawdown_percent, self.risk.min_equity_absolute)?;

        let lp = &self.trading_loop;
        if lp.tick_interval_ms == 0 {
            return Err(ConfigurationError::Invalid("trading_loop.tick_interval_ms must be > 0".into()));
        }
        if lp.batch_size == 0 {
            return Err(ConfigurationError::Invalid("trading_loop.batch_size must be > 0".into()));
        }
        if lp.idempotency_capacity == 0 || lp.idempotency_ttl_secs == 0 {
            return Err(ConfigurationError::Invalid(
                "trading_loop idempotency capacity and ttl must be > 0".into(),
            ));
        }
        if lp.heartbeat_interval_secs == 0 || self.heartbeat.interval_secs == 0 {
            return Err(ConfigurationError::Invalid("heartbeat intervals must be > 0".into()));
        }

        let poll = &self.poll;
        if poll.fast_delay_secs == 0 {
            return Err(ConfigurationError::Invalid("poll.fast_delay_secs must be > 0".into()));
        }
        if poll.max_delay_secs < poll.fast_delay_secs {
            return Err(ConfigurationError::Invalid(format!(
                "poll.max_delay_secs ({}) must be >= poll.fast_delay_secs ({})",
                poll.max_delay_secs, poll.fast_delay_secs
            )));
        }
        if !(poll.backoff_multiplier >= 1.0 && poll.backoff_multiplier.is_finite()) {
            return Err(ConfigurationError::InvalidThreshold {
                name: "poll.backoff_multiplier",
                value: poll.backoff_multiplier,
                reason: "must be a finite value >= 1.0",
            });
        }
        if poll.max_batch_size == 0 {
            return Err(ConfigurationError::Invalid("poll.max_batch_size must be > 0".into()));
        }
        if poll.encodings.is_empty() {
            return Err(ConfigurationError::Invalid("poll.encodings must list at least one encoding".into()));
        }
        poll.enabled_encodings()?;

        if !(self.paper.starting_equity > 0.0) {
            return Err(ConfigurationError::InvalidThreshold {
                name: "paper.starting_equity",
                value: self.paper.starting_equity,
                reason: "must be > 0",
            });
        }

        Ok(())
    }
}

/// Shared by the config layer and `RiskGuard::new`
pub fn validate_risk(max_drawdown_percent: f64, min_equity_absolute: f64) -> Result<(), ConfigurationError> {
    if !(max_drawdown_percent > 0.0 && max_drawdown_percent < 100.0) {
        return Err(ConfigurationError::InvalidThreshold {
            name: "max_drawdown_percent",
            value: max_drawdown_percent,
            reason: "must be strictly between 0 and 100",
        });
    }
    if !(min_equity_absolute > 0.0 && min_equity_absolute.is_finite()) {
        return Err(ConfigurationError::InvalidThreshold {
            name: "min_equity_absolute",
            value: min_equity_absolute,
            reason: "must be a finite value > 0",
        });
    }
    Ok(())
}
