use thiserror::Error;

/// Fatal setup problems: a missing collaborator or an invalid threshold
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Required dependency missing: {0}")]
    MissingDependency(&'static str),

    #[error("Invalid threshold {name} = {value}: {reason}")]
    InvalidThreshold {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Recoverable failure while fetching or executing a single signal
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to fetch approved signals: {0}")]
    Fetch(String),

    #[error("Execution of signal {signal_id} failed: {reason}")]
    Execute { signal_id: String, reason: String },

    #[error("Order service rejected signal {signal_id}: {reason}")]
    Rejected { signal_id: String, reason: String },
}

/// The risk check itself could not complete
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Account info unavailable: {0}")]
    AccountInfo(String),

    #[error("Account reported unusable equity: {0}")]
    InvalidEquity(f64),

    #[error("Failed to list open positions: {0}")]
    Positions(String),

    #[error("Closed {closed} positions but {failed} failed to close")]
    CloseFailed { closed: u32, failed: u32 },
}

/// Poll-layer negotiation failure; always resolved to a safe fallback
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Compression with {encoding} failed: {reason}")]
    Compression { encoding: &'static str, reason: String },

    #[error("Fingerprint computation failed: {0}")]
    Fingerprint(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Poll state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Pending work source failed: {0}")]
    Source(String),
}
