pub mod config;
pub mod core;
pub mod execution;
pub mod monitoring;
pub mod paper;
pub mod poll;
pub mod transport;
pub mod util;

pub use config::RuntimeConfig;
pub use execution::{RiskGuard, TradingLoop};
pub use poll::AdaptivePollProtocol;
