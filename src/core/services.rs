/// Collaborator interfaces consumed by the runtime
///
/// Implementations live outside this crate (broker bridge, approvals
/// database, notification service). The `paper` module provides in-memory
/// versions for dry runs and tests.

use anyhow::Result;
use async_trait::async_trait;

use super::types::{AccountInfo, Alert, ExecutionReport, Position, Signal};

#[async_trait]
pub trait ApprovalsSource: Send + Sync {
    /// Approved signals, oldest first, at most `batch_size` of them
    async fn fetch_approved_signals(&self, batch_size: usize) -> Result<Vec<Signal>>;

    /// Withdraw a signal whose single execution attempt failed
    ///
    /// Sources that settle signals some other way can keep the default.
    async fn mark_failed(&self, _signal_id: &str, _reason: &str) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait OrderService: Send + Sync {
    async fn execute(&self, signal: &Signal) -> Result<ExecutionReport>;
}

#[async_trait]
pub trait AccountInfoProvider: Send + Sync {
    async fn get_account_info(&self) -> Result<AccountInfo>;
}

#[async_trait]
pub trait PositionCloser: Send + Sync {
    async fn get_positions(&self) -> Result<Vec<Position>>;
    async fn close(&self, position: &Position) -> Result<()>;
}

/// Broker connection: account state plus position control
pub trait BrokerClient: AccountInfoProvider + PositionCloser {}

impl<T: AccountInfoProvider + PositionCloser> BrokerClient for T {}

/// Fire-and-forget operator notifications
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, alert: &Alert) -> Result<()>;
}

/// Approved work visible to a remote execution client
#[async_trait]
pub trait PendingWorkSource: Send + Sync {
    async fn pending_for(&self, client_id: &str, limit: usize) -> Result<Vec<Signal>>;
}
