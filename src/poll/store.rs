/// Per-client poll state storage
///
/// Concurrent polls for the same client must not race: `observe` applies
/// an observation and returns the resulting state as one atomic step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::core::ProtocolError;

use super::backoff::{PollClientState, PollObservation};

#[async_trait]
pub trait PollStateStore: Send + Sync {
    async fn observe(&self, client_id: &str, observation: PollObservation) -> Result<PollClientState, ProtocolError>;

    async fn get(&self, client_id: &str) -> Result<Option<PollClientState>, ProtocolError>;
}

/// DashMap-backed store; the shard lock held by `entry` serializes updates per key
#[derive(Debug, Clone, Default)]
pub struct InMemoryPollStore {
    clients: Arc<DashMap<String, PollClientState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryPollStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Simulate an outage of the backing store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), ProtocolError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProtocolError::StoreUnavailable("in-memory poll store disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PollStateStore for InMemoryPollStore {
    async fn observe(&self, client_id: &str, observation: PollObservation) -> Result<PollClientState, ProtocolError> {
        self.ensure_available()?;
        let mut entry = self.clients.entry(client_id.to_string()).or_default();
        entry.record(&observation);
        Ok(entry.clone())
    }

    async fn get(&self, client_id: &str) -> Result<Option<PollClientState>, ProtocolError> {
        self.ensure_available()?;
        Ok(self.clients.get(client_id).map(|state| state.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn observation(pending: usize) -> PollObservation {
        PollObservation {
            pending,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_observe_creates_and_updates_client() {
        let store = InMemoryPollStore::new();
        assert_eq!(store.get("terminal-1").await.unwrap(), None);

        store.observe("terminal-1", observation(0)).await.unwrap();
        let state = store.observe("terminal-1", observation(0)).await.unwrap();
        assert_eq!(state.consecutive_empty, 2);
        assert_eq!(state.total_polls, 2);
        assert_eq!(store.client_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_observations_are_not_lost() {
        let store = InMemoryPollStore::new();
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.observe("shared", observation(0)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let state = store.get("shared").await.unwrap().unwrap();
        assert_eq!(state.total_polls, 64);
        assert_eq!(state.consecutive_empty, 64);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = InMemoryPollStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.observe("c", observation(1)).await,
            Err(ProtocolError::StoreUnavailable(_))
        ));
    }
}
