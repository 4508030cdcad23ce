use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn, error};

/// Closed set of runtime event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SignalFetched,
    SignalExecuted,
    ExecutionError,
    DrawdownTriggered,
    GuardDegraded,
    Heartbeat,
    LoopStarted,
    LoopStopped,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SignalFetched => "signal_fetched",
            EventType::SignalExecuted => "signal_executed",
            EventType::ExecutionError => "execution_error",
            EventType::DrawdownTriggered => "drawdown_triggered",
            EventType::GuardDegraded => "guard_degraded",
            EventType::Heartbeat => "heartbeat",
            EventType::LoopStarted => "loop_started",
            EventType::LoopStopped => "loop_stopped",
        }
    }

    /// Kinds an operator should notice in the logs
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            EventType::ExecutionError | EventType::DrawdownTriggered | EventType::GuardDegraded
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Build an event from any serializable payload; unserializable payloads become `null`
    pub fn with_payload<T: Serialize>(event_type: EventType, payload: &T) -> Self {
        let value = serde_json::to_value(payload).unwrap_or_else(|e| {
            warn!(event_type = event_type.as_str(), error = %e, "Event payload not serializable");
            serde_json::Value::Null
        });
        Self::new(event_type, value)
    }
}

/// Consumer of emitted events
pub trait EventSink: Send + Sync {
    fn handle(&self, event: &Event) -> Result<()>;

    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Synchronous fan-out of events to registered sinks in registration order
///
/// A failing (or panicking) sink is logged and skipped; the caller of
/// `emit` never sees it.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        debug!(sink = sink.name(), total = sinks.len() + 1, "Registered event sink");
        sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver `event` to every sink, returning how many handled it successfully
    pub fn emit(&self, event: Event) -> usize {
        // Snapshot so a sink may register further sinks without deadlocking
        let sinks: Vec<Arc<dyn EventSink>> = self.sinks.read().unwrap_or_else(|e| e.into_inner()).clone();

        let mut delivered = 0;
        for sink in sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.handle(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(
                    sink = sink.name(),
                    event_type = event.event_type.as_str(),
                    error = %e,
                    "Event sink failed"
                ),
                Err(_) => error!(
                    sink = sink.name(),
                    event_type = event.event_type.as_str(),
                    "Event sink panicked"
                ),
            }
        }
        delivered
    }

    pub fn emit_with<T: Serialize>(&self, event_type: EventType, payload: &T) -> usize {
        self.emit(Event::with_payload(event_type, payload))
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("sinks", &self.sink_count())
            .finish()
    }
}

/// Logs every event through `tracing`
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn handle(&self, event: &Event) -> Result<()> {
        if event.event_type.is_warning() {
            warn!(event_type = event.event_type.as_str(), payload = %event.payload, "⚠️  Runtime event");
        } else {
            debug!(event_type = event.event_type.as_str(), payload = %event.payload, "Runtime event");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Forwards events into an unbounded channel
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn handle(&self, event: &Event) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event channel closed"))
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Passive metrics registry: counts events per type
#[derive(Debug, Default)]
pub struct EventCounter {
    counts: DashMap<EventType, u64>,
}

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, event_type: EventType) -> u64 {
        self.counts.get(&event_type).map(|c| *c).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<EventType, u64> {
        self.counts.iter().map(|entry| (*entry.key(), *entry.value())).collect()
    }
}

impl EventSink for EventCounter {
    fn handle(&self, event: &Event) -> Result<()> {
        *self.counts.entry(event.event_type).or_insert(0) += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "counter"
    }
}
