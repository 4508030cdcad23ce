/// Liveness and health reporting

pub mod heartbeat;

pub use heartbeat::{
    ChannelHeartbeatSink, EventHeartbeatSink, HeartbeatHandle, HeartbeatManager, HeartbeatSink,
    HeartbeatSnapshot, LoopStatusProvider, MetricsProvider, SyncMetricsProvider,
};
