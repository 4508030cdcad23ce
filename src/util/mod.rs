pub mod display;

pub use display::{render_heartbeat, ConsoleHeartbeatSink};
