pub mod events;

pub use events::{ChannelSink, Event, EventCounter, EventEmitter, EventSink, EventType, TracingSink};
