/// Adaptive poll protocol for remote execution clients

pub mod backoff;
pub mod compression;
pub mod fingerprint;
pub mod protocol;
pub mod store;

pub use backoff::{BackoffPolicy, PollClientState, PollObservation};
pub use compression::{negotiate, Compressor, ContentEncoding};
pub use fingerprint::fingerprint;
pub use protocol::{AdaptivePollProtocol, PollBatch, PollRequest, PollResponse, PollStatus};
pub use store::{InMemoryPollStore, PollStateStore};
