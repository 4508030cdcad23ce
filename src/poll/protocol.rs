/// Server side of the adaptive poll endpoint
///
/// One `handle` call per incoming request. The result is always a valid
/// response: store, fingerprint and compression failures each degrade to a
/// safe default, and a failing work source yields `Deferred`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn, instrument};

use crate::config::PollSettings;
use crate::core::{ConfigurationError, PendingWorkSource, ProtocolError, Signal};

use super::backoff::{BackoffPolicy, PollObservation};
use super::compression::{Compressor, ContentEncoding};
use super::fingerprint::{fingerprint, normalize_etag};
use super::store::PollStateStore;

#[derive(Debug, Clone, Default)]
pub struct PollRequest {
    pub client_id: String,
    pub if_none_match: Option<String>,
    pub accept_encoding: Option<String>,
}

impl PollRequest {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn if_none_match(mut self, fingerprint: impl Into<String>) -> Self {
        self.if_none_match = Some(fingerprint.into());
        self
    }

    pub fn accept_encoding(mut self, header: impl Into<String>) -> Self {
        self.accept_encoding = Some(header.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    /// Body carries the current batch
    Fresh,
    /// Client already holds the current batch; body is empty
    NotModified,
    /// Work source unavailable; retry after the hint
    Deferred,
}

/// JSON body of a fresh response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollBatch {
    pub items: Vec<Signal>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct PollResponse {
    pub status: PollStatus,
    pub encoding: ContentEncoding,
    pub body: Vec<u8>,
    pub fingerprint: Option<String>,
    pub next_poll_after: Duration,
    pub item_count: usize,
    pub has_more: bool,
}

impl PollResponse {
    pub fn http_status(&self) -> u16 {
        match self.status {
            PollStatus::Fresh => 200,
            PollStatus::NotModified => 304,
            PollStatus::Deferred => 204,
        }
    }

    /// Header pairs for the host HTTP layer
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-Next-Poll-After", self.next_poll_after.as_secs_f64().ceil().to_string()),
            ("Vary", "Accept-Encoding".to_string()),
        ];
        if let Some(fingerprint) = &self.fingerprint {
            headers.push(("ETag", format!("\"{}\"", fingerprint)));
        }
        if self.status == PollStatus::Fresh {
            headers.push(("Content-Type", "application/json".to_string()));
            if self.encoding != ContentEncoding::Identity {
                headers.push(("Content-Encoding", self.encoding.token().to_string()));
            }
        }
        headers
    }
}

pub struct AdaptivePollProtocol {
    source: Arc<dyn PendingWorkSource>,
    store: Arc<dyn PollStateStore>,
    backoff: BackoffPolicy,
    compressor: Compressor,
    max_batch_size: usize,
}

impl AdaptivePollProtocol {
    pub fn new(
        settings: &PollSettings,
        source: Arc<dyn PendingWorkSource>,
        store: Arc<dyn PollStateStore>,
    ) -> Result<Self, ConfigurationError> {
        if settings.max_batch_size == 0 {
            return Err(ConfigurationError::Invalid("poll.max_batch_size must be > 0".into()));
        }
        let encodings = settings.enabled_encodings()?;

        Ok(Self {
            source,
            store,
            backoff: BackoffPolicy::from_settings(settings),
            compressor: Compressor::new(encodings, settings.min_compress_bytes),
            max_batch_size: settings.max_batch_size,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    #[instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn handle(&self, request: &PollRequest) -> PollResponse {
        let now = Utc::now();

        // One extra item tells us whether the batch was truncated
        let mut items = match self.source.pending_for(&request.client_id, self.max_batch_size + 1).await {
            Ok(items) => items,
            Err(e) => {
                let err = ProtocolError::Source(e.to_string());
                warn!(error = %err, "Pending work unavailable - deferring poll");
                return self.deferred();
            }
        };
        let has_more = items.len() > self.max_batch_size;
        items.truncate(self.max_batch_size);
        // The fingerprint ignores order, so the body must not depend on it either
        items.sort_by(|a, b| a.approved_at.cmp(&b.approved_at).then_with(|| a.id.cmp(&b.id)));

        let current = match fingerprint(&items, has_more) {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!(error = %e, "Fingerprint failed - conditional response disabled");
                None
            }
        };

        let observation = PollObservation {
            pending: items.len(),
            at: now,
        };
        let (next_poll_after, conditional) = match self.store.observe(&request.client_id, observation).await {
            Ok(state) => (self.backoff.recommend(&state, now), true),
            Err(e) => {
                warn!(error = %e, "Poll state store unavailable - serving fresh response");
                (self.backoff.fast(), false)
            }
        };

        let unchanged = conditional
            && matches!(
                (&current, request.if_none_match.as_deref()),
                (Some(current), Some(supplied)) if normalize_etag(supplied) == current
            );

        if unchanged {
            debug!(items = items.len(), next_poll_secs = next_poll_after.as_secs_f64(), "Poll unchanged");
            return PollResponse {
                status: PollStatus::NotModified,
                encoding: ContentEncoding::Identity,
                body: Vec::new(),
                fingerprint: current,
                next_poll_after,
                item_count: items.len(),
                has_more,
            };
        }

        let item_count = items.len();
        let batch = PollBatch { items, has_more };
        let body = match serde_json::to_vec(&batch) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %ProtocolError::from(e), "Poll body serialization failed - deferring poll");
                return self.deferred();
            }
        };
        let (encoding, body) = self.compressor.encode(request.accept_encoding.as_deref(), body);

        debug!(
            items = item_count,
            has_more = has_more,
            encoding = encoding.token(),
            bytes = body.len(),
            next_poll_secs = next_poll_after.as_secs_f64(),
            "Poll served"
        );

        PollResponse {
            status: PollStatus::Fresh,
            encoding,
            body,
            fingerprint: current,
            next_poll_after,
            item_count,
            has_more,
        }
    }

    fn deferred(&self) -> PollResponse {
        PollResponse {
            status: PollStatus::Deferred,
            encoding: ContentEncoding::Identity,
            body: Vec::new(),
            fingerprint: None,
            next_poll_after: self.backoff.fast(),
            item_count: 0,
            has_more: false,
        }
    }
}
