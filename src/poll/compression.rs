/// Response compression for the poll endpoint
///
/// The server picks the first encoding from `PREFERENCE` that is both
/// enabled in config and acceptable to the client. Any compression failure
/// degrades to identity; a poll response is never failed because of it.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::ProtocolError;

const ZSTD_LEVEL: i32 = 3;
const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LGWIN: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    Zstd,
    Brotli,
    Gzip,
    Identity,
}

/// Server preference, best first
pub const PREFERENCE: [ContentEncoding; 3] = [ContentEncoding::Zstd, ContentEncoding::Brotli, ContentEncoding::Gzip];

impl ContentEncoding {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "zstd" => Some(ContentEncoding::Zstd),
            "br" => Some(ContentEncoding::Brotli),
            "gzip" | "x-gzip" => Some(ContentEncoding::Gzip),
            "identity" => Some(ContentEncoding::Identity),
            _ => None,
        }
    }

    /// Value for the `Content-Encoding` header
    pub fn token(&self) -> &'static str {
        match self {
            ContentEncoding::Zstd => "zstd",
            ContentEncoding::Brotli => "br",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Identity => "identity",
        }
    }
}

/// Parse an `Accept-Encoding` value into `(coding, q)` pairs
///
/// A malformed q-value disqualifies its coding.
pub fn parse_accept_encoding(header: &str) -> Vec<(String, f32)> {
    header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let coding = pieces.next()?.trim().to_ascii_lowercase();
            if coding.is_empty() {
                return None;
            }

            let mut q = 1.0;
            for param in pieces {
                let param = param.trim();
                if let Some(value) = param.strip_prefix("q=").or_else(|| param.strip_prefix("Q=")) {
                    q = value.trim().parse::<f32>().unwrap_or(0.0);
                }
            }
            Some((coding, q))
        })
        .collect()
}

/// Choose the response encoding for a client
pub fn negotiate(accept_encoding: Option<&str>, enabled: &[ContentEncoding]) -> ContentEncoding {
    let Some(header) = accept_encoding else {
        return ContentEncoding::Identity;
    };
    let accepted = parse_accept_encoding(header);
    let wildcard = accepted.iter().find(|(coding, _)| coding == "*").map(|(_, q)| *q);

    for candidate in PREFERENCE {
        if !enabled.contains(&candidate) {
            continue;
        }
        let q = accepted
            .iter()
            .find(|(coding, _)| ContentEncoding::from_token(coding) == Some(candidate))
            .map(|(_, q)| *q)
            .or(wildcard)
            .unwrap_or(0.0);
        if q > 0.0 {
            return candidate;
        }
    }
    ContentEncoding::Identity
}

pub fn compress(encoding: ContentEncoding, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let failed = |e: std::io::Error| ProtocolError::Compression {
        encoding: encoding.token(),
        reason: e.to_string(),
    };

    match encoding {
        ContentEncoding::Identity => Ok(data.to_vec()),
        ContentEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).map_err(failed)?;
            encoder.finish().map_err(failed)
        }
        ContentEncoding::Zstd => zstd::stream::encode_all(data, ZSTD_LEVEL).map_err(failed),
        ContentEncoding::Brotli => {
            let mut writer = brotli::CompressorWriter::new(Vec::new(), BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_LGWIN);
            writer.write_all(data).map_err(failed)?;
            Ok(writer.into_inner())
        }
    }
}

/// Negotiation plus size threshold plus identity fallback
#[derive(Debug, Clone)]
pub struct Compressor {
    enabled: Vec<ContentEncoding>,
    min_bytes: usize,
}

impl Compressor {
    pub fn new(enabled: Vec<ContentEncoding>, min_bytes: usize) -> Self {
        Self { enabled, min_bytes }
    }

    pub fn encode(&self, accept_encoding: Option<&str>, body: Vec<u8>) -> (ContentEncoding, Vec<u8>) {
        if body.len() < self.min_bytes {
            return (ContentEncoding::Identity, body);
        }

        let encoding = negotiate(accept_encoding, &self.enabled);
        if encoding == ContentEncoding::Identity {
            return (encoding, body);
        }

        match compress(encoding, &body) {
            Ok(compressed) if compressed.len() < body.len() => {
                debug!(
                    encoding = encoding.token(),
                    original = body.len(),
                    compressed = compressed.len(),
                    "Compressed poll response"
                );
                (encoding, compressed)
            }
            Ok(_) => (ContentEncoding::Identity, body),
            Err(e) => {
                warn!(error = %e, "Compression failed - sending identity");
                (ContentEncoding::Identity, body)
            }
        }
    }
}
