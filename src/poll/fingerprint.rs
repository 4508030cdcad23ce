/// Content fingerprint (ETag) of a pending-work batch

use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

use crate::core::ProtocolError;

const FINGERPRINT_SEED: u64 = 0x6d61_7274_656e;

/// Hash of the batch that ignores item order
///
/// Items are serialized individually and the encodings sorted before
/// hashing, so the same pending set yields the same fingerprint regardless
/// of the order the source returns it in. `has_more` is part of the hash.
pub fn fingerprint<T: Serialize>(items: &[T], has_more: bool) -> Result<String, ProtocolError> {
    let mut encoded = items
        .iter()
        .map(serde_json::to_vec)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProtocolError::Fingerprint(e.to_string()))?;
    encoded.sort_unstable();

    let mut hasher = Xxh64::new(FINGERPRINT_SEED);
    hasher.update(&(encoded.len() as u64).to_le_bytes());
    for item in &encoded {
        hasher.update(&(item.len() as u64).to_le_bytes());
        hasher.update(item);
    }
    hasher.update(&[has_more as u8]);

    Ok(format!("{:016x}", hasher.digest()))
}

/// Strip the quoting and weak prefix a client may echo back in `If-None-Match`
pub fn normalize_etag(value: &str) -> &str {
    let value = value.trim();
    let value = value.strip_prefix("W/").unwrap_or(value);
    value.trim_matches('"')
}
