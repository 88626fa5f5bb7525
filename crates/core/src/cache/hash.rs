//! Content-addressed index hashes for deduplicated rows.

use sha2::{Digest, Sha256};

/// Compute the lookup index for a query signature.
///
/// `canonical_params` must already be canonical JSON (sorted keys, array values).
pub fn signature_index(element_type: &str, canonical_params: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(element_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_params.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compute the lookup index for an include fragment.
pub fn include_index(site_id: i64, template: &str, params: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(site_id.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(template.as_bytes());
    hasher.update(b"\n");
    hasher.update(params.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short stable digest used to name query-string variants on disk.
pub fn short_digest(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}
