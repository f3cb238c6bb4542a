//! Snapshot digests used to detect silent divergence between replicas.

/// Hex-encoded BLAKE3 digest of a document snapshot.
pub fn checksum(snapshot: &str) -> String {
    blake3::hash(snapshot.as_bytes()).to_hex().to_string()
}
