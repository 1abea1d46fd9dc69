use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Hash of the empty chain; the first signal links back to this.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Canonical timestamp rendering used in hashed material and in storage.
/// Fixed-width microseconds so text comparison and re-hashing agree.
pub fn canonical_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The chain hash over a signal's identity fields and its predecessor.
#[allow(clippy::too_many_arguments)]
pub fn chain_hash(
    chain_index: i64,
    signal_id: &str,
    symbol: &str,
    action: &str,
    entry_price: f64,
    confidence: f64,
    generated_at: &str,
    prev_hash: &str,
) -> String {
    let material = format!(
        "{chain_index}|{signal_id}|{symbol}|{action}|{entry_price:.8}|{confidence:.8}|{generated_at}|{prev_hash}"
    );
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(digest)
}
