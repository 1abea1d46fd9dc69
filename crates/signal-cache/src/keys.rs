use chrono::{DateTime, Utc};
use signal_core::SourceSignal;

/// Shared-tier key for per-source data: `(source_id, symbol, rounded
/// timestamp)`. The rounding quantum is the TTL in force at write time, so
/// instances reading within the same TTL window share one entry.
pub fn source_key(source_id: &str, symbol: &str, now: DateTime<Utc>, quantum_secs: u64) -> String {
    let bucket = round_timestamp(now, quantum_secs);
    format!("src:{source_id}:{symbol}:{bucket}")
}

/// Local-tier key for per-source data.
pub fn source_local_key(source_id: &str, symbol: &str) -> String {
    format!("src:{source_id}:{symbol}")
}

/// Consensus key quantization: confidences floor-rounded to the nearest 5,
/// tuples sorted by source id, so near-identical input sets hit the same
/// entry.
pub fn consensus_key(symbol: &str, signals: &[SourceSignal]) -> String {
    let mut parts: Vec<String> = signals
        .iter()
        .map(|s| {
            format!(
                "{}={}@{}",
                s.source_id,
                s.direction.as_str(),
                quantize_confidence(s.confidence)
            )
        })
        .collect();
    parts.sort();
    format!("consensus:{symbol}:{}", parts.join("|"))
}

pub fn quantize_confidence(confidence: f64) -> i64 {
    ((confidence / 5.0).floor() * 5.0) as i64
}

fn round_timestamp(ts: DateTime<Utc>, quantum_secs: u64) -> i64 {
    let quantum = quantum_secs.max(1) as i64;
    ts.timestamp() / quantum * quantum
}
