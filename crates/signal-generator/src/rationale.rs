use signal_core::{Consensus, Regime};

/// Context handed to the enrichment hook alongside the template rationale.
pub struct RationaleContext<'a> {
    pub symbol: &'a str,
    pub consensus: &'a Consensus,
    pub regime: Regime,
}

/// Pluggable rationale enrichment (e.g. an LLM elaboration appended to the
/// deterministic template). The core validates only presence and length of
/// the result.
pub trait RationaleEnricher: Send + Sync {
    fn enrich(&self, rationale: String, ctx: &RationaleContext<'_>) -> String;
}

/// Default: the template stands on its own.
pub struct IdentityEnricher;

impl RationaleEnricher for IdentityEnricher {
    fn enrich(&self, rationale: String, _ctx: &RationaleContext<'_>) -> String {
        rationale
    }
}

/// Deterministic template rationale from the consensus and regime. Always
/// comfortably past the 20-character persistence floor.
pub fn build_rationale(symbol: &str, consensus: &Consensus, regime: Regime) -> String {
    let contributors = if consensus.contributing.is_empty() {
        "no contributing sources".to_string()
    } else {
        consensus
            .weights
            .iter()
            .map(|(source_id, weight)| format!("{source_id}={weight:.2}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "{} consensus on {} at {:.1}% confidence in {} regime (weights: {})",
        consensus.direction.as_str(),
        symbol,
        consensus.confidence,
        regime.as_str(),
        contributors
    )
}
