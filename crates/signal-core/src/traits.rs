use async_trait::async_trait;

use crate::error::SourceError;
use crate::types::{SourceSignal, SourceStyle};

/// Uniform producer interface over heterogeneous external data sources.
/// Implementations own their HTTP calls, pagination, and authentication;
/// the registry owns rate limiting, circuit breaking, and deadlines.
#[async_trait]
pub trait SignalSource: Send + Sync {
    fn source_id(&self) -> &str;

    fn style(&self) -> SourceStyle;

    /// Must not block other sources; the registry applies the deadline.
    async fn fetch(&self, symbol: &str) -> Result<SourceSignal, SourceError>;
}
