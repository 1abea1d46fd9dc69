use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use async_trait::async_trait;
use signal_core::{Direction, SignalSource, SourceError, SourceSignal, SourceStyle};

/// Reference adapter: any JSON endpoint answering
/// `GET {base_url}/signal?symbol=AAPL` with a `SignalPayload` body becomes a
/// pipeline source. Production adapters follow this shape with their own
/// auth and pagination.
pub struct HttpSource {
    source_id: String,
    style: SourceStyle,
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct SignalPayload {
    direction: String,
    confidence: f64,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    as_of: Option<DateTime<Utc>>,
}

impl HttpSource {
    pub fn new(source_id: String, style: SourceStyle, base_url: String) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| format!("building http client: {e}"))?;
        Ok(Self {
            source_id,
            style,
            base_url,
            client,
        })
    }
}

#[async_trait]
impl SignalSource for HttpSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn style(&self) -> SourceStyle {
        self.style
    }

    async fn fetch(&self, symbol: &str) -> Result<SourceSignal, SourceError> {
        let url = format!("{}/signal", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout
                } else {
                    SourceError::Upstream(e.to_string())
                }
            })?;

        if response.status().as_u16() == 429 {
            return Err(SourceError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(SourceError::Upstream(format!(
                "status {} from {}",
                response.status(),
                self.source_id
            )));
        }

        let payload: SignalPayload = response
            .json()
            .await
            .map_err(|e| SourceError::BadData(e.to_string()))?;

        let direction = match payload.direction.as_str() {
            "LONG" => Direction::Long,
            "SHORT" => Direction::Short,
            "NEUTRAL" => Direction::Neutral,
            other => {
                return Err(SourceError::BadData(format!("unknown direction {other:?}")))
            }
        };

        let signal = SourceSignal {
            source_id: self.source_id.clone(),
            symbol: symbol.to_string(),
            direction,
            confidence: payload.confidence,
            price: payload.price,
            as_of: payload.as_of,
        };
        signal.validate().map_err(SourceError::BadData)?;
        Ok(signal)
    }
}
