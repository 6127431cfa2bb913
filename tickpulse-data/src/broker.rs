//! REST collaborators of the pipeline: the feed authority that grants
//! short-lived stream endpoints, the batch quote fetch used by the poll-based
//! monitors, and the historical-candle query used to warm up price history.
//!
//! All calls carry the bearer credential and surface failures as typed
//! [`DataError`]s; a missing credential is a configuration error at
//! construction, never a crash in a background loop.

use crate::{error::DataError, feed::FeedAuthority, instrument::InstrumentKey};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use fnv::FnvHashMap;
use serde::{Deserialize, de::DeserializeOwned};
use std::collections::HashMap;
use url::Url;

/// Days of daily candles requested when warming up price history.
const WARMUP_DAYS: i64 = 400;

/// Batch last-price fetch for on-demand and poll-based checks, separate from
/// the streaming path.
#[async_trait]
pub trait QuoteFetch: Send + Sync + 'static {
    async fn quotes(
        &self,
        instruments: &[InstrumentKey],
    ) -> Result<FnvHashMap<InstrumentKey, f64>, DataError>;
}

/// Upstream REST envelope: payloads ride under `data` with a status tag.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AuthorizePayload {
    authorized_redirect_uri: String,
}

#[derive(Debug, Deserialize)]
struct QuotePayload {
    last_price: f64,
}

#[derive(Debug, Deserialize)]
struct CandlesPayload {
    candles: Vec<Vec<serde_json::Value>>,
}

/// Authenticated REST client for the upstream brokerage API.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    http: reqwest::Client,
    base_url: Url,
    access_token: String,
}

impl BrokerClient {
    /// Build a client, failing fast when the credential is absent.
    pub fn new(base_url: &str, access_token: impl Into<String>) -> Result<Self, DataError> {
        let access_token = access_token.into();
        if access_token.is_empty() {
            return Err(DataError::Credentials(
                "access token not configured".to_string(),
            ));
        }

        // A trailing slash keeps Url::join from replacing the last path
        // segment of the API base.
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{base_url}/"))?
        };

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            access_token,
        })
    }

    async fn get_json<T>(&self, url: Url) -> Result<T, DataError>
    where
        T: DeserializeOwned,
    {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }

    fn unwrap_envelope<T>(envelope: Envelope<T>, context: &'static str) -> Result<T, DataError> {
        if envelope.status != "success" {
            return Err(DataError::Authority(format!(
                "{context}: upstream status {}",
                envelope.status
            )));
        }
        envelope
            .data
            .ok_or_else(|| DataError::Authority(format!("{context}: empty payload")))
    }

    /// Daily closes for an instrument, oldest first, for history warm-up.
    pub async fn daily_closes(&self, instrument: &InstrumentKey) -> Result<Vec<f64>, DataError> {
        let to = Utc::now().date_naive();
        let from = to - Duration::days(WARMUP_DAYS);
        let url = self.base_url.join(&format!(
            "historical-candle/{}/day/{to}/{from}",
            instrument.as_ref()
        ))?;

        let envelope: Envelope<CandlesPayload> = self.get_json(url).await?;
        let payload = Self::unwrap_envelope(envelope, "historical candles")?;

        Ok(parse_closes(&payload.candles))
    }
}

#[async_trait]
impl FeedAuthority for BrokerClient {
    /// Request a short-lived authorized stream endpoint for the binary feed.
    async fn authorize(&self) -> Result<Url, DataError> {
        let url = self.base_url.join("feed/market-data-feed/authorize")?;
        let envelope: Envelope<AuthorizePayload> = self.get_json(url).await?;
        let payload = Self::unwrap_envelope(envelope, "feed authorize")?;

        Url::parse(&payload.authorized_redirect_uri).map_err(DataError::from)
    }
}

#[async_trait]
impl QuoteFetch for BrokerClient {
    async fn quotes(
        &self,
        instruments: &[InstrumentKey],
    ) -> Result<FnvHashMap<InstrumentKey, f64>, DataError> {
        if instruments.is_empty() {
            return Ok(FnvHashMap::default());
        }

        let mut url = self.base_url.join("market-quote/quotes")?;
        url.query_pairs_mut().append_pair(
            "instrument_key",
            &instruments
                .iter()
                .map(AsRef::as_ref)
                .collect::<Vec<_>>()
                .join(","),
        );

        let envelope: Envelope<HashMap<String, QuotePayload>> = self.get_json(url).await?;
        let payload = Self::unwrap_envelope(envelope, "batch quotes")?;

        Ok(parse_quotes(payload))
    }
}

/// Extract closes from upstream candle rows `[ts, open, high, low, close,
/// volume, ..]`, newest first upstream, reversed to oldest first. Rows too
/// short to carry a close are skipped.
fn parse_closes(candles: &[Vec<serde_json::Value>]) -> Vec<f64> {
    candles
        .iter()
        .rev()
        .filter_map(|row| row.get(4).and_then(serde_json::Value::as_f64))
        .collect()
}

fn parse_quotes(payload: HashMap<String, QuotePayload>) -> FnvHashMap<InstrumentKey, f64> {
    payload
        .into_iter()
        .map(|(key, quote)| (InstrumentKey::from(key.as_str()), quote.last_price))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credential_is_config_error() {
        assert!(matches!(
            BrokerClient::new("https://api.example.com/v2/", ""),
            Err(DataError::Credentials(_))
        ));
    }

    #[test]
    fn test_parse_closes_reverses_and_skips_short_rows() {
        let candles: Vec<Vec<serde_json::Value>> = serde_json::from_str(
            r#"
            [
                ["2024-07-03T00:00:00+05:30", 101.0, 103.0, 100.0, 102.5, 12000],
                ["2024-07-02T00:00:00+05:30", 100.0, 102.0, 99.0, 101.0, 9000],
                ["bad row"],
                ["2024-07-01T00:00:00+05:30", 99.0, 101.0, 98.5, 100.0, 8000]
            ]
            "#,
        )
        .unwrap();

        assert_eq!(parse_closes(&candles), vec![100.0, 101.0, 102.5]);
    }

    #[test]
    fn test_quote_payload_deserialises_from_envelope() {
        let envelope: Envelope<HashMap<String, QuotePayload>> = serde_json::from_str(
            r#"
            {
                "status": "success",
                "data": {
                    "NSE_EQ|INE002A01018": {"last_price": 2950.5, "instrument_token": "ignored"},
                    "NSE_EQ|INE467B01029": {"last_price": 3890.0}
                }
            }
            "#,
        )
        .unwrap();

        let quotes = parse_quotes(BrokerClient::unwrap_envelope(envelope, "test").unwrap());
        assert_eq!(
            quotes.get(&InstrumentKey::from("NSE_EQ|INE002A01018")),
            Some(&2950.5)
        );
        assert_eq!(quotes.len(), 2);
    }

    #[test]
    fn test_error_status_envelope_is_rejected() {
        let envelope: Envelope<AuthorizePayload> = serde_json::from_str(
            r#"{"status": "error", "data": null}"#,
        )
        .unwrap();

        assert!(matches!(
            BrokerClient::unwrap_envelope(envelope, "feed authorize"),
            Err(DataError::Authority(_))
        ));
    }
}
