//! Wire types for the binary market-data feed.
//!
//! Inbound frames are length-delimited protobuf keyed by instrument; the
//! message shapes below mirror the upstream full-mode feed. The subscribe
//! command is a single JSON text frame naming the instrument set and the
//! requested detail mode.

use crate::{
    error::DataError,
    event::Tick,
    instrument::{InstrumentKey, MarketStatus},
};
use chrono::{DateTime, Utc};
use prost::Message;
use rand::{Rng, distr::Alphanumeric};
use serde_json::json;
use std::collections::HashMap;
use tokio_tungstenite::tungstenite;

/// Daily interval identifier inside [`FullFeed::ohlc`].
pub const INTERVAL_DAY: &str = "1d";

/// Detail mode requested at subscribe time.
pub const MODE_FULL: &str = "full";

/// Top-level inbound feed frame: one entry per subscribed instrument.
#[derive(Clone, PartialEq, Message)]
pub struct FeedFrame {
    #[prost(map = "string, message", tag = "1")]
    pub feeds: HashMap<String, InstrumentFeed>,
    /// Frame generation time, epoch millis.
    #[prost(int64, tag = "2")]
    pub timestamp_ms: i64,
}

/// Per-instrument payload of a [`FeedFrame`].
#[derive(Clone, PartialEq, Message)]
pub struct InstrumentFeed {
    #[prost(message, optional, tag = "1")]
    pub ltpc: Option<Ltpc>,
    #[prost(message, optional, tag = "2")]
    pub full: Option<FullFeed>,
}

/// Last traded price and previous close.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct Ltpc {
    #[prost(double, tag = "1")]
    pub ltp: f64,
    /// Last trade time, epoch millis.
    #[prost(int64, tag = "2")]
    pub ltt: i64,
    /// Previous session close.
    #[prost(double, tag = "3")]
    pub cp: f64,
}

/// Full-mode extras: per-interval OHLC, average traded price, session volume.
#[derive(Clone, PartialEq, Message)]
pub struct FullFeed {
    #[prost(message, repeated, tag = "1")]
    pub ohlc: Vec<OhlcInterval>,
    #[prost(double, tag = "2")]
    pub atp: f64,
    #[prost(uint64, tag = "3")]
    pub vtt: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct OhlcInterval {
    #[prost(string, tag = "1")]
    pub interval: String,
    #[prost(double, tag = "2")]
    pub open: f64,
    #[prost(double, tag = "3")]
    pub high: f64,
    #[prost(double, tag = "4")]
    pub low: f64,
    #[prost(double, tag = "5")]
    pub close: f64,
}

/// Decode one binary frame.
pub fn decode_frame(payload: &[u8]) -> Result<FeedFrame, DataError> {
    FeedFrame::decode(payload).map_err(DataError::from)
}

/// Normalise a decoded frame into [`Tick`]s.
///
/// Instruments without an `ltpc` section carry no price and are skipped with
/// a warning; they never abort the frame.
pub fn normalise(frame: FeedFrame, time_received: DateTime<Utc>) -> Vec<Tick> {
    frame
        .feeds
        .into_iter()
        .filter_map(|(key, feed)| {
            let instrument_key = InstrumentKey::from(key.as_str());
            let Some(ltpc) = feed.ltpc else {
                tracing::warn!(
                    instrument = %instrument_key,
                    "feed entry missing ltpc - skipping"
                );
                return None;
            };

            let (mut open, mut high, mut low) = (0.0, 0.0, 0.0);
            let (mut avg_price, mut volume) = (0.0, 0);
            if let Some(full) = feed.full {
                if let Some(day) = full
                    .ohlc
                    .iter()
                    .find(|interval| interval.interval == INTERVAL_DAY)
                    .or_else(|| full.ohlc.first())
                {
                    open = day.open;
                    high = day.high;
                    low = day.low;
                }
                avg_price = full.atp;
                volume = full.vtt;
            }

            let timestamp = DateTime::<Utc>::from_timestamp_millis(ltpc.ltt)
                .unwrap_or(time_received);

            Some(Tick {
                instrument_key,
                last_price: ltpc.ltp,
                open,
                high,
                low,
                close: ltpc.cp,
                volume,
                avg_price,
                timestamp,
                market_status: MarketStatus::Open,
                is_cached: false,
                is_mock: false,
            })
        })
        .collect()
}

/// Build the subscribe command naming the instrument set and full-detail
/// mode, sent as a single text frame after connecting.
pub fn subscribe_request(instruments: &[InstrumentKey]) -> tungstenite::Message {
    let guid: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();

    tungstenite::Message::text(
        json!({
            "guid": guid,
            "method": "sub",
            "data": {
                "mode": MODE_FULL,
                "instrumentKeys": instruments,
            },
        })
        .to_string(),
    )
}
