use crate::{
    indicator::IndicatorSnapshot,
    instrument::{InstrumentKey, MarketStatus},
    signal::Signal,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalised market-data update for a single instrument.
///
/// Produced by the ingestion channel from decoded feed frames and immutable
/// once created. `close` carries the previous session close so consumers can
/// derive day change without extra state.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Tick {
    pub instrument_key: InstrumentKey,
    pub last_price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub avg_price: f64,
    pub timestamp: DateTime<Utc>,
    pub market_status: MarketStatus,
    /// Set when this is a replay of the last live tick rather than fresh data.
    pub is_cached: bool,
    /// Set only on the zero-valued fallback emitted when nothing was ever
    /// cached for the instrument. Consumers must treat the price as absent.
    pub is_mock: bool,
}

impl Tick {
    /// Zero-valued fallback tick for an instrument with no cached data,
    /// tagged with the given session status (`Closed` outside market hours,
    /// `Error` after retry exhaustion).
    pub fn mock(instrument_key: InstrumentKey, market_status: MarketStatus, time: DateTime<Utc>) -> Self {
        Self {
            instrument_key,
            last_price: 0.0,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0,
            avg_price: 0.0,
            timestamp: time,
            market_status,
            is_cached: false,
            is_mock: true,
        }
    }

    /// Re-tag a previously cached live tick for the cached-fallback path.
    pub fn cached(mut self, market_status: MarketStatus) -> Self {
        self.market_status = market_status;
        self.is_cached = true;
        self
    }

    /// Absolute change of the last traded price vs the previous close.
    pub fn change(&self) -> f64 {
        self.last_price - self.close
    }

    /// Percentage change of the last traded price vs the previous close.
    pub fn change_percent(&self) -> f64 {
        if self.close > 0.0 {
            self.change() / self.close * 100.0
        } else {
            0.0
        }
    }
}

/// Per-tick output shape produced for the pull and push APIs: the normalised
/// quote, the indicators derived from price history, and the current signal.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct MarketSnapshot {
    pub symbol: smol_str::SmolStr,
    pub tick: Tick,
    pub change: f64,
    pub change_percent: f64,
    pub indicators: IndicatorSnapshot,
    pub signal: Signal,
    pub time_generated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_change_percent() {
        let tick = Tick {
            instrument_key: InstrumentKey::from("NSE_EQ|TEST"),
            last_price: 102.0,
            open: 100.5,
            high: 103.0,
            low: 99.5,
            close: 100.0,
            volume: 1_000,
            avg_price: 101.0,
            timestamp: Utc::now(),
            market_status: MarketStatus::Open,
            is_cached: false,
            is_mock: false,
        };

        assert!((tick.change() - 2.0).abs() < f64::EPSILON);
        assert!((tick.change_percent() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mock_tick_has_no_price_and_zero_change() {
        let tick = Tick::mock(
            InstrumentKey::from("NSE_EQ|TEST"),
            MarketStatus::Closed,
            Utc::now(),
        );

        assert!(tick.is_mock);
        assert_eq!(tick.last_price, 0.0);
        assert_eq!(tick.change_percent(), 0.0);
    }
}
