use crate::instrument::InstrumentKey;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::{collections::VecDeque, sync::Arc};

/// Maximum closes retained per instrument - enough for a 200-period average
/// plus buffer.
pub const SERIES_CAP: usize = 260;

/// Per-instrument bounded series of closing prices, oldest first.
///
/// One writer (ingestion) and many readers (indicator computation) operate
/// concurrently. Each instrument owns its own lock so unrelated symbols never
/// serialise; the outer map lock is held only for entry lookup or insert, and
/// readers always observe a complete series (appends are atomic under the
/// per-instrument write lock).
#[derive(Debug)]
pub struct PriceHistory {
    series: RwLock<FnvHashMap<InstrumentKey, Arc<RwLock<VecDeque<f64>>>>>,
    cap: usize,
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::with_cap(SERIES_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            series: RwLock::new(FnvHashMap::default()),
            cap,
        }
    }

    fn entry(&self, instrument: &InstrumentKey) -> Arc<RwLock<VecDeque<f64>>> {
        if let Some(series) = self.series.read().get(instrument) {
            return Arc::clone(series);
        }

        Arc::clone(
            self.series
                .write()
                .entry(instrument.clone())
                .or_insert_with(|| Arc::new(RwLock::new(VecDeque::with_capacity(self.cap)))),
        )
    }

    /// Append the latest close for an instrument, evicting the oldest entry
    /// once at capacity.
    pub fn append(&self, instrument: &InstrumentKey, price: f64) {
        let entry = self.entry(instrument);
        let mut series = entry.write();
        if series.len() == self.cap {
            series.pop_front();
        }
        series.push_back(price);
    }

    /// Bulk-load historical closes (oldest first) ahead of live streaming so
    /// the long moving averages are meaningful from the first tick.
    pub fn seed<Iter>(&self, instrument: &InstrumentKey, closes: Iter)
    where
        Iter: IntoIterator<Item = f64>,
    {
        let entry = self.entry(instrument);
        let mut series = entry.write();
        for price in closes {
            if series.len() == self.cap {
                series.pop_front();
            }
            series.push_back(price);
        }
    }

    /// Snapshot of the instrument's closes, oldest first. Empty if the
    /// instrument has never been seen.
    pub fn closes(&self, instrument: &InstrumentKey) -> Vec<f64> {
        match self.series.read().get(instrument) {
            Some(series) => series.read().iter().copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, instrument: &InstrumentKey) -> usize {
        self.series
            .read()
            .get(instrument)
            .map(|series| series.read().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> InstrumentKey {
        InstrumentKey::from(name)
    }

    #[test]
    fn test_append_preserves_order() {
        let history = PriceHistory::new();
        let instrument = key("NSE_EQ|A");

        history.append(&instrument, 1.0);
        history.append(&instrument, 2.0);
        history.append(&instrument, 3.0);

        assert_eq!(history.closes(&instrument), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let history = PriceHistory::with_cap(3);
        let instrument = key("NSE_EQ|A");

        for price in [1.0, 2.0, 3.0, 4.0, 5.0] {
            history.append(&instrument, price);
        }

        assert_eq!(history.closes(&instrument), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_seed_then_append() {
        let history = PriceHistory::with_cap(4);
        let instrument = key("NSE_EQ|A");

        history.seed(&instrument, [1.0, 2.0, 3.0]);
        history.append(&instrument, 4.0);
        history.append(&instrument, 5.0);

        assert_eq!(history.closes(&instrument), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_unknown_instrument_is_empty() {
        let history = PriceHistory::new();
        assert!(history.closes(&key("NSE_EQ|MISSING")).is_empty());
        assert_eq!(history.len(&key("NSE_EQ|MISSING")), 0);
    }

    #[test]
    fn test_instruments_do_not_interfere() {
        let history = PriceHistory::new();
        history.append(&key("NSE_EQ|A"), 1.0);
        history.append(&key("NSE_EQ|B"), 9.0);

        assert_eq!(history.closes(&key("NSE_EQ|A")), vec![1.0]);
        assert_eq!(history.closes(&key("NSE_EQ|B")), vec![9.0]);
    }
}
