//! Pure indicator math over a series of closing prices (oldest first).
//!
//! Insufficient history never fails: every function degrades to a defined
//! neutral default (RSI 50, zeroed bands) so downstream signal logic can
//! treat the output as always present.

use serde::{Deserialize, Serialize};

/// Default RSI look-back (Wilder).
pub const RSI_PERIOD: usize = 14;

/// Default Bollinger look-back and band width.
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_STD_DEV: f64 = 2.0;

/// Relative Strength Index with Wilder smoothing.
///
/// The first `period` price changes are averaged with a simple mean, then
/// gains and losses are smoothed with `avg = (avg * (period - 1) + new) / period`.
/// Returns the neutral `50.0` when fewer than `period + 1` closes are
/// available, and `100.0` when the average loss is zero.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for window in closes[..period + 1].windows(2) {
        let change = window[1] - window[0];
        avg_gain += change.max(0.0);
        avg_loss += (-change).max(0.0);
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for window in closes[period..].windows(2) {
        let change = window[1] - window[0];
        avg_gain = (avg_gain * (period - 1) as f64 + change.max(0.0)) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + (-change).max(0.0)) / period as f64;
    }

    // A series with no movement at all is neutral, not overbought.
    if avg_gain == 0.0 && avg_loss == 0.0 {
        return 50.0;
    }
    if avg_loss == 0.0 {
        return 100.0;
    }

    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Simple arithmetic mean of the last `period` closes, or of all available
/// closes if fewer. Zero for an empty series.
pub fn moving_average(closes: &[f64], period: usize) -> f64 {
    if closes.is_empty() || period == 0 {
        return 0.0;
    }

    let window = &closes[closes.len().saturating_sub(period)..];
    window.iter().sum::<f64>() / window.len() as f64
}

/// Bollinger Bands `(upper, middle, lower)` over the last `period` closes.
///
/// Middle band is the SMA, the offset is `std_dev` population standard
/// deviations of the same window. All zeros when fewer than `period` closes
/// are available - callers must treat zero bands as unavailable.
pub fn bollinger_bands(closes: &[f64], period: usize, std_dev: f64) -> (f64, f64, f64) {
    if period == 0 || closes.len() < period {
        return (0.0, 0.0, 0.0);
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window
        .iter()
        .map(|close| (close - middle).powi(2))
        .sum::<f64>()
        / period as f64;
    let offset = std_dev * variance.sqrt();

    (middle + offset, middle, middle - offset)
}

/// Indicators derived from one instrument's price history.
///
/// Stateless - recomputed from the series on demand, never persisted
/// independently.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub ma20: f64,
    pub ma50: f64,
    pub ma200: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
}

impl IndicatorSnapshot {
    /// Compute all indicators from a series of closes (oldest first).
    pub fn compute(closes: &[f64]) -> Self {
        let (bb_upper, bb_middle, bb_lower) =
            bollinger_bands(closes, BOLLINGER_PERIOD, BOLLINGER_STD_DEV);

        Self {
            rsi: rsi(closes, RSI_PERIOD),
            ma20: moving_average(closes, 20),
            ma50: moving_average(closes, 50),
            ma200: moving_average(closes, 200),
            bb_upper,
            bb_middle,
            bb_lower,
        }
    }

    /// True when the Bollinger window was full and the bands are meaningful.
    pub fn bands_available(&self) -> bool {
        self.bb_upper != 0.0 && self.bb_middle != 0.0 && self.bb_lower != 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(len: usize, f: impl Fn(usize) -> f64) -> Vec<f64> {
        (0..len).map(f).collect()
    }

    mod rsi {
        use super::*;

        #[test]
        fn test_short_series_is_neutral() {
            for len in 0..=RSI_PERIOD {
                let closes = series(len, |i| 100.0 + i as f64);
                assert_eq!(super::super::rsi(&closes, RSI_PERIOD), 50.0, "len={len}");
            }
        }

        #[test]
        fn test_all_gains_is_100() {
            let closes = series(30, |i| 100.0 + i as f64);
            assert_eq!(super::super::rsi(&closes, RSI_PERIOD), 100.0);
        }

        #[test]
        fn test_all_losses_is_0() {
            let closes = series(30, |i| 100.0 - i as f64);
            assert_eq!(super::super::rsi(&closes, RSI_PERIOD), 0.0);
        }

        #[test]
        fn test_flat_series_is_neutral() {
            let closes = series(30, |_| 100.0);
            assert_eq!(super::super::rsi(&closes, RSI_PERIOD), 50.0);
        }

        #[test]
        fn test_zero_loss_with_gains_is_100() {
            // Flat run ending in a single gain: avg_loss is exactly zero.
            let mut closes = series(30, |_| 100.0);
            closes.push(104.0);
            assert_eq!(super::super::rsi(&closes, RSI_PERIOD), 100.0);
        }

        #[test]
        fn test_more_consecutive_gains_never_lowers_rsi() {
            // Alternate up/down, then extend with a growing run of gains.
            let mut closes = series(20, |i| if i % 2 == 0 { 100.0 } else { 101.0 });
            let mut prev = super::super::rsi(&closes, RSI_PERIOD);

            for step in 1..=20 {
                closes.push(*closes.last().unwrap() + 1.0);
                let next = super::super::rsi(&closes, RSI_PERIOD);
                assert!(
                    next >= prev - 1e-9,
                    "rsi decreased after gain #{step}: {prev} -> {next}"
                );
                assert!((0.0..=100.0).contains(&next));
                prev = next;
            }
        }

        #[test]
        fn test_known_wilder_value() {
            // period 3, closes 10, 12, 11, 13: changes +2, -1, +2
            // avg_gain = 4/3, avg_loss = 1/3, rs = 4, rsi = 80
            let value = super::super::rsi(&[10.0, 12.0, 11.0, 13.0], 3);
            assert!((value - 80.0).abs() < 1e-10);
        }

        #[test]
        fn test_smoothing_after_seed() {
            // Seed as above, then +1 gain:
            // avg_gain = (4/3 * 2 + 1) / 3 = 11/9, avg_loss = (1/3 * 2) / 3 = 2/9
            // rs = 5.5, rsi = 100 - 100/6.5
            let value = super::super::rsi(&[10.0, 12.0, 11.0, 13.0, 14.0], 3);
            let expected = 100.0 - 100.0 / (1.0 + 5.5);
            assert!((value - expected).abs() < 1e-10);
        }
    }

    mod moving_average {
        use super::*;

        #[test]
        fn test_uses_last_period_closes() {
            let closes = vec![1.0, 2.0, 3.0, 4.0];
            assert!((super::super::moving_average(&closes, 2) - 3.5).abs() < 1e-10);
        }

        #[test]
        fn test_short_series_uses_all_closes() {
            let closes = vec![1.0, 2.0, 3.0];
            assert!((super::super::moving_average(&closes, 50) - 2.0).abs() < 1e-10);
        }

        #[test]
        fn test_empty_series_is_zero() {
            assert_eq!(super::super::moving_average(&[], 20), 0.0);
        }
    }

    mod bollinger {
        use super::*;

        #[test]
        fn test_short_series_is_zeroed() {
            let closes = series(BOLLINGER_PERIOD - 1, |i| 100.0 + i as f64);
            assert_eq!(
                bollinger_bands(&closes, BOLLINGER_PERIOD, BOLLINGER_STD_DEV),
                (0.0, 0.0, 0.0)
            );
        }

        #[test]
        fn test_middle_band_is_window_mean() {
            let closes = series(25, |i| 100.0 + i as f64);
            let (upper, middle, lower) =
                bollinger_bands(&closes, BOLLINGER_PERIOD, BOLLINGER_STD_DEV);

            let expected = closes[5..].iter().sum::<f64>() / 20.0;
            assert!((middle - expected).abs() < 1e-10);
            assert!(lower <= middle && middle <= upper);
        }

        #[test]
        fn test_flat_window_collapses_bands() {
            let closes = series(20, |_| 250.0);
            let (upper, middle, lower) =
                bollinger_bands(&closes, BOLLINGER_PERIOD, BOLLINGER_STD_DEV);

            assert_eq!((upper, middle, lower), (250.0, 250.0, 250.0));
        }

        #[test]
        fn test_population_std_dev() {
            // window [2, 4, 4, 4, 5, 5, 7, 9]: mean 5, population std 2
            let closes = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
            let (upper, middle, lower) = bollinger_bands(&closes, 8, 2.0);

            assert!((middle - 5.0).abs() < 1e-10);
            assert!((upper - 9.0).abs() < 1e-10);
            assert!((lower - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn test_snapshot_bands_available() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let snapshot = IndicatorSnapshot::compute(&closes);
        assert!(snapshot.bands_available());

        let snapshot = IndicatorSnapshot::compute(&closes[..10]);
        assert!(!snapshot.bands_available());
    }
}
