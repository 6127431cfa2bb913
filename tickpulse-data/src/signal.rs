//! Trade signal generation from the current price and an [`IndicatorSnapshot`].
//!
//! Two layers feed the decision: three core trend conditions per side
//! (MA50/MA200 alignment, RSI gate, MA20 proximity) and a Bollinger override
//! layer that accumulates a weighted score from band touches, RSI extremes,
//! squeezes and mean-reversion setups. A priority ladder turns the two layers
//! into a direction and a 0-5 confidence.

use crate::indicator::IndicatorSnapshot;
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Recommended trade direction.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[display("BUY")]
    Buy,
    #[display("SELL")]
    Sell,
    #[default]
    #[display("HOLD")]
    Hold,
}

/// Market sentiment label attached to a [`Signal`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sentiment {
    #[display("BULLISH")]
    Bullish,
    #[display("BEARISH")]
    Bearish,
    #[default]
    #[display("NEUTRAL")]
    Neutral,
}

/// Tunable constants of the signal generator.
///
/// The tolerance values were tuned empirically upstream and are deliberately
/// asymmetric; they are carried as configuration rather than hard-coded so a
/// deployment can adjust them without a rebuild.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalConfig {
    /// BUY core: MA50 may lag MA200 by this factor when price > MA50.
    pub ma_cross_buy_tolerance: f64,
    /// SELL core: MA50 may exceed MA200 by this factor when price < MA50.
    pub ma_cross_sell_tolerance: f64,
    /// BUY core: price must clear MA20 scaled by this factor.
    pub ma20_buy_tolerance: f64,
    /// SELL core: price must stay under MA20 scaled by this factor.
    pub ma20_sell_tolerance: f64,
    pub rsi_buy_floor: f64,
    pub rsi_sell_ceiling: f64,

    /// Price within this factor of the lower band counts as a band touch.
    pub bb_lower_proximity: f64,
    /// Price within this factor of the upper band counts as a band touch.
    pub bb_upper_proximity: f64,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub rsi_extreme_oversold: f64,
    pub rsi_extreme_overbought: f64,
    /// Band width below this share of the middle band is a squeeze.
    pub squeeze_width_ratio: f64,

    pub band_touch_weight: f64,
    pub extreme_rsi_weight: f64,
    pub squeeze_breakout_weight: f64,
    pub mean_reversion_weight: f64,

    /// Band score at or above which the override ladder branch applies.
    pub strong_score_threshold: f64,
    /// Band score at or above which the confirmation ladder branch applies.
    pub moderate_score_threshold: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ma_cross_buy_tolerance: 0.999,
            ma_cross_sell_tolerance: 1.001,
            ma20_buy_tolerance: 0.998,
            ma20_sell_tolerance: 1.002,
            rsi_buy_floor: 40.0,
            rsi_sell_ceiling: 60.0,
            bb_lower_proximity: 1.02,
            bb_upper_proximity: 0.98,
            rsi_oversold: 35.0,
            rsi_overbought: 65.0,
            rsi_extreme_oversold: 25.0,
            rsi_extreme_overbought: 75.0,
            squeeze_width_ratio: 0.10,
            band_touch_weight: 2.0,
            extreme_rsi_weight: 1.5,
            squeeze_breakout_weight: 1.0,
            mean_reversion_weight: 0.5,
            strong_score_threshold: 2.0,
            moderate_score_threshold: 1.0,
        }
    }
}

/// The system's current trade recommendation for an instrument.
///
/// One current `Signal` exists per instrument and is superseded atomically on
/// recomputation.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Signal {
    pub direction: Direction,
    pub confidence: u8,
    pub sentiment: Sentiment,
    pub entry: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub reasons: Vec<String>,
}

impl Signal {
    /// Construct a signal, clamping confidence into `[0, 5]`.
    pub fn new(
        direction: Direction,
        confidence: f64,
        sentiment: Sentiment,
        entry: f64,
        stop_loss: f64,
        target: f64,
        reasons: Vec<String>,
    ) -> Self {
        Self {
            direction,
            confidence: confidence.round().clamp(0.0, 5.0) as u8,
            sentiment,
            entry,
            stop_loss,
            target,
            reasons,
        }
    }

    /// Flat HOLD signal anchored at the current price.
    pub fn hold(price: f64, reasons: Vec<String>) -> Self {
        Self::new(
            Direction::Hold,
            0.0,
            Sentiment::Neutral,
            price,
            price,
            price,
            reasons,
        )
    }
}

/// Bollinger override score accumulated for one side, with the reasons that
/// contributed to it.
#[derive(Debug, Default)]
struct BandScore {
    weight: f64,
    reasons: Vec<String>,
}

impl BandScore {
    fn add(&mut self, weight: f64, reason: String) {
        self.weight += weight;
        self.reasons.push(reason);
    }
}

/// Generate the current [`Signal`] for an instrument from its last traded
/// price and indicator snapshot.
pub fn generate(price: f64, indicators: &IndicatorSnapshot, config: &SignalConfig) -> Signal {
    let IndicatorSnapshot {
        rsi,
        ma20,
        ma50,
        ma200,
        bb_upper,
        bb_middle,
        bb_lower,
    } = *indicators;

    // Core trend conditions, three per side.
    let buy_trend = price > ma50 && ma50 >= ma200 * config.ma_cross_buy_tolerance;
    let buy_rsi = rsi > config.rsi_buy_floor;
    let buy_ma20 = price > ma20 * config.ma20_buy_tolerance;
    let buy_core = u8::from(buy_trend) + u8::from(buy_rsi) + u8::from(buy_ma20);

    let sell_trend = price < ma50 && ma50 <= ma200 * config.ma_cross_sell_tolerance;
    let sell_rsi = rsi < config.rsi_sell_ceiling;
    let sell_ma20 = price < ma20 * config.ma20_sell_tolerance;
    let sell_core = u8::from(sell_trend) + u8::from(sell_rsi) + u8::from(sell_ma20);

    // Bollinger override layer, only meaningful with a full band window.
    let mut buy_score = BandScore::default();
    let mut sell_score = BandScore::default();

    if indicators.bands_available() {
        if price <= bb_lower * config.bb_lower_proximity && rsi < config.rsi_oversold {
            buy_score.add(
                config.band_touch_weight,
                format!("Oversold bounce: price at lower band with RSI {rsi:.1}"),
            );
        }
        if price >= bb_upper * config.bb_upper_proximity && rsi > config.rsi_overbought {
            sell_score.add(
                config.band_touch_weight,
                format!("Overbought rejection: price at upper band with RSI {rsi:.1}"),
            );
        }

        if rsi <= config.rsi_extreme_oversold {
            buy_score.add(
                config.extreme_rsi_weight,
                format!("Very oversold: RSI {rsi:.1}"),
            );
        }
        if rsi >= config.rsi_extreme_overbought {
            sell_score.add(
                config.extreme_rsi_weight,
                format!("Very overbought: RSI {rsi:.1}"),
            );
        }

        let squeeze = (bb_upper - bb_lower) < config.squeeze_width_ratio * bb_middle;
        if squeeze && price > bb_upper && buy_trend {
            buy_score.add(
                config.squeeze_breakout_weight,
                "Squeeze breakout above upper band".to_string(),
            );
        }
        if squeeze && price < bb_lower && sell_trend {
            sell_score.add(
                config.squeeze_breakout_weight,
                "Squeeze breakdown below lower band".to_string(),
            );
        }

        // Mean reversion: price sits on the opposite side of the middle band
        // from the direction the core conditions lean toward.
        if buy_core >= 2 && price < bb_middle {
            buy_score.add(
                config.mean_reversion_weight,
                "Mean reversion: price below middle band".to_string(),
            );
        }
        if sell_core >= 2 && price > bb_middle {
            sell_score.add(
                config.mean_reversion_weight,
                "Mean reversion: price above middle band".to_string(),
            );
        }
    }

    let buy_reasons = |score: &BandScore| {
        let mut reasons = Vec::new();
        if buy_trend {
            reasons.push("Strong bullish trend: price > MA50 > MA200".to_string());
        }
        if buy_rsi {
            reasons.push(format!(
                "RSI momentum: RSI {rsi:.1} > {:.0}",
                config.rsi_buy_floor
            ));
        }
        if buy_ma20 {
            reasons.push("Above MA20: price holding the short-term average".to_string());
        }
        reasons.extend(score.reasons.iter().cloned());
        reasons
    };
    let sell_reasons = |score: &BandScore| {
        let mut reasons = Vec::new();
        if sell_trend {
            reasons.push("Strong bearish trend: price < MA50 < MA200".to_string());
        }
        if sell_rsi {
            reasons.push(format!(
                "RSI weakness: RSI {rsi:.1} < {:.0}",
                config.rsi_sell_ceiling
            ));
        }
        if sell_ma20 {
            reasons.push("Below MA20: price under the short-term average".to_string());
        }
        reasons.extend(score.reasons.iter().cloned());
        reasons
    };

    // Priority ladder, first match wins.

    // (a) strong band score overrides, provided at least one core condition
    // on the same side backs it. The same-side requirement keeps a runaway
    // rally (every sell condition false) from reading as an overbought SELL.
    let strong_buy = buy_score.weight >= config.strong_score_threshold && buy_core >= 1;
    let strong_sell = sell_score.weight >= config.strong_score_threshold && sell_core >= 1;
    if strong_buy && (!strong_sell || buy_score.weight >= sell_score.weight) {
        let confidence = 2.0 + buy_score.weight;
        let (stop, target) = buy_levels(price, confidence, indicators, true);
        return Signal::new(
            Direction::Buy,
            confidence,
            Sentiment::Bullish,
            price,
            stop,
            target,
            buy_reasons(&buy_score),
        );
    }
    if strong_sell {
        let confidence = 2.0 + sell_score.weight;
        let (stop, target) = sell_levels(price, confidence, indicators, true);
        return Signal::new(
            Direction::Sell,
            confidence,
            Sentiment::Bearish,
            price,
            stop,
            target,
            sell_reasons(&sell_score),
        );
    }

    // (b) full core alignment.
    if buy_core == 3 {
        let confidence = 3.0 + buy_score.weight.min(2.0);
        let (stop, target) = buy_levels(price, confidence, indicators, false);
        return Signal::new(
            Direction::Buy,
            confidence,
            Sentiment::Bullish,
            price,
            stop,
            target,
            buy_reasons(&buy_score),
        );
    }
    if sell_core == 3 {
        let confidence = 3.0 + sell_score.weight.min(2.0);
        let (stop, target) = sell_levels(price, confidence, indicators, false);
        return Signal::new(
            Direction::Sell,
            confidence,
            Sentiment::Bearish,
            price,
            stop,
            target,
            sell_reasons(&sell_score),
        );
    }

    // (c) moderate band score confirming a two-condition core lean on the
    // same side.
    let moderate_buy = buy_score.weight >= config.moderate_score_threshold && buy_core >= 2;
    let moderate_sell = sell_score.weight >= config.moderate_score_threshold && sell_core >= 2;
    if moderate_buy && (!moderate_sell || buy_score.weight >= sell_score.weight) {
        let confidence = 2.0 + buy_score.weight;
        let (stop, target) = buy_levels(price, confidence, indicators, false);
        return Signal::new(
            Direction::Buy,
            confidence,
            Sentiment::Neutral,
            price,
            stop,
            target,
            buy_reasons(&buy_score),
        );
    }
    if moderate_sell {
        let confidence = 2.0 + sell_score.weight;
        let (stop, target) = sell_levels(price, confidence, indicators, false);
        return Signal::new(
            Direction::Sell,
            confidence,
            Sentiment::Neutral,
            price,
            stop,
            target,
            sell_reasons(&sell_score),
        );
    }

    // (d) two of three core conditions with RSI on the favourable side of 50.
    if buy_core == 2 && rsi > 50.0 {
        let (stop, target) = buy_levels(price, 2.0, indicators, false);
        return Signal::new(
            Direction::Buy,
            2.0,
            Sentiment::Neutral,
            price,
            stop,
            target,
            buy_reasons(&buy_score),
        );
    }
    if sell_core == 2 && rsi < 50.0 {
        let (stop, target) = sell_levels(price, 2.0, indicators, false);
        return Signal::new(
            Direction::Sell,
            2.0,
            Sentiment::Neutral,
            price,
            stop,
            target,
            sell_reasons(&sell_score),
        );
    }

    // (e) no alignment.
    Signal::hold(
        price,
        vec![format!(
            "Mixed conditions: {buy_core}/3 bullish, {sell_core}/3 bearish"
        )],
    )
}

/// BUY stop/target: stop is the tightest of lower-band -2%, MA20 -3% and
/// price -4%; target scales with confidence unless a strong band signal
/// points at the opposite band.
fn buy_levels(
    price: f64,
    confidence: f64,
    indicators: &IndicatorSnapshot,
    strong_band: bool,
) -> (f64, f64) {
    let mut stop = price * 0.96;
    if indicators.ma20 > 0.0 {
        stop = stop.max(indicators.ma20 * 0.97);
    }
    if indicators.bb_lower > 0.0 {
        stop = stop.max(indicators.bb_lower * 0.98);
    }

    let target = if strong_band && indicators.bb_upper > price {
        indicators.bb_upper
    } else {
        price * (1.0 + 0.03 + 0.01 * confidence.clamp(0.0, 5.0))
    };

    (stop, target)
}

/// SELL stop/target, mirrored.
fn sell_levels(
    price: f64,
    confidence: f64,
    indicators: &IndicatorSnapshot,
    strong_band: bool,
) -> (f64, f64) {
    let mut stop = price * 1.04;
    if indicators.ma20 > 0.0 {
        stop = stop.min(indicators.ma20 * 1.03);
    }
    if indicators.bb_upper > 0.0 {
        stop = stop.min(indicators.bb_upper * 1.02);
    }

    let target = if strong_band && indicators.bb_lower > 0.0 && indicators.bb_lower < price {
        indicators.bb_lower
    } else {
        price * (1.0 - 0.03 - 0.01 * confidence.clamp(0.0, 5.0))
    };

    (stop, target)
}
