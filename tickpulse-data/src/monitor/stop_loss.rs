//! Stop-loss position monitoring.
//!
//! Runs independently of the signal pipeline: consolidates open positions
//! from the [`PositionLedger`], prices them through the batch [`QuoteFetch`]
//! path, and raises an urgent alert for every position whose stop-loss level
//! is breached. Symbols the price fetch cannot resolve are skipped, never
//! alerted.

use crate::{
    broker::QuoteFetch,
    instrument::InstrumentDirectory,
    ledger::{PositionLedger, TradeRecord},
    monitor::MonitorStatus,
    notify::NotificationSink,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Loss percentage above which a hit is tagged [`Urgency::High`].
const HIGH_URGENCY_LOSS_PERCENT: f64 = 5.0;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Urgency {
    #[display("MEDIUM")]
    Medium,
    #[display("HIGH")]
    High,
}

/// One breached stop-loss.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct StopLossHit {
    pub symbol: SmolStr,
    pub net_quantity: i64,
    pub current_price: f64,
    pub stop_loss: f64,
    pub entry_price: f64,
    pub loss_amount: f64,
    pub loss_percent: f64,
    pub urgency: Urgency,
}

impl StopLossHit {
    fn render(&self) -> String {
        let side = if self.net_quantity > 0 { "LONG" } else { "SHORT" };
        format!(
            "STOP-LOSS HIT [{}]: {} ({side} {} shares)\n\
             Avg entry {:.2} | Stop {:.2} | Current {:.2}\n\
             Loss {:.2} ({:.1}%)\n\
             Consider closing the position to limit further losses",
            self.urgency,
            self.symbol,
            self.net_quantity.abs(),
            self.entry_price,
            self.stop_loss,
            self.current_price,
            self.loss_amount.abs(),
            self.loss_percent.abs(),
        )
    }
}

/// Evaluate one position against its stop level.
///
/// Boundary inclusive on both sides: a long position at exactly the stop
/// price is a hit, a short position one tick under its stop is not.
pub fn evaluate_position(
    symbol: &SmolStr,
    net_quantity: i64,
    current_price: f64,
    trades: &[TradeRecord],
) -> Option<StopLossHit> {
    if net_quantity == 0 || current_price <= 0.0 || trades.is_empty() {
        return None;
    }

    // Stop reference from the most recent open trade; entry is the
    // quantity-weighted average across open trades.
    let stop_loss = trades
        .iter()
        .max_by_key(|trade| trade.entry_time)
        .map(|trade| trade.stop_loss)?;
    let total_quantity: i64 = trades.iter().map(|trade| trade.quantity.abs()).sum();
    if total_quantity == 0 || stop_loss <= 0.0 {
        return None;
    }
    let entry_price = trades
        .iter()
        .map(|trade| trade.entry_price * trade.quantity.abs() as f64)
        .sum::<f64>()
        / total_quantity as f64;

    let (hit, loss_amount, loss_percent) = if net_quantity > 0 {
        (
            current_price <= stop_loss,
            (entry_price - current_price) * net_quantity.abs() as f64,
            (entry_price - current_price) / entry_price * 100.0,
        )
    } else {
        (
            current_price >= stop_loss,
            (current_price - entry_price) * net_quantity.abs() as f64,
            (current_price - entry_price) / entry_price * 100.0,
        )
    };

    if !hit {
        return None;
    }

    Some(StopLossHit {
        symbol: symbol.clone(),
        net_quantity,
        current_price,
        stop_loss,
        entry_price,
        loss_amount,
        loss_percent,
        urgency: if loss_percent.abs() > HIGH_URGENCY_LOSS_PERCENT {
            Urgency::High
        } else {
            Urgency::Medium
        },
    })
}

/// Periodic stop-loss watchdog over the trader's open positions.
pub struct StopLossMonitor {
    ledger: Arc<dyn PositionLedger>,
    quotes: Arc<dyn QuoteFetch>,
    directory: Arc<InstrumentDirectory>,
    sink: Arc<dyn NotificationSink>,
    running: AtomicBool,
    last_check: RwLock<Option<DateTime<Utc>>>,
    loop_token: Mutex<Option<CancellationToken>>,
}

impl StopLossMonitor {
    pub fn new(
        ledger: Arc<dyn PositionLedger>,
        quotes: Arc<dyn QuoteFetch>,
        directory: Arc<InstrumentDirectory>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            ledger,
            quotes,
            directory,
            sink,
            running: AtomicBool::new(false),
            last_check: RwLock::new(None),
            loop_token: Mutex::new(None),
        }
    }

    /// Check every non-flat position once, alerting on each breached stop.
    /// Returns the number of hits detected.
    pub async fn check_now(&self) -> usize {
        *self.last_check.write() = Some(Utc::now());

        let positions: Vec<(SmolStr, i64)> = self
            .ledger
            .all_positions()
            .into_iter()
            .filter(|(_, net_quantity)| *net_quantity != 0)
            .collect();
        if positions.is_empty() {
            return 0;
        }

        // Resolve symbols to keys, skipping any missing from the directory.
        let mut keyed = Vec::with_capacity(positions.len());
        for (symbol, net_quantity) in positions {
            match self.directory.key(&symbol) {
                Some(key) => keyed.push((symbol, net_quantity, key.clone())),
                None => {
                    warn!(%symbol, "position symbol missing from directory - skipping")
                }
            }
        }

        let keys: Vec<_> = keyed.iter().map(|(_, _, key)| key.clone()).collect();
        let prices = match self.quotes.quotes(&keys).await {
            Ok(prices) => prices,
            Err(error) => {
                error!(%error, stage = "stop-loss price fetch", "quote fetch failed");
                return 0;
            }
        };

        let mut hits = 0;
        for (symbol, net_quantity, key) in keyed {
            let Some(&current_price) = prices.get(&key) else {
                debug!(%symbol, "no current price for position - skipping");
                continue;
            };

            let trades = self.ledger.open_trades_for(&symbol);
            let Some(hit) = evaluate_position(&symbol, net_quantity, current_price, &trades)
            else {
                continue;
            };

            info!(
                %symbol,
                current_price,
                stop_loss = hit.stop_loss,
                urgency = %hit.urgency,
                "stop-loss hit"
            );
            hits += 1;

            if !self.sink.notify(&hit.render()).await {
                warn!(%symbol, "stop-loss alert delivery failed");
            }
        }

        hits
    }

    /// Start the periodic check loop. A second start while running is a
    /// no-op.
    pub fn start(self: &Arc<Self>, interval: std::time::Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("stop-loss monitoring already running");
            return;
        }

        let token = CancellationToken::new();
        *self.loop_token.lock() = Some(token.clone());

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_s = interval.as_secs(), "stop-loss monitoring started");
            loop {
                let hits = monitor.check_now().await;
                if hits > 0 {
                    info!(hits, "processed stop-loss alerts");
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("stop-loss monitoring stopped");
        });
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.loop_token.lock().take() {
            token.cancel();
        }
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            running: self.running.load(Ordering::SeqCst),
            last_check_time: *self.last_check.read(),
            cached_signal_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::DataError,
        instrument::InstrumentKey,
        ledger::{TradeJournal, TradeSide},
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use fnv::FnvHashMap;

    struct FixedQuotes(FnvHashMap<InstrumentKey, f64>);

    #[async_trait]
    impl QuoteFetch for FixedQuotes {
        async fn quotes(
            &self,
            _instruments: &[InstrumentKey],
        ) -> Result<FnvHashMap<InstrumentKey, f64>, DataError> {
            Ok(self.0.clone())
        }
    }

    struct CountingSink(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn notify(&self, _message: &str) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn trade(symbol: &str, side: TradeSide, quantity: i64, entry: f64, stop: f64) -> TradeRecord {
        TradeRecord {
            symbol: SmolStr::new(symbol),
            side,
            quantity,
            entry_price: entry,
            stop_loss: stop,
            target: entry * 1.05,
            entry_time: Utc.with_ymd_and_hms(2024, 7, 3, 9, 30, 0).unwrap(),
            open: true,
        }
    }

    #[test]
    fn test_long_hit_is_boundary_inclusive() {
        let symbol = SmolStr::new("TCS");
        let trades = vec![trade("TCS", TradeSide::Buy, 10, 4000.0, 3800.0)];

        // Exactly at the stop: hit.
        let hit = evaluate_position(&symbol, 10, 3800.0, &trades).unwrap();
        assert_eq!(hit.urgency, Urgency::Medium);
        assert!((hit.loss_amount - 2000.0).abs() < 1e-9);
        assert!((hit.loss_percent - 5.0).abs() < 1e-9);

        // One tick above the stop: no hit.
        assert!(evaluate_position(&symbol, 10, 3800.05, &trades).is_none());
    }

    #[test]
    fn test_short_hit_requires_price_at_or_above_stop() {
        let symbol = SmolStr::new("INFY");
        let trades = vec![trade("INFY", TradeSide::Sell, 5, 1500.0, 1550.0)];

        // One tick below the stop: not yet a hit.
        assert!(evaluate_position(&symbol, -5, 1549.95, &trades).is_none());

        let hit = evaluate_position(&symbol, -5, 1550.0, &trades).unwrap();
        assert_eq!(hit.net_quantity, -5);
        assert!((hit.loss_amount - 250.0).abs() < 1e-9);
        assert!(hit.loss_percent > 0.0);
    }

    #[test]
    fn test_deep_loss_is_high_urgency() {
        let symbol = SmolStr::new("TCS");
        let trades = vec![trade("TCS", TradeSide::Buy, 10, 4000.0, 3790.0)];

        let hit = evaluate_position(&symbol, 10, 3700.0, &trades).unwrap();
        // 7.5% loss
        assert_eq!(hit.urgency, Urgency::High);
        assert!(hit.render().contains("[HIGH]"));
    }

    #[test]
    fn test_flat_or_unpriced_position_is_skipped() {
        let symbol = SmolStr::new("TCS");
        let trades = vec![trade("TCS", TradeSide::Buy, 10, 4000.0, 3800.0)];

        assert!(evaluate_position(&symbol, 0, 3700.0, &trades).is_none());
        assert!(evaluate_position(&symbol, 10, 0.0, &trades).is_none());
        assert!(evaluate_position(&symbol, 10, 3700.0, &[]).is_none());
    }

    #[tokio::test]
    async fn test_check_now_alerts_breached_positions_only() {
        let journal = Arc::new(TradeJournal::new());
        journal.log(trade("TCS", TradeSide::Buy, 10, 4000.0, 3800.0));
        journal.log(trade("INFY", TradeSide::Buy, 5, 1500.0, 1450.0));
        // Symbol with no quote coverage: must be skipped silently.
        journal.log(trade("WIPRO", TradeSide::Buy, 5, 500.0, 480.0));

        let directory = Arc::new(InstrumentDirectory::from_json(
            r#"
            [
                {"tradingsymbol": "TCS", "instrument_key": "NSE_EQ|TCS"},
                {"tradingsymbol": "INFY", "instrument_key": "NSE_EQ|INFY"},
                {"tradingsymbol": "WIPRO", "instrument_key": "NSE_EQ|WIPRO"}
            ]
            "#,
        )
        .unwrap());

        let mut prices = FnvHashMap::default();
        // TCS breached, INFY comfortably above its stop.
        prices.insert(InstrumentKey::from("NSE_EQ|TCS"), 3795.0);
        prices.insert(InstrumentKey::from("NSE_EQ|INFY"), 1490.0);

        let sink = Arc::new(CountingSink(std::sync::atomic::AtomicUsize::new(0)));
        let monitor = Arc::new(StopLossMonitor::new(
            journal,
            Arc::new(FixedQuotes(prices)),
            directory,
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        ));

        assert_eq!(monitor.check_now().await, 1);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
        assert!(monitor.status().last_check_time.is_some());
    }
}
