//! Trade records and position netting.
//!
//! The stop-loss monitor consumes positions read-only through
//! [`PositionLedger`]; [`TradeJournal`] is the in-process implementation that
//! nets BUY/SELL trade records per symbol.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::HashMap;

/// Side of a recorded trade.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// One journal entry for an executed (or paper) trade.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct TradeRecord {
    pub symbol: SmolStr,
    pub side: TradeSide,
    pub quantity: i64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub entry_time: DateTime<Utc>,
    pub open: bool,
}

impl TradeRecord {
    /// Signed quantity: BUY positive, SELL negative.
    pub fn signed_quantity(&self) -> i64 {
        match self.side {
            TradeSide::Buy => self.quantity,
            TradeSide::Sell => -self.quantity,
        }
    }
}

/// Net position derived for one symbol.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Position {
    pub symbol: SmolStr,
    pub net_quantity: i64,
    pub weighted_entry_price: f64,
    pub stop_loss: f64,
}

/// Read-only view of open positions, consumed by the stop-loss monitor.
pub trait PositionLedger: Send + Sync + 'static {
    /// Net signed quantity per symbol, including flat (zero) symbols.
    fn all_positions(&self) -> HashMap<SmolStr, i64>;

    /// Open trade records for one symbol, oldest first.
    fn open_trades_for(&self, symbol: &str) -> Vec<TradeRecord>;
}

/// In-memory journal of trade records with position netting.
#[derive(Debug, Default)]
pub struct TradeJournal {
    trades: RwLock<Vec<TradeRecord>>,
}

impl TradeJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, trade: TradeRecord) {
        self.trades.write().push(trade);
    }

    /// Consolidate one symbol's open trades into a [`Position`].
    ///
    /// Net quantity sums signed quantities; the weighted entry averages entry
    /// prices over absolute quantity; the stop-loss reference comes from the
    /// most recent open trade, matching how alerts were raised upstream.
    pub fn position(&self, symbol: &str) -> Option<Position> {
        let trades = self.open_trades_for(symbol);
        if trades.is_empty() {
            return None;
        }

        let net_quantity: i64 = trades.iter().map(TradeRecord::signed_quantity).sum();
        let total_quantity: i64 = trades.iter().map(|trade| trade.quantity.abs()).sum();
        let weighted_entry_price = if total_quantity > 0 {
            trades
                .iter()
                .map(|trade| trade.entry_price * trade.quantity.abs() as f64)
                .sum::<f64>()
                / total_quantity as f64
        } else {
            0.0
        };

        let stop_loss = trades
            .iter()
            .max_by_key(|trade| trade.entry_time)
            .map(|trade| trade.stop_loss)
            .unwrap_or(0.0);

        Some(Position {
            symbol: SmolStr::new(symbol.to_uppercase()),
            net_quantity,
            weighted_entry_price,
            stop_loss,
        })
    }
}

impl PositionLedger for TradeJournal {
    fn all_positions(&self) -> HashMap<SmolStr, i64> {
        let mut positions: HashMap<SmolStr, i64> = HashMap::new();
        for trade in self.trades.read().iter().filter(|trade| trade.open) {
            *positions
                .entry(SmolStr::new(trade.symbol.to_uppercase()))
                .or_default() += trade.signed_quantity();
        }
        positions
    }

    fn open_trades_for(&self, symbol: &str) -> Vec<TradeRecord> {
        let symbol = symbol.to_uppercase();
        self.trades
            .read()
            .iter()
            .filter(|trade| trade.open && trade.symbol.to_uppercase() == symbol)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trade(
        symbol: &str,
        side: TradeSide,
        quantity: i64,
        entry_price: f64,
        stop_loss: f64,
        hour: u32,
    ) -> TradeRecord {
        TradeRecord {
            symbol: SmolStr::new(symbol),
            side,
            quantity,
            entry_price,
            stop_loss,
            target: entry_price * 1.05,
            entry_time: Utc.with_ymd_and_hms(2024, 7, 3, hour, 0, 0).unwrap(),
            open: true,
        }
    }

    #[test]
    fn test_netting_buy_and_sell() {
        let journal = TradeJournal::new();
        journal.log(trade("TCS", TradeSide::Buy, 10, 3900.0, 3800.0, 9));
        journal.log(trade("TCS", TradeSide::Sell, 4, 3950.0, 4050.0, 10));
        journal.log(trade("INFY", TradeSide::Sell, 5, 1500.0, 1550.0, 11));

        let positions = journal.all_positions();
        assert_eq!(positions.get("TCS"), Some(&6));
        assert_eq!(positions.get("INFY"), Some(&-5));
    }

    #[test]
    fn test_fully_closed_symbol_nets_to_zero() {
        let journal = TradeJournal::new();
        journal.log(trade("TCS", TradeSide::Buy, 10, 3900.0, 3800.0, 9));
        journal.log(trade("TCS", TradeSide::Sell, 10, 3950.0, 4050.0, 10));

        assert_eq!(journal.all_positions().get("TCS"), Some(&0));
    }

    #[test]
    fn test_position_uses_most_recent_stop_loss() {
        let journal = TradeJournal::new();
        journal.log(trade("TCS", TradeSide::Buy, 10, 3900.0, 3800.0, 9));
        journal.log(trade("TCS", TradeSide::Buy, 10, 4000.0, 3880.0, 14));

        let position = journal.position("tcs").unwrap();
        assert_eq!(position.net_quantity, 20);
        assert!((position.weighted_entry_price - 3950.0).abs() < 1e-9);
        assert_eq!(position.stop_loss, 3880.0);
    }

    #[test]
    fn test_closed_trades_are_ignored() {
        let journal = TradeJournal::new();
        let mut closed = trade("TCS", TradeSide::Buy, 10, 3900.0, 3800.0, 9);
        closed.open = false;
        journal.log(closed);

        assert!(journal.all_positions().get("TCS").is_none());
        assert!(journal.position("TCS").is_none());
    }
}
