use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Trading-session gate: no live connection is opened outside these hours,
/// and an open connection is closed deliberately when the session ends.
///
/// Times are exchange-local; `utc_offset_minutes` positions the exchange
/// relative to UTC. Weekends are always closed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MarketHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub utc_offset_minutes: i32,
}

impl Default for MarketHours {
    fn default() -> Self {
        // NSE cash session, UTC+05:30.
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            utc_offset_minutes: 330,
        }
    }
}

impl MarketHours {
    /// Gate that never opens; cached/mock fallback only. Used by deployments
    /// that run the pipeline purely from polled quotes.
    pub fn always_closed() -> Self {
        Self {
            open: NaiveTime::MIN,
            close: NaiveTime::MIN,
            utc_offset_minutes: 0,
        }
    }

    /// Gate that is open around the clock on weekdays.
    pub fn always_open() -> Self {
        Self {
            open: NaiveTime::MIN,
            close: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default(),
            utc_offset_minutes: 0,
        }
    }

    /// Whether the market is open at the given instant.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        let offset = match FixedOffset::east_opt(self.utc_offset_minutes * 60) {
            Some(offset) => offset,
            None => return false,
        };
        let local = now.with_timezone(&offset);

        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }

        let time = local.time();
        time >= self.open && time < self.close
    }

    /// Whether the market is open right now.
    pub fn is_open(&self) -> bool {
        self.is_open_at(Utc::now())
    }
}
