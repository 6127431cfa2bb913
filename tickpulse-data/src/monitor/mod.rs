//! Signal change detection and notification.
//!
//! Tracks the last-known [`Signal`] per instrument, decides whether a fresh
//! evaluation is a significant change (direction flip or confidence move at
//! or above the configured delta), and emits deduplicated, cooldown-gated
//! notifications. A parallel band-cross detector watches price position
//! relative to the Bollinger bands and fires only on zone changes,
//! independent of the main path.

use crate::{
    event::MarketSnapshot,
    indicator::IndicatorSnapshot,
    notify::NotificationSink,
    signal::Signal,
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod stop_loss;

/// Shared cache of the latest [`MarketSnapshot`] per symbol, written by the
/// ingestion pipeline and read by the poll loop and the pull API.
pub type SnapshotCache = RwLock<FnvHashMap<SmolStr, MarketSnapshot>>;

/// Detector configuration.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Minimum time between two notifications for the same instrument.
    pub cooldown: std::time::Duration,
    /// Confidence move at or above this delta is significant on its own.
    pub confidence_delta: u8,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cooldown: std::time::Duration::from_secs(300),
            confidence_delta: 1,
        }
    }
}

/// Price position relative to the Bollinger bands.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BandPosition {
    AboveUpper,
    BelowLower,
    WithinBands,
}

impl BandPosition {
    /// Classify a price against the bands; `None` while the band window is
    /// not yet full.
    pub fn classify(price: f64, indicators: &IndicatorSnapshot) -> Option<Self> {
        if !indicators.bands_available() {
            return None;
        }

        Some(if price > indicators.bb_upper {
            Self::AboveUpper
        } else if price < indicators.bb_lower {
            Self::BelowLower
        } else {
            Self::WithinBands
        })
    }
}

/// Per-instrument detector state. Read-modify-write happens under one mutex
/// per instrument so concurrent ticks and "check now" calls cannot race a
/// duplicate alert.
#[derive(Debug, Default)]
struct SignalState {
    last_signal: Option<Signal>,
    last_alert_time: Option<DateTime<Utc>>,
    band_position: Option<BandPosition>,
    last_band_alert_time: Option<DateTime<Utc>>,
}

/// Monitor status for the admin surface.
#[derive(Clone, Copy, PartialEq, Debug, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub last_check_time: Option<DateTime<Utc>>,
    pub cached_signal_count: usize,
}

/// Stateful signal-change detector and notifier.
pub struct SignalMonitor {
    states: RwLock<FnvHashMap<SmolStr, Arc<Mutex<SignalState>>>>,
    cache: Arc<SnapshotCache>,
    sink: Arc<dyn NotificationSink>,
    config: MonitorConfig,
    running: AtomicBool,
    last_check: RwLock<Option<DateTime<Utc>>>,
    loop_token: Mutex<Option<CancellationToken>>,
}

impl SignalMonitor {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        cache: Arc<SnapshotCache>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            states: RwLock::new(FnvHashMap::default()),
            cache,
            sink,
            config,
            running: AtomicBool::new(false),
            last_check: RwLock::new(None),
            loop_token: Mutex::new(None),
        }
    }

    fn state(&self, symbol: &SmolStr) -> Arc<Mutex<SignalState>> {
        if let Some(state) = self.states.read().get(symbol) {
            return Arc::clone(state);
        }

        Arc::clone(
            self.states
                .write()
                .entry(symbol.clone())
                .or_default(),
        )
    }

    /// Evaluate a freshly generated signal for an instrument and notify when
    /// the state transition is significant.
    ///
    /// Returns `true` when a significant change passed the cooldown gate and
    /// a notification was dispatched.
    pub async fn evaluate(
        &self,
        symbol: &SmolStr,
        price: f64,
        indicators: &IndicatorSnapshot,
        signal: &Signal,
    ) -> bool {
        let now = Utc::now();
        let entry = self.state(symbol);

        // Decide and mutate under the instrument lock, deliver after.
        let (change_message, band_message) = {
            let mut state = entry.lock();

            let change_message = self.detect_signal_change(symbol, price, signal, &mut state, now);
            let band_message = self.detect_band_cross(symbol, price, indicators, &mut state, now);

            (change_message, band_message)
        };

        if let Some(message) = &band_message {
            if !self.sink.notify(message).await {
                warn!(%symbol, "band-cross notification delivery failed");
            }
        }

        match &change_message {
            Some(message) => {
                if !self.sink.notify(message).await {
                    warn!(%symbol, "signal-change notification delivery failed");
                }
                true
            }
            None => false,
        }
    }

    /// Main path: compare against the stored signal and update it.
    fn detect_signal_change(
        &self,
        symbol: &SmolStr,
        price: f64,
        signal: &Signal,
        state: &mut SignalState,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let previous = state.last_signal.replace(signal.clone());

        let Some(previous) = previous else {
            // First observation establishes the state silently.
            return None;
        };

        let direction_changed = previous.direction != signal.direction;
        let confidence_changed =
            previous.confidence.abs_diff(signal.confidence) >= self.config.confidence_delta;
        if !direction_changed && !confidence_changed {
            return None;
        }

        if let Some(last_alert) = state.last_alert_time
            && (now - last_alert).to_std().unwrap_or_default() < self.config.cooldown
        {
            info!(
                %symbol,
                old = %previous.direction,
                new = %signal.direction,
                "signal change suppressed by cooldown"
            );
            return None;
        }

        state.last_alert_time = Some(now);

        let mut change_type = Vec::new();
        if direction_changed {
            change_type.push(format!("Signal: {} -> {}", previous.direction, signal.direction));
        }
        if confidence_changed {
            change_type.push(format!(
                "Confidence: {} -> {}",
                previous.confidence, signal.confidence
            ));
        }

        info!(%symbol, change = %change_type.join(" | "), "signal change detected");

        Some(render_signal_change(
            symbol,
            price,
            signal,
            &change_type.join(" | "),
        ))
    }

    /// Parallel path: band-cross alerts fire only when the price moves into a
    /// different zone, never repeatedly while it stays there.
    fn detect_band_cross(
        &self,
        symbol: &SmolStr,
        price: f64,
        indicators: &IndicatorSnapshot,
        state: &mut SignalState,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let position = BandPosition::classify(price, indicators)?;
        let previous = state.band_position.replace(position);

        if previous == Some(position) || position == BandPosition::WithinBands {
            return None;
        }

        if let Some(last_alert) = state.last_band_alert_time
            && (now - last_alert).to_std().unwrap_or_default() < self.config.cooldown
        {
            return None;
        }

        state.last_band_alert_time = Some(now);

        Some(render_band_cross(symbol, price, indicators, position))
    }

    /// Run detection over every cached snapshot, returning the number of
    /// significant changes notified. Runs to completion before returning.
    pub async fn check_now(&self) -> usize {
        let snapshots: Vec<MarketSnapshot> = self.cache.read().values().cloned().collect();
        *self.last_check.write() = Some(Utc::now());

        let mut changes = 0;
        for snapshot in &snapshots {
            if self
                .evaluate(
                    &snapshot.symbol,
                    snapshot.tick.last_price,
                    &snapshot.indicators,
                    &snapshot.signal,
                )
                .await
            {
                changes += 1;
            }
        }

        if changes > 0 {
            info!(changes, "signal check completed");
        }
        changes
    }

    /// Start the periodic poll loop. A second start while running is a no-op.
    pub fn start(self: &Arc<Self>, interval: std::time::Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("signal monitoring already running");
            return;
        }

        let token = CancellationToken::new();
        *self.loop_token.lock() = Some(token.clone());

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_s = interval.as_secs(), "signal monitoring started");
            loop {
                let changes = monitor.check_now().await;
                if changes > 0 {
                    info!(changes, "processed signal changes");
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("signal monitoring stopped");
        });
    }

    /// Stop the poll loop; any in-flight check completes but no further
    /// checks are scheduled.
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
            cached_signal_count: self.states.read().len(),
        }
    }
}

fn render_signal_change(symbol: &str, price: f64, signal: &Signal, change_type: &str) -> String {
    let mut message = format!(
        "Signal change: {symbol} {} ({}) at {price:.2}\n\
         Change: {change_type}\n\
         Entry {:.2} | Stop {:.2} | Target {:.2}",
        signal.direction, signal.sentiment, signal.entry, signal.stop_loss, signal.target,
    );
    for reason in &signal.reasons {
        message.push_str("\n- ");
        message.push_str(reason);
    }
    message
}

fn render_band_cross(
    symbol: &str,
    price: f64,
    indicators: &IndicatorSnapshot,
    position: BandPosition,
) -> String {
    match position {
        BandPosition::AboveUpper => {
            let beyond = (price - indicators.bb_upper) / indicators.bb_upper * 100.0;
            format!(
                "Band breakout: {symbol} above upper Bollinger band\n\
                 Price {price:.2} vs upper {:.2} ({beyond:.1}% above) - \
                 strong momentum or overbought",
                indicators.bb_upper,
            )
        }
        BandPosition::BelowLower => {
            let beyond = (indicators.bb_lower - price) / indicators.bb_lower * 100.0;
            format!(
                "Band breakdown: {symbol} below lower Bollinger band\n\
                 Price {price:.2} vs lower {:.2} ({beyond:.1}% below) - \
                 strong momentum or oversold",
                indicators.bb_lower,
            )
        }
        BandPosition::WithinBands => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Direction, Sentiment};
    use std::sync::atomic::AtomicUsize;

    struct RecordingSink {
        sent: Mutex<Vec<String>>,
        failures: AtomicUsize,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, message: &str) -> bool {
            if self.fail.load(Ordering::SeqCst) {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return false;
            }
            self.sent.lock().push(message.to_string());
            true
        }
    }

    fn monitor(sink: Arc<RecordingSink>) -> Arc<SignalMonitor> {
        Arc::new(SignalMonitor::new(
            sink,
            Arc::new(SnapshotCache::default()),
            MonitorConfig::default(),
        ))
    }

    fn signal(direction: Direction, confidence: f64) -> Signal {
        Signal::new(
            direction,
            confidence,
            match direction {
                Direction::Buy => Sentiment::Bullish,
                Direction::Sell => Sentiment::Bearish,
                Direction::Hold => Sentiment::Neutral,
            },
            100.0,
            96.0,
            106.0,
            vec!["test reason".to_string()],
        )
    }

    fn bare_indicators() -> IndicatorSnapshot {
        // Zero bands keep the band-cross path quiet.
        IndicatorSnapshot::default()
    }

    fn symbol() -> SmolStr {
        SmolStr::new("TCS")
    }

    #[tokio::test]
    async fn test_first_observation_establishes_silently() {
        let sink = RecordingSink::new();
        let monitor = monitor(Arc::clone(&sink));

        let changed = monitor
            .evaluate(&symbol(), 100.0, &bare_indicators(), &signal(Direction::Buy, 3.0))
            .await;

        assert!(!changed);
        assert!(sink.sent().is_empty());
        assert_eq!(monitor.status().cached_signal_count, 1);
    }

    #[tokio::test]
    async fn test_unchanged_signal_is_idempotent() {
        let sink = RecordingSink::new();
        let monitor = monitor(Arc::clone(&sink));

        for _ in 0..3 {
            let changed = monitor
                .evaluate(&symbol(), 100.0, &bare_indicators(), &signal(Direction::Buy, 3.0))
                .await;
            assert!(!changed);
        }
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_direction_flip_notifies_once_within_cooldown() {
        let sink = RecordingSink::new();
        let monitor = monitor(Arc::clone(&sink));

        monitor
            .evaluate(&symbol(), 100.0, &bare_indicators(), &signal(Direction::Buy, 3.0))
            .await;

        // First flip notifies.
        let changed = monitor
            .evaluate(&symbol(), 100.0, &bare_indicators(), &signal(Direction::Sell, 3.0))
            .await;
        assert!(changed);

        // Second flip lands inside the cooldown window and is suppressed.
        let changed = monitor
            .evaluate(&symbol(), 100.0, &bare_indicators(), &signal(Direction::Buy, 3.0))
            .await;
        assert!(!changed);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Signal: BUY -> SELL"));
    }

    #[tokio::test]
    async fn test_confidence_delta_is_significant() {
        let sink = RecordingSink::new();
        let monitor = monitor(Arc::clone(&sink));

        monitor
            .evaluate(&symbol(), 100.0, &bare_indicators(), &signal(Direction::Buy, 3.0))
            .await;
        let changed = monitor
            .evaluate(&symbol(), 100.0, &bare_indicators(), &signal(Direction::Buy, 4.0))
            .await;

        assert!(changed);
        assert!(sink.sent()[0].contains("Confidence: 3 -> 4"));
    }

    #[tokio::test]
    async fn test_delivery_failure_is_not_fatal() {
        let sink = RecordingSink::new();
        sink.fail.store(true, Ordering::SeqCst);
        let monitor = monitor(Arc::clone(&sink));

        monitor
            .evaluate(&symbol(), 100.0, &bare_indicators(), &signal(Direction::Buy, 3.0))
            .await;
        let changed = monitor
            .evaluate(&symbol(), 100.0, &bare_indicators(), &signal(Direction::Sell, 3.0))
            .await;

        // The change was detected and the state advanced even though the
        // sink refused delivery.
        assert!(changed);
        assert_eq!(sink.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_band_cross_fires_on_zone_change_only() {
        let sink = RecordingSink::new();
        let monitor = monitor(Arc::clone(&sink));

        let indicators = IndicatorSnapshot {
            rsi: 50.0,
            ma20: 100.0,
            ma50: 100.0,
            ma200: 100.0,
            bb_upper: 110.0,
            bb_middle: 100.0,
            bb_lower: 90.0,
        };
        let hold = Signal::hold(100.0, vec![]);

        // Within bands: establishes zone, no alert.
        monitor.evaluate(&symbol(), 100.0, &indicators, &hold).await;
        assert!(sink.sent().is_empty());

        // Breaks above: one alert.
        monitor.evaluate(&symbol(), 112.0, &indicators, &hold).await;
        // Stays above: no repeat.
        monitor.evaluate(&symbol(), 115.0, &indicators, &hold).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("above upper Bollinger band"));
    }

    #[tokio::test]
    async fn test_check_now_counts_cache_changes() {
        let sink = RecordingSink::new();
        let cache = Arc::new(SnapshotCache::default());
        let monitor = Arc::new(SignalMonitor::new(
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
            Arc::clone(&cache),
            MonitorConfig::default(),
        ));

        // Establish BUY through a direct evaluation.
        monitor
            .evaluate(&symbol(), 100.0, &bare_indicators(), &signal(Direction::Buy, 3.0))
            .await;

        // The cache now holds a SELL snapshot for the same symbol.
        cache.write().insert(
            symbol(),
            MarketSnapshot {
                symbol: symbol(),
                tick: crate::event::Tick::mock(
                    crate::instrument::InstrumentKey::from("NSE_EQ|TCS"),
                    crate::instrument::MarketStatus::Open,
                    Utc::now(),
                ),
                change: 0.0,
                change_percent: 0.0,
                indicators: bare_indicators(),
                signal: signal(Direction::Sell, 3.0),
                time_generated: Utc::now(),
            },
        );

        assert_eq!(monitor.check_now().await, 1);
        assert!(monitor.status().last_check_time.is_some());

        // Re-running detects nothing new.
        assert_eq!(monitor.check_now().await, 0);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let sink = RecordingSink::new();
        let monitor = monitor(Arc::clone(&sink));

        assert!(!monitor.status().running);
        monitor.start(std::time::Duration::from_secs(300));
        assert!(monitor.status().running);

        // Second start is a no-op rather than a second loop.
        monitor.start(std::time::Duration::from_secs(300));

        monitor.stop();
        assert!(!monitor.status().running);
    }
}
