//! Ingestion-to-notification pipeline.
//!
//! A [`Pipeline`] owns the price history, the snapshot cache, the signal
//! monitor and a handle to the market feed - constructed once at process
//! start and shared by reference, no globals. Each decoded tick flows
//! through: history append, indicator computation, signal generation, change
//! detection, then publication on the broadcast channel for push consumers
//! and into the cache for the pull API.

use crate::{
    broker::BrokerClient,
    error::DataError,
    event::{MarketSnapshot, Tick},
    feed::{FeedAuthority, FeedTelemetry, MarketFeed},
    history::PriceHistory,
    indicator::IndicatorSnapshot,
    instrument::{Instrument, InstrumentKey, MarketStatus},
    monitor::{MonitorStatus, SignalMonitor, SnapshotCache},
    notify::NotificationSink,
    signal::{self, Signal, SignalConfig},
};
use chrono::Utc;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use smol_str::SmolStr;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Broadcast buffer for push subscribers; laggards miss ticks, never block.
const BROADCAST_CAPACITY: usize = 1024;

/// Aggregate status for the admin surface.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub ingest_running: bool,
    pub feed_phase: String,
    pub market_status: MarketStatus,
    pub instrument_count: usize,
    pub monitor: MonitorStatus,
}

/// Ingestion-to-notification pipeline over a fixed instrument set.
pub struct Pipeline<Authority> {
    feed: MarketFeed<Authority>,
    telemetry: Arc<FeedTelemetry>,
    history: Arc<PriceHistory>,
    cache: Arc<SnapshotCache>,
    monitor: Arc<SignalMonitor>,
    signal_config: SignalConfig,
    instruments: Vec<Instrument>,
    symbols: FnvHashMap<InstrumentKey, SmolStr>,
    broadcast: broadcast::Sender<MarketSnapshot>,
    ingest_running: AtomicBool,
    ingest_token: Mutex<Option<CancellationToken>>,
}

impl<Authority> Pipeline<Authority>
where
    Authority: FeedAuthority,
{
    pub fn new(
        feed: MarketFeed<Authority>,
        sink: Arc<dyn NotificationSink>,
        instruments: Vec<Instrument>,
        signal_config: SignalConfig,
        monitor_config: crate::monitor::MonitorConfig,
    ) -> Self {
        let telemetry = feed.telemetry();
        let cache: Arc<SnapshotCache> = Arc::new(SnapshotCache::default());
        let monitor = Arc::new(SignalMonitor::new(sink, Arc::clone(&cache), monitor_config));
        let symbols = instruments
            .iter()
            .map(|instrument| (instrument.key.clone(), instrument.symbol.clone()))
            .collect();
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);

        Self {
            feed,
            telemetry,
            history: Arc::new(PriceHistory::new()),
            cache,
            monitor,
            signal_config,
            instruments,
            symbols,
            broadcast,
            ingest_running: AtomicBool::new(false),
            ingest_token: Mutex::new(None),
        }
    }

    /// Pre-fill price history from daily candles so the long moving averages
    /// carry meaning from the first live tick. Instruments whose history
    /// fetch fails are skipped, never fatal.
    pub async fn warm_up(&self, broker: &BrokerClient) {
        for instrument in &self.instruments {
            match broker.daily_closes(&instrument.key).await {
                Ok(closes) if !closes.is_empty() => {
                    debug!(
                        symbol = %instrument.symbol,
                        closes = closes.len(),
                        "seeded price history"
                    );
                    self.history.seed(&instrument.key, closes);
                }
                Ok(_) => warn!(symbol = %instrument.symbol, "no historical closes available"),
                Err(error) => warn!(
                    symbol = %instrument.symbol,
                    %error,
                    stage = "history warm-up",
                    "skipping instrument"
                ),
            }
        }
    }

    /// Start the ingestion loop: subscribe to the feed and process ticks
    /// until cancelled or the feed session ends. A second start while
    /// running is a no-op.
    pub fn start_ingest(self: &Arc<Self>) -> Result<(), DataError> {
        if self.ingest_running.swap(true, Ordering::SeqCst) {
            info!("ingestion already running");
            return Ok(());
        }

        let keys: Vec<InstrumentKey> = self
            .instruments
            .iter()
            .map(|instrument| instrument.key.clone())
            .collect();

        let token = CancellationToken::new();
        let mut rx = match self.feed.subscribe(keys, token.clone()) {
            Ok(rx) => rx,
            Err(error) => {
                self.ingest_running.store(false, Ordering::SeqCst);
                return Err(error);
            }
        };
        *self.ingest_token.lock() = Some(token);

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                instruments = pipeline.instruments.len(),
                "ingestion pipeline started"
            );
            while let Some(tick) = rx.recv().await {
                pipeline.ingest_tick(tick).await;
            }
            pipeline.ingest_running.store(false, Ordering::SeqCst);
            info!("ingestion pipeline stopped");
        });

        Ok(())
    }

    /// Stop the ingestion loop, abandoning any in-flight connection or
    /// backoff sleep.
    pub fn stop_ingest(&self) {
        if let Some(token) = self.ingest_token.lock().take() {
            token.cancel();
        }
    }

    /// Process one normalised tick through the full pipeline stage chain.
    pub async fn ingest_tick(&self, tick: Tick) {
        let Some(symbol) = self.symbols.get(&tick.instrument_key).cloned() else {
            warn!(instrument = %tick.instrument_key, "tick for unknown instrument - dropped");
            return;
        };

        let live = !tick.is_cached && !tick.is_mock && tick.last_price > 0.0;
        if live {
            self.history.append(&tick.instrument_key, tick.last_price);
        }

        let closes = self.history.closes(&tick.instrument_key);
        let indicators = IndicatorSnapshot::compute(&closes);

        // Change detection only ever runs on live data; cached and mock
        // ticks republish the previous signal for the pull API.
        let signal = if live {
            let signal = signal::generate(tick.last_price, &indicators, &self.signal_config);
            self.monitor
                .evaluate(&symbol, tick.last_price, &indicators, &signal)
                .await;
            signal
        } else {
            self.cache
                .read()
                .get(&symbol)
                .map(|snapshot| snapshot.signal.clone())
                .unwrap_or_else(|| {
                    Signal::hold(tick.last_price, vec!["No live data".to_string()])
                })
        };

        let snapshot = MarketSnapshot {
            symbol: symbol.clone(),
            change: tick.change(),
            change_percent: tick.change_percent(),
            tick,
            indicators,
            signal,
            time_generated: Utc::now(),
        };

        self.cache.write().insert(symbol, snapshot.clone());
        // No push subscribers is fine; laggards are handled receiver-side.
        let _ = self.broadcast.send(snapshot);
    }

    /// Push API: every processed tick's snapshot, as a broadcast stream.
    pub fn subscribe(&self) -> broadcast::Receiver<MarketSnapshot> {
        self.broadcast.subscribe()
    }

    /// Pull API: the latest snapshot for one symbol.
    pub fn snapshot(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.cache.read().get(symbol.to_uppercase().as_str()).cloned()
    }

    /// Pull API: the latest snapshot for every instrument seen so far.
    pub fn snapshots(&self) -> Vec<MarketSnapshot> {
        self.cache.read().values().cloned().collect()
    }

    /// The signal-change monitor, for admin start/stop/check-now.
    pub fn monitor(&self) -> &Arc<SignalMonitor> {
        &self.monitor
    }

    /// Shared price history, primarily for seeding in embedders.
    pub fn history(&self) -> &Arc<PriceHistory> {
        &self.history
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            ingest_running: self.ingest_running.load(Ordering::SeqCst),
            feed_phase: self.telemetry.phase().to_string(),
            market_status: self.telemetry.market_status(),
            instrument_count: self.instruments.len(),
            monitor: self.monitor.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedConfig, hours::MarketHours};
    use crate::notify::LogSink;
    use async_trait::async_trait;
    use url::Url;

    struct NoAuthority;

    #[async_trait]
    impl FeedAuthority for NoAuthority {
        async fn authorize(&self) -> Result<Url, DataError> {
            Err(DataError::Authority("not used in tests".to_string()))
        }
    }

    fn pipeline() -> Arc<Pipeline<NoAuthority>> {
        let feed = MarketFeed::new(NoAuthority, MarketHours::always_closed(), FeedConfig::default());
        Arc::new(Pipeline::new(
            feed,
            Arc::new(LogSink),
            vec![
                Instrument::new("TCS", InstrumentKey::from("NSE_EQ|TCS")),
                Instrument::new("INFY", InstrumentKey::from("NSE_EQ|INFY")),
            ],
            SignalConfig::default(),
            crate::monitor::MonitorConfig::default(),
        ))
    }

    fn live_tick(key: &str, price: f64) -> Tick {
        Tick {
            instrument_key: InstrumentKey::from(key),
            last_price: price,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 100,
            avg_price: price,
            timestamp: Utc::now(),
            market_status: MarketStatus::Open,
            is_cached: false,
            is_mock: false,
        }
    }

    #[tokio::test]
    async fn test_live_tick_builds_snapshot_and_broadcasts() {
        let pipeline = pipeline();
        let mut rx = pipeline.subscribe();

        pipeline.ingest_tick(live_tick("NSE_EQ|TCS", 3900.0)).await;

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.symbol, "TCS");
        assert_eq!(snapshot.tick.last_price, 3900.0);
        // One close so far: neutral RSI, MA20 equals the price.
        assert_eq!(snapshot.indicators.rsi, 50.0);
        assert_eq!(snapshot.indicators.ma20, 3900.0);

        // Pull API mirror, case-insensitive.
        assert!(pipeline.snapshot("tcs").is_some());
        assert!(pipeline.snapshot("INFY").is_none());
        assert_eq!(pipeline.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_instrument_tick_is_dropped() {
        let pipeline = pipeline();

        pipeline.ingest_tick(live_tick("NSE_EQ|UNKNOWN", 10.0)).await;

        assert!(pipeline.snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_mock_tick_keeps_last_signal_and_appends_nothing() {
        let pipeline = pipeline();

        for price in [100.0, 101.0, 102.0] {
            pipeline.ingest_tick(live_tick("NSE_EQ|TCS", price)).await;
        }
        assert_eq!(pipeline.history().len(&InstrumentKey::from("NSE_EQ|TCS")), 3);
        let live_signal = pipeline.snapshot("TCS").unwrap().signal;

        let mock = Tick::mock(
            InstrumentKey::from("NSE_EQ|TCS"),
            MarketStatus::Closed,
            Utc::now(),
        );
        pipeline.ingest_tick(mock).await;

        // History unchanged, previous signal preserved on the snapshot.
        assert_eq!(pipeline.history().len(&InstrumentKey::from("NSE_EQ|TCS")), 3);
        let snapshot = pipeline.snapshot("TCS").unwrap();
        assert!(snapshot.tick.is_mock);
        assert_eq!(snapshot.signal, live_signal);
    }

    #[tokio::test]
    async fn test_closed_gate_session_ends_and_status_reports() {
        let pipeline = pipeline();

        let mut rx = pipeline.subscribe();
        pipeline.start_ingest().unwrap();

        // Gate is closed: the session emits one mock snapshot per instrument
        // and the ingest loop winds down.
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.tick.is_mock && second.tick.is_mock);

        // Wait for the loop to observe the closed channel.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let status = pipeline.status();
        assert!(!status.ingest_running);
        assert_eq!(status.market_status, MarketStatus::Closed);
        assert_eq!(status.instrument_count, 2);
    }
}
