//! Tick ingestion channel.
//!
//! Maintains a persistent subscription to the binary market-data feed for a
//! set of instruments, hiding reconnect complexity from consumers: ticks are
//! republished on a bounded channel, connection loss enters a capped
//! exponential backoff, and outside trading hours the channel yields the last
//! cached tick per instrument instead of connecting at all.

use crate::{
    error::DataError,
    event::Tick,
    feed::hours::MarketHours,
    instrument::{InstrumentKey, MarketStatus},
};
use async_trait::async_trait;
use chrono::Utc;
use derive_more::Display;
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Market-hours session gating.
pub mod hours;

/// Binary wire format and the subscribe command.
pub mod protocol;

/// Grants short-lived authorized stream endpoints for the upstream feed.
#[async_trait]
pub trait FeedAuthority: Send + Sync + 'static {
    async fn authorize(&self) -> Result<Url, DataError>;
}

/// Ingestion channel configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FeedConfig {
    /// Consecutive failed connection attempts before falling back to cached
    /// emission for the session.
    pub max_reconnect_attempts: u32,
    /// First backoff delay; doubles per attempt up to `backoff_max`.
    pub backoff_base: std::time::Duration,
    pub backoff_max: std::time::Duration,
    /// How often the market-hours gate is re-checked mid-stream.
    pub gate_poll_interval: std::time::Duration,
    /// Consumer channel capacity.
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            backoff_base: std::time::Duration::from_secs(1),
            backoff_max: std::time::Duration::from_secs(30),
            gate_poll_interval: std::time::Duration::from_secs(60),
            channel_capacity: 1024,
        }
    }
}

/// Connection lifecycle of the ingestion loop.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Display)]
pub enum Phase {
    #[default]
    Disconnected,
    Connecting,
    Streaming,
    Backoff,
    ClosedByGate,
}

/// Shared observability surface of a running feed: current phase, market
/// status for the status query, and the connection-attempt counter.
#[derive(Debug, Default)]
pub struct FeedTelemetry {
    phase: RwLock<Phase>,
    market_status: RwLock<MarketStatus>,
    connection_attempts: AtomicU32,
}

impl FeedTelemetry {
    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    pub fn market_status(&self) -> MarketStatus {
        *self.market_status.read()
    }

    pub fn connection_attempts(&self) -> u32 {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.write() = phase;
    }

    fn set_market_status(&self, status: MarketStatus) {
        *self.market_status.write() = status;
    }
}

/// Capped exponential backoff with jitter.
#[derive(Debug)]
struct ExponentialBackoff {
    base: std::time::Duration,
    max: std::time::Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    fn new(base: std::time::Duration, max: std::time::Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay: base doubled per previous attempt, capped, plus up to
    /// 250ms of jitter.
    fn next_delay(&mut self) -> std::time::Duration {
        let exp = self.attempt.min(16);
        self.attempt += 1;

        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max);
        delay + std::time::Duration::from_millis(rand::rng().random_range(0..250))
    }

    fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Outcome of one backoff pause.
enum BackoffOutcome {
    Retry,
    GateClosed,
    Exhausted,
    Cancelled,
}

/// Persistent, auto-recovering subscription to the market-data feed.
pub struct MarketFeed<Authority> {
    authority: Arc<Authority>,
    hours: MarketHours,
    config: FeedConfig,
    cache: Arc<RwLock<FnvHashMap<InstrumentKey, Tick>>>,
    telemetry: Arc<FeedTelemetry>,
}

impl<Authority> MarketFeed<Authority>
where
    Authority: FeedAuthority,
{
    pub fn new(authority: Authority, hours: MarketHours, config: FeedConfig) -> Self {
        Self {
            authority: Arc::new(authority),
            hours,
            config,
            cache: Arc::new(RwLock::new(FnvHashMap::default())),
            telemetry: Arc::new(FeedTelemetry::default()),
        }
    }

    /// Observability handle, shared with the spawned ingestion loop.
    pub fn telemetry(&self) -> Arc<FeedTelemetry> {
        Arc::clone(&self.telemetry)
    }

    /// Last live tick seen for an instrument, if any.
    pub fn cached_tick(&self, instrument: &InstrumentKey) -> Option<Tick> {
        self.cache.read().get(instrument).cloned()
    }

    /// Start streaming ticks for the instrument set.
    ///
    /// Spawns the ingestion loop and returns the consumer end of the tick
    /// channel. The loop runs until cancelled, the session ends (market
    /// close / retries exhausted, after the cached fallback emission), or the
    /// receiver is dropped.
    pub fn subscribe(
        &self,
        instruments: Vec<InstrumentKey>,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<Tick>, DataError> {
        if instruments.is_empty() {
            return Err(DataError::SubscriptionsEmpty);
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let worker = FeedWorker {
            authority: Arc::clone(&self.authority),
            hours: self.hours,
            config: self.config,
            cache: Arc::clone(&self.cache),
            telemetry: Arc::clone(&self.telemetry),
            instruments,
            tx,
            token,
        };

        tokio::spawn(worker.run());

        Ok(rx)
    }
}

struct FeedWorker<Authority> {
    authority: Arc<Authority>,
    hours: MarketHours,
    config: FeedConfig,
    cache: Arc<RwLock<FnvHashMap<InstrumentKey, Tick>>>,
    telemetry: Arc<FeedTelemetry>,
    instruments: Vec<InstrumentKey>,
    tx: mpsc::Sender<Tick>,
    token: CancellationToken,
}

impl<Authority> FeedWorker<Authority>
where
    Authority: FeedAuthority,
{
    async fn run(self) {
        let mut backoff =
            ExponentialBackoff::new(self.config.backoff_base, self.config.backoff_max);

        'session: loop {
            if self.token.is_cancelled() {
                break;
            }

            if !self.hours.is_open() {
                info!("market closed - yielding cached ticks instead of connecting");
                self.telemetry.set_phase(Phase::ClosedByGate);
                self.emit_fallback(MarketStatus::Closed).await;
                break;
            }

            self.telemetry.set_phase(Phase::Connecting);
            self.telemetry
                .connection_attempts
                .fetch_add(1, Ordering::Relaxed);

            match self.connect_and_stream().await {
                StreamEnd::Cancelled => break 'session,
                StreamEnd::ReceiverDropped => break 'session,
                StreamEnd::GateClosed => {
                    info!("market closed mid-stream - connection closed deliberately");
                    self.telemetry.set_phase(Phase::ClosedByGate);
                    self.emit_fallback(MarketStatus::Closed).await;
                    break 'session;
                }
                StreamEnd::Established => {
                    // Streamed successfully before losing the connection:
                    // restart the backoff ladder.
                    backoff.reset();
                }
                StreamEnd::Failed => {}
            }

            match self.backoff_pause(&mut backoff).await {
                BackoffOutcome::Retry => continue,
                BackoffOutcome::Cancelled => break,
                BackoffOutcome::GateClosed => {
                    info!("market closed during backoff - abandoning reconnect");
                    self.telemetry.set_phase(Phase::ClosedByGate);
                    self.emit_fallback(MarketStatus::Closed).await;
                    break;
                }
                BackoffOutcome::Exhausted => {
                    error!(
                        attempts = backoff.attempts(),
                        "feed reconnect attempts exhausted - falling back to cached emission"
                    );
                    self.emit_fallback(MarketStatus::Error).await;
                    break;
                }
            }
        }

        self.telemetry.set_phase(Phase::Disconnected);
    }

    /// One connection lifetime: authorize, connect, subscribe, then pump
    /// frames until the connection ends.
    async fn connect_and_stream(&self) -> StreamEnd {
        let endpoint = match self.authority.authorize().await {
            Ok(endpoint) => endpoint,
            Err(error) => {
                error!(%error, "feed authority authorization failed");
                return StreamEnd::Failed;
            }
        };

        let stream = tokio::select! {
            _ = self.token.cancelled() => return StreamEnd::Cancelled,
            connected = connect_async(endpoint.as_str()) => match connected {
                Ok((stream, _response)) => stream,
                Err(error) => {
                    error!(%error, "feed connection failed");
                    return StreamEnd::Failed;
                }
            },
        };

        let (mut write, mut read) = stream.split();
        if let Err(error) = write.send(protocol::subscribe_request(&self.instruments)).await {
            error!(%error, "failed to send subscribe command");
            return StreamEnd::Failed;
        }

        info!(
            instruments = self.instruments.len(),
            "feed connected and subscribed"
        );
        self.telemetry.set_phase(Phase::Streaming);
        self.telemetry.set_market_status(MarketStatus::Open);

        let mut gate = tokio::time::interval(self.config.gate_poll_interval);
        gate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        gate.tick().await;

        let mut streamed = false;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return StreamEnd::Cancelled;
                }
                _ = gate.tick() => {
                    if !self.hours.is_open() {
                        let _ = write.send(Message::Close(None)).await;
                        return StreamEnd::GateClosed;
                    }
                }
                message = read.next() => match message {
                    Some(Ok(Message::Binary(payload))) => {
                        match protocol::decode_frame(payload.as_ref()) {
                            Ok(frame) => {
                                streamed = true;
                                for tick in protocol::normalise(frame, Utc::now()) {
                                    self.cache
                                        .write()
                                        .insert(tick.instrument_key.clone(), tick.clone());
                                    if self.tx.send(tick).await.is_err() {
                                        debug!("tick receiver dropped - stopping feed");
                                        return StreamEnd::ReceiverDropped;
                                    }
                                }
                            }
                            // Malformed frames are logged and skipped; they
                            // never abort the connection.
                            Err(error) => {
                                warn!(%error, "skipping malformed feed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(message = %text, "feed control message");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        warn!(?frame, "feed connection closed by upstream");
                        break;
                    }
                    Some(Err(error)) => {
                        let error = DataError::from(error);
                        error!(%error, terminal = error.is_terminal(), "feed stream error");
                        break;
                    }
                    None => {
                        warn!("feed stream ended");
                        break;
                    }
                }
            }
        }

        if streamed {
            StreamEnd::Established
        } else {
            StreamEnd::Failed
        }
    }

    /// Pause before the next reconnect attempt. The sleep races the
    /// cancellation token so an external stop never waits out the backoff.
    async fn backoff_pause(&self, backoff: &mut ExponentialBackoff) -> BackoffOutcome {
        // attempts() counts pauses already taken; one more connection follows
        // each pause, so the bound is on total attempts per session.
        if backoff.attempts() + 1 >= self.config.max_reconnect_attempts {
            return BackoffOutcome::Exhausted;
        }
        if !self.hours.is_open() {
            return BackoffOutcome::GateClosed;
        }

        let delay = backoff.next_delay();
        self.telemetry.set_phase(Phase::Backoff);
        warn!(delay_ms = delay.as_millis() as u64, "feed backoff before reconnect");

        tokio::select! {
            _ = self.token.cancelled() => BackoffOutcome::Cancelled,
            _ = tokio::time::sleep(delay) => BackoffOutcome::Retry,
        }
    }

    /// Yield one cached tick per instrument (or the zero-valued mock when
    /// nothing was cached), tagged with the given status, then stop.
    async fn emit_fallback(&self, status: MarketStatus) {
        self.telemetry.set_market_status(status);
        let now = Utc::now();

        for instrument in &self.instruments {
            let tick = match self.cache.read().get(instrument).cloned() {
                Some(cached) => cached.cached(status),
                None => Tick::mock(instrument.clone(), status, now),
            };

            if self.tx.send(tick).await.is_err() {
                return;
            }
        }
    }
}

/// How one connection lifetime ended.
enum StreamEnd {
    /// Streamed at least one frame before disconnecting.
    Established,
    /// Never got as far as a decoded frame.
    Failed,
    GateClosed,
    Cancelled,
    ReceiverDropped,
}
