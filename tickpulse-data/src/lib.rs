//! # Tickpulse-Data
//! Streaming market-data ingestion, technical indicators and stateful signal
//! monitoring for an equity watchlist.
//!
//! ## Overview
//! A continuous tick stream is maintained over a binary-framed feed
//! connection (auto-recovering, market-hours gated), normalised into
//! [`Tick`](event::Tick) values, and folded into per-instrument price
//! history. From the history the indicator engine derives RSI, moving
//! averages and Bollinger Bands; the signal generator turns those into a
//! BUY/SELL/HOLD recommendation with confidence, levels and reasons; and the
//! change detector emits deduplicated, cooldown-gated notifications whenever
//! an instrument's signal state moves materially. A separate stop-loss
//! monitor watches open positions against their stop levels.
//!
//! ## Data flow
//! ```text
//! MarketFeed -> PriceHistory -> IndicatorSnapshot -> Signal
//!                                                      |
//!                              SignalMonitor <---------+
//!                                   |
//!                            NotificationSink
//! ```
//!
//! The [`Pipeline`](pipeline::Pipeline) owns all of the above explicitly -
//! constructed once at process start, no hidden globals - and exposes the
//! pull (latest snapshot per symbol), push (broadcast stream) and admin
//! (start/stop/check-now/status) surfaces.

/// REST collaborators: feed authority, batch quote fetch, history warm-up.
pub mod broker;

/// All errors generated in `tickpulse-data`.
pub mod error;

/// Normalised tick and per-tick snapshot types.
pub mod event;

/// Tick ingestion channel: market-hours gate, wire protocol, reconnect loop.
pub mod feed;

/// Per-instrument bounded closing-price series.
pub mod history;

/// Pure indicator math: RSI, moving averages, Bollinger Bands.
pub mod indicator;

/// Instrument keys and the symbol directory.
pub mod instrument;

/// Trade records and position netting.
pub mod ledger;

/// Signal change detection, band-cross alerts and stop-loss monitoring.
pub mod monitor;

/// Outbound notification delivery.
pub mod notify;

/// The ingestion-to-notification pipeline and its admin surface.
pub mod pipeline;

/// Trade signal generation and its tunable configuration.
pub mod signal;

pub use error::DataError;
pub use event::{MarketSnapshot, Tick};
pub use indicator::IndicatorSnapshot;
pub use instrument::{Instrument, InstrumentDirectory, InstrumentKey, MarketStatus};
pub use pipeline::{Pipeline, PipelineStatus};
pub use signal::{Direction, Sentiment, Signal, SignalConfig};
