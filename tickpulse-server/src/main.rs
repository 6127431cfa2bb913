use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tickpulse_data::{
    Pipeline, SignalConfig,
    broker::BrokerClient,
    feed::{FeedConfig, MarketFeed, hours::MarketHours},
    instrument::InstrumentDirectory,
    ledger::TradeJournal,
    monitor::{MonitorConfig, stop_loss::StopLossMonitor},
    notify::{LogSink, NotificationSink, WebhookSink},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    init_logging();

    info!("Starting tickpulse WebSocket server");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(message) => {
            error!(%message, "invalid server configuration");
            std::process::exit(1);
        }
    };

    // Instrument directory is loaded once and queried by symbol.
    let directory = match load_directory(&config.instruments_file) {
        Ok(directory) => Arc::new(directory),
        Err(message) => {
            error!(%message, "failed to load instrument directory");
            std::process::exit(1);
        }
    };
    info!(instruments = directory.len(), "instrument directory loaded");

    let instruments =
        directory.resolve(config.watchlist.iter().map(String::as_str));
    if instruments.is_empty() {
        error!("no watchlist symbol resolved to an instrument - nothing to monitor");
        std::process::exit(1);
    }

    let broker = match BrokerClient::new(&config.api_base, config.access_token.clone()) {
        Ok(broker) => broker,
        Err(error) => {
            error!(%error, "failed to construct broker client");
            std::process::exit(1);
        }
    };

    let sink: Arc<dyn NotificationSink> = match &config.notify_webhook {
        Some(endpoint) => Arc::new(WebhookSink::new(endpoint.clone())),
        None => {
            warn!("no notification webhook configured - alerts will only be logged");
            Arc::new(LogSink)
        }
    };

    // The pipeline owns price history, signal state and the feed handle;
    // everything below holds references to it.
    let feed = MarketFeed::new(broker.clone(), MarketHours::default(), FeedConfig::default());
    let pipeline = Arc::new(Pipeline::new(
        feed,
        Arc::clone(&sink),
        instruments,
        SignalConfig::default(),
        MonitorConfig::default(),
    ));

    info!("warming up price history from daily candles");
    pipeline.warm_up(&broker).await;

    if let Err(error) = pipeline.start_ingest() {
        error!(%error, "failed to start ingestion");
    }
    pipeline.monitor().start(config.monitor_interval);

    let journal = Arc::new(TradeJournal::new());
    let stop_loss = Arc::new(StopLossMonitor::new(
        journal,
        Arc::new(broker.clone()),
        Arc::clone(&directory),
        Arc::clone(&sink),
    ));
    stop_loss.start(config.stop_loss_interval);

    // Accept WebSocket clients and serve until interrupted.
    let listen_addr = config.listen_addr;
    let accept_pipeline = Arc::clone(&pipeline);
    let accept_stop_loss = Arc::clone(&stop_loss);
    let server = tokio::spawn(async move {
        start_websocket_server(listen_addr, accept_pipeline, accept_stop_loss).await;
    });

    info!(addr = %listen_addr, "tickpulse server running - ctrl-c to stop");
    let _ = tokio::signal::ctrl_c().await;

    info!("shutting down");
    pipeline.stop_ingest();
    pipeline.monitor().stop();
    stop_loss.stop();
    server.abort();
}

struct ServerConfig {
    listen_addr: SocketAddr,
    api_base: String,
    access_token: String,
    instruments_file: String,
    watchlist: Vec<String>,
    notify_webhook: Option<url::Url>,
    monitor_interval: Duration,
    stop_loss_interval: Duration,
}

impl ServerConfig {
    fn from_env() -> Result<Self, String> {
        let listen_addr = std::env::var("TICKPULSE_WS_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9010".to_string())
            .parse::<SocketAddr>()
            .map_err(|error| format!("TICKPULSE_WS_ADDR: {error}"))?;

        let api_base =
            std::env::var("TICKPULSE_API_BASE").map_err(|_| "TICKPULSE_API_BASE not set")?;
        let access_token = std::env::var("TICKPULSE_ACCESS_TOKEN")
            .map_err(|_| "TICKPULSE_ACCESS_TOKEN not set")?;
        let instruments_file = std::env::var("TICKPULSE_INSTRUMENTS_FILE")
            .map_err(|_| "TICKPULSE_INSTRUMENTS_FILE not set")?;

        let watchlist: Vec<String> = std::env::var("TICKPULSE_WATCHLIST")
            .map_err(|_| "TICKPULSE_WATCHLIST not set")?
            .split(',')
            .map(str::trim)
            .filter(|symbol| !symbol.is_empty())
            .map(str::to_string)
            .collect();
        if watchlist.is_empty() {
            return Err("TICKPULSE_WATCHLIST is empty".to_string());
        }

        let notify_webhook = match std::env::var("TICKPULSE_NOTIFY_WEBHOOK") {
            Ok(raw) => Some(
                url::Url::parse(&raw)
                    .map_err(|error| format!("TICKPULSE_NOTIFY_WEBHOOK: {error}"))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            listen_addr,
            api_base,
            access_token,
            instruments_file,
            watchlist,
            notify_webhook,
            monitor_interval: env_duration("TICKPULSE_MONITOR_INTERVAL_SECS", 300),
            stop_loss_interval: env_duration("TICKPULSE_SL_INTERVAL_SECS", 120),
        })
    }
}

fn env_duration(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default_secs),
    )
}

fn load_directory(path: &str) -> Result<InstrumentDirectory, String> {
    let raw = std::fs::read_to_string(path).map_err(|error| format!("{path}: {error}"))?;
    InstrumentDirectory::from_json(&raw).map_err(|error| format!("{path}: {error}"))
}

async fn start_websocket_server(
    addr: SocketAddr,
    pipeline: Arc<Pipeline<BrokerClient>>,
    stop_loss: Arc<StopLossMonitor>,
) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, %addr, "failed to bind WebSocket server");
            return;
        }
    };

    info!("WebSocket server bound to {}", addr);

    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!("New WebSocket connection from {}", peer_addr);
        let pipeline = Arc::clone(&pipeline);
        let stop_loss = Arc::clone(&stop_loss);
        tokio::spawn(handle_client(stream, peer_addr, pipeline, stop_loss));
    }
}

async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    pipeline: Arc<Pipeline<BrokerClient>>,
    stop_loss: Arc<StopLossMonitor>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(error) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, error);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut snapshots = pipeline.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(16);

    let welcome = json!({
        "type": "welcome",
        "message": "Connected to the tickpulse snapshot feed",
        "commands": [
            "status", "check-now", "sl-check-now", "snapshot <SYMBOL>",
            "start-monitor [secs]", "stop-monitor", "start-sl [secs]", "stop-sl"
        ],
    });
    if let Ok(message) = serde_json::to_string(&welcome) {
        let _ = ws_sender.send(Message::text(message)).await;
    }

    // Forward pipeline snapshots and command replies to this client.
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(reply) => {
                        if ws_sender.send(Message::text(reply)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                snapshot = snapshots.recv() => match snapshot {
                    Ok(snapshot) => {
                        if let Ok(message) = serde_json::to_string(&snapshot) {
                            if ws_sender.send(Message::text(message)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Client fell behind under load: skip, don't drop.
                        warn!("Client {} lagged, skipped {} snapshots", peer_addr, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    // Admin text commands from the client.
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let reply = handle_command(text.as_str(), &pipeline, &stop_loss).await;
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => debug!("Received ping from {}", peer_addr),
                Ok(_) => {}
                Err(error) => {
                    error!("WebSocket error for {}: {}", peer_addr, error);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {}
        _ = &mut recv_task => {}
    }

    info!("WebSocket connection closed for {}", peer_addr);
}

async fn handle_command(
    command: &str,
    pipeline: &Arc<Pipeline<BrokerClient>>,
    stop_loss: &Arc<StopLossMonitor>,
) -> String {
    let mut parts = command.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let argument = parts.next();

    let reply = match verb {
        "status" => json!({
            "type": "status",
            "pipeline": pipeline.status(),
            "stop_loss": stop_loss.status(),
        }),
        "check-now" => {
            let changes = pipeline.monitor().check_now().await;
            json!({ "type": "check-now", "changes_detected": changes })
        }
        "sl-check-now" => {
            let hits = stop_loss.check_now().await;
            json!({ "type": "sl-check-now", "stop_loss_hits": hits })
        }
        "snapshot" => match argument.and_then(|symbol| pipeline.snapshot(symbol)) {
            Some(snapshot) => {
                json!({ "type": "snapshot", "data": snapshot })
            }
            None => json!({ "type": "error", "message": "no snapshot for symbol" }),
        },
        "start-monitor" => {
            pipeline
                .monitor()
                .start(command_interval(argument, 300));
            json!({ "type": "ok", "message": "signal monitoring started" })
        }
        "stop-monitor" => {
            pipeline.monitor().stop();
            json!({ "type": "ok", "message": "signal monitoring stopped" })
        }
        "start-sl" => {
            stop_loss.start(command_interval(argument, 120));
            json!({ "type": "ok", "message": "stop-loss monitoring started" })
        }
        "stop-sl" => {
            stop_loss.stop();
            json!({ "type": "ok", "message": "stop-loss monitoring stopped" })
        }
        _ => json!({ "type": "error", "message": format!("unknown command: {verb}") }),
    };

    reply.to_string()
}

fn command_interval(argument: Option<&str>, default_secs: u64) -> Duration {
    Duration::from_secs(
        argument
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default_secs),
    )
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("TICKPULSE_LOG_JSON").is_ok() {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
