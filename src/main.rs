// ===============================
// src/main.rs
// ===============================
/*
 # daemon
 FEED_MODE=binance_mainnet cargo run --release -- serve

 # client (di terminal lain)
 cargo run -- alert BTCUSDT 27000 --broker binance
 cargo run -- order sell BTCUSDT 28000 --broker binance
 cargo run -- session          # alert/buy/sell/cancel/modify per baris stdin

 # metrics
 curl -s localhost:9898/metrics | egrep '^(pending_orders|feed_workers_active|trigger_events_total)'
*/
/*
=============================================================================
Project : ems_rust - async execution management core (alerts + dark orders)
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Accepts alert/buy/sell/cancel/modify commands from clients,
          subscribes to live price feeds (mock/Binance) on demand, fires
          price triggers against every tick, and streams ack/alert/fill
          events back over a duplex channel. Exposes Prometheus metrics
          and records JSONL events.
=============================================================================
*/
use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    select,
    sync::mpsc,
    time::{interval, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ems_rust::client::{self, ClientOrderBook};
use ems_rust::config::{self, Args, Cli, Cmd, Side};
use ems_rust::domain::{CommandKind, Event, EventKind, TriggerEvent};
use ems_rust::feed::{BinanceFeed, BrokerFeeds, MockFeed, PriceFeed};
use ems_rust::metrics;
use ems_rust::notify::{DesktopNotifier, LogNotifier, Notifier};
use ems_rust::recorder;
use ems_rust::router::RouterCfg;
use ems_rust::transport;

type AppResult = Result<(), Box<dyn Error>>;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config: .env/env lalu CLI ----
    let cli = Cli::parse();
    let mut args = config::load();
    cli.apply(&mut args);

    let res = match cli.cmd {
        Cmd::Serve { .. } => serve(args).await,
        Cmd::Alert { symbol, price, broker, oid } => {
            one_shot(args, CommandKind::Alert, symbol, broker, price, oid).await
        }
        Cmd::Order { side, symbol, price, broker, oid } => {
            let kind = match side {
                Side::Buy => CommandKind::Buy,
                Side::Sell => CommandKind::Sell,
            };
            one_shot(args, kind, symbol, broker, price, oid).await
        }
        Cmd::Session => session(args).await,
    };

    if let Err(e) = res {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

fn build_feeds(args: &Args) -> BrokerFeeds {
    let mock = MockFeed { start_px: args.mock_start_px, tick_ms: args.mock_tick_ms, ..MockFeed::default() };
    let feeds = BrokerFeeds::new().with("mock", Arc::new(mock));
    match args.feed_mode {
        config::FeedMode::Mock => feeds,
        config::FeedMode::BinanceSandbox | config::FeedMode::BinanceMainnet => {
            let binance = BinanceFeed::new(args.binance_ws_url.clone(), args.binance_rest_url.clone());
            feeds.with("binance", Arc::new(binance))
        }
    }
}

async fn serve(args: Args) -> AppResult {
    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port)?;
    metrics::CONFIG_FEED_MODE.with_label_values(&[args.feed_mode.as_str()]).set(1);

    // ---- Recorder (optional) ----
    let rec_tx = match args.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(8192);
            tokio::spawn(async move {
                if let Err(e) = recorder::run(rx, path).await {
                    error!(error = %e, "recorder stopped");
                }
            });
            Some(tx)
        }
        None => None,
    };

    // ---- Feeds ----
    let feeds = build_feeds(&args);
    info!(
        listen = %args.listen,
        feed_mode = args.feed_mode.as_str(),
        brokers = ?feeds.brokers(),
        binance_ws = %args.binance_ws_url,
        binance_rest = %args.binance_rest_url,
        feed_ready_timeout = ?args.feed_ready_timeout,
        record_file = ?args.record_file,
        "startup config"
    );
    let feeds: Arc<dyn PriceFeed> = Arc::new(feeds);
    let cfg = RouterCfg { feed_ready_timeout: args.feed_ready_timeout };

    // ---- TCP daemon ----
    let listener = TcpListener::bind(&args.listen).await?;
    let server = transport::serve(listener, feeds, cfg, rec_tx);
    tokio::pin!(server);

    // ---- Heartbeat ----
    let mut hb = interval(Duration::from_secs(30));
    loop {
        select! {
            res = &mut server => return res.map_err(Into::into),
            _ = hb.tick() => {
                info!(
                    sessions = metrics::SESSIONS.get(),
                    workers = metrics::FEED_WORKERS.get(),
                    pending = metrics::PENDING_ORDERS.get(),
                    ticks = metrics::TICKS.get(),
                    "heartbeat"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c, shutting down");
                return Ok(());
            }
        }
    }
}

fn fresh_oid() -> String {
    format!("{}-{:04x}", chrono::Utc::now().format("%H%M%S%3f"), rand::random::<u16>())
}

/// Connect ke daemon; return book + salinan event untuk dicetak.
async fn connect_client(args: &Args) -> Result<(ClientOrderBook, mpsc::Receiver<TriggerEvent>), Box<dyn Error>> {
    let end = transport::connect(args.listen.as_str()).await?;
    info!(addr = %args.listen, "connected to ems");

    let (book, local) = ClientOrderBook::new(args.client_queue_cap, args.client_history_cap);
    tokio::spawn(client::forward(local, end.tx));

    let notifier: Arc<dyn Notifier> = if args.desktop_notify {
        Arc::new(DesktopNotifier::default())
    } else {
        Arc::new(LogNotifier)
    };
    let (tap_tx, tap_rx) = mpsc::channel(256);
    tokio::spawn(client::consume(end.rx, book.clone(), notifier, Some(tap_tx)));
    Ok((book, tap_rx))
}

fn print_event(ev: &TriggerEvent) {
    match serde_json::to_string(ev) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "event not printable"),
    }
}

/// Satu order/alert, tunggu sampai final. Ctrl-C = minta cancel.
async fn one_shot(
    args: Args,
    kind: CommandKind,
    symbol: String,
    broker: String,
    price: f64,
    oid: Option<String>,
) -> AppResult {
    let (book, mut events) = connect_client(&args).await?;
    let oid = oid.unwrap_or_else(fresh_oid);
    let brokers = vec![broker];
    match kind {
        CommandKind::Buy => book.buy(&oid, &symbol, &brokers, price)?,
        CommandKind::Sell => book.sell(&oid, &symbol, &brokers, price)?,
        _ => book.alert(&oid, &symbol, &brokers, price)?,
    }

    loop {
        select! {
            ev = events.recv() => {
                let Some(ev) = ev else {
                    return Err("ems closed the connection".into());
                };
                print_event(&ev);
                if ev.oid == oid && ev.msg != EventKind::Ack {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(%oid, "ctrl-c, cancelling");
                book.cancel(&oid)?;
            }
        }
    }
}

/// Command per baris dari stdin.
async fn session(args: Args) -> AppResult {
    let (book, mut events) = connect_client(&args).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed");
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                match book.apply_line(&line, fresh_oid) {
                    Ok(oid) => info!(%oid, "submitted"),
                    Err(e) => warn!(error = %e, "command not sent"),
                }
            }
            ev = events.recv() => {
                let Some(ev) = ev else {
                    return Err("ems closed the connection".into());
                };
                print_event(&ev);
            }
        }
    }
}
