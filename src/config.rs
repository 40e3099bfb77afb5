// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : ems_rust - async execution management core (alerts + dark orders)
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Accepts alert/buy/sell/cancel/modify commands from clients,
          subscribes to live price feeds (mock/Binance) on demand, fires
          price triggers against every tick, and streams ack/alert/fill
          events back over a duplex channel. Exposes Prometheus metrics
          and records JSONL events.
=============================================================================
*/
use clap::{Parser, Subcommand, ValueEnum};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Mode sumber market data untuk broker `binance`
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FeedMode {
    Mock,
    BinanceSandbox,
    BinanceMainnet,
}

impl FeedMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock"            => Some(FeedMode::Mock),
            "binance_sandbox" | "binance-sandbox" => Some(FeedMode::BinanceSandbox),
            "binance_mainnet" | "binance-mainnet" => Some(FeedMode::BinanceMainnet),
            _ => None,
        }
    }

    pub fn from_env(key: &str, default_mode: FeedMode) -> FeedMode {
        env::var(key).ok().and_then(|v| Self::parse(&v)).unwrap_or(default_mode)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock           => "mock",
            FeedMode::BinanceSandbox => "binance_sandbox",
            FeedMode::BinanceMainnet => "binance_mainnet",
        }
    }

    // Endpoint default per mode
    pub fn default_ws_url(&self) -> &'static str {
        match self {
            FeedMode::Mock            => "wss://testnet.binance.vision/ws", // tidak dipakai saat mock
            FeedMode::BinanceSandbox  => "wss://testnet.binance.vision/ws",
            FeedMode::BinanceMainnet  => "wss://stream.binance.com:9443/ws",
        }
    }

    pub fn default_rest_url(&self) -> &'static str {
        match self {
            FeedMode::Mock            => "https://testnet.binance.vision", // placeholder
            FeedMode::BinanceSandbox  => "https://testnet.binance.vision",
            FeedMode::BinanceMainnet  => "https://api.binance.com",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // daemon
    pub listen: String,
    pub metrics_port: u16,
    pub record_file: Option<String>,

    // feed
    pub feed_mode: FeedMode,
    pub binance_ws_url: String,
    pub binance_rest_url: String,
    /// None = tunggu first quote tanpa batas
    pub feed_ready_timeout: Option<Duration>,
    pub mock_start_px: f64,
    pub mock_tick_ms: u64,

    // client
    pub client_queue_cap: usize,
    /// 0 = tidak dibatasi
    pub client_history_cap: usize,
    pub desktop_notify: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn load() -> Args {
    // Pastikan .env dibaca (agar RECORD_FILE, FEED_MODE, dll ter-load)
    let _ = dotenv();

    let listen       = env::var("EMS_LISTEN").unwrap_or_else(|_| "127.0.0.1:6969".to_string());
    let metrics_port = env_or("METRICS_PORT", 9898u16);
    let record_file  = env::var("RECORD_FILE").ok().filter(|s| !s.trim().is_empty());

    // ===== Feed =====
    let feed_mode = FeedMode::from_env("FEED_MODE", FeedMode::Mock);
    let binance_ws_url = env::var("BINANCE_WS_URL")
        .unwrap_or_else(|_| feed_mode.default_ws_url().to_string());
    let binance_rest_url = env::var("BINANCE_REST_URL")
        .unwrap_or_else(|_| feed_mode.default_rest_url().to_string());

    // FEED_READY_TIMEOUT_MS=0 atau kosong -> tunggu terus
    let feed_ready_timeout = Some(env_or("FEED_READY_TIMEOUT_MS", 0u64))
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis);

    let mock_start_px = env_or("MOCK_START_PX", 100.0f64);
    let mock_tick_ms  = env_or("MOCK_TICK_MS", 5u64);

    // ===== Client =====
    let client_queue_cap   = env_or("CLIENT_QUEUE_CAP", 1024usize);
    let client_history_cap = env_or("CLIENT_HISTORY_CAP", 0usize);
    let desktop_notify     = env_flag("DESKTOP_NOTIFY");

    Args {
        listen,
        metrics_port,
        record_file,
        feed_mode,
        binance_ws_url,
        binance_rest_url,
        feed_ready_timeout,
        mock_start_px,
        mock_tick_ms,
        client_queue_cap,
        client_history_cap,
        desktop_notify,
    }
}

// ===== CLI =====

#[derive(Debug, Parser)]
#[command(name = "ems_rust", version, about = "Alert / dark-order execution management daemon")]
pub struct Cli {
    /// Alamat daemon (override EMS_LISTEN)
    #[arg(long, global = true)]
    pub addr: Option<String>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Jalankan daemon: TCP listener, satu router per koneksi
    Serve {
        #[arg(long)]
        metrics_port: Option<u16>,
        #[arg(long, value_enum)]
        feed_mode: Option<FeedMode>,
        #[arg(long)]
        record_file: Option<String>,
    },
    /// Pasang price alert, tunggu sampai terpicu (Ctrl-C = cancel)
    Alert {
        symbol: String,
        price: f64,
        #[arg(long, default_value = "mock")]
        broker: String,
        #[arg(long)]
        oid: Option<String>,
    },
    /// Pasang dark order buy/sell, tunggu fill (Ctrl-C = cancel)
    Order {
        #[arg(value_enum)]
        side: Side,
        symbol: String,
        price: f64,
        #[arg(long, default_value = "mock")]
        broker: String,
        #[arg(long)]
        oid: Option<String>,
    },
    /// Session interaktif dari stdin (alert/buy/sell/cancel/modify per baris)
    Session,
}

impl Cli {
    /// CLI menimpa nilai dari env.
    pub fn apply(&self, args: &mut Args) {
        if let Some(addr) = &self.addr {
            args.listen = addr.clone();
        }
        if let Cmd::Serve { metrics_port, feed_mode, record_file } = &self.cmd {
            if let Some(p) = metrics_port {
                args.metrics_port = *p;
            }
            if let Some(m) = feed_mode {
                args.feed_mode = *m;
                if env::var("BINANCE_WS_URL").is_err() {
                    args.binance_ws_url = m.default_ws_url().to_string();
                }
                if env::var("BINANCE_REST_URL").is_err() {
                    args.binance_rest_url = m.default_rest_url().to_string();
                }
            }
            if let Some(f) = record_file {
                args.record_file = Some(f.clone());
            }
        }
    }
}
