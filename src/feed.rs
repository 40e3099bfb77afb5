// ===============================
// src/feed.rs
// ===============================
//
// Price feed adapters (satu stream per broker/symbol):
// - MockFeed    : random-walk generator
// - BinanceFeed : first quote via REST ticker, lalu WS aggTrade
//                 (reconnect dengan exponential backoff + jitter)
// - ReplayFeed  : feed manual; batch di-push dari luar (test / replay)
// - BrokerFeeds : dispatch ke feed sesuai nama broker
//
// Kontrak: batch pertama dari stream wajib membawa `last` untuk symbol yang
// disubscribe. Filter tick `price < 0` adalah tugas consumer (worker), bukan
// producer.
//

use ahash::AHashMap as HashMap;
use chrono::Utc;
use futures_util::future::{self, BoxFuture, FutureExt};
use futures_util::stream::{self, BoxStream, StreamExt};
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::{FeedKey, Quote, QuoteBatch, Tick};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("unknown broker {0}")]
    UnknownBroker(String),
    #[error("subscription rejected: {0}")]
    Open(String),
    #[error("stream error: {0}")]
    Stream(String),
}

pub type QuoteStream = BoxStream<'static, Result<QuoteBatch, FeedError>>;

pub trait PriceFeed: Send + Sync {
    fn open(&self, key: &FeedKey) -> BoxFuture<'static, Result<QuoteStream, FeedError>>;
}

/// Bungkus receiver mpsc jadi `QuoteStream`.
fn channel_stream(rx: mpsc::Receiver<Result<QuoteBatch, FeedError>>) -> QuoteStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|b| (b, rx)) }).boxed()
}

// -----------------------------------------------------------------------------
// Mock
// -----------------------------------------------------------------------------

/// Random walk ~1000/tick_ms ticks/s, harga minimum 1% dari start.
#[derive(Debug, Clone)]
pub struct MockFeed {
    pub start_px: f64,
    pub step: f64,
    pub tick_ms: u64,
}

impl Default for MockFeed {
    fn default() -> Self {
        Self { start_px: 100.0, step: 0.01, tick_ms: 5 }
    }
}

impl PriceFeed for MockFeed {
    fn open(&self, key: &FeedKey) -> BoxFuture<'static, Result<QuoteStream, FeedError>> {
        let cfg = self.clone();
        let symbol = key.symbol.clone();
        info!(%key, start_px = cfg.start_px, "mock feed opened");

        let first = Quote { last: cfg.start_px, ticks: vec![] };
        let head = stream::once(future::ready(Ok(single(&symbol, first))));

        let floor = cfg.start_px * 0.01;
        let (tick_ms, step_px) = (cfg.tick_ms, cfg.step);
        let walk = stream::unfold(cfg.start_px, move |px| {
            let symbol = symbol.clone();
            async move {
                sleep(Duration::from_millis(tick_ms)).await;
                // jangan simpan ThreadRng melewati .await
                let step = rand::thread_rng().gen_range(-3..=3) as f64 * step_px;
                let size = rand::thread_rng().gen_range(1..=10) as f64;
                let px = (px + step).max(floor);
                let quote = Quote { last: px, ticks: vec![Tick::trade(px, size)] };
                Some((Ok(single(&symbol, quote)), px))
            }
        });

        future::ready(Ok(head.chain(walk).boxed())).boxed()
    }
}

fn single(symbol: &str, quote: Quote) -> QuoteBatch {
    let mut batch = QuoteBatch::new();
    batch.insert(symbol.to_string(), quote);
    batch
}

// -----------------------------------------------------------------------------
// Binance
// -----------------------------------------------------------------------------

/// Binance spot: REST `ticker/price` untuk baseline, WS `<sym>@aggTrade` untuk tick.
///
/// - `ws_base`:
///     * Sandbox: wss://testnet.binance.vision/ws
///     * Mainnet: wss://stream.binance.com:9443/ws
/// - `rest_base`:
///     * Sandbox: https://testnet.binance.vision
///     * Mainnet: https://api.binance.com
#[derive(Debug, Clone)]
pub struct BinanceFeed {
    ws_base: String,
    rest_base: String,
    http: reqwest::Client,
}

impl BinanceFeed {
    pub fn new(ws_base: impl Into<String>, rest_base: impl Into<String>) -> Self {
        Self { ws_base: ws_base.into(), rest_base: rest_base.into(), http: reqwest::Client::new() }
    }
}

async fn fetch_last(http: &reqwest::Client, rest_base: &str, symbol: &str) -> Result<f64, FeedError> {
    let url = format!(
        "{}/api/v3/ticker/price?symbol={}",
        rest_base.trim_end_matches('/'),
        symbol.to_ascii_uppercase()
    );
    let rsp = http.get(&url).send().await.map_err(|e| FeedError::Open(e.to_string()))?;
    if !rsp.status().is_success() {
        let code = rsp.status();
        let body = rsp.text().await.unwrap_or_default();
        return Err(FeedError::Open(format!("{code}: {body}")));
    }
    let v = rsp.json::<serde_json::Value>().await.map_err(|e| FeedError::Open(e.to_string()))?;
    v.get("price")
        .and_then(|x| x.as_str())
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| FeedError::Open(format!("no price in ticker response: {v}")))
}

/// Parse satu frame aggTrade:
/// {"e":"aggTrade","E":123,"s":"BTCUSDT","a":1,"p":"0.001","q":"100",...}
fn parse_agg_trade(txt: &str) -> Option<(String, Tick)> {
    let v = serde_json::from_str::<serde_json::Value>(txt).ok()?;
    if v.get("e").and_then(|x| x.as_str()) != Some("aggTrade") {
        return None;
    }
    let sym = v.get("s")?.as_str()?.to_string();
    let price = v.get("p")?.as_str()?.parse::<f64>().ok()?;
    let size = v.get("q").and_then(|x| x.as_str()).and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
    Some((sym, Tick::trade(price, size)))
}

async fn pump_agg_trades(
    tx: mpsc::Sender<Result<QuoteBatch, FeedError>>,
    symbol: String,
    ws_base: String,
) {
    let topic = format!("{}@aggTrade", symbol.to_lowercase());
    let ws_url = format!("{}/{}", ws_base.trim_end_matches('/'), topic);

    let mut attempt: u32 = 0;
    loop {
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, %ws_url, "bad ws url");
                let _ = tx.send(Err(FeedError::Stream(format!("bad ws url {ws_url}: {e}")))).await;
                return;
            }
        };

        info!(%ws_url, "connecting binance aggTrade");
        let connected = tokio::select! {
            _ = tx.closed() => {
                info!(%symbol, "aggTrade consumer gone while connecting");
                return;
            }
            res = connect_async(url) => res,
        };
        match connected {
            Ok((mut ws, _resp)) => {
                info!(%symbol, "connected to aggTrade");
                attempt = 0;

                loop {
                    // worker bisa berhenti saat pair sepi; jangan tunggu frame berikutnya
                    let frame = tokio::select! {
                        _ = tx.closed() => {
                            info!(%symbol, "aggTrade consumer gone, closing");
                            return;
                        }
                        frame = ws.next() => frame,
                    };
                    let Some(frame) = frame else { break };
                    match frame {
                        Ok(m) if m.is_text() => {
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            let Some((sym, tick)) = parse_agg_trade(&txt) else {
                                debug!(%txt, "skip non-trade frame");
                                continue;
                            };
                            let quote = Quote { last: tick.price, ticks: vec![tick] };
                            if tx.send(Ok(single(&sym, quote))).await.is_err() {
                                // consumer (worker) sudah berhenti
                                info!(%symbol, "aggTrade consumer gone, closing");
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(?e, "ws read error");
                            break;
                        }
                    }
                }
                info!(%symbol, "aggTrade disconnected, will reconnect…");
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }

        // Exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let shift = attempt.min(6);
        let base_ms = 500u64.saturating_mul(1u64 << shift);
        let jitter = rand::thread_rng().gen_range(0..=250);
        tokio::select! {
            _ = tx.closed() => {
                info!(%symbol, "aggTrade consumer gone, no reconnect");
                return;
            }
            _ = sleep(Duration::from_millis(base_ms + jitter)) => {}
        }
    }
}

impl PriceFeed for BinanceFeed {
    fn open(&self, key: &FeedKey) -> BoxFuture<'static, Result<QuoteStream, FeedError>> {
        let http = self.http.clone();
        let rest_base = self.rest_base.clone();
        let ws_base = self.ws_base.clone();
        let symbol = key.symbol.to_ascii_uppercase();

        async move {
            let last = fetch_last(&http, &rest_base, &symbol).await?;
            info!(%symbol, last, ts = %Utc::now(), "binance first quote");

            let (tx, rx) = mpsc::channel(1024);
            // kapasitas cukup, batch pertama tidak akan gagal
            let _ = tx.try_send(Ok(single(&symbol, Quote { last, ticks: vec![] })));
            tokio::spawn(pump_agg_trades(tx, symbol, ws_base));
            Ok(channel_stream(rx))
        }
        .boxed()
    }
}

// -----------------------------------------------------------------------------
// Replay (manual)
// -----------------------------------------------------------------------------

type ReplayItem = Result<QuoteBatch, FeedError>;

#[derive(Default)]
struct ReplayState {
    senders: HashMap<FeedKey, mpsc::Sender<ReplayItem>>,
    waiting: HashMap<FeedKey, mpsc::Receiver<ReplayItem>>,
    failures: HashMap<FeedKey, String>,
    opens: HashMap<FeedKey, usize>,
}

/// Feed yang digerakkan manual. Batch yang di-push sebelum `open` di-buffer
/// dan diterima subscriber pertama.
#[derive(Clone, Default)]
pub struct ReplayFeed {
    state: Arc<Mutex<ReplayState>>,
}

const REPLAY_CAP: usize = 4096;

impl ReplayFeed {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self, key: &FeedKey) -> mpsc::Sender<ReplayItem> {
        let mut st = self.state();
        if let Some(tx) = st.senders.get(key) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(REPLAY_CAP);
        st.senders.insert(key.clone(), tx.clone());
        st.waiting.insert(key.clone(), rx);
        tx
    }

    /// Returns false kalau buffer penuh.
    pub fn push(&self, key: &FeedKey, batch: QuoteBatch) -> bool {
        self.sender(key).try_send(Ok(batch)).is_ok()
    }

    /// Kirim error ke stream yang sedang aktif.
    pub fn fail_stream(&self, key: &FeedKey, reason: impl Into<String>) -> bool {
        self.sender(key).try_send(Err(FeedError::Stream(reason.into()))).is_ok()
    }

    /// Tutup stream (subscriber melihat end-of-stream).
    pub fn close(&self, key: &FeedKey) {
        let mut st = self.state();
        st.senders.remove(key);
        st.waiting.remove(key);
    }

    /// Semua `open` berikutnya untuk key ini gagal.
    pub fn fail_open(&self, key: &FeedKey, reason: impl Into<String>) {
        self.state().failures.insert(key.clone(), reason.into());
    }

    pub fn opens(&self, key: &FeedKey) -> usize {
        self.state().opens.get(key).copied().unwrap_or(0)
    }
}

impl PriceFeed for ReplayFeed {
    fn open(&self, key: &FeedKey) -> BoxFuture<'static, Result<QuoteStream, FeedError>> {
        let mut st = self.state();
        *st.opens.entry(key.clone()).or_default() += 1;
        if let Some(reason) = st.failures.get(key) {
            return future::ready(Err(FeedError::Open(reason.clone()))).boxed();
        }
        let rx = match st.waiting.remove(key) {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::channel(REPLAY_CAP);
                st.senders.insert(key.clone(), tx);
                rx
            }
        };
        future::ready(Ok(channel_stream(rx))).boxed()
    }
}

// -----------------------------------------------------------------------------
// Dispatch per broker
// -----------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct BrokerFeeds {
    feeds: HashMap<String, Arc<dyn PriceFeed>>,
}

impl BrokerFeeds {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, broker: impl Into<String>, feed: Arc<dyn PriceFeed>) -> Self {
        self.feeds.insert(broker.into().to_ascii_lowercase(), feed);
        self
    }

    pub fn brokers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.feeds.keys().cloned().collect();
        names.sort();
        names
    }
}

impl PriceFeed for BrokerFeeds {
    fn open(&self, key: &FeedKey) -> BoxFuture<'static, Result<QuoteStream, FeedError>> {
        match self.feeds.get(&key.broker.to_ascii_lowercase()) {
            Some(feed) => feed.open(key),
            None => future::ready(Err(FeedError::UnknownBroker(key.broker.clone()))).boxed(),
        }
    }
}
