// ===============================
// src/router.rs (order router per client session)
// ===============================
//
// Loop command dari client:
//   alert/buy/sell -> pastikan feed worker hidup (spawn + tunggu first quote),
//                     bangun Trigger, masuk book, kirim ack
//   cancel         -> remove-by-oid, kirim cancelled / rejected
//   modify         -> in-place di bucket: Trigger baru di level baru, ack lagi
//
// Satu router (dan satu ExecutionBook) per session. Session selesai saat stream
// command tertutup; semua worker milik session di-abort.
//
use ahash::AHashMap as HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::book::{BookError, ExecutionBook, PendingOrder};
use crate::domain::{Command, CommandKind, Event, FeedKey, TriggerEvent};
use crate::feed::{FeedError, PriceFeed};
use crate::metrics::{COMMANDS, EVENTS, FEED_READY_MS, PENDING_ORDERS, REJECTS, SESSIONS};
use crate::predicate::Trigger;
use crate::worker::FeedWorker;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("session closed")]
pub struct SessionClosed;

/// Sisi kirim event ke client (+ tee ke recorder kalau aktif).
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<TriggerEvent>,
    rec: Option<mpsc::Sender<Event>>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<TriggerEvent>, rec: Option<mpsc::Sender<Event>>) -> Self {
        Self { tx, rec }
    }

    fn observe(&self, ev: &TriggerEvent) {
        EVENTS.with_label_values(&[ev.msg.as_str()]).inc();
        self.record(Event::Trig(ev.clone()));
    }

    pub fn record(&self, ev: Event) {
        if let Some(rec) = &self.rec {
            let _ = rec.try_send(ev);
        }
    }

    pub async fn send(&self, ev: TriggerEvent) -> Result<(), SessionClosed> {
        self.observe(&ev);
        self.tx.send(ev).await.map_err(|_| SessionClosed)
    }

    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, TriggerEvent>, SessionClosed> {
        self.tx.reserve().await.map_err(|_| SessionClosed)
    }

    pub fn deliver(&self, permit: mpsc::Permit<'_, TriggerEvent>, ev: TriggerEvent) {
        self.observe(&ev);
        permit.send(ev);
    }
}

#[derive(Debug, Error)]
enum SetupError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("feed not ready after {0:?}")]
    Timeout(Duration),
    #[error("feed worker exited before first quote")]
    WorkerGone,
}

#[derive(Debug, Clone, Default)]
pub struct RouterCfg {
    /// None = tunggu first quote tanpa batas
    pub feed_ready_timeout: Option<Duration>,
}

/// Worker yang pernah di-spawn untuk satu key.
struct Spawned {
    abort: AbortHandle,
    /// tertutup saat task worker selesai (normal, panic, atau abort)
    exited: oneshot::Receiver<()>,
}

pub struct Router {
    book: Arc<ExecutionBook>,
    feeds: Arc<dyn PriceFeed>,
    out: Outbox,
    cfg: RouterCfg,
    workers: JoinSet<()>,
    spawned: HashMap<FeedKey, Spawned>,
}

impl Router {
    pub fn new(feeds: Arc<dyn PriceFeed>, out: Outbox, cfg: RouterCfg) -> Self {
        Self {
            book: Arc::new(ExecutionBook::new()),
            feeds,
            out,
            cfg,
            workers: JoinSet::new(),
            spawned: HashMap::new(),
        }
    }

    pub fn book(&self) -> Arc<ExecutionBook> {
        self.book.clone()
    }

    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        SESSIONS.inc();
        info!("router session started");
        self.out.record(Event::Note("session started".into()));
        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if self.handle(cmd).await.is_err() {
                                info!("client event stream closed");
                                break;
                            }
                        }
                        None => {
                            info!("client command stream closed");
                            break;
                        }
                    }
                }
                Some(res) = self.workers.join_next(), if !self.workers.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            error!(?e, "feed worker panicked");
                        }
                    }
                }
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(mut self) {
        let left = self.book.len();
        PENDING_ORDERS.sub(left as i64);
        self.workers.shutdown().await;
        self.out.record(Event::Note(format!("session ended, {left} pending dropped")));
        SESSIONS.dec();
        info!(pending_dropped = left, "router session ended");
    }

    pub async fn handle(&mut self, cmd: Command) -> Result<(), SessionClosed> {
        COMMANDS.with_label_values(&[cmd.msg.as_str()]).inc();
        self.out.record(Event::Cmd(cmd.clone()));
        match cmd.msg {
            CommandKind::Alert | CommandKind::Buy | CommandKind::Sell => self.on_order(cmd).await,
            CommandKind::Cancel => self.on_cancel(cmd).await,
            CommandKind::Modify => self.on_modify(cmd).await,
        }
    }

    async fn reject(&self, cmd: &Command, code: &'static str, reason: String) -> Result<(), SessionClosed> {
        warn!(oid = %cmd.oid, msg = cmd.msg.as_str(), %reason, "command rejected");
        REJECTS.with_label_values(&[code]).inc();
        self.out.send(TriggerEvent::rejected(cmd, reason)).await
    }

    async fn on_order(&mut self, cmd: Command) -> Result<(), SessionClosed> {
        let Some(broker) = cmd.broker() else {
            return self.reject(&cmd, "no_broker", "no broker given".into()).await;
        };
        if !cmd.price.is_finite() {
            return self.reject(&cmd, "bad_price", format!("invalid price {}", cmd.price)).await;
        }
        if self.book.contains(&cmd.oid) {
            return self.reject(&cmd, "duplicate", BookError::DuplicateOid.to_string()).await;
        }
        if cmd.msg == CommandKind::Alert {
            info!(oid = %cmd.oid, symbol = %cmd.symbol, %broker, price = cmd.price, "alert received");
        }
        let key = FeedKey::new(broker, cmd.symbol.clone());
        self.place(key, cmd).await
    }

    /// Pasang order di book; spawn worker bila perlu.
    /// Kalau feed mati di antara cek dan insert, coba sekali lagi.
    async fn place(&mut self, key: FeedKey, cmd: Command) -> Result<(), SessionClosed> {
        for attempt in 0..2 {
            if let Err(e) = self.ensure_feed(&key).await {
                return self.reject(&cmd, "feed", format!("feed unavailable: {e}")).await;
            }
            match self.insert(&key, &cmd).await? {
                Ok(()) => return Ok(()),
                Err(BookError::DuplicateOid) => {
                    return self.reject(&cmd, "duplicate", BookError::DuplicateOid.to_string()).await;
                }
                Err(BookError::FeedDown(_)) => {
                    debug!(key = %key, attempt, "feed went down during placement");
                }
            }
        }
        self.reject(&cmd, "feed", format!("feed unavailable: {key} keeps failing")).await
    }

    async fn insert(&self, key: &FeedKey, cmd: &Command) -> Result<Result<(), BookError>, SessionClosed> {
        let Some(last) = self.book.last(key) else {
            return Ok(Err(BookError::FeedDown(key.clone())));
        };
        let trigger = Trigger::new(cmd.price, last);
        let ack = TriggerEvent::ack(cmd, trigger.direction);
        let order = PendingOrder { oid: cmd.oid.clone(), trigger, cmd: cmd.clone() };

        // ack masuk antrean sebelum order terlihat oleh worker
        let permit = self.out.reserve().await?;
        let out = &self.out;
        let res = self.book.insert(key, order, move || out.deliver(permit, ack));
        if res.is_ok() {
            PENDING_ORDERS.inc();
            info!(
                oid = %cmd.oid, key = %key, level = cmd.price, last,
                direction = trigger.direction.as_str(), "order live"
            );
        }
        Ok(res)
    }

    /// Pastikan ada worker hidup untuk `key`, return last price.
    async fn ensure_feed(&mut self, key: &FeedKey) -> Result<f64, SetupError> {
        if let Some(last) = self.book.last(key) {
            return Ok(last);
        }
        // max satu worker per key. Worker yang sedang retire ditunggu sampai
        // semua `cancelled` terkirim; sisanya (handshake timeout) di-abort.
        if let Some(stale) = self.spawned.remove(key) {
            if self.book.retiring(key) {
                debug!(key = %key, "waiting for retiring worker");
                let _ = stale.exited.await;
            } else {
                stale.abort.abort();
            }
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exited) = oneshot::channel::<()>();
        let worker = FeedWorker::new(key.clone(), self.book.clone(), self.out.clone());
        let feeds = self.feeds.clone();
        let abort = self.workers.spawn(async move {
            let _exit = exit_tx;
            worker.run(feeds, ready_tx).await;
        });
        self.spawned.insert(key.clone(), Spawned { abort, exited });
        info!(key = %key, "spawned feed worker, waiting first quote");

        let t0 = Instant::now();
        let ready = match self.cfg.feed_ready_timeout {
            Some(limit) => tokio::time::timeout(limit, ready_rx)
                .await
                .map_err(|_| SetupError::Timeout(limit))?,
            None => ready_rx.await,
        };
        let last = ready.map_err(|_| SetupError::WorkerGone)??;
        FEED_READY_MS.observe(t0.elapsed().as_secs_f64() * 1000.0);
        info!(key = %key, last, "received first quote");
        Ok(last)
    }

    async fn on_cancel(&mut self, cmd: Command) -> Result<(), SessionClosed> {
        match self.book.remove(&cmd.oid) {
            Some(o) => {
                PENDING_ORDERS.dec();
                info!(oid = %o.oid, "order cancelled");
                self.out.send(TriggerEvent::cancelled(&o.cmd)).await
            }
            None => self.reject(&cmd, "unknown_oid", "unknown order id".into()).await,
        }
    }

    async fn on_modify(&mut self, cmd: Command) -> Result<(), SessionClosed> {
        if !cmd.price.is_finite() {
            return self.reject(&cmd, "bad_price", format!("invalid price {}", cmd.price)).await;
        }
        // slot ack dipesan dulu; level baru baru terlihat worker setelah ack masuk antrean
        let permit = self.out.reserve().await?;
        let out = &self.out;
        let moved = self.book.modify(&cmd.oid, cmd.price, move |o| {
            out.deliver(permit, TriggerEvent::ack(&o.cmd, o.trigger.direction));
        });
        match moved {
            Some(from) => {
                info!(oid = %cmd.oid, from, to = cmd.price, "order modified");
                Ok(())
            }
            None => self.reject(&cmd, "unknown_oid", "unknown order id".into()).await,
        }
    }
}
