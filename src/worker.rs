// ===============================
// src/worker.rs (feed worker per broker/symbol)
// ===============================
//
// Satu task per (broker, symbol):
// 1) open feed, tunggu batch pertama, seed `last` di book, lapor `ready`
// 2) tiap tick (urut sesuai kiriman feed):
//    - skip price < 0 (data kotor dari upstream), skip NaN/inf (protocol error)
//    - update last (walau belum ada order, untuk baseline order berikutnya)
//    - evaluasi order pending (urut insert), kirim TriggerEvent, order keluar dari book
// 3) feed error / stream selesai -> retire key: semua order pending dibatalkan
//    (event `cancelled` dengan reason)
//
// Worker jalan di task sendiri (tokio::spawn lewat JoinSet milik session),
// jadi error/cancel di loop command router tidak ikut mematikan subscription.
// Hanya akhir session yang meng-abort worker.
//

use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::book::{ExecutionBook, PendingOrder};
use crate::domain::{Event, FeedKey, TriggerEvent};
use crate::feed::{FeedError, PriceFeed, QuoteStream};
use crate::metrics::{BAD_TICKS, FEED_WORKERS, PENDING_ORDERS, TICKS, TICKS_BY_KEY};
use crate::router::Outbox;

pub type Ready = oneshot::Sender<Result<f64, FeedError>>;

/// Gauge worker aktif, turun otomatis saat task selesai atau di-abort.
struct LiveGuard;

impl LiveGuard {
    fn new() -> Self {
        FEED_WORKERS.inc();
        LiveGuard
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        FEED_WORKERS.dec();
    }
}

pub struct FeedWorker {
    key: FeedKey,
    book: Arc<ExecutionBook>,
    out: Outbox,
    /// jumlah tick valid yang sudah diproses (posisi buffer harga)
    index: i64,
}

impl FeedWorker {
    pub fn new(key: FeedKey, book: Arc<ExecutionBook>, out: Outbox) -> Self {
        Self { key, book, out, index: 0 }
    }

    async fn start(&self, feed: &dyn PriceFeed) -> Result<(QuoteStream, f64), FeedError> {
        let mut stream = feed.open(&self.key).await?;
        let first = match stream.next().await {
            Some(Ok(batch)) => batch,
            Some(Err(e)) => return Err(e),
            None => return Err(FeedError::Stream("feed closed before first quote".into())),
        };
        let last = first
            .iter()
            .find(|(sym, _)| sym.eq_ignore_ascii_case(&self.key.symbol))
            .map(|(_, q)| q.last)
            .filter(|px| px.is_finite() && *px >= 0.0)
            .ok_or_else(|| FeedError::Stream(format!("first quote has no last for {}", self.key)))?;
        Ok((stream, last))
    }

    /// Jalankan worker sampai feed mati atau session di-abort.
    pub async fn run(mut self, feed: Arc<dyn PriceFeed>, ready: Ready) {
        let (mut stream, last) = match self.start(feed.as_ref()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %self.key, error = %e, "feed start failed");
                let _ = ready.send(Err(e));
                return;
            }
        };

        let _live = LiveGuard::new();
        self.book.set_last(&self.key, last);
        info!(key = %self.key, last, "feed worker started");
        if ready.send(Ok(last)).is_err() {
            debug!(key = %self.key, "spawner stopped waiting; worker stays up");
        }

        let cause = loop {
            match stream.next().await {
                Some(Ok(batch)) => {
                    for (sym, quote) in batch {
                        if !sym.eq_ignore_ascii_case(&self.key.symbol) {
                            debug!(key = %self.key, %sym, "quote for foreign symbol ignored");
                            continue;
                        }
                        for tick in quote.ticks {
                            if self.on_tick(tick.price).await.is_err() {
                                debug!(key = %self.key, "session closed, worker exit");
                                return;
                            }
                        }
                    }
                }
                Some(Err(e)) => break e,
                None => break FeedError::Stream("feed closed".into()),
            }
        };

        error!(key = %self.key, error = %cause, "feed failed, retiring key");
        self.fail_pending(&cause).await;
    }

    async fn on_tick(&mut self, price: f64) -> Result<(), crate::router::SessionClosed> {
        if !price.is_finite() {
            warn!(key = %self.key, price, "non-finite tick (protocol error)");
            BAD_TICKS.with_label_values(&[&self.key.broker, &self.key.symbol, "non_finite"]).inc();
            return Ok(());
        }
        if price < 0.0 {
            BAD_TICKS.with_label_values(&[&self.key.broker, &self.key.symbol, "negative"]).inc();
            return Ok(());
        }

        self.book.set_last(&self.key, price);
        let index = self.index;
        self.index += 1;
        TICKS.inc();
        TICKS_BY_KEY.with_label_values(&[&self.key.broker, &self.key.symbol]).inc();

        for PendingOrder { oid, trigger, cmd } in self.book.evaluate(&self.key, price) {
            PENDING_ORDERS.dec();
            info!(%oid, key = %self.key, level = trigger.price, price, direction = trigger.direction.as_str(), "triggered");
            let ev = TriggerEvent::triggered(&cmd, trigger.direction, index, price);
            self.out.send(ev).await?;
        }
        Ok(())
    }

    async fn fail_pending(&self, cause: &FeedError) {
        let reason = format!("feed failed: {cause}");
        self.out.record(Event::Note(format!("{}: {reason}", self.key)));
        for o in self.book.retire(&self.key) {
            PENDING_ORDERS.dec();
            warn!(oid = %o.oid, key = %self.key, "order dropped by feed failure");
            let ev = TriggerEvent::cancelled(&o.cmd).with_reason(reason.as_str());
            if self.out.send(ev).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{batch_of, Command, CommandKind, EventKind, Quote, QuoteBatch, Tick};
    use crate::feed::ReplayFeed;
    use crate::predicate::Trigger;
    use tokio::sync::mpsc;

    fn alert(oid: &str, level: f64) -> Command {
        Command {
            msg: CommandKind::Alert,
            oid: oid.into(),
            symbol: "X".into(),
            brokers: vec!["B".into()],
            price: level,
        }
    }

    async fn started(
        feed: &ReplayFeed,
        key: &FeedKey,
    ) -> (Arc<ExecutionBook>, mpsc::Receiver<TriggerEvent>, tokio::task::JoinHandle<()>) {
        let book = Arc::new(ExecutionBook::new());
        let (tx, rx) = mpsc::channel(64);
        let worker = FeedWorker::new(key.clone(), book.clone(), Outbox::new(tx, None));
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(worker.run(Arc::new(feed.clone()), ready_tx));
        ready_rx.await.unwrap().unwrap();
        (book, rx, handle)
    }

    fn add(book: &ExecutionBook, key: &FeedKey, oid: &str, level: f64) {
        let last = book.last(key).unwrap();
        let o = PendingOrder { oid: oid.into(), trigger: Trigger::new(level, last), cmd: alert(oid, level) };
        book.insert(key, o, || {}).unwrap();
    }

    #[tokio::test]
    async fn ready_reports_first_last() {
        let feed = ReplayFeed::new();
        let key = FeedKey::new("B", "X");
        feed.push(&key, batch_of("X", &[60.0]));
        let (book, _rx, handle) = started(&feed, &key).await;
        assert_eq!(book.last(&key), Some(60.0));
        handle.abort();
    }

    #[tokio::test]
    async fn bad_ticks_are_skipped() {
        let feed = ReplayFeed::new();
        let key = FeedKey::new("B", "X");
        feed.push(&key, batch_of("X", &[60.0]));
        let (book, mut rx, handle) = started(&feed, &key).await;
        add(&book, &key, "o1", 50.0);

        feed.push(&key, batch_of("X", &[-1.0, f64::NAN, 49.0]));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.msg, EventKind::Alert);
        assert_eq!(ev.price, 49.0);
        // tick -1 dan NaN tidak dihitung di index
        assert_eq!(ev.index, Some(0));
        handle.abort();
    }

    #[tokio::test]
    async fn foreign_symbols_are_ignored() {
        let feed = ReplayFeed::new();
        let key = FeedKey::new("B", "X");
        feed.push(&key, batch_of("X", &[60.0]));
        let (book, mut rx, handle) = started(&feed, &key).await;
        add(&book, &key, "o1", 70.0);

        let mut batch = QuoteBatch::new();
        batch.insert("Y".into(), Quote { last: 99.0, ticks: vec![Tick::trade(99.0, 1.0)] });
        feed.push(&key, batch);
        feed.push(&key, batch_of("X", &[71.0]));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.oid, "o1");
        assert_eq!(ev.price, 71.0);
        assert_eq!(book.last(&key), Some(71.0));
        handle.abort();
    }

    #[tokio::test]
    async fn open_failure_goes_through_ready() {
        let feed = ReplayFeed::new();
        let key = FeedKey::new("B", "X");
        feed.fail_open(&key, "denied");
        let book = Arc::new(ExecutionBook::new());
        let (tx, _rx) = mpsc::channel(4);
        let (ready_tx, ready_rx) = oneshot::channel();
        FeedWorker::new(key.clone(), book.clone(), Outbox::new(tx, None))
            .run(Arc::new(feed), ready_tx)
            .await;
        assert_eq!(ready_rx.await.unwrap(), Err(FeedError::Open("denied".into())));
        assert_eq!(book.last(&key), None);
    }

    #[tokio::test]
    async fn stream_failure_cancels_pending() {
        let feed = ReplayFeed::new();
        let key = FeedKey::new("B", "X");
        feed.push(&key, batch_of("X", &[60.0]));
        let (book, mut rx, handle) = started(&feed, &key).await;
        add(&book, &key, "o1", 70.0);
        add(&book, &key, "o2", 50.0);

        feed.fail_stream(&key, "broker kicked us");
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!((a.msg, a.oid.as_str()), (EventKind::Cancelled, "o1"));
        assert_eq!((b.msg, b.oid.as_str()), (EventKind::Cancelled, "o2"));
        assert!(a.reason.unwrap().contains("broker kicked us"));
        handle.await.unwrap();
        assert_eq!(book.last(&key), None);
        assert!(book.is_empty());
    }
}
