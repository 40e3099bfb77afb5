// ===============================
// src/client.rs (client-side order book)
// ===============================
//
// Mirror lokal dari state di router:
// - submit() tidak pernah blocking: command masuk antrean lokal (bounded),
//   penuh -> error (bukan di-drop diam-diam)
// - forward() : task yang menguras antrean lokal ke duplex channel
// - consume() : task yang membaca event dari router, update book, notifikasi
//
// State lokal hanya berubah setelah konfirmasi router (ack / cancelled /
// rejected), termasuk untuk cancel.
//
use ahash::AHashMap as HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::domain::{Command, CommandKind, EventKind, TriggerEvent};
use crate::notify::{summary, Notifier};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("order queue full (capacity {0})")]
    QueueFull(usize),
    #[error("order queue closed")]
    Closed,
    #[error("unknown order id {0}")]
    UnknownOid(String),
    #[error("duplicate order id {0}")]
    DuplicateOid(String),
    #[error("bad command line: {0}")]
    Parse(String),
}

#[derive(Debug, Default)]
struct BookState {
    sent: HashMap<String, Command>,
    confirmed: HashMap<String, Command>,
    confirmed_seq: VecDeque<String>,
}

#[derive(Clone)]
pub struct ClientOrderBook {
    state: Arc<Mutex<BookState>>,
    to_ems: mpsc::Sender<Command>,
    queue_cap: usize,
    /// 0 = simpan semua
    history_cap: usize,
}

impl ClientOrderBook {
    /// Return book + sisi terima antrean lokal (untuk `forward`).
    pub fn new(queue_cap: usize, history_cap: usize) -> (Self, mpsc::Receiver<Command>) {
        let queue_cap = queue_cap.max(1);
        let (to_ems, rx) = mpsc::channel(queue_cap);
        let book = Self { state: Arc::default(), to_ems, queue_cap, history_cap };
        (book, rx)
    }

    fn state(&self) -> MutexGuard<'_, BookState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submit(&self, cmd: Command) -> Result<(), ClientError> {
        let oid = cmd.oid.clone();
        let is_order = matches!(cmd.msg, CommandKind::Alert | CommandKind::Buy | CommandKind::Sell);
        if is_order {
            let mut st = self.state();
            if st.sent.contains_key(&oid) || st.confirmed.contains_key(&oid) {
                warn!(%oid, "order id already in use");
                return Err(ClientError::DuplicateOid(oid));
            }
            st.sent.insert(oid.clone(), cmd.clone());
        }
        match self.to_ems.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(e) => {
                if is_order {
                    self.state().sent.remove(&oid);
                }
                match e {
                    TrySendError::Full(cmd) => {
                        error!(oid = %cmd.oid, cap = self.queue_cap, "order queue overflow");
                        Err(ClientError::QueueFull(self.queue_cap))
                    }
                    TrySendError::Closed(_) => Err(ClientError::Closed),
                }
            }
        }
    }

    fn order(&self, msg: CommandKind, oid: &str, symbol: &str, brokers: &[String], price: f64) -> Result<(), ClientError> {
        self.submit(Command {
            msg,
            oid: oid.to_string(),
            symbol: symbol.to_string(),
            brokers: brokers.to_vec(),
            price,
        })
    }

    pub fn alert(&self, oid: &str, symbol: &str, brokers: &[String], price: f64) -> Result<(), ClientError> {
        self.order(CommandKind::Alert, oid, symbol, brokers, price)
    }

    pub fn buy(&self, oid: &str, symbol: &str, brokers: &[String], price: f64) -> Result<(), ClientError> {
        self.order(CommandKind::Buy, oid, symbol, brokers, price)
    }

    pub fn sell(&self, oid: &str, symbol: &str, brokers: &[String], price: f64) -> Result<(), ClientError> {
        self.order(CommandKind::Sell, oid, symbol, brokers, price)
    }

    fn known(&self, oid: &str) -> Option<Command> {
        let st = self.state();
        st.confirmed.get(oid).or_else(|| st.sent.get(oid)).cloned()
    }

    /// Minta router membatalkan order. State lokal baru berubah saat `cancelled` datang.
    pub fn cancel(&self, oid: &str) -> Result<(), ClientError> {
        let known = self.known(oid).ok_or_else(|| ClientError::UnknownOid(oid.to_string()))?;
        self.submit(Command { msg: CommandKind::Cancel, ..known })
    }

    pub fn modify(&self, oid: &str, price: f64) -> Result<(), ClientError> {
        let known = self.known(oid).ok_or_else(|| ClientError::UnknownOid(oid.to_string()))?;
        self.submit(Command { msg: CommandKind::Modify, price, ..known })
    }

    /// Satu baris console:
    ///   `alert|buy|sell <symbol> <broker> <price> [oid]`
    ///   `cancel <oid>`
    ///   `modify <oid> <price>`
    /// Return oid yang dipakai.
    pub fn apply_line(&self, line: &str, fresh_oid: impl FnOnce() -> String) -> Result<String, ClientError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let price = |s: &str| -> Result<f64, ClientError> {
            s.parse::<f64>()
                .ok()
                .filter(|p| p.is_finite())
                .ok_or_else(|| ClientError::Parse(format!("bad price {s:?}")))
        };
        match parts.as_slice() {
            [kind @ ("alert" | "buy" | "sell"), symbol, broker, px, rest @ ..] if rest.len() <= 1 => {
                let oid = rest.first().map(|s| s.to_string()).unwrap_or_else(fresh_oid);
                let px = price(*px)?;
                let brokers = [broker.to_string()];
                match *kind {
                    "alert" => self.alert(&oid, symbol, &brokers, px)?,
                    "buy" => self.buy(&oid, symbol, &brokers, px)?,
                    _ => self.sell(&oid, symbol, &brokers, px)?,
                }
                Ok(oid)
            }
            ["cancel", oid] => {
                self.cancel(oid)?;
                Ok(oid.to_string())
            }
            ["modify", oid, px] => {
                self.modify(oid, price(*px)?)?;
                Ok(oid.to_string())
            }
            _ => Err(ClientError::Parse(line.trim().to_string())),
        }
    }

    fn confirm(&self, oid: &str, level: Option<f64>) -> bool {
        let mut st = self.state();
        if let Some(cmd) = st.sent.remove(oid) {
            st.confirmed.insert(oid.to_string(), cmd);
            st.confirmed_seq.push_back(oid.to_string());
        }
        let Some(cmd) = st.confirmed.get_mut(oid) else { return false };
        if let Some(level) = level {
            cmd.price = level;
        }
        // retention: buang entry confirmed paling lama
        if self.history_cap > 0 {
            while st.confirmed.len() > self.history_cap {
                let Some(old) = st.confirmed_seq.pop_front() else { break };
                st.confirmed.remove(&old);
            }
        }
        true
    }

    pub fn on_ack(&self, ev: &TriggerEvent) {
        if self.confirm(&ev.oid, Some(ev.level)) {
            info!(oid = %ev.oid, level = ev.level, "order accepted");
        } else {
            warn!(oid = %ev.oid, "ack for unknown order");
        }
    }

    pub fn on_fill(&self, ev: &TriggerEvent) {
        self.confirm(&ev.oid, None);
        info!(oid = %ev.oid, msg = ev.msg.as_str(), price = ev.price, "order executed");
    }

    pub fn on_cancelled(&self, ev: &TriggerEvent) {
        let mut st = self.state();
        st.sent.remove(&ev.oid);
        st.confirmed.remove(&ev.oid);
        st.confirmed_seq.retain(|o| o != &ev.oid);
        info!(oid = %ev.oid, reason = ?ev.reason, "order cancelled");
    }

    /// Command ditolak router: yang belum pernah live dibuang dari `sent`.
    pub fn on_rejected(&self, ev: &TriggerEvent) {
        self.state().sent.remove(&ev.oid);
        warn!(oid = %ev.oid, reason = ?ev.reason, "command rejected");
    }

    pub fn on_event(&self, ev: &TriggerEvent) {
        match ev.msg {
            EventKind::Ack => self.on_ack(ev),
            EventKind::Alert | EventKind::Fill => self.on_fill(ev),
            EventKind::Cancelled => self.on_cancelled(ev),
            EventKind::Rejected => self.on_rejected(ev),
        }
    }

    pub fn is_sent(&self, oid: &str) -> bool {
        self.state().sent.contains_key(oid)
    }

    pub fn is_confirmed(&self, oid: &str) -> bool {
        self.state().confirmed.contains_key(oid)
    }

    pub fn confirmed(&self, oid: &str) -> Option<Command> {
        self.state().confirmed.get(oid).cloned()
    }

    pub fn confirmed_len(&self) -> usize {
        self.state().confirmed.len()
    }
}

/// Relay antrean lokal ke duplex channel. Satu-satunya jalur command keluar client.
pub async fn forward(mut local: mpsc::Receiver<Command>, duplex_tx: mpsc::Sender<Command>) {
    while let Some(cmd) = local.recv().await {
        info!(oid = %cmd.oid, msg = cmd.msg.as_str(), symbol = %cmd.symbol, price = cmd.price, "sending order cmd");
        if duplex_tx.send(cmd).await.is_err() {
            warn!("router channel closed, forwarding stopped");
            return;
        }
    }
    debug!("local order queue closed");
}

/// Baca event dari router sampai channel tutup.
///
/// Alert/fill diteruskan ke notifier (gagal = log saja). Semua event juga
/// diteruskan ke `tap` kalau ada (UI / CLI).
pub async fn consume(
    mut events: mpsc::Receiver<TriggerEvent>,
    book: ClientOrderBook,
    notifier: Arc<dyn Notifier>,
    tap: Option<mpsc::Sender<TriggerEvent>>,
) {
    while let Some(ev) = events.recv().await {
        book.on_event(&ev);
        if matches!(ev.msg, EventKind::Alert | EventKind::Fill) {
            if let Err(e) = notifier.notify(&ev).await {
                warn!(error = %e, alert = %summary(&ev), "notification failed");
            }
        }
        if let Some(tap) = &tap {
            let _ = tap.send(ev).await;
        }
    }
    debug!("router event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;
    use crate::notify::NotifyError;
    use futures_util::future::{BoxFuture, FutureExt};

    fn brokers() -> Vec<String> {
        vec!["B".into()]
    }

    fn ev(msg: EventKind, cmd: &Command) -> TriggerEvent {
        match msg {
            EventKind::Ack => TriggerEvent::ack(cmd, Direction::Up),
            EventKind::Cancelled => TriggerEvent::cancelled(cmd),
            EventKind::Rejected => TriggerEvent::rejected(cmd, "nope"),
            _ => TriggerEvent::triggered(cmd, Direction::Up, 0, cmd.price),
        }
    }

    #[test]
    fn submit_then_ack_confirms() {
        let (book, mut rx) = ClientOrderBook::new(8, 0);
        book.alert("o1", "X", &brokers(), 50.0).unwrap();
        assert!(book.is_sent("o1"));
        assert!(!book.is_confirmed("o1"));

        let cmd = rx.try_recv().unwrap();
        assert_eq!(cmd.msg, CommandKind::Alert);
        book.on_event(&ev(EventKind::Ack, &cmd));
        assert!(!book.is_sent("o1"));
        assert!(book.is_confirmed("o1"));

        book.on_event(&ev(EventKind::Alert, &cmd));
        assert!(book.is_confirmed("o1"));
    }

    #[test]
    fn overflow_fails_loudly() {
        let (book, _rx) = ClientOrderBook::new(1, 0);
        book.alert("o1", "X", &brokers(), 50.0).unwrap();
        assert_eq!(book.alert("o2", "X", &brokers(), 51.0), Err(ClientError::QueueFull(1)));
        assert!(!book.is_sent("o2"));
    }

    #[test]
    fn cancel_waits_for_router() {
        let (book, mut rx) = ClientOrderBook::new(8, 0);
        book.buy("o1", "X", &brokers(), 50.0).unwrap();
        let cmd = rx.try_recv().unwrap();
        book.on_event(&ev(EventKind::Ack, &cmd));

        book.cancel("o1").unwrap();
        let cancel = rx.try_recv().unwrap();
        assert_eq!((cancel.msg, cancel.symbol.as_str()), (CommandKind::Cancel, "X"));
        assert!(book.is_confirmed("o1"));

        book.on_event(&ev(EventKind::Cancelled, &cmd));
        assert!(!book.is_confirmed("o1"));
        assert_eq!(book.cancel("o1"), Err(ClientError::UnknownOid("o1".into())));
    }

    #[test]
    fn modify_updates_level_on_reack() {
        let (book, mut rx) = ClientOrderBook::new(8, 0);
        book.sell("o1", "X", &brokers(), 70.0).unwrap();
        let cmd = rx.try_recv().unwrap();
        book.on_event(&ev(EventKind::Ack, &cmd));

        book.modify("o1", 65.0).unwrap();
        let m = rx.try_recv().unwrap();
        assert_eq!((m.msg, m.price), (CommandKind::Modify, 65.0));
        assert_eq!(book.confirmed("o1").unwrap().price, 70.0);

        book.on_event(&ev(EventKind::Ack, &Command { msg: CommandKind::Sell, ..m }));
        let c = book.confirmed("o1").unwrap();
        assert_eq!((c.msg, c.price), (CommandKind::Sell, 65.0));
    }

    #[test]
    fn rejected_order_leaves_sent() {
        let (book, mut rx) = ClientOrderBook::new(8, 0);
        book.alert("o1", "X", &brokers(), 50.0).unwrap();
        let cmd = rx.try_recv().unwrap();
        book.on_event(&ev(EventKind::Rejected, &cmd));
        assert!(!book.is_sent("o1"));
        assert!(!book.is_confirmed("o1"));
    }

    #[test]
    fn confirmed_history_is_bounded() {
        let (book, mut rx) = ClientOrderBook::new(16, 2);
        for oid in ["a", "b", "c"] {
            book.alert(oid, "X", &brokers(), 1.0).unwrap();
            let cmd = rx.try_recv().unwrap();
            book.on_event(&ev(EventKind::Ack, &cmd));
        }
        assert_eq!(book.confirmed_len(), 2);
        assert!(!book.is_confirmed("a"));
        assert!(book.is_confirmed("c"));
    }

    struct Broken;

    impl Notifier for Broken {
        fn notify(&self, _ev: &TriggerEvent) -> BoxFuture<'static, Result<(), NotifyError>> {
            let err = std::io::Error::new(std::io::ErrorKind::NotFound, "no notify-send");
            futures_util::future::ready(Err(NotifyError::Spawn(err))).boxed()
        }
    }

    #[tokio::test]
    async fn notifier_failure_is_not_fatal() {
        let (book, mut local) = ClientOrderBook::new(8, 0);
        book.alert("o1", "X", &brokers(), 50.0).unwrap();
        let cmd = local.recv().await.unwrap();

        let (ev_tx, ev_rx) = mpsc::channel(8);
        let (tap_tx, mut tap_rx) = mpsc::channel(8);
        let task = tokio::spawn(consume(ev_rx, book.clone(), Arc::new(Broken), Some(tap_tx)));

        ev_tx.send(ev(EventKind::Ack, &cmd)).await.unwrap();
        ev_tx.send(ev(EventKind::Alert, &cmd)).await.unwrap();
        assert_eq!(tap_rx.recv().await.unwrap().msg, EventKind::Ack);
        assert_eq!(tap_rx.recv().await.unwrap().msg, EventKind::Alert);
        drop(ev_tx);
        task.await.unwrap();
        assert!(book.is_confirmed("o1"));
    }

    #[tokio::test]
    async fn forward_relays_in_order() {
        let (book, local) = ClientOrderBook::new(8, 0);
        let (duplex_tx, mut duplex_rx) = mpsc::channel(8);
        book.alert("a", "X", &brokers(), 1.0).unwrap();
        book.alert("b", "X", &brokers(), 2.0).unwrap();
        drop(book);
        forward(local, duplex_tx).await;
        assert_eq!(duplex_rx.recv().await.unwrap().oid, "a");
        assert_eq!(duplex_rx.recv().await.unwrap().oid, "b");
    }

    #[test]
    fn console_lines() {
        let (book, mut rx) = ClientOrderBook::new(8, 0);
        let oid = book.apply_line("alert BTCUSDT binance 27000.5", || "auto-1".into()).unwrap();
        assert_eq!(oid, "auto-1");
        let cmd = rx.try_recv().unwrap();
        assert_eq!((cmd.msg, cmd.symbol.as_str(), cmd.price), (CommandKind::Alert, "BTCUSDT", 27000.5));
        assert_eq!(cmd.broker(), Some("binance"));

        assert_eq!(book.apply_line("sell X B 70 s1", || unreachable!()).unwrap(), "s1");
        assert_eq!(rx.try_recv().unwrap().msg, CommandKind::Sell);

        book.apply_line("modify s1 65", String::new).unwrap();
        let m = rx.try_recv().unwrap();
        assert_eq!((m.msg, m.price, m.symbol.as_str()), (CommandKind::Modify, 65.0, "X"));

        assert!(matches!(book.apply_line("buy X B abc", String::new), Err(ClientError::Parse(_))));
        assert!(matches!(book.apply_line("launch rockets", String::new), Err(ClientError::Parse(_))));
        assert_eq!(
            book.apply_line("cancel nope", String::new),
            Err(ClientError::UnknownOid("nope".into()))
        );
    }

    #[test]
    fn duplicate_oid_refused_locally() {
        let (book, mut rx) = ClientOrderBook::new(8, 0);
        book.alert("o1", "X", &brokers(), 50.0).unwrap();
        assert_eq!(
            book.buy("o1", "Y", &brokers(), 40.0),
            Err(ClientError::DuplicateOid("o1".into()))
        );
        let first = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());

        book.on_event(&ev(EventKind::Ack, &first));
        let kept = book.confirmed("o1").unwrap();
        assert_eq!((kept.msg, kept.symbol.as_str(), kept.price), (CommandKind::Alert, "X", 50.0));

        // sudah confirmed: tetap ditolak
        assert!(matches!(book.sell("o1", "X", &brokers(), 60.0), Err(ClientError::DuplicateOid(_))));
        assert_eq!(book.confirmed("o1").unwrap().msg, CommandKind::Alert);
    }

    #[test]
    fn overflow_keeps_existing_entries() {
        let (book, _rx) = ClientOrderBook::new(1, 0);
        book.alert("o1", "X", &brokers(), 50.0).unwrap();
        assert_eq!(book.alert("o2", "X", &brokers(), 51.0), Err(ClientError::QueueFull(1)));
        assert!(book.is_sent("o1"));
        assert!(!book.is_sent("o2"));
        assert!(matches!(book.alert("o1", "X", &brokers(), 52.0), Err(ClientError::DuplicateOid(_))));
        assert!(book.is_sent("o1"));
    }
}
