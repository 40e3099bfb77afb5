// ===============================
// src/book.rs (execution book per router session)
// ===============================
//
// Tabel order pending per (broker, symbol) + last price per key.
//
// - Setiap key punya bucket sendiri di balik mutex: append (router) dan
//   remove (feed worker) tidak bisa saling menimpa.
// - `last` hanya ditulis oleh worker pemilik key.
// - Bucket tanpa `last` dianggap feed belum/tidak hidup: order ditolak
//   dengan `BookError::FeedDown` supaya router spawn ulang worker.
//
// Lock order: index -> bucket. Jangan pegang bucket saat mengambil index.
//
use ahash::AHashMap as HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::domain::{Command, FeedKey};
use crate::predicate::Trigger;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingOrder {
    pub oid: String,
    pub trigger: Trigger,
    pub cmd: Command,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookError {
    #[error("duplicate order id")]
    DuplicateOid,
    #[error("no live feed for {0}")]
    FeedDown(FeedKey),
}

#[derive(Debug, Default)]
struct Bucket {
    last: Option<f64>,
    /// worker lama masih mengirim `cancelled` untuk order hasil drain
    retiring: bool,
    orders: Vec<PendingOrder>,
}

#[derive(Debug, Default)]
pub struct ExecutionBook {
    buckets: Mutex<HashMap<FeedKey, Arc<Mutex<Bucket>>>>,
    index: Mutex<HashMap<String, FeedKey>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecutionBook {
    pub fn new() -> Self { Self::default() }

    fn bucket(&self, key: &FeedKey) -> Arc<Mutex<Bucket>> {
        lock(&self.buckets).entry(key.clone()).or_default().clone()
    }

    fn existing(&self, key: &FeedKey) -> Option<Arc<Mutex<Bucket>>> {
        lock(&self.buckets).get(key).cloned()
    }

    pub fn last(&self, key: &FeedKey) -> Option<f64> {
        self.existing(key).and_then(|b| lock(&b).last)
    }

    /// Tick update, dipanggil hanya oleh worker pemilik key.
    pub fn set_last(&self, key: &FeedKey, price: f64) {
        let bucket = self.bucket(key);
        let mut b = lock(&bucket);
        b.last = Some(price);
        b.retiring = false;
    }

    /// True antara `retire` dan first quote worker berikutnya.
    pub fn retiring(&self, key: &FeedKey) -> bool {
        self.existing(key).map(|b| lock(&b).retiring).unwrap_or(false)
    }

    pub fn contains(&self, oid: &str) -> bool {
        lock(&self.index).contains_key(oid)
    }

    pub fn pending(&self, key: &FeedKey) -> usize {
        self.existing(key).map(|b| lock(&b).orders.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        lock(&self.index).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append order ke bucket `key`.
    ///
    /// `on_live` dijalankan selagi bucket masih terkunci, sebelum worker bisa
    /// melihat order ini. Router memakainya untuk meng-enqueue ack sehingga
    /// tidak ada trigger yang mendahului ack.
    pub fn insert<F: FnOnce()>(
        &self,
        key: &FeedKey,
        order: PendingOrder,
        on_live: F,
    ) -> Result<(), BookError> {
        let mut index = lock(&self.index);
        if index.contains_key(&order.oid) {
            return Err(BookError::DuplicateOid);
        }
        let bucket = self.bucket(key);
        let mut b = lock(&bucket);
        if b.last.is_none() {
            return Err(BookError::FeedDown(key.clone()));
        }
        index.insert(order.oid.clone(), key.clone());
        b.orders.push(order);
        on_live();
        Ok(())
    }

    /// Remove-by-oid lintas semua bucket (cancel / modify).
    pub fn remove(&self, oid: &str) -> Option<PendingOrder> {
        let mut index = lock(&self.index);
        let key = index.get(oid)?.clone();
        let bucket = self.existing(&key)?;
        let mut b = lock(&bucket);
        let pos = b.orders.iter().position(|o| o.oid == oid)?;
        index.remove(oid);
        Some(b.orders.remove(pos))
    }

    /// Pindah level order `oid` di tempat: Trigger dibangun ulang terhadap
    /// `last` bucket-nya dan order pindah ke akhir antrean key tersebut.
    ///
    /// Order tidak pernah keluar dari book. `on_live` menerima order baru dan
    /// dijalankan selagi bucket terkunci (lihat `insert`). Return level lama,
    /// `None` kalau oid tidak ada.
    pub fn modify<F: FnOnce(&PendingOrder)>(&self, oid: &str, price: f64, on_live: F) -> Option<f64> {
        let index = lock(&self.index);
        let key = index.get(oid)?;
        let bucket = self.existing(key)?;
        let mut b = lock(&bucket);
        let last = b.last?;
        let pos = b.orders.iter().position(|o| o.oid == oid)?;

        let mut order = b.orders.remove(pos);
        let old = order.trigger.price;
        order.trigger = Trigger::new(price, last);
        order.cmd.price = price;
        on_live(&order);
        b.orders.push(order);
        Some(old)
    }

    /// Evaluasi semua order pending `key` terhadap satu tick.
    ///
    /// Order yang kena dikeluarkan dari bucket dan dikembalikan dalam urutan
    /// insert; sisanya tetap dengan urutan semula.
    pub fn evaluate(&self, key: &FeedKey, price: f64) -> Vec<PendingOrder> {
        let Some(bucket) = self.existing(key) else { return Vec::new() };
        let fired: Vec<PendingOrder> = {
            let mut b = lock(&bucket);
            if b.orders.is_empty() {
                return Vec::new();
            }
            let snapshot = std::mem::take(&mut b.orders);
            let (fired, keep): (Vec<_>, Vec<_>) =
                snapshot.into_iter().partition(|o| o.trigger.hits(price));
            b.orders = keep;
            fired
        };
        if !fired.is_empty() {
            let mut index = lock(&self.index);
            for o in &fired {
                index.remove(&o.oid);
            }
        }
        fired
    }

    /// Feed mati: kosongkan bucket, hapus `last` dan tandai key `retiring`
    /// secara atomik.
    pub fn retire(&self, key: &FeedKey) -> Vec<PendingOrder> {
        let Some(bucket) = self.existing(key) else { return Vec::new() };
        let drained = {
            let mut b = lock(&bucket);
            b.last = None;
            b.retiring = true;
            std::mem::take(&mut b.orders)
        };
        if !drained.is_empty() {
            let mut index = lock(&self.index);
            for o in &drained {
                index.remove(&o.oid);
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CommandKind;

    fn key() -> FeedKey {
        FeedKey::new("B", "X")
    }

    fn order(oid: &str, level: f64, last: f64) -> PendingOrder {
        PendingOrder {
            oid: oid.into(),
            trigger: Trigger::new(level, last),
            cmd: Command {
                msg: CommandKind::Alert,
                oid: oid.into(),
                symbol: "X".into(),
                brokers: vec!["B".into()],
                price: level,
            },
        }
    }

    #[test]
    fn insert_requires_live_feed() {
        let book = ExecutionBook::new();
        let err = book.insert(&key(), order("o1", 10.0, 9.0), || {}).unwrap_err();
        assert_eq!(err, BookError::FeedDown(key()));
        assert!(book.is_empty());

        book.set_last(&key(), 9.0);
        book.insert(&key(), order("o1", 10.0, 9.0), || {}).unwrap();
        assert_eq!(book.pending(&key()), 1);
        assert!(book.contains("o1"));
    }

    #[test]
    fn duplicate_oid_rejected_across_keys() {
        let book = ExecutionBook::new();
        let other = FeedKey::new("B", "Y");
        book.set_last(&key(), 9.0);
        book.set_last(&other, 9.0);
        book.insert(&key(), order("o1", 10.0, 9.0), || {}).unwrap();
        let mut called = false;
        let err = book.insert(&other, order("o1", 10.0, 9.0), || called = true).unwrap_err();
        assert_eq!(err, BookError::DuplicateOid);
        assert!(!called);
        assert_eq!(book.pending(&other), 0);
    }

    #[test]
    fn evaluate_keeps_insertion_order_and_fires_once() {
        let book = ExecutionBook::new();
        book.set_last(&key(), 60.0);
        book.insert(&key(), order("a", 70.0, 60.0), || {}).unwrap();
        book.insert(&key(), order("b", 50.0, 60.0), || {}).unwrap();
        book.insert(&key(), order("c", 65.0, 60.0), || {}).unwrap();

        assert!(book.evaluate(&key(), 61.0).is_empty());

        let fired = book.evaluate(&key(), 75.0);
        let oids: Vec<_> = fired.iter().map(|o| o.oid.as_str()).collect();
        assert_eq!(oids, ["a", "c"]);
        assert!(book.evaluate(&key(), 75.0).is_empty());
        assert_eq!(book.pending(&key()), 1);
        assert!(!book.contains("a"));

        let fired = book.evaluate(&key(), 49.0);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].oid, "b");
        assert!(book.is_empty());
    }

    #[test]
    fn remove_by_oid() {
        let book = ExecutionBook::new();
        book.set_last(&key(), 60.0);
        book.insert(&key(), order("a", 70.0, 60.0), || {}).unwrap();
        book.insert(&key(), order("b", 80.0, 60.0), || {}).unwrap();

        assert_eq!(book.remove("a").map(|o| o.oid), Some("a".to_string()));
        assert!(book.remove("a").is_none());
        assert!(book.remove("nope").is_none());

        let fired = book.evaluate(&key(), 90.0);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].oid, "b");
    }

    #[test]
    fn retire_drains_and_clears_last() {
        let book = ExecutionBook::new();
        book.set_last(&key(), 60.0);
        book.insert(&key(), order("a", 70.0, 60.0), || {}).unwrap();
        book.insert(&key(), order("b", 50.0, 60.0), || {}).unwrap();

        let drained = book.retire(&key());
        assert_eq!(drained.len(), 2);
        assert_eq!(book.last(&key()), None);
        assert!(book.retiring(&key()));
        assert!(book.is_empty());
        assert!(matches!(
            book.insert(&key(), order("c", 70.0, 60.0), || {}),
            Err(BookError::FeedDown(_))
        ));
    }

    #[test]
    fn first_quote_after_retire_clears_retiring() {
        let book = ExecutionBook::new();
        assert!(!book.retiring(&key()));
        book.set_last(&key(), 60.0);
        book.retire(&key());
        assert!(book.retiring(&key()));
        book.set_last(&key(), 61.0);
        assert!(!book.retiring(&key()));
    }

    #[test]
    fn modify_rebuilds_trigger_in_place() {
        let book = ExecutionBook::new();
        book.set_last(&key(), 60.0);
        book.insert(&key(), order("a", 70.0, 60.0), || {}).unwrap();
        book.insert(&key(), order("b", 80.0, 60.0), || {}).unwrap();

        let mut seen = None;
        let old = book.modify("a", 55.0, |o| seen = Some((o.trigger, o.cmd.price)));
        assert_eq!(old, Some(70.0));
        assert_eq!(seen, Some((Trigger::new(55.0, 60.0), 55.0)));
        assert!(book.contains("a"));
        assert_eq!(book.pending(&key()), 2);

        // level lama tidak lagi memicu, level baru memicu, urutan: b lalu a
        assert!(book.evaluate(&key(), 71.0).is_empty());
        book.set_last(&key(), 71.0);
        book.modify("b", 54.0, |_| {}).unwrap();
        let fired = book.evaluate(&key(), 50.0);
        let oids: Vec<_> = fired.iter().map(|o| o.oid.as_str()).collect();
        assert_eq!(oids, ["a", "b"]);
    }

    #[test]
    fn modify_unknown_or_drained_oid() {
        let book = ExecutionBook::new();
        book.set_last(&key(), 60.0);
        book.insert(&key(), order("a", 70.0, 60.0), || {}).unwrap();
        book.retire(&key());

        let mut called = false;
        assert_eq!(book.modify("a", 65.0, |_| called = true), None);
        assert_eq!(book.modify("nope", 65.0, |_| called = true), None);
        assert!(!called);
    }
}
