// ===============================
// src/predicate.rs
// ===============================
//
// Trigger level untuk alert/order.
// Operator perbandingan dipilih otomatis dari posisi harga terakhir (known_last)
// terhadap level, sehingga predicate tidak langsung true saat dibuat.
//
//   level >= last  -> hits() jika price >= level, direction Down
//   level <  last  -> hits() jika price <= level, direction Up
//
// Catatan: label direction mengikuti konvensi lama (arah pendekatan historis).
//
use serde::{Deserialize, Serialize};

use crate::domain::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub price: f64,
    pub direction: Direction,
}

impl Trigger {
    pub fn new(trigger_price: f64, known_last: f64) -> Self {
        let direction = if trigger_price >= known_last { Direction::Down } else { Direction::Up };
        Self { price: trigger_price, direction }
    }

    #[inline]
    pub fn hits(&self, price: f64) -> bool {
        match self.direction {
            Direction::Down => price >= self.price,
            Direction::Up => price <= self.price,
        }
    }
}
