// ===============================
// src/domain.rs
// ===============================
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key satu feed: (broker, symbol)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedKey { pub broker: String, pub symbol: String }

impl FeedKey {
    pub fn new(broker: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self { broker: broker.into(), symbol: symbol.into() }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.symbol, self.broker)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind { Alert, Buy, Sell, Cancel, Modify }

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Alert => "alert",
            CommandKind::Buy => "buy",
            CommandKind::Sell => "sell",
            CommandKind::Cancel => "cancel",
            CommandKind::Modify => "modify",
        }
    }
}

/// Client -> router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub msg: CommandKind,
    pub oid: String,
    pub symbol: String,
    pub brokers: Vec<String>,
    pub price: f64,
}

impl Command {
    /// Only the first broker is routed to; fan-out is not supported.
    pub fn broker(&self) -> Option<&str> {
        self.brokers.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction { Up, Down }

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self { Direction::Up => "up", Direction::Down => "down" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind { Ack, Alert, Fill, Cancelled, Rejected }

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Ack => "ack",
            EventKind::Alert => "alert",
            EventKind::Fill => "fill",
            EventKind::Cancelled => "cancelled",
            EventKind::Rejected => "rejected",
        }
    }
}

/// Router -> client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub msg: EventKind,
    pub oid: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub broker: String,
    /// posisi di buffer harga saat trigger (hanya untuk display)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
    /// harga tick yang memicu (atau level order untuk ack)
    pub price: f64,
    /// level trigger milik order
    #[serde(default)]
    pub level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TriggerEvent {
    fn base(msg: EventKind, cmd: &Command) -> Self {
        Self {
            msg,
            oid: cmd.oid.clone(),
            symbol: cmd.symbol.clone(),
            broker: cmd.broker().unwrap_or_default().to_string(),
            index: None,
            price: cmd.price,
            level: cmd.price,
            direction: None,
            name: cmd.msg.as_str().to_string(),
            reason: None,
        }
    }

    pub fn ack(cmd: &Command, direction: Direction) -> Self {
        Self { direction: Some(direction), ..Self::base(EventKind::Ack, cmd) }
    }

    pub fn cancelled(cmd: &Command) -> Self {
        Self::base(EventKind::Cancelled, cmd)
    }

    pub fn with_reason(self, reason: impl Into<String>) -> Self {
        Self { reason: Some(reason.into()), ..self }
    }

    pub fn rejected(cmd: &Command, reason: impl Into<String>) -> Self {
        Self { reason: Some(reason.into()), ..Self::base(EventKind::Rejected, cmd) }
    }

    /// Reject for input that never became a `Command` (undecodable line).
    pub fn rejected_raw(oid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            msg: EventKind::Rejected,
            oid: oid.into(),
            symbol: String::new(),
            broker: String::new(),
            index: None,
            price: 0.0,
            level: 0.0,
            direction: None,
            name: String::new(),
            reason: Some(reason.into()),
        }
    }

    /// Alerts trigger as `alert`, buy/sell as a (simulated) `fill`.
    pub fn triggered(cmd: &Command, direction: Direction, index: i64, price: f64) -> Self {
        let msg = match cmd.msg {
            CommandKind::Buy | CommandKind::Sell => EventKind::Fill,
            _ => EventKind::Alert,
        };
        Self {
            index: Some(index),
            price,
            direction: Some(direction),
            ..Self::base(msg, cmd)
        }
    }
}

// Market data dari feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Tick {
    pub fn trade(price: f64, size: f64) -> Self {
        Self { price, size: Some(size), kind: Some("trade".into()) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote { pub last: f64, pub ticks: Vec<Tick> }

/// symbol -> quote
pub type QuoteBatch = HashMap<String, Quote>;

/// Bikin batch satu-symbol dari daftar harga
pub fn batch_of(symbol: &str, prices: &[f64]) -> QuoteBatch {
    let last = prices.last().copied().unwrap_or_default();
    let ticks = prices.iter().map(|p| Tick { price: *p, size: None, kind: None }).collect();
    let mut batch = QuoteBatch::new();
    batch.insert(symbol.to_string(), Quote { last, ticks });
    batch
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Cmd(Command), Trig(TriggerEvent), Note(String) }
