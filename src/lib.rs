// ===============================
// src/lib.rs
// ===============================
pub mod book;
pub mod client;
pub mod config;
pub mod domain;
pub mod feed;
pub mod metrics;
pub mod notify;
pub mod predicate;
pub mod recorder;
pub mod router;
pub mod transport;
pub mod worker;
