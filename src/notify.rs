// ===============================
// src/notify.rs
// ===============================
//
// Notifikasi sisi client untuk alert/fill.
// Gagal kirim notifikasi hanya di-log, tidak pernah balik ke pipeline trigger.
//
use futures_util::future::{self, BoxFuture, FutureExt};
use thiserror::Error;
use tracing::info;

use crate::domain::TriggerEvent;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier failed to start: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("notifier exited with {0}")]
    Exit(std::process::ExitStatus),
}

pub trait Notifier: Send + Sync {
    fn notify(&self, ev: &TriggerEvent) -> BoxFuture<'static, Result<(), NotifyError>>;
}

/// Ringkasan satu baris untuk manusia.
pub fn summary(ev: &TriggerEvent) -> String {
    let mut s = format!("{}: {}.{}", ev.msg.as_str(), ev.symbol, ev.broker);
    if let Some(d) = ev.direction {
        s.push_str(&format!(" {}", d.as_str()));
    }
    s.push_str(&format!(" @ {} (level {}) [{}]", ev.price, ev.level, ev.oid));
    if let Some(r) = &ev.reason {
        s.push_str(&format!(" - {r}"));
    }
    s
}

#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, ev: &TriggerEvent) -> BoxFuture<'static, Result<(), NotifyError>> {
        info!(oid = %ev.oid, "{}", summary(ev));
        future::ready(Ok(())).boxed()
    }
}

/// `notify-send` (linux desktop).
#[derive(Debug, Clone)]
pub struct DesktopNotifier {
    pub app: String,
    pub timeout_ms: u32,
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self { app: "ems".into(), timeout_ms: 10_000 }
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, ev: &TriggerEvent) -> BoxFuture<'static, Result<(), NotifyError>> {
        let app = self.app.clone();
        let timeout = self.timeout_ms.to_string();
        let body = summary(ev);
        async move {
            let status = tokio::process::Command::new("notify-send")
                .args(["-u", "normal", "-t", timeout.as_str(), app.as_str(), body.as_str()])
                .status()
                .await?;
            if status.success() { Ok(()) } else { Err(NotifyError::Exit(status)) }
        }
        .boxed()
    }
}
