// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "valid price ticks evaluated").unwrap());

pub static TICKS_BY_KEY: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_key", "valid ticks per broker/symbol"),
        &["broker", "symbol"],
    )
    .unwrap()
});

pub static BAD_TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bad_ticks_total", "ticks skipped (labels: broker, symbol, reason)"),
        &["broker", "symbol", "reason"],
    )
    .unwrap()
});

pub static FEED_WORKERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("feed_workers_active", "live feed workers").unwrap());

// Waktu spawn worker -> first quote (milliseconds)
pub static FEED_READY_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "feed_ready_latency_ms",
        "Latency from worker spawn to first quote (ms)",
    ))
    .unwrap()
});

// -------- Router --------
pub static SESSIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("router_sessions_active", "connected client sessions").unwrap());

pub static COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("commands_total", "inbound commands"), &["msg"]).unwrap()
});

pub static EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("trigger_events_total", "outbound events"), &["msg"]).unwrap()
});

pub static REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("rejects_total", "rejected commands"), &["reason"]).unwrap()
});

pub static PENDING_ORDERS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pending_orders", "orders waiting for trigger").unwrap());

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "feed mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_KEY.clone())),
        REGISTRY.register(Box::new(BAD_TICKS.clone())),
        REGISTRY.register(Box::new(FEED_WORKERS.clone())),
        REGISTRY.register(Box::new(FEED_READY_MS.clone())),
        REGISTRY.register(Box::new(SESSIONS.clone())),
        REGISTRY.register(Box::new(COMMANDS.clone())),
        REGISTRY.register(Box::new(EVENTS.clone())),
        REGISTRY.register(Box::new(REJECTS.clone())),
        REGISTRY.register(Box::new(PENDING_ORDERS.clone())),
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Metrics server di OS thread sendiri (runtime Tokio tetap bersih)
pub fn serve_metrics(port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    tracing::info!(%addr, "metrics listening (/ and /metrics)");
    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(error = %e, "metrics accept error"),
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        init();
        COMMANDS.with_label_values(&["alert"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("commands_total"));
    }
}
