// ===============================
// src/transport.rs (duplex channel client <-> router)
// ===============================
//
// Dua bentuk duplex:
// - in-process : pasangan mpsc (Command ->, <- TriggerEvent)
// - stream     : JSON lines di atas AsyncRead/AsyncWrite (TCP untuk antar proses)
//
// Baris yang tidak bisa di-decode jadi `Command` dibalas `rejected`
// ("unsupported command" / "invalid command"), tidak di-drop diam-diam.
//
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::{Command, CommandKind, Event, TriggerEvent};
use crate::feed::PriceFeed;
use crate::metrics::REJECTS;
use crate::router::{Outbox, Router, RouterCfg};

pub const CHANNEL_CAP: usize = 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Sisi client dari duplex.
pub struct ClientEnd {
    pub tx: mpsc::Sender<Command>,
    pub rx: mpsc::Receiver<TriggerEvent>,
}

/// Sisi router dari duplex.
pub struct ServerEnd {
    pub rx: mpsc::Receiver<Command>,
    pub tx: mpsc::Sender<TriggerEvent>,
}

pub fn duplex(cap: usize) -> (ClientEnd, ServerEnd) {
    let (cmd_tx, cmd_rx) = mpsc::channel(cap);
    let (ev_tx, ev_rx) = mpsc::channel(cap);
    (ClientEnd { tx: cmd_tx, rx: ev_rx }, ServerEnd { rx: cmd_rx, tx: ev_tx })
}

/// Jalankan satu session router di atas `ServerEnd`.
pub async fn run_session(
    end: ServerEnd,
    feeds: Arc<dyn PriceFeed>,
    cfg: RouterCfg,
    rec: Option<mpsc::Sender<Event>>,
) {
    Router::new(feeds, Outbox::new(end.tx, rec), cfg).run(end.rx).await;
}

/// Decode satu baris JSON jadi `Command`, atau event `rejected` untuk dibalas.
pub fn decode_command(line: &str) -> Result<Command, TriggerEvent> {
    let v: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| TriggerEvent::rejected_raw("", format!("malformed command: {e}")))?;
    let oid = v.get("oid").and_then(|x| x.as_str()).unwrap_or_default().to_string();

    if let Some(msg) = v.get("msg") {
        if serde_json::from_value::<CommandKind>(msg.clone()).is_err() {
            return Err(TriggerEvent::rejected_raw(oid, format!("unsupported command {msg}")));
        }
    }
    serde_json::from_value::<Command>(v).map_err(|e| TriggerEvent::rejected_raw(oid, format!("invalid command: {e}")))
}

async fn write_lines<W, T>(writer: W, mut rx: mpsc::Receiver<T>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut w = BufWriter::new(writer);
    while let Some(item) = rx.recv().await {
        let line = serde_json::to_string(&item)?;
        w.write_all(line.as_bytes()).await?;
        w.write_all(b"\n").await?;
        w.flush().await?;
    }
    // sisi tulis ditutup supaya peer melihat EOF
    w.shutdown().await
}

async fn read_commands<R>(reader: R, cmd_tx: mpsc::Sender<Command>, out: Outbox)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "command stream read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_command(&line) {
            Ok(cmd) => {
                if cmd_tx.send(cmd).await.is_err() {
                    break;
                }
            }
            Err(rej) => {
                warn!(oid = %rej.oid, reason = ?rej.reason, "bad command line");
                REJECTS.with_label_values(&["unsupported"]).inc();
                if out.send(rej).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("command stream closed");
}

async fn read_records<R, T>(reader: R, tx: mpsc::Sender<T>)
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<T>(&line) {
            Ok(item) => {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, %line, "undecodable line skipped"),
        }
    }
}

/// Router session di atas stream byte (JSON lines). Selesai saat client menutup sisi tulisnya.
pub async fn serve_io<R, W>(
    reader: R,
    writer: W,
    feeds: Arc<dyn PriceFeed>,
    cfg: RouterCfg,
    rec: Option<mpsc::Sender<Event>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAP);
    let (ev_tx, ev_rx) = mpsc::channel::<TriggerEvent>(CHANNEL_CAP);
    let out = Outbox::new(ev_tx, rec);

    let writer_task = tokio::spawn(write_lines(writer, ev_rx));
    let reader_task = tokio::spawn(read_commands(reader, cmd_tx, out.clone()));

    Router::new(feeds, out, cfg).run(cmd_rx).await;
    reader_task.abort();

    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "event writer stopped"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(?e, "event writer panicked"),
    }
}

/// Sisi client di atas stream byte.
pub fn connect_io<R, W>(reader: R, writer: W) -> ClientEnd
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(CHANNEL_CAP);
    let (ev_tx, ev_rx) = mpsc::channel::<TriggerEvent>(CHANNEL_CAP);
    tokio::spawn(async move {
        if let Err(e) = write_lines(writer, cmd_rx).await {
            warn!(error = %e, "command writer stopped");
        }
    });
    tokio::spawn(read_records(reader, ev_tx));
    ClientEnd { tx: cmd_tx, rx: ev_rx }
}

pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<ClientEnd, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let (r, w) = stream.into_split();
    Ok(connect_io(r, w))
}

/// Accept loop: satu router per koneksi.
pub async fn serve(
    listener: TcpListener,
    feeds: Arc<dyn PriceFeed>,
    cfg: RouterCfg,
    rec: Option<mpsc::Sender<Event>>,
) -> Result<(), TransportError> {
    info!(addr = ?listener.local_addr().ok(), "ems listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        info!(%peer, "client connected");
        let (r, w) = stream.into_split();
        let feeds = feeds.clone();
        let cfg = cfg.clone();
        let rec = rec.clone();
        tokio::spawn(async move {
            serve_io(r, w, feeds, cfg, rec).await;
            info!(%peer, "client disconnected");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{batch_of, EventKind, FeedKey};
    use crate::feed::ReplayFeed;

    #[test]
    fn decode_accepts_well_formed_commands() {
        let cmd = decode_command(
            r#"{"msg":"alert","oid":"o1","symbol":"X","brokers":["B"],"price":50.0}"#,
        )
        .unwrap();
        assert_eq!(cmd.msg, CommandKind::Alert);
        assert_eq!(cmd.broker(), Some("B"));
    }

    #[test]
    fn decode_rejects_unknown_msg_with_oid() {
        let rej = decode_command(
            r#"{"msg":"transmit","oid":"o9","symbol":"X","brokers":["B"],"price":1.0}"#,
        )
        .unwrap_err();
        assert_eq!(rej.msg, EventKind::Rejected);
        assert_eq!(rej.oid, "o9");
        assert!(rej.reason.unwrap().starts_with("unsupported command"));
    }

    #[test]
    fn decode_rejects_garbage() {
        let rej = decode_command("{nope").unwrap_err();
        assert!(rej.reason.unwrap().starts_with("malformed command"));
        let rej = decode_command(r#"{"msg":"alert","oid":"o2"}"#).unwrap_err();
        assert_eq!(rej.oid, "o2");
        assert!(rej.reason.unwrap().starts_with("invalid command"));
    }

    #[tokio::test]
    async fn json_lines_round_trip_over_io() {
        let feed = ReplayFeed::new();
        feed.push(&FeedKey::new("B", "X"), batch_of("X", &[60.0]));

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let (sr, sw) = tokio::io::split(server_io);
        let session = tokio::spawn(serve_io(sr, sw, Arc::new(feed.clone()), RouterCfg::default(), None));

        let (cr, cw) = tokio::io::split(client_io);
        let mut end = connect_io(cr, cw);
        end.tx
            .send(Command {
                msg: CommandKind::Alert,
                oid: "o1".into(),
                symbol: "X".into(),
                brokers: vec!["B".into()],
                price: 65.0,
            })
            .await
            .unwrap();
        let ack = end.rx.recv().await.unwrap();
        assert_eq!((ack.msg, ack.oid.as_str()), (EventKind::Ack, "o1"));

        feed.push(&FeedKey::new("B", "X"), batch_of("X", &[64.0, 66.0]));
        let hit = end.rx.recv().await.unwrap();
        assert_eq!((hit.msg, hit.price, hit.index), (EventKind::Alert, 66.0, Some(1)));

        drop(end);
        session.await.unwrap();
    }
}
