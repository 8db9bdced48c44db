//! Persistent duplex channel to the speech/LLM engine.
//!
//! An [`EngineLink`] owns one WebSocket connection and keeps it alive on its
//! own task: `Disconnected → Connecting → Connected → Disconnected → …`, with a
//! fixed backoff between attempts and no give-up. Callers never wait for the
//! connection; frames offered while it is down are dropped (or briefly queued,
//! depending on the [`BufferPolicy`]) and counted.

use crate::config::BufferPolicy;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

type EngineStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// An audio delta as carried on the duplex channel, in both directions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioDelta {
    /// Base64 PCM16 little-endian.
    pub delta: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineMessage {
    pub audio: AudioDelta,
}

impl EngineMessage {
    pub fn delta(delta: impl Into<String>) -> Self {
        Self {
            audio: AudioDelta {
                delta: delta.into(),
                sample_rate: None,
                format: None,
                timestamp: None,
            },
        }
    }
}

/// Why a frame did not make it onto the wire.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("engine unavailable, frame dropped")]
    UpstreamUnavailable,
    #[error("engine unavailable, frame queued for reconnect")]
    Queued,
}

#[derive(Debug, Default)]
struct LinkCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
    connects: AtomicU64,
}

/// A snapshot of the link's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub connects: u64,
}

struct Outbound {
    writer: Option<SplitSink<EngineStream, WsMessage>>,
    backlog: VecDeque<String>,
    /// Cancels the reader of the current connection. Replaced on every connect.
    connection: CancellationToken,
}

struct Shared {
    url: String,
    backoff: Duration,
    policy: BufferPolicy,
    state_tx: watch::Sender<LinkState>,
    outbound: Mutex<Outbound>,
    counters: LinkCounters,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// A cheaply clonable handle to the engine connection.
#[derive(Clone)]
pub struct EngineLink {
    shared: Arc<Shared>,
}

impl EngineLink {
    /// Spawns the connection task and returns immediately.
    ///
    /// Audio deltas received from the engine are pushed to `inbound` in arrival
    /// order; with `None` they are discarded.
    pub fn spawn(
        url: impl Into<String>,
        backoff: Duration,
        policy: BufferPolicy,
        inbound: Option<mpsc::Sender<EngineMessage>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let shared = Arc::new(Shared {
            url: url.into(),
            backoff,
            policy,
            state_tx,
            outbound: Mutex::new(Outbound {
                writer: None,
                backlog: VecDeque::new(),
                connection: CancellationToken::new(),
            }),
            counters: LinkCounters::default(),
            task: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(run_link(shared.clone(), inbound));
        if let Ok(mut task) = shared.task.lock() {
            *task = Some(handle);
        }
        Self { shared }
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    pub fn stats(&self) -> LinkStats {
        let c = &self.shared.counters;
        LinkStats {
            sent: c.sent.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
        }
    }

    /// Offers one message to the engine.
    ///
    /// Never waits for a connection to come up. While the link is down the
    /// frame is dropped or queued according to the buffer policy; either way
    /// the drop decision is counted and returned to the caller.
    pub async fn relay(&self, message: &EngineMessage) -> Result<(), RelayError> {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to serialize engine message");
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(RelayError::UpstreamUnavailable);
            }
        };

        let mut outbound = self.shared.outbound.lock().await;
        if let Some(writer) = outbound.writer.as_mut() {
            match writer.send(WsMessage::Text(text.into())).await {
                Ok(()) => {
                    self.shared.counters.sent.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "Engine send failed; marking link broken");
                    outbound.writer = None;
                    self.shared.state_tx.send_replace(LinkState::Disconnected);
                    outbound.connection.cancel();
                    self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(RelayError::UpstreamUnavailable);
                }
            }
        }

        match self.shared.policy {
            BufferPolicy::Drop => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Engine link down; frame dropped");
                Err(RelayError::UpstreamUnavailable)
            }
            BufferPolicy::Queue(capacity) => {
                if outbound.backlog.len() >= capacity {
                    outbound.backlog.pop_front();
                    self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                outbound.backlog.push_back(text);
                Err(RelayError::Queued)
            }
        }
    }

    /// Stops the connection task and closes the socket.
    pub async fn shutdown(&self) {
        let handle = self.shared.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        let mut outbound = self.shared.outbound.lock().await;
        outbound.connection.cancel();
        if let Some(mut writer) = outbound.writer.take() {
            let _ = writer.close().await;
        }
        self.shared.state_tx.send_replace(LinkState::Disconnected);
        info!(url = %self.shared.url, "Engine link shut down.");
    }
}

/// Connection loop. Runs until the link is shut down.
#[instrument(name = "engine_link", skip_all, fields(url = %shared.url))]
async fn run_link(shared: Arc<Shared>, inbound: Option<mpsc::Sender<EngineMessage>>) {
    loop {
        shared.state_tx.send_replace(LinkState::Connecting);
        debug!("Connecting to engine...");

        match connect_async(shared.url.as_str()).await {
            Ok((ws_stream, _)) => {
                let (mut writer, reader) = ws_stream.split();
                let connection = CancellationToken::new();
                {
                    let mut outbound = shared.outbound.lock().await;
                    let mut flushed = 0usize;
                    while let Some(text) = outbound.backlog.pop_front() {
                        if writer.send(WsMessage::Text(text.into())).await.is_err() {
                            shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        shared.counters.sent.fetch_add(1, Ordering::Relaxed);
                        flushed += 1;
                    }
                    outbound.writer = Some(writer);
                    outbound.connection = connection.clone();
                    shared.counters.connects.fetch_add(1, Ordering::Relaxed);
                    shared.state_tx.send_replace(LinkState::Connected);
                    info!(flushed, "Connected to engine.");
                }

                read_until_closed(&connection, reader, inbound.as_ref()).await;

                let mut outbound = shared.outbound.lock().await;
                outbound.writer = None;
                shared.state_tx.send_replace(LinkState::Disconnected);
                warn!(backoff_ms = shared.backoff.as_millis() as u64, "Engine connection lost; reconnecting after backoff.");
            }
            Err(e) => {
                shared.state_tx.send_replace(LinkState::Disconnected);
                warn!(error = %e, backoff_ms = shared.backoff.as_millis() as u64, "Engine unreachable; retrying after backoff.");
            }
        }

        tokio::time::sleep(shared.backoff).await;
    }
}

async fn read_until_closed(
    connection: &CancellationToken,
    mut reader: SplitStream<EngineStream>,
    inbound: Option<&mpsc::Sender<EngineMessage>>,
) {
    loop {
        tokio::select! {
            msg_result = reader.next() => {
                match msg_result {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<EngineMessage>(&text) {
                            Ok(message) => {
                                if let Some(tx) = inbound {
                                    // Awaiting keeps arrival order under backpressure.
                                    tokio::select! {
                                        sent = tx.send(message) => {
                                            if sent.is_err() {
                                                debug!("Inbound consumer gone; discarding engine audio.");
                                            }
                                        },
                                        _ = connection.cancelled() => {
                                            debug!("Writer reported a broken link.");
                                            return;
                                        },
                                    }
                                }
                            }
                            Err(_) => trace!("Ignoring non-audio engine message."),
                        }
                    }
                    Some(Ok(WsMessage::Close(close_frame))) => {
                        info!(?close_frame, "Engine closed the connection.");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Error reading from engine WebSocket: {}", e);
                        return;
                    }
                    None => return,
                }
            },
            _ = connection.cancelled() => {
                debug!("Writer reported a broken link.");
                return;
            },
        }
    }
}
