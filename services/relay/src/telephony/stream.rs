//! Bidirectional telephony audio over a WebSocket.
//!
//! Each `/audio` socket gets its own engine link for as long as it is open.
//! Carrier frames go up as 16 kHz PCM16; engine audio comes back down as
//! 8 kHz μ-law in the carrier's media-event shape.

use super::relay::transcode_frame;
use crate::{
    audio_utils::{
        ENGINE_PCM16_SAMPLE_RATE, StreamResampler, TELEPHONY_MULAW_SAMPLE_RATE, decode_i16,
        encode_i16, encode_mulaw,
    },
    config::BufferPolicy,
    engine::{AudioDelta, EngineLink, EngineMessage, RelayError},
    models::TelephonyEvent,
    state::RouterState,
};
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::Engine;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// 20 ms of engine audio at 16 kHz.
const ENGINE_FRAME_SAMPLES: usize = 320;

#[derive(Serialize, Debug)]
struct OutboundMedia {
    payload: String,
}

/// A media event sent back to the carrier.
#[derive(Serialize, Debug)]
struct OutboundEvent {
    event: &'static str,
    media: OutboundMedia,
}

/// Axum handler to upgrade an HTTP connection to a telephony audio socket.
pub async fn audio_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RouterState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_audio_socket(socket, state))
}

#[instrument(name = "audio_stream", skip_all, fields(connection_id = %Uuid::new_v4()))]
async fn handle_audio_socket(socket: WebSocket, state: Arc<RouterState>) {
    info!("Telephony audio socket connected.");

    let (engine_tx, engine_rx) = mpsc::channel(256);
    let engine = EngineLink::spawn(
        state.engine_url.clone(),
        state.reconnect_backoff,
        BufferPolicy::Drop,
        Some(engine_tx),
    );

    if let Err(e) = pump(socket, &engine, engine_rx).await {
        error!(error = ?e, "Telephony audio socket terminated with error.");
    }

    engine.shutdown().await;
    info!(stats = ?engine.stats(), "Telephony audio socket closed.");
}

async fn pump(
    socket: WebSocket,
    engine: &EngineLink,
    mut engine_rx: mpsc::Receiver<EngineMessage>,
) -> Result<()> {
    let (mut socket_tx, mut socket_rx) = socket.split();
    let mut upsampler = StreamResampler::telephony_to_engine()?;
    let mut downsampler = StreamResampler::new(
        ENGINE_PCM16_SAMPLE_RATE,
        TELEPHONY_MULAW_SAMPLE_RATE,
        ENGINE_FRAME_SAMPLES,
    )?;

    loop {
        tokio::select! {
            msg_result = socket_rx.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(event) = serde_json::from_str::<TelephonyEvent>(&text) else {
                            warn!("Ignoring unparsable telephony frame.");
                            continue;
                        };
                        match event.event.as_str() {
                            "media" => {
                                let Some(media) = event.media else { continue };
                                match transcode_frame(&mut upsampler, &media.payload) {
                                    Ok(Some(delta)) => {
                                        relay_up(engine, &mut upsampler, delta, media.timestamp).await;
                                    }
                                    Ok(None) => {}
                                    Err(e) => warn!(error = %e, "Malformed media frame dropped."),
                                }
                            }
                            "stop" => {
                                info!("Carrier stopped the stream.");
                                break;
                            }
                            other => debug!(event = %other, "Ignoring telephony event."),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Carrier closed the audio socket.");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Error receiving from telephony socket: {:?}", e);
                        break;
                    }
                }
            },
            Some(message) = engine_rx.recv() => {
                let pcm = downsampler.push(&decode_i16(&message.audio.delta));
                if pcm.is_empty() {
                    continue;
                }
                send_media(&mut socket_tx, &pcm).await?;
            },
        }
    }

    let tail = upsampler.finish();
    if !tail.is_empty() {
        relay_up(engine, &mut upsampler, encode_i16(&tail), None).await;
    }
    Ok(())
}

async fn relay_up(
    engine: &EngineLink,
    upsampler: &mut StreamResampler,
    delta: String,
    timestamp: Option<serde_json::Value>,
) {
    let message = EngineMessage {
        audio: AudioDelta {
            delta,
            sample_rate: Some(ENGINE_PCM16_SAMPLE_RATE as u32),
            format: Some("pcm16".to_string()),
            timestamp,
        },
    };
    // Drops are counted by the link; carried audio goes with them.
    if let Err(RelayError::UpstreamUnavailable) = engine.relay(&message).await {
        upsampler.reset();
    }
}

async fn send_media(socket_tx: &mut SplitSink<WebSocket, Message>, pcm: &[i16]) -> Result<()> {
    let event = OutboundEvent {
        event: "media",
        media: OutboundMedia {
            payload: base64::engine::general_purpose::STANDARD.encode(encode_mulaw(pcm)),
        },
    };
    let serialized = serde_json::to_string(&event)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
