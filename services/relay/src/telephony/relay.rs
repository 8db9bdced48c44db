//! The relay worker: per-stream transcoding and hand-off to the engine link.
//!
//! HTTP handlers only enqueue events. A single worker task owns every
//! [`TelephonyStreamContext`], so frames of one stream are transcoded and
//! relayed in the order they were accepted.

use crate::audio_utils::{ENGINE_PCM16_SAMPLE_RATE, StreamResampler, decode_mulaw, encode_i16};
use crate::engine::{AudioDelta, EngineLink, EngineMessage, RelayError};
use crate::models::{RelayStatsResponse, TelephonyEvent};
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

/// Stream id used when the carrier does not name one.
const DEFAULT_STREAM_ID: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("media payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// μ-law base64 at 8 kHz in, base64 PCM16 at 16 kHz out.
///
/// The output has exactly twice as many samples as the frame, delayed by the
/// resampler's priming. Returns `None` for an empty frame.
pub fn transcode_frame(
    resampler: &mut StreamResampler,
    payload: &str,
) -> Result<Option<String>, FrameError> {
    let mulaw = base64::engine::general_purpose::STANDARD.decode(payload)?;
    let pcm = resampler.push(&decode_mulaw(&mulaw));
    Ok((!pcm.is_empty()).then(|| encode_i16(&pcm)))
}

#[derive(Debug, Default)]
pub struct RelayCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    decode_errors: AtomicU64,
    active_streams: AtomicU64,
}

impl RelayCounters {
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// State for one carrier media stream, owned by the relay worker.
struct TelephonyStreamContext {
    stream_id: String,
    engine: EngineLink,
    last_activity: Instant,
    resampler: StreamResampler,
    frames_relayed: u64,
}

impl TelephonyStreamContext {
    fn new(stream_id: String, engine: EngineLink) -> anyhow::Result<Self> {
        Ok(Self {
            stream_id,
            engine,
            last_activity: Instant::now(),
            resampler: StreamResampler::telephony_to_engine()?,
            frames_relayed: 0,
        })
    }

    async fn relay_media(
        &mut self,
        payload: &str,
        timestamp: Option<serde_json::Value>,
    ) -> Result<(), FrameError> {
        self.last_activity = Instant::now();
        let Some(delta) = transcode_frame(&mut self.resampler, payload)? else {
            return Ok(());
        };
        self.send(delta, timestamp).await;
        Ok(())
    }

    /// Relays the audio the resampler still holds back. Called once when the
    /// stream ends.
    async fn finish(&mut self) {
        let tail = self.resampler.finish();
        if !tail.is_empty() {
            self.send(encode_i16(&tail), None).await;
        }
    }

    async fn send(&mut self, delta: String, timestamp: Option<serde_json::Value>) {
        let message = EngineMessage {
            audio: AudioDelta {
                delta,
                sample_rate: Some(ENGINE_PCM16_SAMPLE_RATE as u32),
                format: Some("pcm16".to_string()),
                timestamp,
            },
        };
        match self.engine.relay(&message).await {
            Ok(()) => self.frames_relayed += 1,
            Err(RelayError::Queued) => trace!(stream_id = %self.stream_id, "Frame queued for reconnect."),
            Err(RelayError::UpstreamUnavailable) => {
                // Audio carried over from dropped frames must not reach the
                // engine after it reconnects.
                self.resampler.reset();
                trace!(stream_id = %self.stream_id, "Frame dropped; engine unavailable.")
            }
        }
    }
}

/// Handle to the relay worker, shared by the HTTP handlers.
#[derive(Clone)]
pub struct TelephonyRelay {
    engine: EngineLink,
    jobs: mpsc::Sender<TelephonyEvent>,
    counters: Arc<RelayCounters>,
}

impl TelephonyRelay {
    /// Spawns the relay worker in front of `engine`.
    pub fn spawn(engine: EngineLink, idle_timeout: Duration, queue_capacity: usize) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::channel(queue_capacity);
        let counters = Arc::new(RelayCounters::default());
        let worker = RelayWorker {
            engine: engine.clone(),
            counters: counters.clone(),
            idle_timeout,
            streams: HashMap::new(),
        };
        tokio::spawn(worker.run(jobs_rx));
        Self {
            engine,
            jobs: jobs_tx,
            counters,
        }
    }

    /// Enqueues an event without waiting. Returns `false` if the worker is
    /// saturated or gone; the event is then counted as dropped.
    pub fn submit(&self, event: TelephonyEvent) -> bool {
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        match self.jobs.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Relay queue rejected a telephony event.");
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn counters(&self) -> &RelayCounters {
        &self.counters
    }

    pub fn engine(&self) -> &EngineLink {
        &self.engine
    }

    pub fn stats(&self) -> RelayStatsResponse {
        let link = self.engine.stats();
        let c = &self.counters;
        RelayStatsResponse {
            accepted: c.accepted.load(Ordering::Relaxed),
            relayed: link.sent,
            dropped: link.dropped + c.rejected.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            active_streams: c.active_streams.load(Ordering::Relaxed),
            engine_state: serde_json::to_value(self.engine.state())
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        }
    }
}

struct RelayWorker {
    engine: EngineLink,
    counters: Arc<RelayCounters>,
    idle_timeout: Duration,
    streams: HashMap<String, TelephonyStreamContext>,
}

impl RelayWorker {
    #[instrument(name = "relay_worker", skip_all)]
    async fn run(mut self, mut jobs: mpsc::Receiver<TelephonyEvent>) {
        let period = (self.idle_timeout / 2).max(Duration::from_millis(100));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = sweep.tick() => self.prune_idle(Instant::now()).await,
            }
        }
        info!(streams = self.streams.len(), "Relay worker stopped.");
    }

    async fn handle(&mut self, event: TelephonyEvent) {
        let stream_id = event
            .stream_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_STREAM_ID.to_string());

        match event.event.as_str() {
            "media" => {
                let Some(media) = event.media.filter(|m| !m.payload.is_empty()) else {
                    debug!(%stream_id, "Media event without payload ignored.");
                    return;
                };
                let Some(context) = self.context_for(&stream_id) else {
                    self.counters.record_decode_error();
                    return;
                };
                if let Err(e) = context.relay_media(&media.payload, media.timestamp).await {
                    warn!(%stream_id, error = %e, "Malformed media payload dropped.");
                    self.counters.record_decode_error();
                }
            }
            "stop" => {
                if let Some(mut context) = self.streams.remove(&stream_id) {
                    context.finish().await;
                    info!(
                        stream_id = %context.stream_id,
                        frames_relayed = context.frames_relayed,
                        "Telephony stream stopped."
                    );
                }
                self.publish_active();
            }
            other => debug!(%stream_id, event = %other, "Ignoring telephony event."),
        }
    }

    fn context_for(&mut self, stream_id: &str) -> Option<&mut TelephonyStreamContext> {
        if !self.streams.contains_key(stream_id) {
            match TelephonyStreamContext::new(stream_id.to_string(), self.engine.clone()) {
                Ok(context) => {
                    info!(%stream_id, "Telephony stream started.");
                    self.streams.insert(stream_id.to_string(), context);
                    self.publish_active();
                }
                Err(e) => {
                    warn!(%stream_id, error = %e, "Could not create stream context.");
                    return None;
                }
            }
        }
        self.streams.get_mut(stream_id)
    }

    async fn prune_idle(&mut self, now: Instant) {
        let idle: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, context)| {
                now.saturating_duration_since(context.last_activity) >= self.idle_timeout
            })
            .map(|(stream_id, _)| stream_id.clone())
            .collect();
        if idle.is_empty() {
            return;
        }
        for stream_id in idle {
            if let Some(mut context) = self.streams.remove(&stream_id) {
                context.finish().await;
                info!(%stream_id, frames_relayed = context.frames_relayed, "Telephony stream idle; released.");
            }
        }
        self.publish_active();
    }

    fn publish_active(&self) {
        self.counters
            .active_streams
            .store(self.streams.len() as u64, Ordering::Relaxed);
    }
}
