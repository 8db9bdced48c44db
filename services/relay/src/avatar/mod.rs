//! Avatar Media Forwarder
//!
//! Takes synthesized audio deltas from the engine link and pushes the decoded
//! bytes into an avatar session. When no session can be created the forwarder
//! runs against a mock session: chunks are still decoded and accounted, and
//! the process keeps serving.

pub mod backend;

pub use backend::{AvatarBackend, AvatarError, AvatarSessionInfo, AvatarTransport, HeyGenBackend};

use crate::{
    engine::EngineMessage,
    models::{AvatarHealthResponse, AvatarStatsResponse},
    state::ForwarderState,
    telephony::now_millis,
};
use axum::{extract::State, response::Json};
use base64::Engine;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// The session the forwarder is currently feeding.
pub enum AvatarSession {
    Live {
        info: AvatarSessionInfo,
        transport: Arc<dyn AvatarTransport>,
    },
    Mock,
}

impl AvatarSession {
    fn is_connected(&self) -> bool {
        match self {
            AvatarSession::Live { transport, .. } => transport.is_connected(),
            AvatarSession::Mock => false,
        }
    }
}

#[derive(Debug, Default)]
struct ForwarderCounters {
    chunks: AtomicU64,
    bytes: AtomicU64,
}

pub struct AvatarForwarder {
    backend: Option<Arc<dyn AvatarBackend>>,
    voice_id: String,
    session: Mutex<Option<AvatarSession>>,
    counters: ForwarderCounters,
}

impl AvatarForwarder {
    /// `backend` is `None` when no API key is configured; the forwarder then
    /// always runs against a mock session.
    pub fn new(backend: Option<Arc<dyn AvatarBackend>>, voice_id: impl Into<String>) -> Self {
        Self {
            backend,
            voice_id: voice_id.into(),
            session: Mutex::new(None),
            counters: ForwarderCounters::default(),
        }
    }

    /// Creates the avatar session if none exists yet. Any failure degrades to
    /// a mock session; this never errors.
    #[instrument(skip(self), fields(voice_id = %self.voice_id))]
    pub async fn ensure_session(&self) {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.create_session().await);
        }
    }

    async fn create_session(&self) -> AvatarSession {
        let Some(backend) = self.backend.as_ref() else {
            warn!("No avatar API key configured; using mock session.");
            return AvatarSession::Mock;
        };
        match backend.create_session(&self.voice_id).await {
            Ok((info, transport)) => {
                info!(session_id = %info.session_id, "Avatar session ready.");
                AvatarSession::Live { info, transport }
            }
            Err(e) => {
                error!(error = %e, "Avatar session creation failed; using mock session.");
                AvatarSession::Mock
            }
        }
    }

    /// Decodes one base64 delta and forwards it, creating the session first
    /// if this is the first chunk.
    pub async fn forward(&self, delta: &str) {
        let chunk = match base64::engine::general_purpose::STANDARD.decode(delta) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "Undecodable audio delta skipped.");
                return;
            }
        };

        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.create_session().await);
        }

        let len = chunk.len() as u64;
        match session.as_ref() {
            Some(AvatarSession::Live { transport, info }) => {
                if let Err(e) = transport.send_audio(chunk).await {
                    warn!(session_id = %info.session_id, error = %e, "Avatar transport rejected a chunk.");
                }
            }
            _ => debug!(bytes = len, "Audio chunk (mock)"),
        }
        self.counters.chunks.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes.fetch_add(len, Ordering::Relaxed);
    }

    pub async fn is_avatar_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(AvatarSession::is_connected)
    }

    pub async fn stats(&self) -> AvatarStatsResponse {
        let session = self.session.lock().await;
        let (mock, session_id) = match session.as_ref() {
            Some(AvatarSession::Live { info, .. }) => (false, Some(info.session_id.clone())),
            Some(AvatarSession::Mock) => (true, None),
            None => (false, None),
        };
        AvatarStatsResponse {
            chunks: self.counters.chunks.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            mock,
            session_id,
        }
    }

    /// Spawns the single consumer loop. Deltas are forwarded one at a time in
    /// the order the engine sent them.
    pub fn spawn_consumer(self: Arc<Self>, mut rx: mpsc::Receiver<EngineMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                self.forward(&message.audio.delta).await;
            }
            debug!("Engine audio channel closed; forwarder loop finished.");
        })
    }

    /// Closes the session through the backend. Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let session = self.session.lock().await.take();
        if let Some(AvatarSession::Live { info, transport }) = session {
            transport.close().await;
            if let Some(backend) = self.backend.as_ref() {
                if let Err(e) = backend.close_session(&info.session_id).await {
                    warn!(session_id = %info.session_id, error = %e, "Avatar session stop failed.");
                }
            }
            info!(session_id = %info.session_id, "Avatar session closed.");
        }
    }
}

/// Forwarder health: engine and avatar connectivity reported independently.
#[utoipa::path(
    get,
    path = "/avatar/healthz",
    responses((status = 200, description = "Forwarder health", body = AvatarHealthResponse))
)]
pub async fn healthz(State(state): State<Arc<ForwarderState>>) -> Json<AvatarHealthResponse> {
    Json(AvatarHealthResponse {
        ok: true,
        ts: now_millis(),
        voice_agent_connected: state.engine.is_connected(),
        avatar_connected: state.forwarder.is_avatar_connected().await,
    })
}

/// Forwarding counters.
#[utoipa::path(
    get,
    path = "/avatar/stats",
    responses((status = 200, description = "Forwarder counters", body = AvatarStatsResponse))
)]
pub async fn stats(State(state): State<Arc<ForwarderState>>) -> Json<AvatarStatsResponse> {
    Json(state.forwarder.stats().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferPolicy;
    use crate::engine::test_support::serve_engine;
    use crate::engine::{EngineLink, LinkState};
    use crate::router::create_avatar_router;
    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingTransport {
        chunks: StdMutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl AvatarTransport for RecordingTransport {
        async fn send_audio(&self, chunk: Bytes) -> Result<(), AvatarError> {
            self.chunks.lock().unwrap().push(chunk);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    struct RecordingBackend {
        transport: Arc<RecordingTransport>,
        created: AtomicU64,
        closed: StdMutex<Vec<String>>,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                transport: Arc::new(RecordingTransport::default()),
                created: AtomicU64::new(0),
                closed: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AvatarBackend for RecordingBackend {
        async fn create_session(
            &self,
            _voice_id: &str,
        ) -> Result<(AvatarSessionInfo, Arc<dyn AvatarTransport>), AvatarError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let info = AvatarSessionInfo {
                session_id: "rec-1".to_string(),
                sdp: None,
                ice_servers: vec![],
            };
            let transport: Arc<dyn AvatarTransport> = self.transport.clone();
            Ok((info, transport))
        }

        async fn close_session(&self, session_id: &str) -> Result<(), AvatarError> {
            self.closed.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    async fn wait_connected(link: &EngineLink) {
        let mut rx = link.subscribe_state();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == LinkState::Connected))
            .await
            .expect("engine link never connected")
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_backend_runs_mock_session() {
        let forwarder = AvatarForwarder::new(None, "voice");
        forwarder.forward(&b64(&[1, 2, 3, 4])).await;
        forwarder.forward("***").await;

        let stats = forwarder.stats().await;
        assert_eq!(stats, AvatarStatsResponse {
            chunks: 1,
            bytes: 4,
            mock: true,
            session_id: None,
        });
        assert!(!forwarder.is_avatar_connected().await);
    }

    #[tokio::test]
    async fn test_session_is_created_lazily_once() {
        let backend = Arc::new(RecordingBackend::new());
        let forwarder = AvatarForwarder::new(Some(backend.clone()), "voice");
        assert!(!forwarder.is_avatar_connected().await);

        forwarder.forward(&b64(b"ab")).await;
        forwarder.forward(&b64(b"cd")).await;
        forwarder.ensure_session().await;

        assert_eq!(backend.created.load(Ordering::SeqCst), 1);
        assert!(forwarder.is_avatar_connected().await);
        let stats = forwarder.stats().await;
        assert_eq!(stats.session_id.as_deref(), Some("rec-1"));
        assert!(!stats.mock);

        forwarder.close().await;
        forwarder.close().await;
        assert_eq!(*backend.closed.lock().unwrap(), vec!["rec-1".to_string()]);
        assert!(!forwarder.is_avatar_connected().await);
    }

    #[tokio::test]
    async fn test_thousand_deltas_arrive_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_received, push) = serve_engine(listener).await;

        let backend = Arc::new(RecordingBackend::new());
        let forwarder = Arc::new(AvatarForwarder::new(Some(backend.clone()), "voice"));
        let (tx, rx) = mpsc::channel(64);
        let engine = EngineLink::spawn(
            format!("ws://{}", addr),
            Duration::from_millis(50),
            BufferPolicy::Drop,
            Some(tx),
        );
        let consumer = forwarder.clone().spawn_consumer(rx);
        wait_connected(&engine).await;

        const N: u32 = 1000;
        for i in 0..N {
            let message = EngineMessage::delta(b64(&i.to_le_bytes()));
            push.send(serde_json::to_string(&message).unwrap()).unwrap();
        }

        timeout(Duration::from_secs(10), async {
            while backend.transport.chunks.lock().unwrap().len() < N as usize {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("not every chunk reached the transport");

        let chunks = backend.transport.chunks.lock().unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.as_ref(), (i as u32).to_le_bytes(), "chunk {} out of order", i);
        }
        assert_eq!(forwarder.stats().await.bytes, u64::from(N) * 4);

        engine.shutdown().await;
        consumer.abort();
    }

    #[tokio::test]
    async fn test_unreachable_backend_reports_avatar_down_engine_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_received, _push) = serve_engine(listener).await;

        let backend = HeyGenBackend::new("key", "http://127.0.0.1:1/v1/streams").unwrap();
        let forwarder = Arc::new(AvatarForwarder::new(Some(Arc::new(backend)), "voice"));
        forwarder.ensure_session().await;

        let engine = EngineLink::spawn(
            format!("ws://{}", addr),
            Duration::from_millis(50),
            BufferPolicy::Drop,
            None,
        );
        wait_connected(&engine).await;

        let state = Arc::new(ForwarderState {
            engine: engine.clone(),
            forwarder: forwarder.clone(),
        });
        let response = create_avatar_router(state)
            .oneshot(Request::get("/avatar/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["voiceAgentConnected"], true);
        assert_eq!(value["avatarConnected"], false);

        assert!(forwarder.stats().await.mock);
        engine.shutdown().await;
    }
}
