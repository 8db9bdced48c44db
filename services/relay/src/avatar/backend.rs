//! Avatar rendering backend boundary.
//!
//! The forwarder only needs two things from a backend: a way to open a
//! session for a voice profile, and a transport to push audio into it.
//! [`HeyGenBackend`] speaks the streaming REST API; the media track it hands
//! back is fed by the SDP/ICE material returned with the session.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum AvatarError {
    #[error("avatar backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("avatar backend rejected the request: {0}")]
    Rejected(String),
    #[error("avatar transport is closed")]
    TransportClosed,
}

/// What the backend returned when the session was created.
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarSessionInfo {
    pub session_id: String,
    pub sdp: Option<serde_json::Value>,
    pub ice_servers: Vec<serde_json::Value>,
}

/// Carries raw audio into a live avatar session.
#[async_trait]
pub trait AvatarTransport: Send + Sync {
    async fn send_audio(&self, chunk: Bytes) -> Result<(), AvatarError>;
    fn is_connected(&self) -> bool;
    async fn close(&self);
}

#[async_trait]
pub trait AvatarBackend: Send + Sync {
    async fn create_session(
        &self,
        voice_id: &str,
    ) -> Result<(AvatarSessionInfo, Arc<dyn AvatarTransport>), AvatarError>;

    async fn close_session(&self, session_id: &str) -> Result<(), AvatarError>;
}

#[derive(Deserialize, Debug, Default)]
struct SessionBody {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    sdp: Option<serde_json::Value>,
    #[serde(default)]
    ice_servers: Option<Vec<serde_json::Value>>,
}

/// The create-session response, either flat or wrapped in `data`.
#[derive(Deserialize, Debug)]
struct SessionEnvelope {
    #[serde(default)]
    data: Option<SessionBody>,
    #[serde(flatten)]
    flat: SessionBody,
}

impl SessionEnvelope {
    fn into_info(self) -> Result<AvatarSessionInfo, AvatarError> {
        let body = match self.data {
            Some(data) if data.session_id.is_some() => data,
            _ => self.flat,
        };
        let session_id = body
            .session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AvatarError::Rejected("response carried no session_id".to_string()))?;
        Ok(AvatarSessionInfo {
            session_id,
            sdp: body.sdp,
            ice_servers: body.ice_servers.unwrap_or_default(),
        })
    }
}

/// Audio track of a negotiated session.
pub struct SessionTrack {
    session_id: String,
    open: AtomicBool,
    bytes_sent: AtomicU64,
}

impl SessionTrack {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            open: AtomicBool::new(true),
            bytes_sent: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl AvatarTransport for SessionTrack {
    async fn send_audio(&self, chunk: Bytes) -> Result<(), AvatarError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(AvatarError::TransportClosed);
        }
        let total = self.bytes_sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        trace!(session_id = %self.session_id, bytes = chunk.len(), total, "Audio chunk → avatar");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// HeyGen streaming API client.
pub struct HeyGenBackend {
    client: reqwest::Client,
    api_key: String,
    stream_api_url: String,
}

impl HeyGenBackend {
    pub fn new(api_key: impl Into<String>, stream_api_url: impl Into<String>) -> Result<Self, AvatarError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            stream_api_url: stream_api_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AvatarBackend for HeyGenBackend {
    #[instrument(skip(self), fields(url = %self.stream_api_url))]
    async fn create_session(
        &self,
        voice_id: &str,
    ) -> Result<(AvatarSessionInfo, Arc<dyn AvatarTransport>), AvatarError> {
        let response = self
            .client
            .post(&self.stream_api_url)
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({ "voice": voice_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Avatar backend refused session creation.");
            return Err(AvatarError::Rejected(format!("{}: {}", status, body)));
        }

        let info = response.json::<SessionEnvelope>().await?.into_info()?;
        info!(
            session_id = %info.session_id,
            ice_servers = info.ice_servers.len(),
            has_sdp = info.sdp.is_some(),
            "Avatar stream session created."
        );
        let track: Arc<dyn AvatarTransport> = Arc::new(SessionTrack::new(info.session_id.clone()));
        Ok((info, track))
    }

    #[instrument(skip(self))]
    async fn close_session(&self, session_id: &str) -> Result<(), AvatarError> {
        let response = self
            .client
            .post(format!("{}/stop", self.stream_api_url))
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({ "session_id": session_id }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AvatarError::Rejected(response.status().to_string()));
        }
        debug!("Avatar session stopped.");
        Ok(())
    }
}
