//! API Models
//!
//! Request and response bodies for the relay's HTTP surfaces. Everything here
//! derives `ToSchema` so that `utoipa` can publish it in the OpenAPI document.

use callcenter_core::{CallSession, EndOutcome, Routes};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One carrier media-stream event, as posted to `/incoming` or sent on `/audio`.
#[derive(Deserialize, ToSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TelephonyEvent {
    #[schema(example = "media")]
    pub event: String,
    #[serde(default, alias = "streamSid")]
    #[schema(example = "S1")]
    pub stream_id: Option<String>,
    #[serde(default)]
    pub media: Option<MediaPayload>,
}

#[derive(Deserialize, ToSchema, Debug, Clone)]
pub struct MediaPayload {
    /// Base64 G.711 μ-law at 8 kHz.
    pub payload: String,
    /// Carrier timestamp, passed through untouched.
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "1200")]
    pub timestamp: Option<serde_json::Value>,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct AcceptedResponse {
    pub accepted: bool,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct HealthResponse {
    pub ok: bool,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
}

#[derive(Serialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AvatarHealthResponse {
    pub ok: bool,
    pub ts: i64,
    pub voice_agent_connected: bool,
    pub avatar_connected: bool,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatsResponse {
    pub accepted: u64,
    pub relayed: u64,
    pub dropped: u64,
    pub decode_errors: u64,
    pub active_streams: u64,
    #[schema(example = "connected")]
    pub engine_state: String,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvatarStatsResponse {
    pub chunks: u64,
    pub bytes: u64,
    pub mock: bool,
    pub session_id: Option<String>,
}

#[derive(Deserialize, ToSchema, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartByRolePayload {
    #[schema(example = "call-123")]
    pub session_id: Option<String>,
    #[schema(example = "sales")]
    pub role_id: Option<String>,
}

#[derive(Deserialize, ToSchema, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartByCampaignPayload {
    #[schema(example = "call-123")]
    pub session_id: Option<String>,
    #[schema(example = "promo")]
    pub campaign_id: Option<String>,
}

#[derive(Deserialize, ToSchema, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct EndCallPayload {
    #[schema(example = "call-123")]
    pub session_id: Option<String>,
}

#[derive(Serialize, ToSchema, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallStartedResponse {
    pub success: bool,
    pub session_id: String,
    pub role_id: String,
    #[schema(example = "avatar_sora")]
    pub pipeline: String,
}

impl From<CallSession> for CallStartedResponse {
    fn from(session: CallSession) -> Self {
        Self {
            success: true,
            session_id: session.session_id,
            role_id: session.role_id,
            pipeline: session.pipeline,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallEndedResponse {
    pub session_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "service_unavailable")]
    pub reason: Option<String>,
}

impl From<EndOutcome> for CallEndedResponse {
    fn from(outcome: EndOutcome) -> Self {
        Self {
            session_id: outcome.session_id,
            ok: outcome.ok,
            reason: outcome.reason,
        }
    }
}

/// The dialplan's routing table.
#[derive(Serialize, ToSchema, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RoutesResponse {
    #[schema(value_type = Object)]
    pub roles: serde_json::Value,
    #[schema(value_type = Object)]
    pub campaigns: serde_json::Value,
    pub default_pipeline: String,
}

impl TryFrom<Routes> for RoutesResponse {
    type Error = serde_json::Error;

    fn try_from(routes: Routes) -> Result<Self, Self::Error> {
        Ok(Self {
            roles: serde_json::to_value(routes.roles)?,
            campaigns: serde_json::to_value(routes.campaigns)?,
            default_pipeline: routes.default_pipeline,
        })
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}
