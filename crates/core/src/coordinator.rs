//! Call Session Coordinator
//!
//! Resolves the dialplan for an incoming call and hands the call over to the
//! conversation service. The coordinator keeps no per-session state: a
//! [`CallSession`] is returned to the caller and forgotten.

use crate::conversation::{ConversationService, StartCallRequest};
use crate::dialplan::{Dialplan, DialplanError, Resolution, Routes};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Reason reported by [`CallCoordinator::end`] when no service is wired in.
pub const SERVICE_UNAVAILABLE: &str = "service_unavailable";

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Routing(#[from] DialplanError),
    #[error("conversation service unavailable")]
    ServiceUnavailable,
    /// The service refused or failed the call; carries its own reason.
    #[error("{0}")]
    StartFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
}

/// A started call, as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub session_id: String,
    pub role_id: String,
    pub pipeline: String,
    pub state: SessionState,
}

/// Result of [`CallCoordinator::end`]; never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndOutcome {
    pub session_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct CallCoordinator {
    dialplan: Arc<Dialplan>,
    conversation: Option<Arc<dyn ConversationService>>,
}

impl CallCoordinator {
    /// Creates a coordinator. `conversation` may be absent, in which case
    /// starts fail with `ServiceUnavailable` and ends report `ok: false`.
    pub fn new(dialplan: Arc<Dialplan>, conversation: Option<Arc<dyn ConversationService>>) -> Self {
        Self {
            dialplan,
            conversation,
        }
    }

    pub fn list_routes(&self) -> Routes {
        self.dialplan.routes()
    }

    #[instrument(skip(self))]
    pub async fn start_by_role(
        &self,
        session_id: &str,
        role_id: &str,
    ) -> Result<CallSession, CoordinatorError> {
        let resolution = self.dialplan.resolve_role(role_id)?;
        self.start(session_id, resolution).await
    }

    #[instrument(skip(self))]
    pub async fn start_by_campaign(
        &self,
        session_id: &str,
        campaign_id: &str,
    ) -> Result<CallSession, CoordinatorError> {
        let resolution = self.dialplan.resolve_campaign(campaign_id)?;
        self.start(session_id, resolution).await
    }

    async fn start(
        &self,
        session_id: &str,
        resolution: Resolution,
    ) -> Result<CallSession, CoordinatorError> {
        let service = self
            .conversation
            .as_ref()
            .ok_or(CoordinatorError::ServiceUnavailable)?;

        let outcome = service
            .start_call(StartCallRequest {
                session_id: session_id.to_string(),
                role_id: resolution.role_id.clone(),
                pipeline: resolution.pipeline.clone(),
                roles_context: self.dialplan.roles_context(),
            })
            .await
            .map_err(|e| CoordinatorError::StartFailed(e.to_string()))?;

        if !outcome.success {
            let reason = outcome
                .error
                .unwrap_or_else(|| "start_call_failed".to_string());
            warn!(%reason, "Conversation service refused the call.");
            return Err(CoordinatorError::StartFailed(reason));
        }

        let session = CallSession {
            session_id: outcome.session_id.unwrap_or_else(|| session_id.to_string()),
            role_id: resolution.role_id,
            pipeline: resolution.pipeline,
            state: SessionState::Active,
        };
        info!(
            session_id = %session.session_id,
            role_id = %session.role_id,
            pipeline = %session.pipeline,
            "Call started."
        );
        Ok(session)
    }

    /// Ends a call. Never fails: telephony resources must be released even
    /// when the conversation service is gone.
    #[instrument(skip(self))]
    pub async fn end(&self, session_id: &str) -> EndOutcome {
        let Some(service) = self.conversation.as_ref() else {
            warn!("No conversation service; reporting end as not acknowledged.");
            return EndOutcome {
                session_id: session_id.to_string(),
                ok: false,
                reason: Some(SERVICE_UNAVAILABLE.to_string()),
            };
        };

        match service.end_call(session_id).await {
            Ok(()) => {
                info!("Call ended.");
                EndOutcome {
                    session_id: session_id.to_string(),
                    ok: true,
                    reason: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Conversation service failed to end the call.");
                EndOutcome {
                    session_id: session_id.to_string(),
                    ok: false,
                    reason: Some(e.to_string()),
                }
            }
        }
    }
}
