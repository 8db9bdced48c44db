//! Axum Handlers for the Call-Center Orchestration API
//!
//! Thin wrappers over [`CallCoordinator`]. Every failure body has the shape
//! `{success: false, error}`; `utoipa` doc comments feed the OpenAPI document.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use callcenter_core::{CallCoordinator, CoordinatorError};
use std::sync::Arc;
use tracing::error;

use crate::{
    models::{
        CallEndedResponse, CallStartedResponse, EndCallPayload, ErrorResponse, RoutesResponse,
        StartByCampaignPayload, StartByRolePayload,
    },
    state::RouterState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unauthorized,
    ServiceUnavailable(String),
    BadGateway(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::ServiceUnavailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
            ApiError::BadGateway(message) => (StatusCode::BAD_GATEWAY, message),
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred.".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn coordinator_error(err: CoordinatorError) -> ApiError {
    match err {
        CoordinatorError::Routing(e) => ApiError::NotFound(e.to_string()),
        CoordinatorError::ServiceUnavailable => {
            ApiError::ServiceUnavailable("multimodal_service_unavailable".to_string())
        }
        CoordinatorError::StartFailed(reason) => ApiError::BadGateway(reason),
    }
}

/// Unwraps a JSON body, mapping any rejection to a 400.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(p)| p)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{} is required", name)))
}

fn coordinator(state: &RouterState) -> &CallCoordinator {
    state.coordinator.as_ref()
}

/// List the dialplan's roles and campaigns.
#[utoipa::path(
    get,
    path = "/callcenter/routes",
    responses(
        (status = 200, description = "Routing table", body = RoutesResponse),
        (status = 500, description = "Routing table could not be rendered", body = ErrorResponse)
    )
)]
pub async fn list_routes(
    State(state): State<Arc<RouterState>>,
) -> Result<Json<RoutesResponse>, ApiError> {
    Ok(Json(coordinator(&state).list_routes().try_into()?))
}

/// Start a call for an operational role.
#[utoipa::path(
    post,
    path = "/callcenter/start/role",
    request_body = StartByRolePayload,
    responses(
        (status = 200, description = "Call started", body = CallStartedResponse),
        (status = 400, description = "Missing parameters", body = ErrorResponse),
        (status = 404, description = "Unknown role", body = ErrorResponse),
        (status = 502, description = "Conversation service refused the call", body = ErrorResponse),
        (status = 503, description = "No conversation service configured", body = ErrorResponse)
    )
)]
pub async fn start_by_role(
    State(state): State<Arc<RouterState>>,
    payload: Result<Json<StartByRolePayload>, JsonRejection>,
) -> Result<Json<CallStartedResponse>, ApiError> {
    let payload = body(payload)?;
    let session_id = required(payload.session_id, "sessionId")?;
    let role_id = required(payload.role_id, "roleId")?;

    let session = coordinator(&state)
        .start_by_role(&session_id, &role_id)
        .await
        .map_err(coordinator_error)?;
    Ok(Json(session.into()))
}

/// Start a call for a campaign.
#[utoipa::path(
    post,
    path = "/callcenter/start/campaign",
    request_body = StartByCampaignPayload,
    responses(
        (status = 200, description = "Call started", body = CallStartedResponse),
        (status = 400, description = "Missing parameters", body = ErrorResponse),
        (status = 404, description = "Unknown campaign or role", body = ErrorResponse),
        (status = 502, description = "Conversation service refused the call", body = ErrorResponse),
        (status = 503, description = "No conversation service configured", body = ErrorResponse)
    )
)]
pub async fn start_by_campaign(
    State(state): State<Arc<RouterState>>,
    payload: Result<Json<StartByCampaignPayload>, JsonRejection>,
) -> Result<Json<CallStartedResponse>, ApiError> {
    let payload = body(payload)?;
    let session_id = required(payload.session_id, "sessionId")?;
    let campaign_id = required(payload.campaign_id, "campaignId")?;

    let session = coordinator(&state)
        .start_by_campaign(&session_id, &campaign_id)
        .await
        .map_err(coordinator_error)?;
    Ok(Json(session.into()))
}

/// End a call. Answers 200 even when the service did not acknowledge it.
#[utoipa::path(
    post,
    path = "/callcenter/end",
    request_body = EndCallPayload,
    responses(
        (status = 200, description = "End outcome", body = CallEndedResponse),
        (status = 400, description = "Missing parameters", body = ErrorResponse)
    )
)]
pub async fn end_call(
    State(state): State<Arc<RouterState>>,
    payload: Result<Json<EndCallPayload>, JsonRejection>,
) -> Result<Json<CallEndedResponse>, ApiError> {
    let payload = body(payload)?;
    let session_id = required(payload.session_id, "sessionId")?;
    Ok(Json(coordinator(&state).end(&session_id).await.into()))
}
