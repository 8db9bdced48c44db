//! Axum Router Configuration
//!
//! Routing for both HTTP services: the telephony router (media ingress,
//! `/audio` socket, call-center orchestration, OpenAPI docs) and the avatar
//! forwarder's health surface.

use crate::{
    avatar, handlers,
    models::{
        AcceptedResponse, AvatarHealthResponse, AvatarStatsResponse, CallEndedResponse,
        CallStartedResponse, EndCallPayload, ErrorResponse, HealthResponse, MediaPayload,
        RelayStatsResponse, RoutesResponse, StartByCampaignPayload, StartByRolePayload,
        TelephonyEvent,
    },
    state::{ForwarderState, RouterState},
    telephony,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        telephony::incoming,
        telephony::healthz,
        telephony::stats,
        handlers::list_routes,
        handlers::start_by_role,
        handlers::start_by_campaign,
        handlers::end_call,
    ),
    components(
        schemas(
            TelephonyEvent, MediaPayload, AcceptedResponse, HealthResponse, RelayStatsResponse,
            RoutesResponse, StartByRolePayload, StartByCampaignPayload, EndCallPayload,
            CallStartedResponse, CallEndedResponse, ErrorResponse
        )
    ),
    tags(
        (name = "Call Center Relay", description = "Telephony media ingress and call orchestration")
    )
)]
pub struct ApiDoc;

#[derive(OpenApi)]
#[openapi(
    paths(avatar::healthz, avatar::stats),
    components(schemas(AvatarHealthResponse, AvatarStatsResponse)),
    tags(
        (name = "Avatar Forwarder", description = "Engine audio to avatar session forwarding")
    )
)]
pub struct AvatarApiDoc;

/// Creates the telephony router service.
pub fn create_router(app_state: Arc<RouterState>) -> Router {
    let api_router = Router::new()
        .route("/incoming", post(telephony::incoming))
        .route("/healthz", get(telephony::healthz))
        .route("/stats", get(telephony::stats))
        .route("/audio", get(telephony::audio_ws_handler))
        .route("/callcenter/routes", get(handlers::list_routes))
        .route("/callcenter/start/role", post(handlers::start_by_role))
        .route("/callcenter/start/campaign", post(handlers::start_by_campaign))
        .route("/callcenter/end", post(handlers::end_call))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

/// Creates the avatar forwarder service.
pub fn create_avatar_router(state: Arc<ForwarderState>) -> Router {
    Router::new()
        .route("/avatar/healthz", get(avatar::healthz))
        .route("/avatar/stats", get(avatar::stats))
        .with_state(state)
}
