//! Telephony Media Router
//!
//! - `relay`: the worker that owns per-stream state and feeds the engine link.
//! - `stream`: the bidirectional `/audio` WebSocket for carriers that stream
//!   media over a socket instead of posting it.
//!
//! The HTTP handlers here only authenticate and enqueue. They answer `202`
//! regardless of engine health so the carrier keeps the call leg up.

pub mod relay;
pub mod stream;

pub use relay::TelephonyRelay;
pub use stream::audio_ws_handler;

use crate::{
    handlers::ApiError,
    models::{AcceptedResponse, ErrorResponse, HealthResponse, RelayStatsResponse, TelephonyEvent},
    state::RouterState,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use std::sync::Arc;
use tracing::warn;

/// `true` when no token is configured or a known auth header carries it.
fn is_authorized(headers: &HeaderMap, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return true;
    };
    headers
        .get("x-twilio-signature")
        .or_else(|| headers.get(axum::http::header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(token))
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Accept one carrier media-stream event.
#[utoipa::path(
    post,
    path = "/incoming",
    request_body = TelephonyEvent,
    responses(
        (status = 202, description = "Event accepted for relay", body = AcceptedResponse),
        (status = 401, description = "Missing or wrong carrier token", body = ErrorResponse)
    )
)]
pub async fn incoming(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    if !is_authorized(&headers, state.telephony_auth_token.as_deref()) {
        warn!("Unauthorized telephony webhook request.");
        return Err(ApiError::Unauthorized);
    }

    match serde_json::from_slice::<TelephonyEvent>(&body) {
        Ok(event) => {
            state.relay.submit(event);
        }
        Err(e) => {
            warn!(error = %e, "Malformed telephony event dropped.");
            state.relay.counters().record_decode_error();
        }
    }

    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })))
}

/// Liveness probe. Does not reflect engine connectivity.
#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Process is alive", body = HealthResponse))
)]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        ts: now_millis(),
    })
}

/// Relay counters.
#[utoipa::path(
    get,
    path = "/stats",
    responses((status = 200, description = "Relay counters", body = RelayStatsResponse))
)]
pub async fn stats(State(state): State<Arc<RouterState>>) -> Json<RelayStatsResponse> {
    Json(state.relay.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_utils::TELEPHONY_FRAME_SAMPLES;
    use crate::config::BufferPolicy;
    use crate::engine::test_support::{serve_engine, unused_addr};
    use crate::engine::{EngineLink, EngineMessage, LinkState};
    use crate::router::create_router;
    use axum::{
        Router,
        body::Body,
        http::{Request, header},
    };
    use base64::Engine;
    use callcenter_core::{CallCoordinator, Dialplan};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tower::ServiceExt;

    fn router_state(engine: EngineLink, token: Option<&str>) -> Arc<RouterState> {
        Arc::new(RouterState {
            coordinator: Arc::new(CallCoordinator::new(
                Arc::new(Dialplan::from_json("{}").unwrap()),
                None,
            )),
            relay: TelephonyRelay::spawn(engine, Duration::from_secs(30), 64),
            telephony_auth_token: token.map(str::to_string),
            engine_url: "ws://127.0.0.1:1".to_string(),
            reconnect_backoff: Duration::from_millis(50),
        })
    }

    fn frame_request(stream_id: &str, timestamp: u32) -> Request<Body> {
        media_request(stream_id, timestamp, &[0xFFu8; TELEPHONY_FRAME_SAMPLES])
    }

    fn media_request(stream_id: &str, timestamp: u32, mulaw: &[u8]) -> Request<Body> {
        let payload = base64::engine::general_purpose::STANDARD.encode(mulaw);
        let body = serde_json::json!({
            "event": "media",
            "streamId": stream_id,
            "media": { "payload": payload, "timestamp": timestamp.to_string() }
        });
        Request::builder()
            .method("POST")
            .uri("/incoming")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn post(app: &Router, request: Request<Body>) -> StatusCode {
        app.clone().oneshot(request).await.unwrap().status()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_is_authorized() {
        let mut headers = HeaderMap::new();
        assert!(is_authorized(&headers, None));
        assert!(!is_authorized(&headers, Some("secret")));

        headers.insert("x-twilio-signature", "abc-secret-xyz".parse().unwrap());
        assert!(is_authorized(&headers, Some("secret")));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(is_authorized(&headers, Some("secret")));
        assert!(!is_authorized(&headers, Some("other")));
    }

    #[tokio::test]
    async fn test_incoming_accepts_while_engine_is_down() {
        let addr = unused_addr().await;
        let engine = EngineLink::spawn(
            format!("ws://{}", addr),
            Duration::from_secs(60),
            BufferPolicy::Drop,
            None,
        );
        let state = router_state(engine.clone(), None);
        let app = create_router(state.clone());

        assert_eq!(post(&app, frame_request("S1", 1)).await, StatusCode::ACCEPTED);

        let malformed = Request::builder()
            .method("POST")
            .uri("/incoming")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        assert_eq!(post(&app, malformed).await, StatusCode::ACCEPTED);

        wait_until(|| state.relay.stats().dropped == 1).await;
        let stats = state.relay.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.relayed, 0);
        assert_eq!(stats.active_streams, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_incoming_requires_token_when_configured() {
        let addr = unused_addr().await;
        let engine = EngineLink::spawn(
            format!("ws://{}", addr),
            Duration::from_secs(60),
            BufferPolicy::Drop,
            None,
        );
        let app = create_router(router_state(engine.clone(), Some("tok")));

        let response = app.clone().oneshot(frame_request("S1", 1)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "Unauthorized");

        let mut request = frame_request("S1", 1);
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, "tok".parse().unwrap());
        assert_eq!(post(&app, request).await, StatusCode::ACCEPTED);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_healthz_and_stats() {
        let addr = unused_addr().await;
        let engine = EngineLink::spawn(
            format!("ws://{}", addr),
            Duration::from_secs(60),
            BufferPolicy::Drop,
            None,
        );
        let app = create_router(router_state(engine.clone(), None));

        let response = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["ok"], true);
        assert!(value["ts"].as_i64().unwrap() > 0);

        let response = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["accepted"], 0);
        assert!(value["engineState"].is_string());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_frames_sent_while_engine_down_are_dropped_not_replayed() {
        let addr = unused_addr().await;
        let engine = EngineLink::spawn(
            format!("ws://{}", addr),
            Duration::from_millis(50),
            BufferPolicy::Drop,
            None,
        );
        let state = router_state(engine.clone(), None);
        let app = create_router(state.clone());

        for ts in 1..=3 {
            assert_eq!(post(&app, frame_request("S1", ts)).await, StatusCode::ACCEPTED);
        }
        wait_until(|| state.relay.stats().dropped == 3).await;

        let listener = TcpListener::bind(addr).await.unwrap();
        let (mut received, _push) = serve_engine(listener).await;
        let mut link_state = engine.subscribe_state();
        timeout(
            Duration::from_secs(5),
            link_state.wait_for(|s| *s == LinkState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        for ts in 4..=5 {
            assert_eq!(post(&app, frame_request("S1", ts)).await, StatusCode::ACCEPTED);
        }

        let mut timestamps = Vec::new();
        for _ in 0..2 {
            let text = timeout(Duration::from_secs(5), received.recv())
                .await
                .unwrap()
                .unwrap();
            let msg: EngineMessage = serde_json::from_str(&text).unwrap();
            assert_eq!(msg.audio.sample_rate, Some(16000));
            assert_eq!(msg.audio.format.as_deref(), Some("pcm16"));
            timestamps.push(msg.audio.timestamp.unwrap());
        }
        assert_eq!(timestamps, vec![serde_json::json!("4"), serde_json::json!("5")]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(received.try_recv().is_err());

        let stats = state.relay.stats();
        assert_eq!(stats.relayed, 2);
        assert_eq!(stats.dropped, 3);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_short_frames_dropped_during_outage_leave_no_audio_behind() {
        let addr = unused_addr().await;
        let engine = EngineLink::spawn(
            format!("ws://{}", addr),
            Duration::from_millis(50),
            BufferPolicy::Drop,
            None,
        );
        let state = router_state(engine.clone(), None);
        let app = create_router(state.clone());

        // 10 ms frames at full scale; half a resampler chunk each.
        let loud = [0x80u8; TELEPHONY_FRAME_SAMPLES / 2];
        for ts in 1..=3 {
            assert_eq!(post(&app, media_request("S1", ts, &loud)).await, StatusCode::ACCEPTED);
        }
        wait_until(|| state.relay.stats().dropped == 3).await;

        let listener = TcpListener::bind(addr).await.unwrap();
        let (mut received, _push) = serve_engine(listener).await;
        let mut link_state = engine.subscribe_state();
        timeout(
            Duration::from_secs(5),
            link_state.wait_for(|s| *s == LinkState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        let silent = [0xFFu8; TELEPHONY_FRAME_SAMPLES / 2];
        for ts in 4..=5 {
            assert_eq!(post(&app, media_request("S1", ts, &silent)).await, StatusCode::ACCEPTED);
        }

        for expected in ["4", "5"] {
            let text = timeout(Duration::from_secs(5), received.recv())
                .await
                .unwrap()
                .unwrap();
            let msg: EngineMessage = serde_json::from_str(&text).unwrap();
            assert_eq!(msg.audio.timestamp, Some(serde_json::json!(expected)));
            let pcm = crate::audio_utils::decode_i16(&msg.audio.delta);
            assert_eq!(pcm.len(), TELEPHONY_FRAME_SAMPLES);
            assert!(
                pcm.iter().all(|&s| s == 0),
                "audio from a dropped frame was relayed under timestamp {}",
                expected
            );
        }
        engine.shutdown().await;
    }
}
