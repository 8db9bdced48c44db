//! Main Entrypoint for the Avatar Forwarder Service
//!
//! Opens the engine link, creates the avatar session (or falls back to a mock
//! one), forwards engine audio in order, and serves the health surface. On
//! shutdown the avatar session is stopped and the engine link closed.

use anyhow::Context;
use callcenter_relay::{
    avatar::{AvatarBackend, AvatarForwarder, HeyGenBackend},
    config::Config,
    engine::EngineLink,
    router::create_avatar_router,
    state::ForwarderState,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Engine audio buffered between the link and the forwarding loop.
const FORWARD_QUEUE_CAPACITY: usize = 256;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Starting avatar forwarder...");

    let (audio_tx, audio_rx) = mpsc::channel(FORWARD_QUEUE_CAPACITY);
    let engine = EngineLink::spawn(
        config.voice_agent_ws.clone(),
        config.reconnect_backoff,
        config.buffer_policy,
        Some(audio_tx),
    );

    let backend: Option<Arc<dyn AvatarBackend>> = match &config.heygen_api_key {
        Some(key) => Some(Arc::new(
            HeyGenBackend::new(key.clone(), config.heygen_stream_api_url.clone())
                .context("Failed to build avatar backend client")?,
        )),
        None => None,
    };
    let forwarder = Arc::new(AvatarForwarder::new(backend, config.heygen_voice_id.clone()));
    forwarder.ensure_session().await;
    let consumer = forwarder.clone().spawn_consumer(audio_rx);

    let state = Arc::new(ForwarderState {
        engine: engine.clone(),
        forwarder: forwarder.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = create_avatar_router(state).layer(cors);

    info!(
        engine = %config.voice_agent_ws,
        bind_address = %config.avatar_bind_address,
        "Forwarder configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.avatar_bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    engine.shutdown().await;
    consumer.abort();
    forwarder.close().await;
    info!("Forwarder has shut down.");
    Ok(())
}
