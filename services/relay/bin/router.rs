//! Main Entrypoint for the Telephony Router Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the dialplan and wiring the conversation service, if any.
//! 3. Starting the engine link and the relay worker.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use callcenter_core::{CallCoordinator, ConversationService, Dialplan};
use callcenter_relay::{
    config::Config, conversation_client::HttpConversationService, engine::EngineLink,
    router::create_router, state::RouterState, telephony::TelephonyRelay,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Depth of the queue between the HTTP handlers and the relay worker.
const RELAY_QUEUE_CAPACITY: usize = 1024;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing router state...");

    // --- 3. Dialplan and Conversation Service ---
    let dialplan = Dialplan::from_path(&config.dialplan_path).with_context(|| {
        format!(
            "Failed to load dialplan from {}",
            config.dialplan_path.display()
        )
    })?;
    let conversation: Option<Arc<dyn ConversationService>> =
        match &config.conversation_service_url {
            Some(url) => {
                info!(%url, "Using HTTP conversation service.");
                Some(Arc::new(HttpConversationService::new(url.clone())?))
            }
            None => {
                warn!("CONVERSATION_SERVICE_URL not set; call starts will be refused.");
                None
            }
        };
    let coordinator = Arc::new(CallCoordinator::new(Arc::new(dialplan), conversation));

    // --- 4. Engine Link and Relay Worker ---
    let engine = EngineLink::spawn(
        config.voice_agent_ws.clone(),
        config.reconnect_backoff,
        config.buffer_policy,
        None,
    );
    let relay = TelephonyRelay::spawn(
        engine.clone(),
        config.stream_idle_timeout,
        RELAY_QUEUE_CAPACITY,
    );

    let app_state = Arc::new(RouterState {
        coordinator,
        relay,
        telephony_auth_token: config.telephony_auth_token.clone(),
        engine_url: config.voice_agent_ws.clone(),
        reconnect_backoff: config.reconnect_backoff,
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        engine = %config.voice_agent_ws,
        buffer_policy = ?config.buffer_policy,
        auth = config.telephony_auth_token.is_some(),
        bind_address = %config.bind_address,
        "Router configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    engine.shutdown().await;
    info!("Server has shut down.");
    Ok(())
}
