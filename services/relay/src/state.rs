//! Shared Application State
//!
//! One process-lifetime state object per service, created at startup and
//! passed to every handler behind an `Arc`. Connection handles live here and
//! nowhere else.

use crate::{avatar::AvatarForwarder, engine::EngineLink, telephony::TelephonyRelay};
use callcenter_core::CallCoordinator;
use std::sync::Arc;
use std::time::Duration;

/// State of the telephony router service.
pub struct RouterState {
    pub coordinator: Arc<CallCoordinator>,
    pub relay: TelephonyRelay,
    pub telephony_auth_token: Option<String>,
    /// Engine endpoint for per-socket links opened by `/audio`.
    pub engine_url: String,
    pub reconnect_backoff: Duration,
}

/// State of the avatar forwarder service.
pub struct ForwarderState {
    pub engine: EngineLink,
    pub forwarder: Arc<AvatarForwarder>,
}
