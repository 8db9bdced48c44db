//! Conversation Service Contract
//!
//! The conversation service runs the actual call (speech recognition, dialogue,
//! synthesis). This crate never implements it; it only describes the calls the
//! coordinator makes so that any backend can be injected at construction.

use crate::dialplan::RolesContext;
use anyhow::Result;
use async_trait::async_trait;

/// Everything the conversation service needs to start a call.
#[derive(Debug, Clone)]
pub struct StartCallRequest {
    pub session_id: String,
    pub role_id: String,
    pub pipeline: String,
    pub roles_context: RolesContext,
}

/// The service's answer to a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCallOutcome {
    pub success: bool,
    /// Session id assigned by the service, if it chose its own.
    pub session_id: Option<String>,
    pub error: Option<String>,
}

impl StartCallOutcome {
    pub fn started(session_id: Option<String>) -> Self {
        Self {
            success: true,
            session_id,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
        }
    }
}

/// The external conversation service the coordinator delegates to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Starts a call for the resolved role and pipeline.
    async fn start_call(&self, request: StartCallRequest) -> Result<StartCallOutcome>;

    /// Ends a call. Errors are reported, never retried by the caller.
    async fn end_call(&self, session_id: &str) -> Result<()>;
}
