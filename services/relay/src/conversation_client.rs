//! HTTP client for the external conversation service.
//!
//! `POST {base}/start_call` with `{sessionId, roleId, pipeline, rolesContext}`
//! answers `{success, sessionId?, error?}`; `POST {base}/end_call` with
//! `{sessionId}` answers any 2xx on success.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use callcenter_core::dialplan::RoleEntry;
use callcenter_core::{ConversationService, StartCallOutcome, StartCallRequest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartCallBody<'a> {
    session_id: &'a str,
    role_id: &'a str,
    pipeline: &'a str,
    roles_context: &'a BTreeMap<String, RoleEntry>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StartCallReply {
    success: bool,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EndCallBody<'a> {
    session_id: &'a str,
}

pub struct HttpConversationService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConversationService {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build conversation service HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ConversationService for HttpConversationService {
    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    async fn start_call(&self, request: StartCallRequest) -> Result<StartCallOutcome> {
        let body = StartCallBody {
            session_id: &request.session_id,
            role_id: &request.role_id,
            pipeline: &request.pipeline,
            roles_context: &request.roles_context,
        };
        let response = self
            .client
            .post(format!("{}/start_call", self.base_url))
            .json(&body)
            .send()
            .await
            .context("conversation service unreachable")?;

        let status = response.status();
        let reply = response
            .json::<StartCallReply>()
            .await
            .with_context(|| format!("unexpected start_call reply ({})", status))?;
        debug!(%status, success = reply.success, "start_call answered.");

        Ok(StartCallOutcome {
            success: reply.success && status.is_success(),
            session_id: reply.session_id.filter(|id| !id.is_empty()),
            error: reply.error,
        })
    }

    #[instrument(skip(self))]
    async fn end_call(&self, session_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/end_call", self.base_url))
            .json(&EndCallBody { session_id })
            .send()
            .await
            .context("conversation service unreachable")?;
        if !response.status().is_success() {
            bail!("end_call failed with status {}", response.status());
        }
        Ok(())
    }
}
