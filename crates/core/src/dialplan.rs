//! Static Dialplan
//!
//! The dialplan maps operational roles and marketing campaigns to the
//! pipeline a call should run on. It is read once at startup from a single
//! JSON document and never reloaded; every lookup afterwards is a pure read.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Pipeline used when the document does not name a default of its own.
pub const BUILTIN_DEFAULT_PIPELINE: &str = "voice_only";

#[derive(Debug, thiserror::Error)]
pub enum DialplanError {
    /// The dialplan document could not be read or parsed. Fatal at startup.
    #[error("invalid dialplan configuration: {0}")]
    Configuration(String),
    #[error("role_not_found:{0}")]
    RoleNotFound(String),
    #[error("campaign_not_found:{0}")]
    CampaignNotFound(String),
}

/// A role entry, keyed by role id in [`DialplanConfig::roles`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
}

/// A campaign entry. The referenced role is only looked up at call time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub role_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
}

/// The persisted layout of the dialplan document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialplanConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pipeline: Option<String>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleEntry>,
    #[serde(default)]
    pub campaigns: BTreeMap<String, CampaignEntry>,
}

/// The outcome of resolving a role or campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub role_id: String,
    pub pipeline: String,
}

/// The read-only view exposed through `listRoutes`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Routes {
    pub roles: BTreeMap<String, RoleEntry>,
    pub campaigns: BTreeMap<String, CampaignEntry>,
    pub default_pipeline: String,
}

/// The role table handed to the conversation service on every call.
pub type RolesContext = Arc<BTreeMap<String, RoleEntry>>;

/// A loaded, immutable dialplan.
#[derive(Debug, Clone)]
pub struct Dialplan {
    default_pipeline: String,
    roles: RolesContext,
    campaigns: BTreeMap<String, CampaignEntry>,
}

/// Treats `None` and whitespace-only strings alike.
fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl Dialplan {
    pub fn new(config: DialplanConfig) -> Self {
        let default_pipeline = non_empty(config.default_pipeline.as_ref())
            .unwrap_or(BUILTIN_DEFAULT_PIPELINE)
            .to_string();
        Self {
            default_pipeline,
            roles: Arc::new(config.roles),
            campaigns: config.campaigns,
        }
    }

    /// Parses a dialplan from its JSON document.
    pub fn from_json(json: &str) -> Result<Self, DialplanError> {
        let config: DialplanConfig = serde_json::from_str(json)
            .map_err(|e| DialplanError::Configuration(e.to_string()))?;
        Ok(Self::new(config))
    }

    /// Reads and parses the dialplan document at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DialplanError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DialplanError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let dialplan = Self::from_json(&json)?;
        tracing::info!(
            path = %path.display(),
            roles = dialplan.roles.len(),
            campaigns = dialplan.campaigns.len(),
            default_pipeline = %dialplan.default_pipeline,
            "Dialplan loaded."
        );
        Ok(dialplan)
    }

    pub fn default_pipeline(&self) -> &str {
        &self.default_pipeline
    }

    pub fn roles_context(&self) -> RolesContext {
        Arc::clone(&self.roles)
    }

    /// Resolves a role: `role.pipeline → defaultPipeline`.
    pub fn resolve_role(&self, role_id: &str) -> Result<Resolution, DialplanError> {
        let role = self
            .roles
            .get(role_id)
            .ok_or_else(|| DialplanError::RoleNotFound(role_id.to_string()))?;
        let pipeline = non_empty(role.pipeline.as_ref()).unwrap_or(self.default_pipeline.as_str());
        Ok(Resolution {
            role_id: role_id.to_string(),
            pipeline: pipeline.to_string(),
        })
    }

    /// Resolves a campaign: `campaign.pipeline → role.pipeline → defaultPipeline`.
    ///
    /// The campaign's role must exist even when the campaign carries its own
    /// pipeline, since the call is started on behalf of that role.
    pub fn resolve_campaign(&self, campaign_id: &str) -> Result<Resolution, DialplanError> {
        let campaign = self
            .campaigns
            .get(campaign_id)
            .ok_or_else(|| DialplanError::CampaignNotFound(campaign_id.to_string()))?;
        let role = self
            .roles
            .get(&campaign.role_id)
            .ok_or_else(|| DialplanError::RoleNotFound(campaign.role_id.clone()))?;
        let pipeline = non_empty(campaign.pipeline.as_ref())
            .or_else(|| non_empty(role.pipeline.as_ref()))
            .unwrap_or(self.default_pipeline.as_str());
        Ok(Resolution {
            role_id: campaign.role_id.clone(),
            pipeline: pipeline.to_string(),
        })
    }

    pub fn routes(&self) -> Routes {
        Routes {
            roles: self.roles.as_ref().clone(),
            campaigns: self.campaigns.clone(),
            default_pipeline: self.default_pipeline.clone(),
        }
    }
}
