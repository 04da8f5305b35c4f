//! Resolved settings intake
//!
//! The engine receives a fully-resolved settings object; form rendering
//! and variable substitution happen upstream. This module only
//! deserializes and validates it. Validation failures are configuration
//! errors raised before any network call.

use std::path::Path;

use serde::Deserialize;

use crate::api::{Region, RunError};

/// Component id of the sync application itself. Syncing it into the
/// target would make the target sync back, so it is always skipped.
pub const SELF_COMPONENT_ID: &str = "kds-team.app-dev-prod-sync";

/// Component types excluded from sync unless the skip list is overridden:
/// sandboxes are per-user scratch space and the sync app itself is
/// self-referential.
pub fn default_skipped_components() -> String {
    format!("keboola.sandboxes,{}", SELF_COMPONENT_ID)
}

fn default_true() -> bool {
    true
}

/// Fully-resolved settings handed to the engine at start-up
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub prod_id: String,
    pub dev_id: String,
    #[serde(default)]
    pub branch_mode: bool,
    #[serde(default)]
    pub master_tokens: Option<MasterTokens>,
    #[serde(default)]
    pub configuration_override: Vec<OverrideEntry>,
    #[serde(default = "default_skipped_components")]
    pub skipped_components: String,
    #[serde(default = "default_true")]
    pub ignore_inactive_orchestration_updates: bool,
    #[serde(default)]
    pub transfer_states: bool,
    #[serde(rename = "#api_token")]
    pub api_token: String,
    pub region: Region,
    pub mode: String,
    #[serde(default)]
    pub merge_message: String,
}

/// Elevated credentials used only in branch mode
#[derive(Debug, Clone, Deserialize)]
pub struct MasterTokens {
    #[serde(rename = "#prod_token")]
    pub prod_token: String,
    #[serde(rename = "#dev_token")]
    pub dev_token: String,
}

/// One raw `configuration_override` entry, parsed further by the override
/// resolver
#[derive(Debug, Clone, Deserialize)]
pub struct OverrideEntry {
    /// Diagnostic label only, never used for matching
    #[serde(default)]
    pub name: Option<String>,
    pub config_url: String,
    /// Comma-separated dotted property paths
    #[serde(default)]
    pub ignored_properties: String,
}

impl Settings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, RunError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RunError::Configuration(format!("cannot read settings file {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, RunError> {
        let settings: Settings = serde_json::from_str(raw)
            .map_err(|e| RunError::Configuration(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), RunError> {
        for (key, value) in [
            ("prod_id", &self.prod_id),
            ("dev_id", &self.dev_id),
            ("#api_token", &self.api_token),
            ("mode", &self.mode),
        ] {
            if value.trim().is_empty() {
                return Err(RunError::Configuration(format!(
                    "mandatory setting '{}' is empty",
                    key
                )));
            }
        }

        // Variable substitution happens before the engine runs; a leftover
        // placeholder means the upstream layer did not resolve it
        if self.mode.contains("{{") {
            return Err(RunError::Configuration(format!(
                "mode '{}' contains an unresolved variable placeholder",
                self.mode
            )));
        }

        if self.branch_mode && self.master_tokens.is_none() {
            return Err(RunError::Configuration(
                "branch_mode requires master_tokens (#prod_token, #dev_token)".to_string(),
            ));
        }

        Ok(())
    }
}
