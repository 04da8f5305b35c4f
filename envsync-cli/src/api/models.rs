//! Core data model for project configuration inventories

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Platform region, selecting the management API stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "US")]
    Us,
    #[serde(rename = "EU")]
    Eu,
    #[serde(rename = "AZURE-EU")]
    AzureEu,
}

impl Region {
    /// Hostname suffix of the region's connection stack
    pub fn host_suffix(&self) -> &'static str {
        match self {
            Self::Us => ".keboola.com",
            Self::Eu => ".eu-central-1.keboola.com",
            Self::AzureEu => ".north-europe.azure.keboola.com",
        }
    }

    /// Base URL of the Storage management API for this region
    pub fn connection_url(&self) -> String {
        format!("https://connection{}", self.host_suffix())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Us => "US",
            Self::Eu => "EU",
            Self::AzureEu => "AZURE-EU",
        }
    }
}

/// One side (source or target) of a sync run
///
/// Immutable once built; the direction decides which of the two refs is
/// written. In branch mode the dev side carries `branch_id` and all
/// configuration endpoints are routed through the branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRef {
    pub id: String,
    pub token: String,
    pub region: Region,
    pub branch_id: Option<String>,
}

impl ProjectRef {
    pub fn new(id: impl Into<String>, token: impl Into<String>, region: Region) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            region,
            branch_id: None,
        }
    }

    pub fn is_branch(&self) -> bool {
        self.branch_id.is_some()
    }

    /// Stable cache key for per-project state (token cache, sync markers)
    pub fn cache_key(&self) -> String {
        match &self.branch_id {
            Some(branch) => format!("{}-{}-branch-{}", self.region.as_str(), self.id, branch),
            None => format!("{}-{}", self.region.as_str(), self.id),
        }
    }
}

/// Cross-project-stable reference to one configuration, or one row of it
///
/// Numeric object ids differ between projects, so identity is carried by
/// the component id plus the configuration's external id (the id the
/// engine itself assigns when creating counterparts), never by a raw
/// target-side id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigUrl {
    pub component_id: String,
    pub configuration_id: String,
    pub row_id: Option<String>,
}

impl ConfigUrl {
    pub fn new(component_id: impl Into<String>, configuration_id: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            configuration_id: configuration_id.into(),
            row_id: None,
        }
    }

    pub fn with_row(mut self, row_id: impl Into<String>) -> Self {
        self.row_id = Some(row_id.into());
        self
    }

    /// Reference to the whole configuration, dropping any row part
    pub fn configuration(&self) -> Self {
        Self {
            component_id: self.component_id.clone(),
            configuration_id: self.configuration_id.clone(),
            row_id: None,
        }
    }
}

impl Default for ConfigUrl {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl std::fmt::Display for ConfigUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.component_id, self.configuration_id)?;
        if let Some(row) = &self.row_id {
            write!(f, "/rows/{}", row)?;
        }
        Ok(())
    }
}

/// A component together with its configurations, as returned by the
/// component listing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    #[serde(default)]
    pub configurations: Vec<ComponentConfig>,
}

/// One synced unit: a single configuration of a component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Owning component id (e.g. "keboola.ex-aws-s3"). Not part of the
    /// configuration payload itself, filled in when listing.
    #[serde(default)]
    pub component_id: String,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Orchestration-style active flag. Absent for most component types.
    #[serde(default, rename = "isActive", skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    /// Structured configuration body
    #[serde(default)]
    pub configuration: Value,
    /// Execution state, only read/written when state transfer is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default)]
    pub rows: Vec<ConfigRow>,
}

impl ComponentConfig {
    /// Ordered row ids, preserving the platform's row ordering
    pub fn row_ids(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.id.as_str()).collect()
    }

    pub fn row(&self, row_id: &str) -> Option<&ConfigRow> {
        self.rows.iter().find(|r| r.id == row_id)
    }
}

/// One row of a row-based configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "isDisabled")]
    pub is_disabled: bool,
    #[serde(default)]
    pub configuration: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

/// A development branch of a production project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRef {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "isDefault")]
    pub is_default: bool,
}
