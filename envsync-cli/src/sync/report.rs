//! Run report and change descriptions
//!
//! The report is the single human-facing artifact of a run: counts of
//! components created/updated/skipped, accumulated failures and the merge
//! message. Change descriptions attach the merge message, direction tag
//! and run id to every write.

use crate::api::ConfigUrl;

use super::direction::SyncDirection;

/// What failed for one component, without aborting the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Read/diff/write of the component's configuration failed
    Component,
    /// Best-effort state transfer failed after a successful body sync
    StateTransfer,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::StateTransfer => "state transfer",
        }
    }
}

/// One recovered per-component failure
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub url: ConfigUrl,
    pub kind: FailureKind,
    pub message: String,
}

/// Builds change descriptions in the platform's audit-log format
#[derive(Debug, Clone)]
pub struct ChangeDescriber {
    merge_message: String,
    direction: SyncDirection,
    run_id: String,
}

impl ChangeDescriber {
    pub fn new(
        merge_message: impl Into<String>,
        direction: SyncDirection,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            merge_message: merge_message.into(),
            direction,
            run_id: run_id.into(),
        }
    }

    pub fn describe(&self, custom: &str) -> String {
        format!(
            "{} - {}: {}, runID:{}",
            self.merge_message,
            self.direction.tag(),
            custom,
            self.run_id
        )
    }
}

/// Structured result of one sync run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub direction: SyncDirection,
    pub run_id: String,
    pub merge_message: String,
    pub components_created: Vec<ConfigUrl>,
    pub components_updated: Vec<ConfigUrl>,
    pub components_skipped: Vec<String>,
    /// Target-side objects the engine refuses to delete automatically
    pub flagged_for_review: Vec<String>,
    pub failures: Vec<SyncFailure>,
    /// Per-component change descriptions, aggregated
    pub change_log: Vec<String>,
}

impl RunReport {
    pub fn new(
        direction: SyncDirection,
        merge_message: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            run_id: run_id.into(),
            merge_message: merge_message.into(),
            components_created: Vec::new(),
            components_updated: Vec::new(),
            components_skipped: Vec::new(),
            flagged_for_review: Vec::new(),
            failures: Vec::new(),
            change_log: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Final merge message: configured prefix plus generated summary
    pub fn merge_summary(&self) -> String {
        format!(
            "{} - {}: {} updated, {} created, runID:{}",
            self.merge_message,
            self.direction.tag(),
            self.components_updated.len(),
            self.components_created.len(),
            self.run_id
        )
    }

    /// Multi-line rendering for CLI/log display
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Sync run {} ({})\n", self.run_id, self.direction.as_str()));
        out.push_str(&format!(
            "  created: {}, updated: {}, skipped: {}, failures: {}\n",
            self.components_created.len(),
            self.components_updated.len(),
            self.components_skipped.len(),
            self.failures.len()
        ));
        for url in &self.components_created {
            out.push_str(&format!("  created {}\n", url));
        }
        for url in &self.components_updated {
            out.push_str(&format!("  updated {}\n", url));
        }
        for component_id in &self.components_skipped {
            out.push_str(&format!("  skipped {}\n", component_id));
        }
        for flagged in &self.flagged_for_review {
            out.push_str(&format!("  review needed: {}\n", flagged));
        }
        for failure in &self.failures {
            out.push_str(&format!(
                "  {} failed ({}): {}\n",
                failure.url,
                failure.kind.as_str(),
                failure.message
            ));
        }
        out.push_str(&self.merge_summary());
        out
    }
}
