//! Skip filter: components excluded from sync entirely
//!
//! Skipped components are never read from the target and never written;
//! they only appear in the run report under `components_skipped`.

use std::collections::HashSet;

/// Membership set parsed from the comma-separated `skipped_components`
/// setting
#[derive(Debug, Clone, Default)]
pub struct SkipSet {
    ids: HashSet<String>,
}

impl SkipSet {
    /// Parse the comma-separated skip list. Empty and whitespace-only
    /// entries are dropped silently; matching is exact and case-sensitive.
    pub fn parse(raw: &str) -> Self {
        let ids = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { ids }
    }

    pub fn is_skipped(&self, component_id: &str) -> bool {
        self.ids.contains(component_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
