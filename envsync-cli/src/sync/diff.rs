//! Diff engine
//!
//! Computes the structural delta between a source and a target
//! configuration believed to represent the same logical unit:
//! - recursive walk over the configuration body trees
//! - ignored property paths excluded in both directions
//! - secret fields (`#`-prefixed keys) compared by presence only
//! - rows matched by their stable row id
//!
//! Property removals (paths present only in target) are recorded but
//! never applied; only row removals are mirrored, because rows are an
//! array the engine owns. Delta entries come out in lexical
//! property-path order so runs are reproducible.

use serde_json::{Map, Value};

use crate::api::{ComponentConfig, ConfigRow, ConfigUrl};

use super::overrides::{IgnoreSet, OverrideMap};

/// One property-level difference
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    /// Dotted path inside the configuration body
    pub path: String,
    /// Target-side value, absent for additions
    pub old: Option<Value>,
    /// Source-side value to write
    pub new: Value,
}

/// One row-level difference
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    /// Row exists only in source; created in target
    Added(ConfigRow),
    /// Row exists only in target; deleted from target
    Removed { row_id: String },
    /// Row exists on both sides with differing bodies
    Updated {
        row_id: String,
        changes: Vec<PropertyChange>,
    },
}

impl RowChange {
    pub fn row_id(&self) -> &str {
        match self {
            Self::Added(row) => &row.id,
            Self::Removed { row_id } => row_id,
            Self::Updated { row_id, .. } => row_id,
        }
    }
}

/// Minimal set of changes aligning target with source for one
/// configuration. Produced fresh per component per run and consumed
/// immediately by the apply step.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub url: ConfigUrl,
    /// Additions and updates, lexically ordered by path
    pub changes: Vec<PropertyChange>,
    /// Paths present only in target. Reported for review, never deleted.
    pub removals: Vec<String>,
    pub rows: Vec<RowChange>,
    /// Active flag to write, set by the state reconciler
    pub active_flag: Option<bool>,
}

impl Delta {
    /// Whether applying this delta would write anything
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.rows.is_empty() && self.active_flag.is_none()
    }
}

/// Diff two configurations matched by `url`
pub fn diff_configs(
    url: &ConfigUrl,
    source: &ComponentConfig,
    target: &ComponentConfig,
    overrides: &OverrideMap,
) -> Delta {
    let ignored = overrides.ignored_for(&url.configuration());
    let (changes, mut removals) =
        diff_trees(&source.configuration, &target.configuration, &ignored);

    let mut rows = Vec::new();
    for source_row in &source.rows {
        match target.row(&source_row.id) {
            Some(target_row) => {
                let row_ignored = overrides.ignored_for(&url.clone().with_row(&source_row.id));
                let (row_changes, row_removals) =
                    diff_trees(&source_row.configuration, &target_row.configuration, &row_ignored);
                // Reported like config-level removals, never applied
                removals.extend(
                    row_removals
                        .into_iter()
                        .map(|path| format!("rows/{}/{}", source_row.id, path)),
                );
                if !row_changes.is_empty() || source_row.is_disabled != target_row.is_disabled {
                    rows.push(RowChange::Updated {
                        row_id: source_row.id.clone(),
                        changes: row_changes,
                    });
                }
            }
            None => rows.push(RowChange::Added(source_row.clone())),
        }
    }
    // Rows are an engine-owned array, so target-only rows are removed
    for target_row in &target.rows {
        if source.row(&target_row.id).is_none() {
            rows.push(RowChange::Removed {
                row_id: target_row.id.clone(),
            });
        }
    }

    removals.sort();

    Delta {
        url: url.clone(),
        changes,
        removals,
        rows,
        active_flag: None,
    }
}

/// Diff two body trees, honoring the ignore set. Returns additions and
/// updates plus the target-only paths.
pub fn diff_trees(
    source: &Value,
    target: &Value,
    ignored: &IgnoreSet,
) -> (Vec<PropertyChange>, Vec<String>) {
    let mut changes = Vec::new();
    let mut removals = Vec::new();
    walk("", source, target, ignored, &mut changes, &mut removals);
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    removals.sort();
    (changes, removals)
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn is_secret_key(key: &str) -> bool {
    key.starts_with('#')
}

fn walk(
    prefix: &str,
    source: &Value,
    target: &Value,
    ignored: &IgnoreSet,
    changes: &mut Vec<PropertyChange>,
    removals: &mut Vec<String>,
) {
    let (Some(source_map), Some(target_map)) = (source.as_object(), target.as_object()) else {
        // Non-object on either side: whole-value replacement. Ignored
        // paths underneath the replacement are still excluded.
        if !ignored.covers(prefix) {
            let new = strip_under(prefix, source, ignored);
            if new != *target {
                changes.push(PropertyChange {
                    path: prefix.to_string(),
                    old: Some(target.clone()),
                    new,
                });
            }
        }
        return;
    };

    for (key, source_value) in source_map {
        let path = join(prefix, key);
        if ignored.covers(&path) {
            continue;
        }
        match target_map.get(key) {
            Some(target_value) => {
                if is_secret_key(key) {
                    // Write-only semantics: a secret present on both sides
                    // never differs, whatever the actual values
                    continue;
                }
                if source_value.is_object() && target_value.is_object() {
                    walk(&path, source_value, target_value, ignored, changes, removals);
                } else if source_value != target_value {
                    // Type mismatch or scalar update; the source subtree
                    // replaces the target value minus any ignored paths
                    let new = strip_under(&path, source_value, ignored);
                    if new != *target_value {
                        changes.push(PropertyChange {
                            path,
                            old: Some(target_value.clone()),
                            new,
                        });
                    }
                }
            }
            None => {
                // Addition. A subtree with an ignored path underneath is
                // skipped wholesale so the ignored property cannot ride in.
                if ignored.has_descendant(&path) {
                    continue;
                }
                changes.push(PropertyChange {
                    path,
                    old: None,
                    new: source_value.clone(),
                });
            }
        }
    }

    for key in target_map.keys() {
        if source_map.contains_key(key) {
            continue;
        }
        let path = join(prefix, key);
        if ignored.covers(&path) || ignored.has_descendant(&path) {
            continue;
        }
        removals.push(path);
    }
}

/// Copy of `body` with every covered path removed, used when creating a
/// fresh counterpart (full body copy minus ignored paths)
pub fn strip_ignored(body: &Value, ignored: &IgnoreSet) -> Value {
    strip_under("", body, ignored)
}

/// Same, for a subtree rooted at `prefix` inside the body
fn strip_under(prefix: &str, value: &Value, ignored: &IgnoreSet) -> Value {
    let Some(map) = value.as_object() else {
        return value.clone();
    };
    let mut out = Map::new();
    for (key, child) in map {
        let path = join(prefix, key);
        if ignored.covers(&path) {
            continue;
        }
        out.insert(key.clone(), strip_under(&path, child, ignored));
    }
    Value::Object(out)
}

/// Apply property changes onto a copy of the target body, creating
/// intermediate objects as needed. Target-only properties survive.
pub fn apply_changes(target_body: &Value, changes: &[PropertyChange]) -> Value {
    let mut out = if target_body.is_object() {
        target_body.clone()
    } else {
        Value::Object(Map::new())
    };
    for change in changes {
        set_path(&mut out, &change.path, change.new.clone());
    }
    out
}

fn set_path(root: &mut Value, path: &str, new_value: Value) {
    // An empty path comes from a root-level type mismatch and replaces
    // the whole body
    if path.is_empty() {
        *root = new_value;
        return;
    }
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();
    for (index, segment) in segments.iter().enumerate() {
        let map = match current {
            Value::Object(map) => map,
            other => {
                *other = Value::Object(Map::new());
                other.as_object_mut().expect("just assigned object")
            }
        };
        if index == segments.len() - 1 {
            map.insert((*segment).to_string(), new_value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
