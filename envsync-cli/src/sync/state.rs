//! State reconciler
//!
//! Two conditional exceptions to the plain diff/apply flow:
//!
//! - the orchestration active flag is seeded from source on the first run
//!   for a configuration; afterwards `ignore_inactive_orchestration_updates`
//!   freezes it, otherwise it diffs like any property
//! - execution state (configuration and row state trees) is only
//!   transferred when `transfer_states` is on, as a best-effort step after
//!   the body sync
//!
//! "First run" detection needs a marker persisted outside this engine;
//! it is injected as the `SyncStateStore` capability.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{ComponentConfig, ConfigUrl, ProjectRef, StorageToken, TokenCache};

use super::diff::Delta;

/// Adjust the active-flag part of a delta
///
/// `first_run` means no prior sync marker exists for this configuration.
pub fn reconcile_active_flag(
    delta: &mut Delta,
    source: &ComponentConfig,
    target: Option<&ComponentConfig>,
    first_run: bool,
    ignore_updates: bool,
) {
    let Some(source_active) = source.is_active else {
        // Not an orchestration-style component
        return;
    };
    let target_active = target.and_then(|t| t.is_active);

    if first_run {
        // Seeded unconditionally, even when updates are ignored afterwards
        if target_active != Some(source_active) {
            delta.active_flag = Some(source_active);
        }
        return;
    }

    if ignore_updates {
        delta.active_flag = None;
        return;
    }

    if target_active != Some(source_active) {
        delta.active_flag = Some(source_active);
    }
}

/// One pending state write: configuration state when `row_id` is `None`,
/// row state otherwise
#[derive(Debug, Clone, PartialEq)]
pub struct StateWrite {
    pub row_id: Option<String>,
    pub state: Value,
}

/// Plan the execution-state writes for a configuration. Empty unless
/// `transfer_states` is enabled; state trees are never even read
/// otherwise.
pub fn plan_state_transfer(source: &ComponentConfig, transfer_states: bool) -> Vec<StateWrite> {
    if !transfer_states {
        return Vec::new();
    }

    let mut writes = Vec::new();
    if let Some(state) = &source.state {
        if !state.is_null() {
            writes.push(StateWrite {
                row_id: None,
                state: state.clone(),
            });
        }
    }
    for row in &source.rows {
        if let Some(state) = &row.state {
            if !state.is_null() {
                writes.push(StateWrite {
                    row_id: Some(row.id.clone()),
                    state: state.clone(),
                });
            }
        }
    }
    writes
}

/// Persisted run state: sync markers and the storage token cache
pub trait SyncStateStore: Send + Sync {
    fn has_prior_sync_marker(&self, project: &ProjectRef, url: &ConfigUrl) -> bool;
    fn record_sync_marker(&self, project: &ProjectRef, url: &ConfigUrl);
    fn token_cache(&self) -> TokenCache;
    fn store_token(&self, key: &str, token: StorageToken);
    /// Persist accumulated changes. Called once at the end of a run.
    fn flush(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default, rename = "storage_tokens_cache")]
    tokens: TokenCache,
    #[serde(default)]
    synced_components: BTreeSet<String>,
}

/// JSON-file-backed state store
pub struct FileStateStore {
    path: PathBuf,
    inner: Mutex<StateFile>,
}

impl FileStateStore {
    /// Load the state file, starting empty when it does not exist yet
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt state file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read state file {}", path.display()));
            }
        };
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    fn marker_key(project: &ProjectRef, url: &ConfigUrl) -> String {
        format!("{}/{}", project.cache_key(), url)
    }
}

impl SyncStateStore for FileStateStore {
    fn has_prior_sync_marker(&self, project: &ProjectRef, url: &ConfigUrl) -> bool {
        let key = Self::marker_key(project, url);
        self.inner
            .lock()
            .expect("state store lock poisoned")
            .synced_components
            .contains(&key)
    }

    fn record_sync_marker(&self, project: &ProjectRef, url: &ConfigUrl) {
        let key = Self::marker_key(project, url);
        debug!("recording sync marker {}", key);
        self.inner
            .lock()
            .expect("state store lock poisoned")
            .synced_components
            .insert(key);
    }

    fn token_cache(&self) -> TokenCache {
        self.inner
            .lock()
            .expect("state store lock poisoned")
            .tokens
            .clone()
    }

    fn store_token(&self, key: &str, token: StorageToken) {
        self.inner
            .lock()
            .expect("state store lock poisoned")
            .tokens
            .insert(key, token);
    }

    fn flush(&self) -> anyhow::Result<()> {
        let state = self.inner.lock().expect("state store lock poisoned");
        let raw = serde_json::to_string_pretty(&*state)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("cannot write state file {}", self.path.display()))
    }
}
