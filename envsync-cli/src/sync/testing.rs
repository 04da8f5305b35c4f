//! In-memory `EnvironmentClient` for engine tests
//!
//! Holds per-project configuration inventories, applies writes to them
//! and records every call so tests can assert which components were
//! touched.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::{
    ApiError, BranchRef, Component, ComponentConfig, ConfigRow, ConfigUrl, EnvironmentClient,
    ProjectRef, Region, StorageToken, TokenCache,
};
use crate::sync::state::SyncStateStore;

/// One recorded client call
#[derive(Debug, Clone)]
pub struct Call {
    pub method: &'static str,
    pub project: String,
    /// Component id the call concerns, empty for project-level calls
    pub component_id: String,
}

#[derive(Default)]
struct Inner {
    /// project cache key -> component id -> configurations
    projects: HashMap<String, HashMap<String, Vec<ComponentConfig>>>,
    branches: Vec<BranchRef>,
    calls: Vec<Call>,
    created_branches: usize,
    next_branch_id: u32,
    fail_writes_for: Vec<String>,
    fail_state_writes: bool,
    fail_listing_auth: bool,
}

pub struct MockEnvironment {
    inner: Mutex<Inner>,
}

impl MockEnvironment {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_branch_id: 900,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mock lock poisoned")
    }

    // --- fixture setup ---

    pub fn add_config(&self, project: &ProjectRef, config: ComponentConfig) {
        let mut inner = self.lock();
        inner
            .projects
            .entry(project.cache_key())
            .or_default()
            .entry(config.component_id.clone())
            .or_default()
            .push(config);
    }

    pub fn add_branch(&self, name: &str, id: &str) {
        self.lock().branches.push(BranchRef {
            id: id.to_string(),
            name: name.to_string(),
            is_default: false,
        });
    }

    pub fn add_default_branch(&self, id: &str) {
        self.lock().branches.push(BranchRef {
            id: id.to_string(),
            name: "Main".to_string(),
            is_default: true,
        });
    }

    pub fn fail_writes_for(&self, component_id: &str) {
        self.lock().fail_writes_for.push(component_id.to_string());
    }

    pub fn fail_state_writes(&self) {
        self.lock().fail_state_writes = true;
    }

    pub fn fail_listing_with_auth_error(&self) {
        self.lock().fail_listing_auth = true;
    }

    // --- assertions ---

    pub fn created_branches(&self) -> usize {
        self.lock().created_branches
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Calls of any kind that concern the given component
    pub fn calls_for_component(&self, component_id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.component_id == component_id)
            .count()
    }

    /// Write calls (create/update/delete/state/flag) across all projects
    pub fn write_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.method != "list_components" && c.method != "read_config")
            .count()
    }

    pub fn config(&self, project: &ProjectRef, url: &ConfigUrl) -> Option<ComponentConfig> {
        let inner = self.lock();
        inner
            .projects
            .get(&project.cache_key())?
            .get(&url.component_id)?
            .iter()
            .find(|c| c.id == url.configuration_id)
            .cloned()
    }

    pub fn config_body(&self, project: &ProjectRef, url: &ConfigUrl) -> Option<Value> {
        self.config(project, url).map(|c| c.configuration)
    }

    fn record(&self, method: &'static str, project: &ProjectRef, component_id: &str) {
        self.lock().calls.push(Call {
            method,
            project: project.cache_key(),
            component_id: component_id.to_string(),
        });
    }

    fn write_guard(&self, component_id: &str, what: &str) -> Result<(), ApiError> {
        if self
            .lock()
            .fail_writes_for
            .iter()
            .any(|id| id == component_id)
        {
            return Err(ApiError::Unexpected {
                status: 500,
                body: format!("injected write failure for {}", what),
            });
        }
        Ok(())
    }

    fn with_config<T>(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        apply: impl FnOnce(&mut ComponentConfig) -> T,
    ) -> Result<T, ApiError> {
        let mut inner = self.lock();
        let config = inner
            .projects
            .get_mut(&project.cache_key())
            .and_then(|components| components.get_mut(&url.component_id))
            .and_then(|configs| configs.iter_mut().find(|c| c.id == url.configuration_id))
            .ok_or_else(|| ApiError::NotFound(url.to_string()))?;
        Ok(apply(config))
    }
}

#[async_trait]
impl EnvironmentClient for MockEnvironment {
    async fn list_components(
        &self,
        project: &ProjectRef,
        include_state: bool,
    ) -> Result<Vec<Component>, ApiError> {
        self.record("list_components", project, "");
        if self.lock().fail_listing_auth {
            return Err(ApiError::Auth("invalid token".to_string()));
        }

        let inner = self.lock();
        let mut components: Vec<Component> = inner
            .projects
            .get(&project.cache_key())
            .map(|components| {
                components
                    .iter()
                    .map(|(id, configs)| Component {
                        id: id.clone(),
                        configurations: configs
                            .iter()
                            .cloned()
                            .map(|mut c| {
                                if !include_state {
                                    c.state = None;
                                    for row in &mut c.rows {
                                        row.state = None;
                                    }
                                }
                                c
                            })
                            .collect(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        components.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(components)
    }

    async fn read_config(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
    ) -> Result<ComponentConfig, ApiError> {
        self.record("read_config", project, &url.component_id);
        self.config(project, url)
            .ok_or_else(|| ApiError::NotFound(url.to_string()))
    }

    async fn create_config(
        &self,
        project: &ProjectRef,
        config: &ComponentConfig,
        _change_description: &str,
    ) -> Result<(), ApiError> {
        self.record("create_config", project, &config.component_id);
        self.write_guard(&config.component_id, &config.id)?;
        self.add_config(project, config.clone());
        Ok(())
    }

    async fn update_config(
        &self,
        project: &ProjectRef,
        config: &ComponentConfig,
        _change_description: &str,
    ) -> Result<(), ApiError> {
        self.record("update_config", project, &config.component_id);
        self.write_guard(&config.component_id, &config.id)?;
        let url = ConfigUrl::new(config.component_id.clone(), config.id.clone());
        self.with_config(project, &url, |existing| {
            existing.name = config.name.clone();
            existing.description = config.description.clone();
            existing.configuration = config.configuration.clone();
        })
    }

    async fn create_row(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row: &ConfigRow,
        _change_description: &str,
    ) -> Result<(), ApiError> {
        self.record("create_row", project, &url.component_id);
        self.write_guard(&url.component_id, &row.id)?;
        self.with_config(project, url, |config| config.rows.push(row.clone()))
    }

    async fn update_row(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row: &ConfigRow,
        _change_description: &str,
    ) -> Result<(), ApiError> {
        self.record("update_row", project, &url.component_id);
        self.write_guard(&url.component_id, &row.id)?;
        self.with_config(project, url, |config| {
            if let Some(existing) = config.rows.iter_mut().find(|r| r.id == row.id) {
                *existing = row.clone();
            }
        })
    }

    async fn delete_row(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row_id: &str,
        _change_description: &str,
    ) -> Result<(), ApiError> {
        self.record("delete_row", project, &url.component_id);
        self.write_guard(&url.component_id, row_id)?;
        self.with_config(project, url, |config| {
            config.rows.retain(|r| r.id != row_id);
        })
    }

    async fn write_active_flag(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        active: bool,
    ) -> Result<(), ApiError> {
        self.record("write_active_flag", project, &url.component_id);
        self.write_guard(&url.component_id, &url.configuration_id)?;
        self.with_config(project, url, |config| config.is_active = Some(active))
    }

    async fn write_config_state(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        state: &Value,
    ) -> Result<(), ApiError> {
        self.record("write_config_state", project, &url.component_id);
        if self.lock().fail_state_writes {
            return Err(ApiError::Unexpected {
                status: 500,
                body: "injected state write failure".to_string(),
            });
        }
        self.with_config(project, url, |config| config.state = Some(state.clone()))
    }

    async fn write_row_state(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row_id: &str,
        state: &Value,
    ) -> Result<(), ApiError> {
        self.record("write_row_state", project, &url.component_id);
        if self.lock().fail_state_writes {
            return Err(ApiError::Unexpected {
                status: 500,
                body: "injected state write failure".to_string(),
            });
        }
        self.with_config(project, url, |config| {
            if let Some(row) = config.rows.iter_mut().find(|r| r.id == row_id) {
                row.state = Some(state.clone());
            }
        })
    }

    async fn list_branches(&self, project: &ProjectRef) -> Result<Vec<BranchRef>, ApiError> {
        self.record("list_branches", project, "");
        Ok(self.lock().branches.clone())
    }

    async fn create_branch(
        &self,
        project: &ProjectRef,
        name: &str,
        _description: &str,
    ) -> Result<BranchRef, ApiError> {
        self.record("create_branch", project, "");
        let mut inner = self.lock();
        inner.created_branches += 1;
        inner.next_branch_id += 1;
        let branch = BranchRef {
            id: inner.next_branch_id.to_string(),
            name: name.to_string(),
            is_default: false,
        };
        inner.branches.push(branch.clone());
        Ok(branch)
    }

    async fn generate_storage_token(
        &self,
        _region: Region,
        _manage_token: &str,
        project_id: &str,
    ) -> Result<StorageToken, ApiError> {
        Ok(StorageToken::new(
            "1",
            format!("storage-{}", project_id),
            "2099-01-01T00:00:00+00:00",
        ))
    }
}

/// `SyncStateStore` without a backing file
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<(TokenCache, BTreeSet<String>)>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn marker_key(project: &ProjectRef, url: &ConfigUrl) -> String {
        format!("{}/{}", project.cache_key(), url)
    }
}

impl SyncStateStore for MemoryStateStore {
    fn has_prior_sync_marker(&self, project: &ProjectRef, url: &ConfigUrl) -> bool {
        self.inner
            .lock()
            .expect("state lock poisoned")
            .1
            .contains(&Self::marker_key(project, url))
    }

    fn record_sync_marker(&self, project: &ProjectRef, url: &ConfigUrl) {
        self.inner
            .lock()
            .expect("state lock poisoned")
            .1
            .insert(Self::marker_key(project, url));
    }

    fn token_cache(&self) -> TokenCache {
        self.inner.lock().expect("state lock poisoned").0.clone()
    }

    fn store_token(&self, key: &str, token: StorageToken) {
        self.inner
            .lock()
            .expect("state lock poisoned")
            .0
            .insert(key, token);
    }

    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
