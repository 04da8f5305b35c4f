//! Environment client: authenticated access to a project's configuration
//! inventory
//!
//! `EnvironmentClient` is the contract the engine consumes; every read and
//! write of configuration metadata goes through it. `StorageApiClient` is
//! the production implementation over the platform's management HTTP API.
//! Tests substitute a recording mock.

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use super::error::ApiError;
use super::models::{
    BranchRef, Component, ComponentConfig, ConfigRow, ConfigUrl, ProjectRef, Region,
};
use super::resilience::RetryPolicy;
use super::tokens::StorageToken;

/// Description attached to tokens the engine provisions for itself
const TOKEN_DESCRIPTION: &str = "DEV/PROD Sync Application";

/// Contract for reading and writing one project's configuration inventory
///
/// Failure modes: `Auth` is fatal for the run, `NotFound` means "create
/// the counterpart", `RateLimited` is retried with backoff inside the
/// implementation, `Conflict` is surfaced without retry.
#[async_trait]
pub trait EnvironmentClient: Send + Sync {
    /// All components of the project, each with its configurations.
    /// Execution state is only included when `include_state` is set.
    async fn list_components(
        &self,
        project: &ProjectRef,
        include_state: bool,
    ) -> Result<Vec<Component>, ApiError>;

    async fn read_config(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
    ) -> Result<ComponentConfig, ApiError>;

    async fn create_config(
        &self,
        project: &ProjectRef,
        config: &ComponentConfig,
        change_description: &str,
    ) -> Result<(), ApiError>;

    async fn update_config(
        &self,
        project: &ProjectRef,
        config: &ComponentConfig,
        change_description: &str,
    ) -> Result<(), ApiError>;

    async fn create_row(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row: &ConfigRow,
        change_description: &str,
    ) -> Result<(), ApiError>;

    async fn update_row(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row: &ConfigRow,
        change_description: &str,
    ) -> Result<(), ApiError>;

    async fn delete_row(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row_id: &str,
        change_description: &str,
    ) -> Result<(), ApiError>;

    async fn write_active_flag(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        active: bool,
    ) -> Result<(), ApiError>;

    async fn write_config_state(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        state: &Value,
    ) -> Result<(), ApiError>;

    async fn write_row_state(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row_id: &str,
        state: &Value,
    ) -> Result<(), ApiError>;

    async fn list_branches(&self, project: &ProjectRef) -> Result<Vec<BranchRef>, ApiError>;

    /// Create a development branch. Branch creation is asynchronous on the
    /// platform side; implementations block until the job completes.
    async fn create_branch(
        &self,
        project: &ProjectRef,
        name: &str,
        description: &str,
    ) -> Result<BranchRef, ApiError>;

    /// Provision a short-lived storage token for a project through the
    /// manage API, authenticated with the master `manage_token`.
    async fn generate_storage_token(
        &self,
        region: Region,
        manage_token: &str,
        project_id: &str,
    ) -> Result<StorageToken, ApiError>;
}

/// Production client over the platform's Storage management API
pub struct StorageApiClient {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl StorageApiClient {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            retry,
        }
    }

    /// Base URL of the components endpoint for a project, routed through
    /// the development branch when the ref carries one
    fn components_base(&self, project: &ProjectRef) -> String {
        let connection = project.region.connection_url();
        match &project.branch_id {
            Some(branch) => format!("{}/v2/storage/branch/{}/components", connection, branch),
            None => format!("{}/v2/storage/components", connection),
        }
    }

    fn config_endpoint(&self, project: &ProjectRef, url: &ConfigUrl) -> String {
        format!(
            "{}/{}/configs/{}",
            self.components_base(project),
            url.component_id,
            url.configuration_id
        )
    }

    async fn get_json(
        &self,
        token: &str,
        url: &str,
        query: &[(&str, &str)],
        what: &str,
    ) -> Result<Value, ApiError> {
        self.retry
            .execute(what, || {
                let request = self
                    .http
                    .get(url)
                    .header("X-StorageApi-Token", token)
                    .query(query);
                async move {
                    let response = request.send().await?;
                    Self::into_json(response, what).await
                }
            })
            .await
    }

    async fn send_form(
        &self,
        method: reqwest::Method,
        token: &str,
        url: &str,
        form: &[(&str, String)],
        what: &str,
    ) -> Result<Value, ApiError> {
        self.retry
            .execute(what, || {
                let request = self
                    .http
                    .request(method.clone(), url)
                    .header("X-StorageApi-Token", token)
                    .form(form);
                async move {
                    let response = request.send().await?;
                    Self::into_json(response, what).await
                }
            })
            .await
    }

    async fn into_json(response: reqwest::Response, what: &str) -> Result<Value, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body, what));
        }
        let body = response.text().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Unexpected {
            status: status.as_u16(),
            body: format!("invalid JSON in response for {}: {}", what, e),
        })
    }

    /// Shared form fields for configuration create/update
    fn config_form(config: &ComponentConfig, change_description: &str) -> Vec<(&'static str, String)> {
        vec![
            ("name", config.name.clone()),
            ("description", config.description.clone()),
            ("configuration", config.configuration.to_string()),
            ("changeDescription", change_description.to_string()),
        ]
    }

    fn row_form(row: &ConfigRow, change_description: &str) -> Vec<(&'static str, String)> {
        vec![
            ("name", row.name.clone()),
            ("description", row.description.clone()),
            ("configuration", row.configuration.to_string()),
            ("isDisabled", row.is_disabled.to_string()),
            ("changeDescription", change_description.to_string()),
        ]
    }

    /// Poll an asynchronous storage job until it settles
    async fn wait_for_job(&self, token: &str, job_url: &str) -> Result<Value, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            let job = self.get_json(token, job_url, &[], "storage job status").await?;
            match job["status"].as_str() {
                Some("success") => return Ok(job),
                Some("error") => {
                    return Err(ApiError::Unexpected {
                        status: 200,
                        body: format!("storage job failed: {}", job),
                    });
                }
                _ => {
                    attempt += 1;
                    let secs = 2u64.saturating_pow(attempt.min(4)).min(20);
                    debug!("storage job still running, polling again in {}s", secs);
                    tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                }
            }
        }
    }
}

#[async_trait]
impl EnvironmentClient for StorageApiClient {
    async fn list_components(
        &self,
        project: &ProjectRef,
        include_state: bool,
    ) -> Result<Vec<Component>, ApiError> {
        let include = if include_state {
            "configuration,rows,state"
        } else {
            "configuration,rows"
        };
        let url = self.components_base(project);
        let value = self
            .get_json(
                &project.token,
                &url,
                &[("include", include)],
                "list components",
            )
            .await?;

        let mut components: Vec<Component> =
            serde_json::from_value(value).map_err(|e| ApiError::Unexpected {
                status: 200,
                body: format!("unexpected component listing shape: {}", e),
            })?;
        for component in &mut components {
            for config in &mut component.configurations {
                config.component_id = component.id.clone();
            }
        }
        Ok(components)
    }

    async fn read_config(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
    ) -> Result<ComponentConfig, ApiError> {
        let endpoint = self.config_endpoint(project, url);
        let value = self
            .get_json(&project.token, &endpoint, &[], &format!("read config {}", url))
            .await?;

        let mut config: ComponentConfig =
            serde_json::from_value(value).map_err(|e| ApiError::Unexpected {
                status: 200,
                body: format!("unexpected configuration shape for {}: {}", url, e),
            })?;
        config.component_id = url.component_id.clone();
        Ok(config)
    }

    async fn create_config(
        &self,
        project: &ProjectRef,
        config: &ComponentConfig,
        change_description: &str,
    ) -> Result<(), ApiError> {
        let endpoint = format!(
            "{}/{}/configs",
            self.components_base(project),
            config.component_id
        );
        let mut form = Self::config_form(config, change_description);
        // Keep the source id so the configuration stays addressable by the
        // same ConfigUrl in both projects
        form.push(("configurationId", config.id.clone()));

        info!("creating configuration {}/{}", config.component_id, config.id);
        self.send_form(
            reqwest::Method::POST,
            &project.token,
            &endpoint,
            &form,
            &format!("create config {}/{}", config.component_id, config.id),
        )
        .await?;
        Ok(())
    }

    async fn update_config(
        &self,
        project: &ProjectRef,
        config: &ComponentConfig,
        change_description: &str,
    ) -> Result<(), ApiError> {
        let url = ConfigUrl::new(config.component_id.clone(), config.id.clone());
        let endpoint = self.config_endpoint(project, &url);
        let form = Self::config_form(config, change_description);

        self.send_form(
            reqwest::Method::PUT,
            &project.token,
            &endpoint,
            &form,
            &format!("update config {}", url),
        )
        .await?;
        Ok(())
    }

    async fn create_row(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row: &ConfigRow,
        change_description: &str,
    ) -> Result<(), ApiError> {
        let endpoint = format!("{}/rows", self.config_endpoint(project, url));
        let mut form = Self::row_form(row, change_description);
        form.push(("rowId", row.id.clone()));

        self.send_form(
            reqwest::Method::POST,
            &project.token,
            &endpoint,
            &form,
            &format!("create row {}/rows/{}", url, row.id),
        )
        .await?;
        Ok(())
    }

    async fn update_row(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row: &ConfigRow,
        change_description: &str,
    ) -> Result<(), ApiError> {
        let endpoint = format!("{}/rows/{}", self.config_endpoint(project, url), row.id);
        let form = Self::row_form(row, change_description);

        self.send_form(
            reqwest::Method::PUT,
            &project.token,
            &endpoint,
            &form,
            &format!("update row {}/rows/{}", url, row.id),
        )
        .await?;
        Ok(())
    }

    async fn delete_row(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row_id: &str,
        change_description: &str,
    ) -> Result<(), ApiError> {
        let endpoint = format!("{}/rows/{}", self.config_endpoint(project, url), row_id);
        self.send_form(
            reqwest::Method::DELETE,
            &project.token,
            &endpoint,
            &[("changeDescription", change_description.to_string())],
            &format!("delete row {}/rows/{}", url, row_id),
        )
        .await?;
        Ok(())
    }

    async fn write_active_flag(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        active: bool,
    ) -> Result<(), ApiError> {
        let endpoint = self.config_endpoint(project, url);
        self.send_form(
            reqwest::Method::PUT,
            &project.token,
            &endpoint,
            &[("isActive", active.to_string())],
            &format!("write active flag {}", url),
        )
        .await?;
        Ok(())
    }

    async fn write_config_state(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        state: &Value,
    ) -> Result<(), ApiError> {
        let endpoint = format!("{}/state", self.config_endpoint(project, url));
        self.send_form(
            reqwest::Method::PUT,
            &project.token,
            &endpoint,
            &[("state", state.to_string())],
            &format!("write config state {}", url),
        )
        .await?;
        Ok(())
    }

    async fn write_row_state(
        &self,
        project: &ProjectRef,
        url: &ConfigUrl,
        row_id: &str,
        state: &Value,
    ) -> Result<(), ApiError> {
        let endpoint = format!(
            "{}/rows/{}/state",
            self.config_endpoint(project, url),
            row_id
        );
        self.send_form(
            reqwest::Method::PUT,
            &project.token,
            &endpoint,
            &[("state", state.to_string())],
            &format!("write row state {}/rows/{}", url, row_id),
        )
        .await?;
        Ok(())
    }

    async fn list_branches(&self, project: &ProjectRef) -> Result<Vec<BranchRef>, ApiError> {
        let url = format!("{}/v2/storage/dev-branches/", project.region.connection_url());
        let value = self
            .get_json(&project.token, &url, &[], "list branches")
            .await?;
        serde_json::from_value(value).map_err(|e| ApiError::Unexpected {
            status: 200,
            body: format!("unexpected branch listing shape: {}", e),
        })
    }

    async fn create_branch(
        &self,
        project: &ProjectRef,
        name: &str,
        description: &str,
    ) -> Result<BranchRef, ApiError> {
        let url = format!("{}/v2/storage/dev-branches/", project.region.connection_url());
        info!("creating development branch '{}'", name);
        let response = self
            .send_form(
                reqwest::Method::POST,
                &project.token,
                &url,
                &[
                    ("name", name.to_string()),
                    ("description", description.to_string()),
                ],
                &format!("create branch '{}'", name),
            )
            .await?;

        // Branch creation is a storage job; the branch id arrives with the
        // job result
        let job_url = response["url"].as_str().ok_or_else(|| ApiError::Unexpected {
            status: 200,
            body: format!("branch creation returned no job url: {}", response),
        })?;
        let job = self.wait_for_job(&project.token, job_url).await?;

        let id = &job["results"]["id"];
        let id = id
            .as_str()
            .map(str::to_string)
            .or_else(|| id.as_u64().map(|n| n.to_string()))
            .ok_or_else(|| ApiError::Unexpected {
                status: 200,
                body: format!("branch job result carries no id: {}", job),
            })?;

        Ok(BranchRef {
            id,
            name: name.to_string(),
            is_default: false,
        })
    }

    async fn generate_storage_token(
        &self,
        region: Region,
        manage_token: &str,
        project_id: &str,
    ) -> Result<StorageToken, ApiError> {
        let url = format!(
            "{}/manage/projects/{}/tokens",
            region.connection_url(),
            project_id
        );
        let body = serde_json::json!({
            "description": TOKEN_DESCRIPTION,
            "canManageBuckets": true,
            "canReadAllFileUploads": false,
            "canPurgeTrash": false,
            "canManageTokens": true,
            "bucketPermissions": {"*": "write"},
            "expiresIn": 1800,
        });

        let what = format!("generate token for project {}", project_id);
        let value = self
            .retry
            .execute(&what, || {
                let request = self
                    .http
                    .post(&url)
                    .header("X-KBC-ManageApiToken", manage_token)
                    .json(&body);
                let what = what.clone();
                async move {
                    let response = request.send().await?;
                    Self::into_json(response, &what).await
                }
            })
            .await?;

        let id = match &value["id"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let token = value["token"]
            .as_str()
            .ok_or_else(|| ApiError::Unexpected {
                status: 200,
                body: format!("token response carries no token value: {}", value),
            })?
            .to_string();
        let expires = value["expires"].as_str().unwrap_or_default().to_string();

        Ok(StorageToken::new(id, token, expires))
    }
}
