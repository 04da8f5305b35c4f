//! Sync orchestrator
//!
//! Drives one run end to end: resolve direction and credentials, list the
//! source inventory, sync every non-skipped configuration through a
//! bounded worker pool, then assemble the run report. Component failures
//! are isolated per configuration; only auth and transport failures abort
//! the run as a whole.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use log::{debug, info, warn};

use crate::api::{
    ApiError, ComponentConfig, ConcurrencyLimiter, ConfigUrl, EnvironmentClient, ProjectRef,
    ResilienceConfig, RunError,
};
use crate::config::Settings;

use super::branch::ensure_dev_branch;
use super::diff::{RowChange, apply_changes, diff_configs, strip_ignored};
use super::direction::SyncDirection;
use super::overrides::OverrideMap;
use super::report::{ChangeDescriber, FailureKind, RunReport, SyncFailure};
use super::skip::SkipSet;
use super::state::{SyncStateStore, plan_state_transfer, reconcile_active_flag};

/// Cooperative stop signal. Once set, queued components are dropped;
/// in-flight ones finish their writes.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything fixed for the duration of one run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub direction: SyncDirection,
    pub source: ProjectRef,
    pub target: ProjectRef,
    pub overrides: OverrideMap,
    pub skip: SkipSet,
    pub ignore_inactive_orchestration_updates: bool,
    pub transfer_states: bool,
    pub merge_message: String,
    pub run_id: String,
}

impl RunContext {
    /// Resolve settings into a run context: direction, override rules,
    /// skip list and authenticated project refs for both sides.
    ///
    /// In branch mode the dev side is the managed development branch of
    /// the production project, authenticated with the master tokens.
    /// Otherwise both sides get short-lived storage tokens, reusing
    /// cached ones that are still valid.
    pub async fn prepare(
        client: &dyn EnvironmentClient,
        state: &dyn SyncStateStore,
        settings: &Settings,
        run_id: impl Into<String>,
    ) -> Result<Self, RunError> {
        let direction = SyncDirection::resolve(&settings.mode)?;
        let overrides = OverrideMap::resolve(&settings.configuration_override)?;
        let skip = SkipSet::parse(&settings.skipped_components);

        let (prod, dev) = if settings.branch_mode {
            let tokens = settings.master_tokens.as_ref().ok_or_else(|| {
                RunError::Configuration("branch_mode requires master_tokens".to_string())
            })?;
            let prod = ProjectRef::new(
                settings.prod_id.clone(),
                tokens.prod_token.clone(),
                settings.region,
            );
            let dev = ensure_dev_branch(client, &prod, tokens)
                .await
                .map_err(RunError::Connectivity)?;
            (prod, dev)
        } else {
            let prod = provision_project(client, state, settings, &settings.prod_id).await?;
            let dev = provision_project(client, state, settings, &settings.dev_id).await?;
            (prod, dev)
        };

        let (source, target) = match direction {
            SyncDirection::ProdToDev => (prod, dev),
            SyncDirection::DevToProd => (dev, prod),
        };
        info!(
            "run prepared: {} (source project {}, target project {})",
            direction.as_str(),
            source.id,
            target.id
        );

        Ok(Self {
            direction,
            source,
            target,
            overrides,
            skip,
            ignore_inactive_orchestration_updates: settings.ignore_inactive_orchestration_updates,
            transfer_states: settings.transfer_states,
            merge_message: settings.merge_message.clone(),
            run_id: run_id.into(),
        })
    }
}

/// Build an authenticated ref for one project, provisioning a storage
/// token through the manage API unless a cached one is still valid
async fn provision_project(
    client: &dyn EnvironmentClient,
    state: &dyn SyncStateStore,
    settings: &Settings,
    project_id: &str,
) -> Result<ProjectRef, RunError> {
    let mut project = ProjectRef::new(project_id, "", settings.region);
    let key = project.cache_key();

    if let Some(cached) = state.token_cache().get_valid(&key, Utc::now()) {
        debug!("reusing cached storage token for {}", key);
        project.token = cached.token.clone();
        return Ok(project);
    }

    let token = client
        .generate_storage_token(settings.region, &settings.api_token, project_id)
        .await
        .map_err(RunError::Connectivity)?;
    project.token = token.token.clone();
    state.store_token(&key, token);
    Ok(project)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// Result of syncing one configuration, folded into the run report
struct ComponentOutcome {
    url: ConfigUrl,
    applied: Applied,
    flagged: Vec<String>,
    failures: Vec<SyncFailure>,
    change_log: Vec<String>,
    fatal: Option<ApiError>,
}

impl ComponentOutcome {
    fn new(url: ConfigUrl) -> Self {
        Self {
            url,
            applied: Applied::Unchanged,
            flagged: Vec::new(),
            failures: Vec::new(),
            change_log: Vec::new(),
            fatal: None,
        }
    }
}

pub struct SyncOrchestrator<'a> {
    client: &'a dyn EnvironmentClient,
    state: &'a dyn SyncStateStore,
    limiter: ConcurrencyLimiter,
    cancel: CancellationFlag,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(
        client: &'a dyn EnvironmentClient,
        state: &'a dyn SyncStateStore,
        resilience: &ResilienceConfig,
    ) -> Self {
        Self {
            client,
            state,
            limiter: ConcurrencyLimiter::new(resilience.concurrency.clone()),
            cancel: CancellationFlag::default(),
        }
    }

    /// Handle for signalling the run to stop after in-flight components
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Execute one sync run and produce its report
    pub async fn run(&self, ctx: &RunContext) -> Result<RunReport, RunError> {
        let describer = ChangeDescriber::new(
            ctx.merge_message.clone(),
            ctx.direction,
            ctx.run_id.clone(),
        );
        let mut report = RunReport::new(ctx.direction, &ctx.merge_message, &ctx.run_id);

        // State trees are only fetched when they will be transferred
        let components = self
            .client
            .list_components(&ctx.source, ctx.transfer_states)
            .await
            .map_err(RunError::Connectivity)?;

        let mut work: Vec<ComponentConfig> = Vec::new();
        for component in components {
            if ctx.skip.is_skipped(&component.id) {
                info!("skipping component {}", component.id);
                report.components_skipped.push(component.id);
                continue;
            }
            for mut config in component.configurations {
                config.component_id = component.id.clone();
                work.push(config);
            }
        }
        report.components_skipped.sort();

        let source_urls: HashSet<ConfigUrl> = work
            .iter()
            .map(|c| ConfigUrl::new(c.component_id.clone(), c.id.clone()))
            .collect();

        let describer = &describer;
        let mut tasks = FuturesUnordered::new();
        for config in work {
            tasks.push(async move {
                let _permit = self.limiter.acquire().await;
                if self.cancel.is_cancelled() {
                    return None;
                }
                Some(self.sync_component(ctx, config, describer).await)
            });
        }

        let mut outcomes = Vec::new();
        let mut fatal: Option<ApiError> = None;
        while let Some(outcome) = tasks.next().await {
            let Some(outcome) = outcome else { continue };
            if let Some(error) = outcome.fatal {
                // Stop feeding the pool; components already written stay written
                self.cancel.cancel();
                fatal.get_or_insert(error);
                continue;
            }
            outcomes.push(outcome);
        }
        drop(tasks);

        if let Some(error) = fatal {
            return Err(RunError::Connectivity(error));
        }

        // Pool completion order is arbitrary; report order is not
        outcomes.sort_by_key(|o| o.url.to_string());
        for outcome in outcomes {
            match outcome.applied {
                Applied::Created => report.components_created.push(outcome.url),
                Applied::Updated => report.components_updated.push(outcome.url),
                Applied::Unchanged => {}
            }
            report.flagged_for_review.extend(outcome.flagged);
            report.failures.extend(outcome.failures);
            report.change_log.extend(outcome.change_log);
        }

        self.flag_target_only_configurations(ctx, &source_urls, &mut report)
            .await;

        if let Err(e) = self.state.flush() {
            warn!("failed to persist sync state: {:#}", e);
        }
        info!("{}", report.merge_summary());
        Ok(report)
    }

    /// Configurations existing only in the target are never deleted
    /// automatically; they are surfaced for manual review instead.
    async fn flag_target_only_configurations(
        &self,
        ctx: &RunContext,
        source_urls: &HashSet<ConfigUrl>,
        report: &mut RunReport,
    ) {
        let components = match self.client.list_components(&ctx.target, false).await {
            Ok(components) => components,
            Err(e) => {
                warn!("cannot enumerate target configurations for review: {}", e);
                return;
            }
        };
        for component in components {
            if ctx.skip.is_skipped(&component.id) {
                continue;
            }
            for config in component.configurations {
                let url = ConfigUrl::new(component.id.clone(), config.id.clone());
                if !source_urls.contains(&url) {
                    report
                        .flagged_for_review
                        .push(format!("configuration {} exists only in target", url));
                }
            }
        }
        report.flagged_for_review.sort();
    }

    async fn sync_component(
        &self,
        ctx: &RunContext,
        source: ComponentConfig,
        describer: &ChangeDescriber,
    ) -> ComponentOutcome {
        let url = ConfigUrl::new(source.component_id.clone(), source.id.clone());
        let mut outcome = ComponentOutcome::new(url.clone());

        if let Err(error) = self
            .sync_one(ctx, &url, &source, describer, &mut outcome)
            .await
        {
            if error.is_fatal() {
                outcome.fatal = Some(error);
            } else {
                warn!("sync of {} failed: {}", url, error);
                outcome.applied = Applied::Unchanged;
                outcome.failures.push(SyncFailure {
                    url,
                    kind: FailureKind::Component,
                    message: error.to_string(),
                });
            }
        }
        outcome
    }

    async fn sync_one(
        &self,
        ctx: &RunContext,
        url: &ConfigUrl,
        source: &ComponentConfig,
        describer: &ChangeDescriber,
        out: &mut ComponentOutcome,
    ) -> Result<(), ApiError> {
        let first_run = !self.state.has_prior_sync_marker(&ctx.target, url);

        match self.client.read_config(&ctx.target, url).await {
            Ok(target) => {
                self.update_existing(ctx, url, source, &target, first_run, describer, out)
                    .await?;
            }
            Err(ApiError::NotFound(_)) => {
                self.create_counterpart(ctx, url, source, describer, out)
                    .await?;
            }
            Err(e) => return Err(e),
        }

        if ctx.transfer_states {
            self.transfer_states(ctx, url, source, out).await?;
        }

        self.state.record_sync_marker(&ctx.target, url);
        Ok(())
    }

    /// Create the target counterpart of a source configuration: full body
    /// copy minus ignored paths, rows included, preserving the source ids
    async fn create_counterpart(
        &self,
        ctx: &RunContext,
        url: &ConfigUrl,
        source: &ComponentConfig,
        describer: &ChangeDescriber,
        out: &mut ComponentOutcome,
    ) -> Result<(), ApiError> {
        let ignored = ctx.overrides.ignored_for(url);

        let mut fresh = source.clone();
        fresh.configuration = strip_ignored(&source.configuration, &ignored);
        fresh.state = None;
        fresh.rows = Vec::new();

        let description = describer.describe("Configuration created");
        self.client
            .create_config(&ctx.target, &fresh, &description)
            .await?;
        out.change_log.push(description);

        for row in &source.rows {
            let row_ignored = ctx.overrides.ignored_for(&url.clone().with_row(&row.id));
            let mut fresh_row = row.clone();
            fresh_row.configuration = strip_ignored(&row.configuration, &row_ignored);
            fresh_row.state = None;

            let description = describer.describe(&format!("Row {} created", row.id));
            self.client
                .create_row(&ctx.target, url, &fresh_row, &description)
                .await?;
            out.change_log.push(description);
        }

        if let Some(active) = source.is_active {
            self.client.write_active_flag(&ctx.target, url, active).await?;
            out.change_log
                .push(describer.describe(&format!("Active flag set to {}", active)));
        }

        out.applied = Applied::Created;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_existing(
        &self,
        ctx: &RunContext,
        url: &ConfigUrl,
        source: &ComponentConfig,
        target: &ComponentConfig,
        first_run: bool,
        describer: &ChangeDescriber,
        out: &mut ComponentOutcome,
    ) -> Result<(), ApiError> {
        let mut delta = diff_configs(url, source, target, &ctx.overrides);
        reconcile_active_flag(
            &mut delta,
            source,
            Some(target),
            first_run,
            ctx.ignore_inactive_orchestration_updates,
        );

        for path in &delta.removals {
            out.flagged
                .push(format!("{}: property '{}' exists only in target", url, path));
        }

        if delta.is_empty() {
            debug!("{} already in sync", url);
            return Ok(());
        }

        if !delta.changes.is_empty() {
            // Patch onto the target body so target-only properties survive
            let mut updated = target.clone();
            updated.component_id = url.component_id.clone();
            updated.name = source.name.clone();
            updated.description = source.description.clone();
            updated.configuration = apply_changes(&target.configuration, &delta.changes);

            let description = describer.describe("Configuration updated");
            self.client
                .update_config(&ctx.target, &updated, &description)
                .await?;
            out.change_log.push(description);
        }

        for row_change in &delta.rows {
            match row_change {
                RowChange::Added(row) => {
                    let row_ignored =
                        ctx.overrides.ignored_for(&url.clone().with_row(&row.id));
                    let mut fresh_row = row.clone();
                    fresh_row.configuration = strip_ignored(&row.configuration, &row_ignored);
                    fresh_row.state = None;

                    let description = describer.describe(&format!("Row {} created", row.id));
                    self.client
                        .create_row(&ctx.target, url, &fresh_row, &description)
                        .await?;
                    out.change_log.push(description);
                }
                RowChange::Updated { row_id, changes } => {
                    let Some(source_row) = source.row(row_id) else {
                        continue;
                    };
                    let target_body = target
                        .row(row_id)
                        .map(|r| r.configuration.clone())
                        .unwrap_or_default();

                    let mut updated_row = source_row.clone();
                    updated_row.configuration = apply_changes(&target_body, changes);
                    updated_row.state = None;

                    let description = describer.describe(&format!("Row {} updated", row_id));
                    self.client
                        .update_row(&ctx.target, url, &updated_row, &description)
                        .await?;
                    out.change_log.push(description);
                }
                RowChange::Removed { row_id } => {
                    let description = describer.describe(&format!("Row {} deleted", row_id));
                    self.client
                        .delete_row(&ctx.target, url, row_id, &description)
                        .await?;
                    out.change_log.push(description);
                }
            }
        }

        if let Some(active) = delta.active_flag {
            self.client.write_active_flag(&ctx.target, url, active).await?;
            out.change_log
                .push(describer.describe(&format!("Active flag set to {}", active)));
        }

        out.applied = Applied::Updated;
        Ok(())
    }

    /// Best-effort: a state write failure is reported but never rolls
    /// back or fails the body sync
    async fn transfer_states(
        &self,
        ctx: &RunContext,
        url: &ConfigUrl,
        source: &ComponentConfig,
        out: &mut ComponentOutcome,
    ) -> Result<(), ApiError> {
        for write in plan_state_transfer(source, true) {
            let result = match &write.row_id {
                None => {
                    self.client
                        .write_config_state(&ctx.target, url, &write.state)
                        .await
                }
                Some(row_id) => {
                    self.client
                        .write_row_state(&ctx.target, url, row_id, &write.state)
                        .await
                }
            };
            if let Err(e) = result {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("state transfer for {} failed: {}", url, e);
                out.failures.push(SyncFailure {
                    url: url.clone(),
                    kind: FailureKind::StateTransfer,
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ConfigRow, Region};
    use crate::config::OverrideEntry;
    use crate::sync::testing::{MemoryStateStore, MockEnvironment};
    use serde_json::{Value, json};

    fn prod() -> ProjectRef {
        ProjectRef::new("100", "prod-token", Region::Eu)
    }

    fn dev() -> ProjectRef {
        ProjectRef::new("200", "dev-token", Region::Eu)
    }

    fn make_ctx() -> RunContext {
        RunContext {
            direction: SyncDirection::ProdToDev,
            source: prod(),
            target: dev(),
            overrides: OverrideMap::default(),
            skip: SkipSet::parse(""),
            ignore_inactive_orchestration_updates: true,
            transfer_states: false,
            merge_message: "release".to_string(),
            run_id: "run-1".to_string(),
        }
    }

    fn make_config(component_id: &str, id: &str, body: Value) -> ComponentConfig {
        ComponentConfig {
            component_id: component_id.to_string(),
            id: id.to_string(),
            name: format!("{} {}", component_id, id),
            description: String::new(),
            is_active: None,
            configuration: body,
            state: None,
            rows: vec![],
        }
    }

    fn make_row(id: &str, body: Value) -> ConfigRow {
        ConfigRow {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            is_disabled: false,
            configuration: body,
            state: None,
        }
    }

    fn overrides_ignoring(config_url: &str, ignored: &str) -> OverrideMap {
        OverrideMap::resolve(&[OverrideEntry {
            name: None,
            config_url: config_url.to_string(),
            ignored_properties: ignored.to_string(),
        }])
        .unwrap()
    }

    async fn run(
        client: &MockEnvironment,
        state: &MemoryStateStore,
        ctx: &RunContext,
    ) -> Result<RunReport, RunError> {
        let orchestrator = SyncOrchestrator::new(client, state, &ResilienceConfig::default());
        orchestrator.run(ctx).await
    }

    #[tokio::test]
    async fn test_missing_counterpart_is_created_with_rows() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();

        let mut source = make_config("keboola.ex-db", "123", json!({"timeout": 30}));
        source.rows = vec![make_row("r1", json!({"query": "select 1"}))];
        client.add_config(&ctx.source, source);

        let report = run(&client, &state, &ctx).await.unwrap();

        let url = ConfigUrl::new("keboola.ex-db", "123");
        assert_eq!(report.components_created, vec![url.clone()]);
        assert!(report.components_updated.is_empty());

        let created = client.config(&ctx.target, &url).unwrap();
        assert_eq!(created.configuration, json!({"timeout": 30}));
        assert_eq!(created.id, "123");
        assert_eq!(created.rows.len(), 1);
        assert_eq!(created.rows[0].configuration, json!({"query": "select 1"}));
        assert!(state.has_prior_sync_marker(&ctx.target, &url));
    }

    #[tokio::test]
    async fn test_created_counterpart_omits_ignored_paths() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let mut ctx = make_ctx();
        ctx.overrides =
            overrides_ignoring("https://x/extractors/keboola.ex-db/123", "db.password");

        client.add_config(
            &ctx.source,
            make_config(
                "keboola.ex-db",
                "123",
                json!({"db": {"host": "h", "password": "secret"}}),
            ),
        );

        run(&client, &state, &ctx).await.unwrap();

        let url = ConfigUrl::new("keboola.ex-db", "123");
        assert_eq!(
            client.config_body(&ctx.target, &url).unwrap(),
            json!({"db": {"host": "h"}})
        );
    }

    #[tokio::test]
    async fn test_update_applies_delta_and_preserves_ignored_target_values() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let mut ctx = make_ctx();
        ctx.overrides = overrides_ignoring("https://x/extractors/keboola.ex-db/123", "db.host");

        client.add_config(
            &ctx.source,
            make_config(
                "keboola.ex-db",
                "123",
                json!({"db": {"host": "prod-db"}, "timeout": 30}),
            ),
        );
        client.add_config(
            &ctx.target,
            make_config(
                "keboola.ex-db",
                "123",
                json!({"db": {"host": "dev-db"}, "timeout": 10}),
            ),
        );

        let report = run(&client, &state, &ctx).await.unwrap();

        let url = ConfigUrl::new("keboola.ex-db", "123");
        assert_eq!(report.components_updated, vec![url.clone()]);
        assert_eq!(
            client.config_body(&ctx.target, &url).unwrap(),
            json!({"db": {"host": "dev-db"}, "timeout": 30})
        );
    }

    #[tokio::test]
    async fn test_second_run_writes_nothing() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();

        client.add_config(
            &ctx.source,
            make_config("keboola.ex-db", "123", json!({"timeout": 30})),
        );
        client.add_config(
            &ctx.target,
            make_config("keboola.ex-db", "123", json!({"timeout": 10})),
        );

        run(&client, &state, &ctx).await.unwrap();
        let writes_after_first = client.write_calls();
        assert!(writes_after_first > 0);

        let report = run(&client, &state, &ctx).await.unwrap();
        assert_eq!(client.write_calls(), writes_after_first);
        assert!(report.components_updated.is_empty());
        assert!(report.components_created.is_empty());
    }

    #[tokio::test]
    async fn test_skipped_component_is_never_touched() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let mut ctx = make_ctx();
        ctx.skip = SkipSet::parse("a.b");

        client.add_config(&ctx.source, make_config("a.b", "1", json!({"v": "new"})));
        client.add_config(&ctx.source, make_config("c.d", "2", json!({"v": 1})));
        client.add_config(&ctx.target, make_config("a.b", "1", json!({"v": "old"})));

        let report = run(&client, &state, &ctx).await.unwrap();

        assert_eq!(report.components_skipped, vec!["a.b".to_string()]);
        assert_eq!(client.calls_for_component("a.b"), 0);
        assert_eq!(
            client
                .config_body(&ctx.target, &ConfigUrl::new("a.b", "1"))
                .unwrap(),
            json!({"v": "old"})
        );
        // The non-skipped component still synced
        assert_eq!(report.components_created, vec![ConfigUrl::new("c.d", "2")]);
    }

    #[tokio::test]
    async fn test_target_only_property_is_flagged_and_survives() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();

        client.add_config(
            &ctx.source,
            make_config("keboola.ex-db", "123", json!({"a": 1})),
        );
        client.add_config(
            &ctx.target,
            make_config("keboola.ex-db", "123", json!({"a": 2, "extra": true})),
        );

        let report = run(&client, &state, &ctx).await.unwrap();

        let url = ConfigUrl::new("keboola.ex-db", "123");
        assert_eq!(
            client.config_body(&ctx.target, &url).unwrap(),
            json!({"a": 1, "extra": true})
        );
        assert!(
            report
                .flagged_for_review
                .iter()
                .any(|f| f.contains("extra")),
            "flags: {:?}",
            report.flagged_for_review
        );
    }

    #[tokio::test]
    async fn test_target_only_configuration_is_flagged_not_deleted() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();

        client.add_config(&ctx.target, make_config("keboola.ex-db", "999", json!({})));

        let report = run(&client, &state, &ctx).await.unwrap();

        assert!(
            report
                .flagged_for_review
                .iter()
                .any(|f| f.contains("keboola.ex-db/999")),
        );
        assert!(
            client
                .config(&ctx.target, &ConfigUrl::new("keboola.ex-db", "999"))
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_row_target_only_property_is_flagged_not_applied() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();

        let mut source = make_config("keboola.ex-db", "123", json!({}));
        source.rows = vec![make_row("r1", json!({"q": 1}))];
        let mut target = make_config("keboola.ex-db", "123", json!({}));
        target.rows = vec![make_row("r1", json!({"q": 1, "extra": 2}))];
        client.add_config(&ctx.source, source);
        client.add_config(&ctx.target, target);

        let report = run(&client, &state, &ctx).await.unwrap();

        assert!(
            report
                .flagged_for_review
                .iter()
                .any(|f| f.contains("rows/r1/extra")),
            "flags: {:?}",
            report.flagged_for_review
        );
        let synced = client
            .config(&ctx.target, &ConfigUrl::new("keboola.ex-db", "123"))
            .unwrap();
        assert_eq!(synced.row("r1").unwrap().configuration, json!({"q": 1, "extra": 2}));
        assert_eq!(client.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_issues_no_writes() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();
        client.add_config(&ctx.source, make_config("keboola.ex-db", "1", json!({"v": 1})));

        let orchestrator = SyncOrchestrator::new(&client, &state, &ResilienceConfig::default());
        orchestrator.cancellation().cancel();
        let report = orchestrator.run(&ctx).await.unwrap();

        assert!(report.components_created.is_empty());
        assert_eq!(client.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_rows_are_mirrored_including_removals() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();

        let mut source = make_config("keboola.ex-db", "123", json!({}));
        source.rows = vec![
            make_row("r1", json!({"q": "new"})),
            make_row("r3", json!({"q": "fresh"})),
        ];
        let mut target = make_config("keboola.ex-db", "123", json!({}));
        target.rows = vec![
            make_row("r1", json!({"q": "old"})),
            make_row("r2", json!({"q": "gone"})),
        ];
        client.add_config(&ctx.source, source);
        client.add_config(&ctx.target, target);

        run(&client, &state, &ctx).await.unwrap();

        let synced = client
            .config(&ctx.target, &ConfigUrl::new("keboola.ex-db", "123"))
            .unwrap();
        assert_eq!(synced.row_ids(), vec!["r1", "r3"]);
        assert_eq!(synced.row("r1").unwrap().configuration, json!({"q": "new"}));
    }

    #[tokio::test]
    async fn test_component_failure_is_isolated() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();
        client.fail_writes_for("bad.comp");

        client.add_config(&ctx.source, make_config("bad.comp", "1", json!({"v": 1})));
        client.add_config(&ctx.target, make_config("bad.comp", "1", json!({"v": 2})));
        client.add_config(&ctx.source, make_config("good.comp", "2", json!({"v": 1})));

        let report = run(&client, &state, &ctx).await.unwrap();

        assert!(report.has_failures());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Component);
        assert_eq!(report.failures[0].url, ConfigUrl::new("bad.comp", "1"));
        assert_eq!(
            report.components_created,
            vec![ConfigUrl::new("good.comp", "2")]
        );
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_run() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();
        client.fail_listing_with_auth_error();

        let err = run(&client, &state, &ctx).await.unwrap_err();
        assert!(matches!(err, RunError::Connectivity(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_states_not_transferred_by_default() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();

        let mut source = make_config("keboola.ex-db", "123", json!({}));
        source.state = Some(json!({"lastRun": "ok"}));
        source.rows = vec![ConfigRow {
            state: Some(json!({"cursor": 42})),
            ..make_row("r1", json!({}))
        }];
        client.add_config(&ctx.source, source);

        run(&client, &state, &ctx).await.unwrap();

        let synced = client
            .config(&ctx.target, &ConfigUrl::new("keboola.ex-db", "123"))
            .unwrap();
        assert_eq!(synced.state, None);
        assert_eq!(synced.rows[0].state, None);
    }

    #[tokio::test]
    async fn test_states_transferred_when_enabled() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let mut ctx = make_ctx();
        ctx.transfer_states = true;

        let mut source = make_config("keboola.ex-db", "123", json!({}));
        source.state = Some(json!({"lastRun": "ok"}));
        source.rows = vec![ConfigRow {
            state: Some(json!({"cursor": 42})),
            ..make_row("r1", json!({}))
        }];
        client.add_config(&ctx.source, source);

        run(&client, &state, &ctx).await.unwrap();

        let synced = client
            .config(&ctx.target, &ConfigUrl::new("keboola.ex-db", "123"))
            .unwrap();
        assert_eq!(synced.state, Some(json!({"lastRun": "ok"})));
        assert_eq!(synced.rows[0].state, Some(json!({"cursor": 42})));
    }

    #[tokio::test]
    async fn test_state_transfer_failure_is_best_effort() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let mut ctx = make_ctx();
        ctx.transfer_states = true;
        client.fail_state_writes();

        let mut source = make_config("keboola.ex-db", "123", json!({"v": 1}));
        source.state = Some(json!({"lastRun": "ok"}));
        client.add_config(&ctx.source, source);

        let report = run(&client, &state, &ctx).await.unwrap();

        // Body sync succeeded, only the state write is reported
        assert_eq!(
            report.components_created,
            vec![ConfigUrl::new("keboola.ex-db", "123")]
        );
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::StateTransfer);
    }

    #[tokio::test]
    async fn test_first_run_seeds_active_flag() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();

        let mut source = make_config("keboola.orchestrator", "5", json!({}));
        source.is_active = Some(false);
        let mut target = make_config("keboola.orchestrator", "5", json!({}));
        target.is_active = Some(true);
        client.add_config(&ctx.source, source);
        client.add_config(&ctx.target, target);

        run(&client, &state, &ctx).await.unwrap();

        let url = ConfigUrl::new("keboola.orchestrator", "5");
        assert_eq!(client.config(&ctx.target, &url).unwrap().is_active, Some(false));
    }

    #[tokio::test]
    async fn test_active_flag_frozen_after_first_sync() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();

        let url = ConfigUrl::new("keboola.orchestrator", "5");
        state.record_sync_marker(&ctx.target, &url);

        let mut source = make_config("keboola.orchestrator", "5", json!({}));
        source.is_active = Some(false);
        let mut target = make_config("keboola.orchestrator", "5", json!({}));
        target.is_active = Some(true);
        client.add_config(&ctx.source, source);
        client.add_config(&ctx.target, target);

        run(&client, &state, &ctx).await.unwrap();

        assert_eq!(client.config(&ctx.target, &url).unwrap().is_active, Some(true));
        let flag_writes = client
            .calls()
            .iter()
            .filter(|c| c.method == "write_active_flag")
            .count();
        assert_eq!(flag_writes, 0);
    }

    #[tokio::test]
    async fn test_reversed_direction_writes_only_to_its_target() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let mut ctx = make_ctx();
        ctx.direction = SyncDirection::DevToProd;
        ctx.source = dev();
        ctx.target = prod();

        client.add_config(&ctx.source, make_config("keboola.ex-db", "1", json!({"v": 2})));
        client.add_config(&ctx.target, make_config("keboola.ex-db", "1", json!({"v": 1})));

        run(&client, &state, &ctx).await.unwrap();

        let url = ConfigUrl::new("keboola.ex-db", "1");
        assert_eq!(client.config_body(&prod(), &url).unwrap(), json!({"v": 2}));
        assert_eq!(client.config_body(&dev(), &url).unwrap(), json!({"v": 2}));
        for call in client.calls() {
            if call.method != "list_components" && call.method != "read_config" {
                assert_eq!(call.project, prod().cache_key(), "write to {:?}", call);
            }
        }
    }

    #[tokio::test]
    async fn test_change_descriptions_carry_direction_and_run_id() {
        let client = MockEnvironment::new();
        let state = MemoryStateStore::new();
        let ctx = make_ctx();

        client.add_config(&ctx.source, make_config("keboola.ex-db", "1", json!({"v": 1})));

        let report = run(&client, &state, &ctx).await.unwrap();

        assert_eq!(report.change_log.len(), 1);
        assert_eq!(
            report.change_log[0],
            "release - SYNC FROM PROD: Configuration created, runID:run-1"
        );
    }

    mod prepare {
        use super::*;
        use crate::config::Settings;
        use serde_json::json;

        fn settings(extra: Value) -> Settings {
            let mut raw = json!({
                "prod_id": "100",
                "dev_id": "200",
                "#api_token": "manage-token",
                "region": "EU",
                "mode": "prod_to_dev"
            });
            raw.as_object_mut()
                .unwrap()
                .extend(extra.as_object().unwrap().clone());
            Settings::from_json(&raw.to_string()).unwrap()
        }

        #[tokio::test]
        async fn test_prepare_provisions_and_caches_storage_tokens() {
            let client = MockEnvironment::new();
            let state = MemoryStateStore::new();

            let ctx = RunContext::prepare(&client, &state, &settings(json!({})), "r")
                .await
                .unwrap();

            assert_eq!(ctx.source.token, "storage-100");
            assert_eq!(ctx.target.token, "storage-200");
            assert_eq!(state.token_cache().len(), 2);
        }

        #[tokio::test]
        async fn test_prepare_direction_chooses_source_and_target() {
            let client = MockEnvironment::new();
            let state = MemoryStateStore::new();

            let ctx = RunContext::prepare(
                &client,
                &state,
                &settings(json!({"mode": "dev_to_prod"})),
                "r",
            )
            .await
            .unwrap();

            assert_eq!(ctx.direction, SyncDirection::DevToProd);
            assert_eq!(ctx.source.id, "200");
            assert_eq!(ctx.target.id, "100");
        }

        #[tokio::test]
        async fn test_prepare_branch_mode_targets_dev_branch() {
            let client = MockEnvironment::new();
            let state = MemoryStateStore::new();

            let ctx = RunContext::prepare(
                &client,
                &state,
                &settings(json!({
                    "branch_mode": true,
                    "master_tokens": {"#prod_token": "mp", "#dev_token": "md"}
                })),
                "r",
            )
            .await
            .unwrap();

            // Dev side is a branch of the production project
            assert_eq!(ctx.target.id, "100");
            assert!(ctx.target.is_branch());
            assert_eq!(ctx.target.token, "md");
            assert_eq!(ctx.source.token, "mp");
            assert!(!ctx.source.is_branch());
        }
    }
}
