//! The top-level reconcile loop.
//!
//! One pass fetches the parent, generates and renders the desired
//! applications, validates them, runs the optional progressive sync machinery,
//! applies the sync policy through the materializer, and computes the next
//! requeue. Generation and validation failures become conditions plus a fixed
//! back-off rather than hard errors, so the work queue is not hammered by
//! misconfigured parents.

use crate::{
    cluster::ClusterResolver,
    conditions::set_condition,
    error::{Error, Result},
    generators::{GeneratorError, GeneratorRegistry},
    materialize::{self, FieldPreservations},
    predicates, progressive,
    project::ProjectResolver,
    store::{update_status_with_retry, KubeStore, Store},
    teardown::teardown,
    template::{merge_templates, render_application, RenderMode},
};
use appset_core::{
    application::{API_GROUP, API_VERSION, DEFAULT_PROJECT, SyncStatusCode},
    appset::{ApplicationsSyncPolicy, ResourceStatus, RolloutState, REFRESH_ANNOTATION},
    conditions::{
        ApplicationSetConditionStatus, ApplicationSetConditionType,
        REASON_APPLICATION_PARAMS_GENERATION_ERROR, REASON_APPLICATION_SET_UP_TO_DATE,
        REASON_APPLICATION_VALIDATION_ERROR, REASON_CREATE_APPLICATION_ERROR,
        REASON_DELETE_APPLICATION_ERROR, REASON_UPDATE_APPLICATION_ERROR,
    },
    rollout::{disable_automated_sync, sync_operation},
    Application, ApplicationSet, ApplicationSetCondition,
};
use futures::{FutureExt, StreamExt};
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client, ResourceExt,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Back-off applied after generation or validation failures
pub const VALIDATION_ERROR_REQUEUE: Duration = Duration::from_secs(180);

/// Tunables and collaborators that do not change per reconcile
#[derive(Default)]
pub struct Settings {
    /// Namespaces served by this controller; empty serves everything
    pub namespaces: Vec<String>,
    /// Annotation keys preserved on live children for every parent
    pub preserved_annotations: Vec<String>,
    /// Label keys preserved on live children for every parent
    pub preserved_labels: Vec<String>,
    /// Mutation policy forced over whatever the parents declare
    pub policy_override: Option<ApplicationsSyncPolicy>,
}

/// Shared state handed to every reconcile invocation
pub struct Context {
    /// Object store access
    pub store: Arc<dyn Store>,
    /// Destination cluster registry
    pub clusters: Arc<dyn ClusterResolver>,
    /// Project registry
    pub projects: Arc<dyn ProjectResolver>,
    /// Generator implementations
    pub generators: GeneratorRegistry,
    /// Controller-level tunables
    pub settings: Settings,
}

/// Reconcile one parent.
///
/// Panics anywhere below are caught here and surfaced as [`Error::Panicked`];
/// the harness boundary never unwinds.
#[instrument(skip_all, fields(app_set = %set.name_any(), namespace = %set.namespace().unwrap_or_default()))]
pub async fn reconcile(set: Arc<ApplicationSet>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = set.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = set.name_any();
    match AssertUnwindSafe(reconcile_inner(namespace, name, ctx)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::Panicked(message))
        }
    }
}

/// Decides how to handle reconciliation failures
pub fn error_policy(_set: Arc<ApplicationSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(%error, "reconcile failed, requeueing");
    Action::requeue(Duration::from_secs(60))
}

async fn reconcile_inner(namespace: String, name: String, ctx: Arc<Context>) -> Result<Action> {
    if !predicates::namespace_allowed(Some(&namespace), &ctx.settings.namespaces) {
        debug!("namespace is not served by this controller");
        return Ok(Action::await_change());
    }

    let store = ctx.store.as_ref();
    let Some(mut set) = store.get_app_set(&namespace, &name).await? else {
        debug!("application set is gone, nothing to do");
        return Ok(Action::await_change());
    };

    if set.metadata.deletion_timestamp.is_some() {
        return teardown(store, &set).await;
    }

    migrate_status(store, &mut set).await?;

    let generated = match generate_applications(&ctx, &set).await {
        Ok(generated) => generated,
        Err(err) => {
            warn!(%err, "failed to generate applications");
            let condition = ApplicationSetCondition::new(
                ApplicationSetConditionType::ErrorOccurred,
                ApplicationSetConditionStatus::True,
                REASON_APPLICATION_PARAMS_GENERATION_ERROR,
                &format!("failed to generate applications: {err}"),
            );
            set_condition(store, &mut set, condition, false).await;
            // swallowed so the harness honours the back-off instead of retrying hot
            return Ok(Action::requeue(VALIDATION_ERROR_REQUEUE));
        }
    };
    let desired = generated.apps;

    let mut validation = validate_applications(&ctx, &set, &desired).await;
    validation.messages.extend(generated.render_failures);
    if !validation.is_empty() {
        let condition = ApplicationSetCondition::new(
            ApplicationSetConditionType::ErrorOccurred,
            ApplicationSetConditionStatus::True,
            REASON_APPLICATION_VALIDATION_ERROR,
            &validation.aggregate_message(),
        );
        set_condition(store, &mut set, condition, true).await;
    }

    let current = store.list_owned_apps(&set).await?;
    refresh_resources_status(store, &mut set, &current).await;

    let sync_map = if set.progressive_sync_active() {
        Some(progressive::apply_progressive_sync(store, &mut set, &current, &desired).await?)
    } else {
        progressive::clear_progressive_state(store, &mut set).await?;
        None
    };

    let mut valid_apps: Vec<Application> = desired
        .iter()
        .enumerate()
        .filter(|(idx, _)| !validation.invalid.contains(idx))
        .map(|(_, app)| app.clone())
        .collect();

    if let Some(sync_map) = &sync_map {
        let statuses = set
            .status
            .as_ref()
            .map(|s| s.application_status.clone())
            .unwrap_or_default();
        let current_sync: BTreeMap<String, SyncStatusCode> =
            current.iter().map(|app| (app.name_any(), app.sync_status())).collect();
        for app in &mut valid_apps {
            // the rollout drives syncs now, automated sync would race it
            let prune = disable_automated_sync(app);
            let app_name = app.name_any();
            let pending = statuses
                .iter()
                .any(|s| s.application == app_name && s.status == RolloutState::Pending);
            let out_of_sync = current_sync.get(&app_name) == Some(&SyncStatusCode::OutOfSync);
            if pending && out_of_sync && sync_map.get(&app_name).copied().unwrap_or(false) {
                info!(app = %app_name, "triggering sync for pending application");
                app.operation = Some(sync_operation(app, prune));
            }
        }
    }

    let policy = ctx
        .settings
        .policy_override
        .unwrap_or_else(|| set.applications_sync_policy());
    let preserved = FieldPreservations::for_set(
        &set,
        &ctx.settings.preserved_annotations,
        &ctx.settings.preserved_labels,
    );

    let applied = if policy.allow_update() {
        materialize::create_or_update_in_cluster(store, &set, &valid_apps, &preserved).await
    } else {
        materialize::create_in_cluster(store, &set, &valid_apps, &preserved).await
    };
    if let Err(err) = applied {
        let reason = if policy.allow_update() {
            REASON_UPDATE_APPLICATION_ERROR
        } else {
            REASON_CREATE_APPLICATION_ERROR
        };
        let condition = ApplicationSetCondition::new(
            ApplicationSetConditionType::ErrorOccurred,
            ApplicationSetConditionStatus::True,
            reason,
            &format!("failed to apply applications: {err}"),
        );
        set_condition(store, &mut set, condition, true).await;
        return Err(err);
    }

    if policy.allow_delete() {
        if let Err(err) =
            materialize::delete_in_cluster(store, ctx.clusters.as_ref(), &set, &desired).await
        {
            let condition = ApplicationSetCondition::new(
                ApplicationSetConditionType::ErrorOccurred,
                ApplicationSetConditionStatus::True,
                REASON_DELETE_APPLICATION_ERROR,
                &format!("failed to prune applications: {err}"),
            );
            set_condition(store, &mut set, condition, true).await;
            return Err(err);
        }
    }

    if set.refresh_requested() {
        clear_refresh_annotation(store, &set).await?;
    }

    if validation.is_empty() {
        let condition = ApplicationSetCondition::new(
            ApplicationSetConditionType::ResourcesUpToDate,
            ApplicationSetConditionStatus::True,
            REASON_APPLICATION_SET_UP_TO_DATE,
            "All applications have been generated successfully",
        );
        set_condition(store, &mut set, condition, true).await;
        match generated.requeue {
            Some(after) => Ok(Action::requeue(after)),
            None => Ok(Action::await_change()),
        }
    } else {
        Ok(Action::requeue(VALIDATION_ERROR_REQUEUE))
    }
}

struct Generated {
    apps: Vec<Application>,
    render_failures: Vec<String>,
    requeue: Option<Duration>,
}

async fn generate_applications(ctx: &Context, set: &ApplicationSet) -> Result<Generated, GeneratorError> {
    let mode = if set.spec.go_template {
        RenderMode::Structured
    } else {
        RenderMode::Flat
    };
    let mut apps = Vec::new();
    let mut render_failures = Vec::new();
    for entry in &set.spec.generators {
        let generator = ctx.generators.lookup(entry)?;
        let params_list = generator.generate_params(entry, set).await?;
        let template = match merge_templates(&set.spec.template, generator.template(entry).as_ref()) {
            Ok(template) => template,
            Err(err) => {
                render_failures.push(format!("failed to merge generator template: {err}"));
                continue;
            }
        };
        for params in params_list {
            match render_application(&template, &params, mode) {
                Ok(app) => apps.push(app),
                Err(err) => render_failures.push(format!("failed to render application: {err}")),
            }
        }
    }
    Ok(Generated {
        apps,
        render_failures,
        requeue: ctx.generators.min_requeue_after(set),
    })
}

#[derive(Default)]
struct ValidationErrors {
    invalid: BTreeSet<usize>,
    messages: Vec<String>,
}

impl ValidationErrors {
    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The last failure, with a count of how many it stands in for
    fn aggregate_message(&self) -> String {
        match self.messages.last() {
            None => String::new(),
            Some(last) if self.messages.len() == 1 => last.clone(),
            Some(last) => format!("{last} (and {} more)", self.messages.len() - 1),
        }
    }

    fn record(&mut self, idx: usize, message: String) {
        self.invalid.insert(idx);
        self.messages.push(message);
    }
}

/// Per-child validation: names must be unique and non-empty, projects must
/// exist, destinations must resolve. Failures exclude only the offending
/// child.
async fn validate_applications(
    ctx: &Context,
    set: &ApplicationSet,
    desired: &[Application],
) -> ValidationErrors {
    let mut errors = ValidationErrors::default();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for (idx, app) in desired.iter().enumerate() {
        let name = app.name_any();
        if name.is_empty() {
            errors.record(idx, "generated application has an empty name".to_string());
            continue;
        }
        if !seen.insert(name.clone()) {
            errors.record(
                idx,
                format!(
                    "ApplicationSet {} contains applications with duplicate name: {name}",
                    set.name_any()
                ),
            );
            continue;
        }
        // validate the project the materializer will stamp in
        let project = if app.spec.project.is_empty() {
            DEFAULT_PROJECT
        } else {
            app.spec.project.as_str()
        };
        if let Err(err) = ctx.projects.resolve(project).await {
            errors.record(idx, format!("application project is invalid: {err}"));
            continue;
        }
        if let Err(err) = ctx.clusters.resolve(&app.spec.destination).await {
            errors.record(idx, format!("application destination spec is invalid: {err}"));
        }
    }
    errors
}

/// One-shot migration of legacy status entries; persists only when something
/// actually changed
async fn migrate_status(store: &dyn Store, set: &mut ApplicationSet) -> Result<()> {
    let needs_migration = set
        .status
        .as_ref()
        .is_some_and(|s| s.application_status.iter().any(|a| a.target_revisions.is_none()));
    if !needs_migration {
        return Ok(());
    }
    info!("migrating application statuses to non-null target revisions");
    let updated = update_status_with_retry(store, set, |latest| {
        if let Some(status) = latest.status.as_mut() {
            for entry in &mut status.application_status {
                if entry.target_revisions.is_none() {
                    entry.target_revisions = Some(vec![]);
                }
            }
        }
    })
    .await?;
    set.metadata.resource_version = updated.metadata.resource_version.clone();
    set.status = updated.status;
    Ok(())
}

/// Refresh the live-children summary on the parent status, sorted by name.
/// Best-effort: failures are logged and the next reconcile recomputes.
async fn refresh_resources_status(store: &dyn Store, set: &mut ApplicationSet, current: &[Application]) {
    let mut resources: Vec<ResourceStatus> = current
        .iter()
        .map(|app| ResourceStatus {
            group: API_GROUP.to_string(),
            version: API_VERSION.to_string(),
            kind: "Application".to_string(),
            name: app.name_any(),
            namespace: app.namespace().unwrap_or_default(),
            status: Some(app.sync_status()),
            health: app.status.as_ref().map(|s| s.health.clone()),
        })
        .collect();
    resources.sort_by(|a, b| a.name.cmp(&b.name));

    let unchanged = set
        .status
        .as_ref()
        .map(|s| s.resources == resources)
        .unwrap_or(resources.is_empty());
    if unchanged {
        return;
    }
    let result = update_status_with_retry(store, set, |latest| {
        latest.status.get_or_insert_with(Default::default).resources = resources.clone();
    })
    .await;
    match result {
        Ok(updated) => {
            set.metadata.resource_version = updated.metadata.resource_version.clone();
            set.status = updated.status;
        }
        Err(err) => warn!(%err, "unable to refresh resources status"),
    }
}

/// Acknowledge a requested refresh by removing the annotation
async fn clear_refresh_annotation(store: &dyn Store, set: &ApplicationSet) -> Result<()> {
    debug!("acknowledging refresh request");
    store
        .patch_app_set(
            &set.namespace().unwrap_or_default(),
            &set.name_any(),
            &serde_json::json!({"metadata": {"annotations": {REFRESH_ANNOTATION: null}}}),
        )
        .await
        .map_err(Error::RefreshAnnotation)?;
    Ok(())
}

/// Run the controller against a cluster.
///
/// Watches parents and, through the owner-reference relation declared here,
/// their children; event filtering beyond the ownership relation is available
/// in [`predicates`](crate::predicates) for embedders wiring custom trigger
/// streams.
pub async fn run(client: Client, context: Arc<Context>) {
    let app_sets = Api::<ApplicationSet>::all(client.clone());
    let apps = Api::<Application>::all(client);
    Controller::new(app_sets, watcher::Config::default())
        .owns(apps, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|outcome| async move {
            match outcome {
                Ok(obj) => debug!(?obj, "reconciled"),
                Err(err) => warn!(%err, "reconciliation error"),
            }
        })
        .await;
}

/// Construct the production [`Context`] from a client and settings
pub fn context(
    client: Client,
    clusters: Arc<dyn ClusterResolver>,
    projects: Arc<dyn ProjectResolver>,
    settings: Settings,
) -> Arc<Context> {
    Arc::new(Context {
        store: Arc::new(KubeStore::new(client)),
        generators: GeneratorRegistry::new(clusters.clone()),
        clusters,
        projects,
        settings,
    })
}
