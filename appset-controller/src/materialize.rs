//! Turning desired applications into cluster objects.
//!
//! The reconciler is the sole owner of child spec, labels, annotations,
//! finalizers and the operation trigger; everything else on the live object is
//! left alone. Updates are field-preserving: annotation and label keys listed
//! on the parent (plus controller globals and built-in defaults) survive from
//! the live object, as do `post-delete-` finalizers installed by other
//! tooling.
//!
//! Failures are collected per child so one bad application never blocks its
//! siblings; the first error is returned once the whole set has been walked.

use crate::{
    cluster::ClusterResolver,
    error::Error,
    store::Store,
    util::{lists_equal, maps_equal},
};
use appset_core::{
    application::DEFAULT_PROJECT,
    appset::{POST_DELETE_FINALIZER_PREFIX, REFRESH_ANNOTATION, RESOURCES_FINALIZER},
    Application, ApplicationSet,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Annotation keys always preserved on live children
pub const DEFAULT_PRESERVED_ANNOTATIONS: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "argocd.argoproj.io/refresh",
    REFRESH_ANNOTATION,
];

/// What a create-or-update did to one child
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationResult {
    /// The live object already matched
    None,
    /// The child was created
    Created,
    /// The child was updated in place
    Updated,
}

/// The preserved-key sets, built once per reconcile
#[derive(Clone, Debug, Default)]
pub struct FieldPreservations {
    annotations: BTreeSet<String>,
    labels: BTreeSet<String>,
}

impl FieldPreservations {
    /// Union of parent-listed keys, controller globals, and built-in defaults
    pub fn for_set(set: &ApplicationSet, global_annotations: &[String], global_labels: &[String]) -> Self {
        let mut annotations: BTreeSet<String> =
            DEFAULT_PRESERVED_ANNOTATIONS.iter().map(|k| k.to_string()).collect();
        annotations.extend(global_annotations.iter().cloned());
        let mut labels: BTreeSet<String> = global_labels.iter().cloned().collect();
        if let Some(preserved) = &set.spec.preserved_fields {
            annotations.extend(preserved.annotations.iter().cloned());
            labels.extend(preserved.labels.iter().cloned());
        }
        Self { annotations, labels }
    }
}

/// Defaults applied to every desired spec before comparing against the live one
fn normalize(app: &mut Application) {
    if app.spec.project.is_empty() {
        app.spec.project = DEFAULT_PROJECT.to_string();
    }
}

fn owner_reference(set: &ApplicationSet) -> Result<OwnerReference, Error> {
    Ok(OwnerReference {
        api_version: ApplicationSet::api_version(&()).to_string(),
        kind: ApplicationSet::kind(&()).to_string(),
        name: set.metadata.name.clone().ok_or(Error::MissingObjectKey(".metadata.name"))?,
        uid: set.metadata.uid.clone().ok_or(Error::MissingObjectKey(".metadata.uid"))?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Merge a desired child over its live counterpart per the ownership rules
fn merge_application(
    set: &ApplicationSet,
    desired: &Application,
    live: &Application,
    preserved: &FieldPreservations,
) -> Result<Application, Error> {
    if let Some(owner) = live.owner_references().iter().find(|r| r.controller == Some(true)) {
        if Some(&owner.uid) != set.uid().as_ref() {
            return Err(Error::ForeignOwner(live.name_any()));
        }
    }

    let mut merged = live.clone();
    merged.spec = desired.spec.clone();
    if desired.operation.is_some() {
        merged.operation = desired.operation.clone();
    }

    let live_annotations = live.annotations();
    let mut annotations: BTreeMap<String, String> =
        desired.metadata.annotations.clone().unwrap_or_default();
    for key in &preserved.annotations {
        if let Some(value) = live_annotations.get(key) {
            annotations.insert(key.clone(), value.clone());
        }
    }

    let live_labels = live.labels();
    let mut labels: BTreeMap<String, String> = desired.metadata.labels.clone().unwrap_or_default();
    for key in &preserved.labels {
        if let Some(value) = live_labels.get(key) {
            labels.insert(key.clone(), value.clone());
        }
    }

    let mut finalizers: Vec<String> = desired.metadata.finalizers.clone().unwrap_or_default();
    for finalizer in live.finalizers() {
        if finalizer.starts_with(POST_DELETE_FINALIZER_PREFIX) && !finalizers.contains(finalizer) {
            finalizers.push(finalizer.clone());
        }
    }

    merged.metadata.annotations = (!annotations.is_empty()).then_some(annotations);
    merged.metadata.labels = (!labels.is_empty()).then_some(labels);
    merged.metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);
    merged.metadata.owner_references = Some(vec![owner_reference(set)?]);
    Ok(merged)
}

/// Content-based diff over the fields this controller owns; status never counts
fn applications_differ(live: &Application, merged: &Application) -> bool {
    live.spec != merged.spec
        || live.operation != merged.operation
        || !maps_equal(live.metadata.annotations.as_ref(), merged.metadata.annotations.as_ref())
        || !maps_equal(live.metadata.labels.as_ref(), merged.metadata.labels.as_ref())
        || !lists_equal(live.metadata.finalizers.as_ref(), merged.metadata.finalizers.as_ref())
        || live.metadata.owner_references != merged.metadata.owner_references
}

/// Create missing children and update drifted ones.
///
/// Returns what happened to each child; on per-child failures the loop keeps
/// going and the first error is returned at the end.
pub async fn create_or_update_in_cluster(
    store: &dyn Store,
    set: &ApplicationSet,
    desired: &[Application],
    preserved: &FieldPreservations,
) -> Result<Vec<(String, OperationResult)>, Error> {
    let namespace = set.namespace().unwrap_or_default();
    let mut results = Vec::with_capacity(desired.len());
    let mut first_error: Option<Error> = None;

    for app in desired {
        let mut desired_app = app.clone();
        // children always live next to their parent
        desired_app.metadata.namespace = Some(namespace.clone());
        normalize(&mut desired_app);
        let name = desired_app.name_any();

        let outcome = apply_one(store, set, &namespace, desired_app, preserved).await;
        match outcome {
            Ok(result) => {
                match result {
                    OperationResult::Created => info!(app = %name, "created Application"),
                    OperationResult::Updated => info!(app = %name, "updated Application"),
                    OperationResult::None => debug!(app = %name, "unchanged Application"),
                }
                results.push((name, result));
            }
            Err(err) => {
                warn!(app = %name, %err, "failed to apply Application");
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(results),
    }
}

async fn apply_one(
    store: &dyn Store,
    set: &ApplicationSet,
    namespace: &str,
    mut desired: Application,
    preserved: &FieldPreservations,
) -> Result<OperationResult, Error> {
    let name = desired.name_any();
    match store.get_app(namespace, &name).await? {
        None => {
            desired.metadata.owner_references = Some(vec![owner_reference(set)?]);
            store.create_app(&desired).await?;
            Ok(OperationResult::Created)
        }
        Some(live) => {
            let merged = merge_application(set, &desired, &live, preserved)?;
            if applications_differ(&live, &merged) {
                store.update_app(&merged).await?;
                Ok(OperationResult::Updated)
            } else {
                Ok(OperationResult::None)
            }
        }
    }
}

/// Create-only mode: apply just the desired children that do not exist yet
pub async fn create_in_cluster(
    store: &dyn Store,
    set: &ApplicationSet,
    desired: &[Application],
    preserved: &FieldPreservations,
) -> Result<Vec<(String, OperationResult)>, Error> {
    let current = store.list_owned_apps(set).await?;
    let current_names: BTreeSet<String> = current.iter().map(|a| a.name_any()).collect();
    let missing: Vec<Application> = desired
        .iter()
        .filter(|a| !current_names.contains(&a.name_any()))
        .cloned()
        .collect();
    create_or_update_in_cluster(store, set, &missing, preserved).await
}

/// Delete live children absent from the desired set, fixing up the resources
/// finalizer first when the destination no longer resolves
pub async fn delete_in_cluster(
    store: &dyn Store,
    resolver: &dyn ClusterResolver,
    set: &ApplicationSet,
    desired: &[Application],
) -> Result<(), Error> {
    let desired_names: BTreeSet<String> = desired.iter().map(|a| a.name_any()).collect();
    let current = store.list_owned_apps(set).await?;
    let mut first_error: Option<Error> = None;

    for app in current {
        let name = app.name_any();
        if desired_names.contains(&name) {
            continue;
        }
        let namespace = app.namespace().unwrap_or_default();
        let removal = async {
            remove_finalizer_on_invalid_destination(store, resolver, &app).await?;
            store.delete_app(&namespace, &name).await?;
            Ok::<_, Error>(())
        };
        match removal.await {
            Ok(()) => info!(app = %name, "deleted orphaned Application"),
            Err(err) => {
                warn!(app = %name, %err, "failed to delete orphaned Application");
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Drop the resources finalizer when the destination no longer resolves, so a
/// finalizer-gated deletion cannot stall against an unreachable cluster
async fn remove_finalizer_on_invalid_destination(
    store: &dyn Store,
    resolver: &dyn ClusterResolver,
    app: &Application,
) -> Result<(), Error> {
    if !app.finalizers().iter().any(|f| f == RESOURCES_FINALIZER) {
        return Ok(());
    }
    if let Err(err) = resolver.resolve(&app.spec.destination).await {
        let remaining: Vec<String> = app
            .finalizers()
            .iter()
            .filter(|f| *f != RESOURCES_FINALIZER)
            .cloned()
            .collect();
        info!(app = %app.name_any(), %err, "removing resources finalizer, destination does not resolve");
        store
            .patch_app(
                &app.namespace().unwrap_or_default(),
                &app.name_any(),
                &serde_json::json!({"metadata": {"finalizers": remaining}}),
            )
            .await?;
    }
    Ok(())
}

/// Detach every child from the parent so they survive its deletion
pub async fn remove_owner_references(store: &dyn Store, set: &ApplicationSet) -> Result<(), Error> {
    for app in store.list_owned_apps(set).await? {
        store
            .patch_app(
                &app.namespace().unwrap_or_default(),
                &app.name_any(),
                &serde_json::json!({"metadata": {"ownerReferences": null}}),
            )
            .await?;
        debug!(app = %app.name_any(), "removed owner reference");
    }
    Ok(())
}
