//! Tearing the fleet down when the parent is deleted.
//!
//! The parent carries the resources finalizer, so its deletion blocks until
//! this module has dealt with the children. When the policy forbids deleting
//! children they are detached instead; otherwise they are removed either all
//! at once through the owner-reference garbage collector, or one at a time in
//! reverse step order for progressively rolled-out fleets.

use crate::{error::Error, materialize::remove_owner_references, store::Store};
use appset_core::{
    appset::{DeletionOrder, RESOURCES_FINALIZER, STEP_UNASSIGNED},
    Application, ApplicationSet,
};
use chrono::Utc;
use kube::{runtime::controller::Action, ResourceExt};
use std::time::Duration;
use tracing::{info, warn};

/// How long a child may sit with a deletion timestamp before the teardown is
/// reported as stalled
pub const STALLED_DELETION_TIMEOUT: Duration = Duration::from_secs(120);

/// Requeue interval between reverse-deletion rounds
pub const REVERSE_DELETION_REQUEUE: Duration = Duration::from_secs(10);

/// Handle a parent whose deletion timestamp is set
pub async fn teardown(store: &dyn Store, set: &ApplicationSet) -> Result<Action, Error> {
    if !set.finalizers().iter().any(|f| f == RESOURCES_FINALIZER) {
        // nothing holds the deletion back, the garbage collector takes over
        return Ok(Action::await_change());
    }

    if !set.applications_sync_policy().allow_delete() || set.preserve_resources_on_deletion() {
        info!("policy preserves resources, detaching applications from the owner");
        remove_owner_references(store, set).await?;
        remove_parent_finalizer(store, set).await?;
        return Ok(Action::await_change());
    }

    match set.deletion_order() {
        DeletionOrder::AllAtOnce => {
            remove_parent_finalizer(store, set).await?;
            Ok(Action::await_change())
        }
        DeletionOrder::Reverse => reverse_delete(store, set).await,
    }
}

/// Delete one child per cycle, walking the recorded rollout steps backwards.
///
/// Children without a recorded step drain first; the parent finalizer only
/// comes off once every child is gone.
async fn reverse_delete(store: &dyn Store, set: &ApplicationSet) -> Result<Action, Error> {
    let mut current = store.list_owned_apps(set).await?;
    if current.is_empty() {
        info!("all applications removed, releasing the finalizer");
        remove_parent_finalizer(store, set).await?;
        return Ok(Action::await_change());
    }

    let statuses = set
        .status
        .as_ref()
        .map(|s| s.application_status.as_slice())
        .unwrap_or(&[]);
    let recorded_step = |app: &Application| {
        let name = app.name_any();
        statuses
            .iter()
            .find(|s| s.application == name)
            .map(|s| s.step)
            .unwrap_or(STEP_UNASSIGNED)
    };
    // unassigned children sort above every real step and drain first
    current.sort_by_key(|app| {
        let step = recorded_step(app);
        std::cmp::Reverse(if step == STEP_UNASSIGNED { i32::MAX } else { step })
    });

    let next = &current[0];
    let name = next.name_any();
    if let Some(deleted_at) = &next.metadata.deletion_timestamp {
        let elapsed = (Utc::now() - deleted_at.0).num_seconds();
        if elapsed > STALLED_DELETION_TIMEOUT.as_secs() as i64 {
            return Err(Error::TeardownStalled {
                name,
                elapsed_seconds: elapsed,
            });
        }
        warn!(app = %name, elapsed, "waiting for application to finish terminating");
        return Ok(Action::requeue(REVERSE_DELETION_REQUEUE));
    }

    info!(app = %name, step = recorded_step(next), "deleting application in reverse step order");
    store
        .delete_app(&next.namespace().unwrap_or_default(), &name)
        .await?;
    Ok(Action::requeue(REVERSE_DELETION_REQUEUE))
}

async fn remove_parent_finalizer(store: &dyn Store, set: &ApplicationSet) -> Result<(), Error> {
    let remaining: Vec<String> = set
        .finalizers()
        .iter()
        .filter(|f| *f != RESOURCES_FINALIZER)
        .cloned()
        .collect();
    store
        .patch_app_set(
            &set.namespace().unwrap_or_default(),
            &set.name_any(),
            &serde_json::json!({"metadata": {"finalizers": remaining}}),
        )
        .await?;
    Ok(())
}
