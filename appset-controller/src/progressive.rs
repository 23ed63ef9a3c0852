//! Driving the rollout engine against the store.
//!
//! Each reconcile advances the per-application state machine from fresh
//! runtime observations, promotes `Waiting` applications of unlocked steps
//! under their `maxUpdate` caps, and keeps the `RolloutProgressing` condition
//! in step with the per-step completion state. All decisions are made by the
//! pure functions in `appset_core::rollout`; this module persists them.

use crate::{
    conditions::set_condition,
    error::Error,
    store::{update_status_with_retry, Store},
};
use appset_core::{
    conditions::{
        ApplicationSetConditionStatus, ApplicationSetConditionType,
        REASON_APPLICATION_SET_MODIFIED, REASON_APPLICATION_SET_ROLLOUT_COMPLETE,
    },
    rollout::{
        build_sync_map, next_app_status, progressing_step, promote_pending, Observation,
        StepAssignment,
    },
    Application, ApplicationSet, ApplicationSetCondition,
};
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::debug;

/// Run one progressive sync pass and return, per desired application, whether
/// it is currently allowed to sync
pub async fn apply_progressive_sync(
    store: &dyn Store,
    set: &mut ApplicationSet,
    current: &[Application],
    desired: &[Application],
) -> Result<BTreeMap<String, bool>, Error> {
    let steps = set.rollout_steps().to_vec();
    let assignment = StepAssignment::assign(desired.iter(), &steps);
    let now = Time(Utc::now());

    let live: BTreeMap<String, Application> =
        current.iter().map(|app| (app.name_any(), app.clone())).collect();

    // advance the state machine for every application the parent manages
    let recorded = set
        .status
        .as_ref()
        .map(|s| s.application_status.clone())
        .unwrap_or_default();
    let mut statuses: Vec<_> = current
        .iter()
        .map(|app| {
            let name = app.name_any();
            let existing = recorded.iter().find(|s| s.application == name);
            next_app_status(
                existing,
                &Observation::of(app),
                &name,
                assignment.display_step(&name),
                &now,
            )
        })
        .collect();
    persist_application_statuses(store, set, &statuses).await?;

    let sync_map = build_sync_map(&assignment, &statuses, &live);
    let promoted = promote_pending(&mut statuses, &assignment, &sync_map, &steps, &now);
    if promoted > 0 {
        debug!(promoted, "promoted applications to Pending");
        persist_application_statuses(store, set, &statuses).await?;
    }

    update_rollout_condition(store, set, steps.len()).await;
    Ok(sync_map)
}

/// Drop stale per-application state after the strategy was switched away from
/// rolling sync
pub async fn clear_progressive_state(store: &dyn Store, set: &mut ApplicationSet) -> Result<(), Error> {
    let stale = set
        .status
        .as_ref()
        .is_some_and(|s| !s.application_status.is_empty());
    if stale {
        debug!("clearing rollout state, strategy is no longer RollingSync");
        persist_application_statuses(store, set, &[]).await?;
    }
    Ok(())
}

async fn persist_application_statuses(
    store: &dyn Store,
    set: &mut ApplicationSet,
    statuses: &[appset_core::appset::ApplicationSetApplicationStatus],
) -> Result<(), Error> {
    let unchanged = set
        .status
        .as_ref()
        .map(|s| s.application_status.as_slice() == statuses)
        .unwrap_or(statuses.is_empty());
    if unchanged {
        return Ok(());
    }
    let updated = update_status_with_retry(store, set, |latest| {
        latest
            .status
            .get_or_insert_with(Default::default)
            .application_status = statuses.to_vec();
    })
    .await?;
    set.metadata.resource_version = updated.metadata.resource_version.clone();
    set.status = updated.status;
    Ok(())
}

async fn update_rollout_condition(store: &dyn Store, set: &mut ApplicationSet, step_count: usize) {
    let statuses = set
        .status
        .as_ref()
        .map(|s| s.application_status.as_slice())
        .unwrap_or(&[]);
    let condition = match progressing_step(statuses, step_count) {
        Some(step) => ApplicationSetCondition::new(
            ApplicationSetConditionType::RolloutProgressing,
            ApplicationSetConditionStatus::True,
            REASON_APPLICATION_SET_MODIFIED,
            &format!("ApplicationSet is performing rollout of step {}", step + 1),
        ),
        None => ApplicationSetCondition::new(
            ApplicationSetConditionType::RolloutProgressing,
            ApplicationSetConditionStatus::False,
            REASON_APPLICATION_SET_ROLLOUT_COMPLETE,
            "ApplicationSet rollout of all steps is complete",
        ),
    };
    set_condition(store, set, condition, true).await;
}
