//! The progressive rollout engine.
//!
//! Everything here is a pure function from *runtime observations* (what the
//! application controller reports on each child) and *recorded state* (the
//! per-application entries on the parent status) to new recorded state. The
//! async layer extracts observations, calls in here, and persists the result.
//!
//! The per-application state machine is `Waiting → Pending → Progressing →
//! Healthy`, falling back to `Waiting` whenever the target revisions change or
//! the application drifts out of sync.

use crate::{
    application::{
        Application, HealthStatusCode, Info, Operation, OperationInitiator, OperationPhase,
        RetryStrategy, SyncOperation, SyncStatusCode,
    },
    appset::{
        ApplicationSetApplicationStatus, ApplicationSetRolloutStep, RolloutState, STEP_UNASSIGNED,
    },
    selector::Selector,
};
use k8s_openapi::apimachinery::pkg::{apis::meta::v1::Time, util::intstr::IntOrString};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Initiator recorded on rollout-triggered sync operations
pub const SYNC_OPERATION_INITIATOR: &str = "applicationset-controller";

/// Retry budget of rollout-triggered sync operations
pub const SYNC_OPERATION_RETRY_LIMIT: i64 = 5;

const MSG_NO_STATUS: &str = "No Application status found, defaulting status to Waiting.";
const MSG_PENDING_CHANGES: &str = "Application has pending changes, setting status to Waiting.";
const MSG_SYNC_SUCCEEDED: &str =
    "Application resource completed a sync successfully, updating status from Pending to Progressing.";
const MSG_BECAME_PROGRESSING: &str =
    "Application resource became Progressing, updating status from Pending to Progressing.";
const MSG_ALREADY_HEALTHY: &str =
    "Application resource is already Healthy, updating status from Waiting to Healthy.";
const MSG_BECAME_HEALTHY: &str =
    "Application resource became Healthy, updating status from Progressing to Healthy.";
const MSG_MOVED_TO_PENDING: &str =
    "Application moved to Pending status, watching for the Application resource to start Progressing.";

/// Runtime state of one application, extracted up front so the transition
/// rules never touch the resource itself
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    /// Reported health
    pub health: HealthStatusCode,
    /// Reported sync comparison
    pub sync: SyncStatusCode,
    /// Phase of the tracked operation, if any
    pub phase: Option<OperationPhase>,
    /// Revisions the application currently targets
    pub target_revisions: Vec<String>,
}

impl Observation {
    /// Extract the observation from a live application
    pub fn of(app: &Application) -> Self {
        Self {
            health: app.health_status(),
            sync: app.sync_status(),
            phase: app.operation_phase(),
            target_revisions: app.target_revisions(),
        }
    }

    /// Healthy, in sync, and with no operation in flight
    pub fn is_healthy(&self) -> bool {
        self.health == HealthStatusCode::Healthy
            && self.sync != SyncStatusCode::OutOfSync
            && matches!(self.phase, None | Some(OperationPhase::Succeeded))
    }
}

/// Which rollout step each application belongs to.
///
/// Built once per reconcile from the desired applications; the first matching
/// step wins and applications matching no step stay unassigned.
#[derive(Clone, Debug, Default)]
pub struct StepAssignment {
    by_step: Vec<Vec<String>>,
    step_of: BTreeMap<String, usize>,
}

impl StepAssignment {
    /// Evaluate every step selector against every application's labels
    pub fn assign<'a>(
        apps: impl IntoIterator<Item = &'a Application>,
        steps: &[ApplicationSetRolloutStep],
    ) -> Self {
        let selectors: Vec<Selector> = steps
            .iter()
            .map(|step| Selector::from(step.match_expressions.as_slice()))
            .collect();
        let mut assignment = Self {
            by_step: vec![Vec::new(); steps.len()],
            step_of: BTreeMap::new(),
        };
        for app in apps {
            let Some(name) = app.metadata.name.clone() else { continue };
            let labels = app.metadata.labels.clone().unwrap_or_default();
            let mut assigned = None;
            for (idx, selector) in selectors.iter().enumerate() {
                if !selector.matches(&labels) {
                    continue;
                }
                match assigned {
                    None => assigned = Some(idx),
                    Some(first) => {
                        warn!(app = %name, first_step = first + 1, also_matches = idx + 1,
                            "application matches more than one rollout step, keeping the first match");
                    }
                }
            }
            if let Some(idx) = assigned {
                assignment.by_step[idx].push(name.clone());
                assignment.step_of.insert(name, idx);
            }
        }
        assignment
    }

    /// 0-based step of an application, `None` when unassigned
    pub fn step_of(&self, name: &str) -> Option<usize> {
        self.step_of.get(name).copied()
    }

    /// 1-based step for status entries, [`STEP_UNASSIGNED`] when unassigned
    pub fn display_step(&self, name: &str) -> i32 {
        self.step_of(name).map(|s| s as i32 + 1).unwrap_or(STEP_UNASSIGNED)
    }

    /// Applications assigned to a step
    pub fn apps_in(&self, step: usize) -> &[String] {
        self.by_step.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of steps evaluated
    pub fn step_count(&self) -> usize {
        self.by_step.len()
    }
}

fn transition(
    entry: &mut ApplicationSetApplicationStatus,
    to: RolloutState,
    message: &str,
    now: &Time,
) {
    entry.status = to;
    entry.message = message.to_string();
    entry.last_transition_time = Some(now.clone());
}

/// Advance the recorded state of one application.
///
/// The rules are evaluated top-down and the first applicable one wins; when
/// none applies the entry is carried over with a refreshed step number. An
/// application seen for the first time starts at `Waiting` and the rules run
/// on that default in the same pass, so an already healthy newcomer reaches
/// `Healthy` without a promotion cycle.
pub fn next_app_status(
    existing: Option<&ApplicationSetApplicationStatus>,
    observed: &Observation,
    name: &str,
    step: i32,
    now: &Time,
) -> ApplicationSetApplicationStatus {
    let mut entry = match existing {
        Some(existing) => {
            let mut entry = existing.clone();
            entry.step = step;
            entry
        }
        None => ApplicationSetApplicationStatus {
            application: name.to_string(),
            step,
            status: RolloutState::Waiting,
            message: MSG_NO_STATUS.to_string(),
            last_transition_time: Some(now.clone()),
            target_revisions: Some(observed.target_revisions.clone()),
        },
    };

    let recorded_revisions = entry.target_revisions.as_deref().unwrap_or(&[]);
    if recorded_revisions != observed.target_revisions.as_slice() {
        transition(&mut entry, RolloutState::Waiting, MSG_PENDING_CHANGES, now);
        entry.target_revisions = Some(observed.target_revisions.clone());
        return entry;
    }

    if observed.sync == SyncStatusCode::OutOfSync
        && !matches!(entry.status, RolloutState::Waiting | RolloutState::Pending)
    {
        transition(&mut entry, RolloutState::Waiting, MSG_PENDING_CHANGES, now);
        return entry;
    }

    match entry.status {
        RolloutState::Pending
            if observed.sync != SyncStatusCode::OutOfSync
                && observed.phase == Some(OperationPhase::Succeeded) =>
        {
            transition(&mut entry, RolloutState::Progressing, MSG_SYNC_SUCCEEDED, now);
        }
        RolloutState::Pending
            if observed.phase == Some(OperationPhase::Running)
                || observed.health == HealthStatusCode::Progressing =>
        {
            transition(&mut entry, RolloutState::Progressing, MSG_BECAME_PROGRESSING, now);
        }
        RolloutState::Waiting if observed.is_healthy() => {
            transition(&mut entry, RolloutState::Healthy, MSG_ALREADY_HEALTHY, now);
        }
        RolloutState::Progressing if observed.is_healthy() => {
            transition(&mut entry, RolloutState::Healthy, MSG_BECAME_HEALTHY, now);
        }
        _ => {}
    }
    entry
}

/// Compute which applications are allowed to sync.
///
/// The first step always is; each later step unlocks only once every
/// application of the step before it is runtime-healthy *and* recorded
/// `Healthy`. An application missing from the live set or the status list
/// blocks everything after its step.
pub fn build_sync_map(
    assignment: &StepAssignment,
    statuses: &[ApplicationSetApplicationStatus],
    live: &BTreeMap<String, Application>,
) -> BTreeMap<String, bool> {
    let mut sync_map = BTreeMap::new();
    let mut sync_enabled = true;
    for step in 0..assignment.step_count() {
        for name in assignment.apps_in(step) {
            sync_map.insert(name.clone(), sync_enabled);
        }
        if !sync_enabled {
            continue;
        }
        for name in assignment.apps_in(step) {
            let recorded = statuses.iter().find(|s| &s.application == name);
            match (recorded, live.get(name)) {
                (Some(status), Some(app)) => {
                    if !(app.is_healthy() && status.status == RolloutState::Healthy) {
                        sync_enabled = false;
                        break;
                    }
                }
                _ => {
                    sync_enabled = false;
                    break;
                }
            }
        }
    }
    sync_map
}

/// Invalid `maxUpdate` values; callers log these and fall back to no cap
#[derive(Debug, Error, PartialEq)]
pub enum MaxUpdateError {
    #[error("maxUpdate must not be negative, got {0}")]
    Negative(i32),
    #[error("maxUpdate must be an integer or a percentage, got {0:?}")]
    Malformed(String),
}

/// Resolve a `maxUpdate` cap against the number of applications in the step.
///
/// Percentages round down, except that a non-zero percentage never resolves to
/// zero.
pub fn resolve_max_update(max_update: &IntOrString, total: usize) -> Result<usize, MaxUpdateError> {
    match max_update {
        IntOrString::Int(value) if *value >= 0 => Ok(*value as usize),
        IntOrString::Int(value) => Err(MaxUpdateError::Negative(*value)),
        IntOrString::String(value) => {
            let percent: usize = value
                .strip_suffix('%')
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| MaxUpdateError::Malformed(value.clone()))?;
            let scaled = total * percent / 100;
            Ok(if percent > 0 && scaled == 0 { 1 } else { scaled })
        }
    }
}

/// Promote `Waiting` applications of sync-enabled steps to `Pending`, keeping
/// each step's in-flight count under its resolved cap. Returns the number of
/// promotions.
pub fn promote_pending(
    statuses: &mut [ApplicationSetApplicationStatus],
    assignment: &StepAssignment,
    sync_map: &BTreeMap<String, bool>,
    steps: &[ApplicationSetRolloutStep],
    now: &Time,
) -> usize {
    let mut total = vec![0usize; steps.len()];
    let mut in_flight = vec![0usize; steps.len()];
    for status in statuses.iter() {
        let Some(step) = assignment.step_of(&status.application) else { continue };
        total[step] += 1;
        if matches!(status.status, RolloutState::Pending | RolloutState::Progressing) {
            in_flight[step] += 1;
        }
    }

    let mut promoted = 0;
    for status in statuses.iter_mut() {
        let Some(step) = assignment.step_of(&status.application) else { continue };
        if status.status != RolloutState::Waiting {
            continue;
        }
        if !sync_map.get(&status.application).copied().unwrap_or(false) {
            continue;
        }
        if let Some(max_update) = &steps[step].max_update {
            match resolve_max_update(max_update, total[step]) {
                Ok(cap) if in_flight[step] >= cap => {
                    debug!(app = %status.application, step = step + 1, cap,
                        "maxUpdate reached, holding application in Waiting");
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(step = step + 1, %err, "ignoring invalid maxUpdate");
                }
            }
        }
        transition(status, RolloutState::Pending, MSG_MOVED_TO_PENDING, now);
        status.step = step as i32 + 1;
        in_flight[step] += 1;
        promoted += 1;
    }
    promoted
}

/// The first incomplete step that has any recorded applications, 0-based.
///
/// `None` means the rollout is complete.
pub fn progressing_step(
    statuses: &[ApplicationSetApplicationStatus],
    step_count: usize,
) -> Option<usize> {
    for step in 0..step_count {
        let display = step as i32 + 1;
        let entries: Vec<_> = statuses.iter().filter(|s| s.step == display).collect();
        if !entries.is_empty() && entries.iter().any(|s| s.status != RolloutState::Healthy) {
            return Some(step);
        }
    }
    None
}

/// Remove the child's automated sync stanza while the rollout drives syncs,
/// returning the prune flag it carried
pub fn disable_automated_sync(app: &mut Application) -> bool {
    app.spec
        .sync_policy
        .as_mut()
        .and_then(|policy| policy.automated.take())
        .map(|automated| automated.prune)
        .unwrap_or(false)
}

/// The one-shot operation placed on a pending, out-of-sync application to
/// trigger its sync
pub fn sync_operation(app: &Application, prune: bool) -> Operation {
    let sync_options = app
        .spec
        .sync_policy
        .as_ref()
        .map(|policy| policy.sync_options.clone())
        .unwrap_or_default();
    Operation {
        sync: Some(SyncOperation {
            revision: None,
            prune,
            sync_options,
        }),
        initiated_by: OperationInitiator {
            username: SYNC_OPERATION_INITIATOR.to_string(),
            automated: true,
        },
        info: vec![Info {
            name: "Reason".to_string(),
            value: "ApplicationSet RollingSync triggered a sync of this Application resource".to_string(),
        }],
        retry: RetryStrategy {
            limit: SYNC_OPERATION_RETRY_LIMIT,
        },
    }
}
