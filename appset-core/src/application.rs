//! The `Application` child resource produced for every generated parameter set.
//!
//! Unlike [`ApplicationSet`](crate::ApplicationSet), the wrapper type is written by
//! hand rather than derived, because the resource carries a root-level one-shot
//! [`Operation`] field next to `spec` and `status` that the derive cannot express.
//! The fleet controller owns `spec`, labels, annotations, finalizers and the
//! `operation` trigger; the application controller owns `status`.

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    NamespaceResourceScope,
};
use kube::core::{Resource, TypeMeta};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Group of the application resources.
pub const API_GROUP: &str = "argoproj.io";
/// Version of the application resources.
pub const API_VERSION: &str = "v1alpha1";
/// Project applications fall back to when their spec names none.
pub const DEFAULT_PROJECT: &str = "default";

/// An argo-style `Application`, owned by exactly one `ApplicationSet`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// The type fields, not always present
    #[serde(flatten, default, skip_serializing_if = "Option::is_none")]
    pub types: Option<TypeMeta>,
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state, written by the fleet controller
    #[serde(default)]
    pub spec: ApplicationSpec,
    /// One-shot sync trigger, consumed by the application controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    /// Observed state, written by the application controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ApplicationStatus>,
}

impl Application {
    /// Construct a named `Application` with its type fields populated
    pub fn new(name: &str, spec: ApplicationSpec) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: format!("{API_GROUP}/{API_VERSION}"),
                kind: "Application".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            operation: None,
            status: None,
        }
    }

    /// Observed health, `Unknown` until the application controller reports one
    pub fn health_status(&self) -> HealthStatusCode {
        self.status.as_ref().map(|s| s.health.status).unwrap_or_default()
    }

    /// Observed sync state, `Unknown` until the application controller reports one
    pub fn sync_status(&self) -> SyncStatusCode {
        self.status.as_ref().map(|s| s.sync.status).unwrap_or_default()
    }

    /// Phase of the currently tracked operation, if any
    pub fn operation_phase(&self) -> Option<OperationPhase> {
        self.status.as_ref().and_then(|s| s.operation_state.as_ref()).map(|o| o.phase)
    }

    /// The revisions the application currently targets.
    ///
    /// Prefers the multi-source revision list and falls back to the single
    /// tracked revision.
    pub fn target_revisions(&self) -> Vec<String> {
        let Some(status) = &self.status else { return vec![] };
        if !status.sync.revisions.is_empty() {
            return status.sync.revisions.clone();
        }
        match &status.sync.revision {
            Some(rev) if !rev.is_empty() => vec![rev.clone()],
            _ => vec![],
        }
    }

    /// Healthy, not out of sync, and with no operation in flight or a completed one
    pub fn is_healthy(&self) -> bool {
        self.health_status() == HealthStatusCode::Healthy
            && self.sync_status() != SyncStatusCode::OutOfSync
            && matches!(self.operation_phase(), None | Some(OperationPhase::Succeeded))
    }
}

impl Resource for Application {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "Application".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        API_GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        API_VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "applications".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Desired state of an [`Application`]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Location of the application manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ApplicationSource>,
    /// Cluster and namespace the manifests land in
    #[serde(default)]
    pub destination: ApplicationDestination,
    /// Project the application belongs to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    /// How the application controller keeps the destination in sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
}

/// Source repository reference
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    /// Repository URL
    #[serde(default, rename = "repoURL")]
    pub repo_url: String,
    /// Directory path within the repository
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Revision to check out
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_revision: String,
    /// Helm chart name, for helm repositories
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chart: String,
}

/// Deployment destination, identified by server URL and/or cluster name
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    /// API server URL of the target cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    /// Registered name of the target cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Target namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Sync behaviour of the application controller
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Automated sync settings, absent for manual sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<SyncPolicyAutomated>,
    /// Options forwarded to every sync operation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
    /// Retry behaviour for failed syncs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryStrategy>,
}

/// Automated sync settings
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicyAutomated {
    /// Delete resources that are no longer rendered
    #[serde(default)]
    pub prune: bool,
    /// Revert live drift even without a new revision
    #[serde(default)]
    pub self_heal: bool,
}

/// Retry behaviour for sync operations
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    /// Maximum number of attempts, 0 for none
    #[serde(default)]
    pub limit: i64,
}

/// A requested one-shot operation on an [`Application`]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Requested sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncOperation>,
    /// Who requested the operation
    #[serde(default)]
    pub initiated_by: OperationInitiator,
    /// Freeform details attached by the initiator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<Info>,
    /// Retry behaviour for this operation
    #[serde(default)]
    pub retry: RetryStrategy,
}

/// Requested sync parameters
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Revision to sync to, defaulting to the tracked revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Delete resources that are no longer rendered
    #[serde(default)]
    pub prune: bool,
    /// Options for this sync only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
}

/// Identity of the operation requester
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationInitiator {
    /// Name of the requesting user or controller
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Whether the request came from a controller rather than a person
    #[serde(default)]
    pub automated: bool,
}

/// Name/value detail attached to an operation
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Info {
    pub name: String,
    pub value: String,
}

/// Observed state of an [`Application`], owned by the application controller
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    /// Aggregate resource health
    #[serde(default)]
    pub health: HealthStatus,
    /// Comparison against the target revision
    #[serde(default)]
    pub sync: SyncStatus,
    /// State of the currently or last executed operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_state: Option<OperationState>,
}

/// Aggregate health of an application
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// The health code
    #[serde(default)]
    pub status: HealthStatusCode,
    /// Human readable detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Health codes reported by the application controller
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum HealthStatusCode {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    /// Not yet assessed, or an unrecognised code
    #[default]
    #[serde(other)]
    Unknown,
}

/// Sync comparison result
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// The sync code
    #[serde(default)]
    pub status: SyncStatusCode,
    /// Revision the live state was compared against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Per-source revisions for multi-source applications
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<String>,
}

/// Sync codes reported by the application controller
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum SyncStatusCode {
    Synced,
    OutOfSync,
    /// Comparison has not happened or failed
    #[default]
    #[serde(other)]
    Unknown,
}

/// Progress of an executed operation
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    /// Current phase
    #[serde(default)]
    pub phase: OperationPhase,
    /// Human readable detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// The operation being tracked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    /// When the operation started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Time>,
    /// When the operation finished, if it has
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Time>,
}

/// Operation phases
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum OperationPhase {
    #[default]
    Running,
    Succeeded,
    Failed,
    Error,
    Terminating,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_revisions_prefer_the_revision_list() {
        let mut app = Application::new("a", ApplicationSpec::default());
        assert_eq!(app.target_revisions(), Vec::<String>::new());

        app.status = Some(ApplicationStatus {
            sync: SyncStatus {
                revision: Some("abc".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(app.target_revisions(), vec!["abc".to_string()]);

        app.status.as_mut().unwrap().sync.revisions = vec!["r1".into(), "r2".into()];
        assert_eq!(app.target_revisions(), vec!["r1".to_string(), "r2".to_string()]);
    }

    #[test]
    fn healthy_requires_health_sync_and_operation() {
        let healthy = |health, sync, phase: Option<OperationPhase>| {
            let mut app = Application::new("a", ApplicationSpec::default());
            app.status = Some(ApplicationStatus {
                health: HealthStatus {
                    status: health,
                    ..Default::default()
                },
                sync: SyncStatus {
                    status: sync,
                    ..Default::default()
                },
                operation_state: phase.map(|phase| OperationState {
                    phase,
                    ..Default::default()
                }),
            });
            app.is_healthy()
        };

        assert!(healthy(HealthStatusCode::Healthy, SyncStatusCode::Synced, None));
        assert!(healthy(
            HealthStatusCode::Healthy,
            SyncStatusCode::Synced,
            Some(OperationPhase::Succeeded)
        ));
        assert!(!healthy(HealthStatusCode::Healthy, SyncStatusCode::OutOfSync, None));
        assert!(!healthy(
            HealthStatusCode::Healthy,
            SyncStatusCode::Synced,
            Some(OperationPhase::Running)
        ));
        assert!(!healthy(HealthStatusCode::Progressing, SyncStatusCode::Synced, None));
    }

    #[test]
    fn unknown_codes_deserialize_to_unknown() {
        let health: HealthStatusCode = serde_json::from_value(serde_json::json!("Wobbly")).unwrap();
        assert_eq!(health, HealthStatusCode::Unknown);
        let sync: SyncStatusCode = serde_json::from_value(serde_json::json!("Sideways")).unwrap();
        assert_eq!(sync, SyncStatusCode::Unknown);
    }
}
