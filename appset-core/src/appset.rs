//! The `ApplicationSet` parent resource and its strategy types.

use crate::{
    application::{ApplicationSpec, HealthStatus, SyncStatusCode},
    conditions::ApplicationSetCondition,
};
use k8s_openapi::apimachinery::pkg::{
    apis::meta::v1::{LabelSelector, Time},
    util::intstr::IntOrString,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Finalizer that keeps a parent alive until its children have been dealt with
pub const RESOURCES_FINALIZER: &str = "resources-finalizer.argocd.argoproj.io";

/// Prefix of child finalizers that must survive a field-preserving update
pub const POST_DELETE_FINALIZER_PREFIX: &str = "post-delete-finalizer.argocd.argoproj.io";

/// Annotation requesting an out-of-band reconciliation of the parent
pub const REFRESH_ANNOTATION: &str = "argocd.argoproj.io/application-set-refresh";

/// Step number recorded for applications that match no rollout step
pub const STEP_UNASSIGNED: i32 = -1;

/// Desired state of a fleet of applications.
///
/// Each generator entry produces parameter maps, the template is rendered once
/// per parameter map, and the resulting applications are reconciled against the
/// cluster under the sync policy and optional rollout strategy.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "ApplicationSet",
    plural = "applicationsets",
    shortname = "appset",
    namespaced,
    status = "ApplicationSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSpec {
    /// Parameter producers, evaluated in order
    #[serde(default)]
    pub generators: Vec<ApplicationSetGenerator>,
    /// Template rendered once per generated parameter map
    #[serde(default)]
    pub template: ApplicationSetTemplate,
    /// Gates on child create/update/delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<ApplicationSetSyncPolicy>,
    /// Optional staged rollout of child syncs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ApplicationSetStrategy>,
    /// Labels and annotations on live children that updates must not clobber
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserved_fields: Option<ApplicationPreservedFields>,
    /// Resolve nested parameter paths and keep structured values when rendering.
    ///
    /// When unset, parameter maps are flattened to dotted keys and every value
    /// is stringified before substitution.
    #[serde(default)]
    pub go_template: bool,
}

/// A single generator entry; exactly one fragment is expected to be set
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetGenerator {
    /// Fixed list of parameter maps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<ListGenerator>,
    /// One parameter map per registered cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<ClusterGenerator>,
    /// Parameter maps discovered from a git repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitGenerator>,
}

/// Inline parameter maps
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListGenerator {
    /// The parameter maps, one application each
    #[serde(default)]
    pub elements: Vec<Map<String, Value>>,
    /// Template overriding the parent template for this generator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<ApplicationSetTemplate>,
}

/// One parameter map per cluster known to the destination registry
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGenerator {
    /// Restrict to clusters whose labels match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Template overriding the parent template for this generator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<ApplicationSetTemplate>,
}

/// Parameter maps discovered from a git repository.
///
/// Served by an out-of-tree generator; the fragment is carried here so specs
/// using it stay round-trippable.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitGenerator {
    /// Repository to scan
    #[serde(default, rename = "repoURL")]
    pub repo_url: String,
    /// Revision to scan at
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    /// Directories to turn into parameter maps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directories: Vec<GitDirectoryGeneratorItem>,
    /// Config files to turn into parameter maps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<GitFileGeneratorItem>,
    /// Polling interval override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after_seconds: Option<u64>,
}

/// Directory pattern scanned by the git generator
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct GitDirectoryGeneratorItem {
    /// Glob relative to the repository root
    pub path: String,
}

/// File pattern scanned by the git generator
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct GitFileGeneratorItem {
    /// Glob relative to the repository root
    pub path: String,
}

/// Template stamped out per parameter map
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetTemplate {
    /// Metadata of the generated application
    #[serde(default)]
    pub metadata: ApplicationSetTemplateMeta,
    /// Spec of the generated application
    #[serde(default)]
    pub spec: ApplicationSpec,
}

/// Metadata subset a template may set on generated applications
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetTemplateMeta {
    /// Name of the generated application, usually parameterised
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Namespace override; children default to the parent namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Labels stamped onto the generated application
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations stamped onto the generated application
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Finalizers stamped onto the generated application
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

/// Gates on child mutations
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetSyncPolicy {
    /// Keep children alive when the parent is deleted
    #[serde(default)]
    pub preserve_resources_on_deletion: bool,
    /// Which mutations the reconciler may perform, defaulting to all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applications_sync: Option<ApplicationsSyncPolicy>,
}

/// Which child mutations the reconciler may perform
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ApplicationsSyncPolicy {
    /// Only create missing children
    #[serde(rename = "create-only")]
    CreateOnly,
    /// Create missing and update drifted children
    #[serde(rename = "create-update")]
    CreateUpdate,
    /// Create missing and prune orphaned children
    #[serde(rename = "create-delete")]
    CreateDelete,
    /// Create, update and prune
    #[default]
    #[serde(rename = "sync")]
    Sync,
}

impl ApplicationsSyncPolicy {
    /// Whether drifted children may be updated in place
    pub fn allow_update(self) -> bool {
        matches!(self, Self::CreateUpdate | Self::Sync)
    }

    /// Whether children absent from the desired set may be deleted
    pub fn allow_delete(self) -> bool {
        matches!(self, Self::CreateDelete | Self::Sync)
    }
}

/// Rollout strategy for child syncs
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetStrategy {
    /// Strategy selector
    #[serde(default, rename = "type")]
    pub strategy_type: ApplicationSetStrategyType,
    /// Step definitions, used by [`ApplicationSetStrategyType::RollingSync`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_sync: Option<ApplicationSetRolloutStrategy>,
    /// Order children are removed in when the parent is deleted.
    ///
    /// Matched case-insensitively; `Reverse` walks the rollout steps backwards,
    /// anything else deletes all children at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_order: Option<String>,
}

/// The closed set of rollout strategies
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ApplicationSetStrategyType {
    /// No sync gating; every child may sync as soon as it is created
    #[default]
    AllAtOnce,
    /// Step-wise sync gating driven by the per-application status machine
    RollingSync,
}

/// Ordered rollout steps
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetRolloutStrategy {
    /// The steps, applied in order
    #[serde(default)]
    pub steps: Vec<ApplicationSetRolloutStep>,
}

/// One rollout step: a label match plus an optional concurrency cap
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetRolloutStep {
    /// Label expressions selecting the applications of this step, ANDed
    #[serde(default)]
    pub match_expressions: Vec<ApplicationMatchExpression>,
    /// Cap on concurrently syncing applications, absolute or a percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_update: Option<IntOrString>,
}

/// A label expression on generated application labels
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMatchExpression {
    /// Label key to test
    #[serde(default)]
    pub key: String,
    /// `In` or `NotIn`; anything else never matches
    #[serde(default)]
    pub operator: String,
    /// Values tested against the label value
    #[serde(default)]
    pub values: Vec<String>,
}

/// Label and annotation keys preserved on live children during updates
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationPreservedFields {
    /// Annotation keys owned by external tooling
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<String>,
    /// Label keys owned by external tooling
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// Deletion orderings derived from [`ApplicationSetStrategy::deletion_order`]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DeletionOrder {
    /// Delete every child in one sweep via the owner reference
    #[default]
    AllAtOnce,
    /// Delete one child at a time, walking the rollout steps backwards
    Reverse,
}

impl ApplicationSet {
    /// Effective mutation policy, defaulting to full sync
    pub fn applications_sync_policy(&self) -> ApplicationsSyncPolicy {
        self.spec
            .sync_policy
            .as_ref()
            .and_then(|p| p.applications_sync)
            .unwrap_or_default()
    }

    /// Whether children must outlive the parent
    pub fn preserve_resources_on_deletion(&self) -> bool {
        self.spec
            .sync_policy
            .as_ref()
            .is_some_and(|p| p.preserve_resources_on_deletion)
    }

    /// Progressive sync is active only for a `RollingSync` strategy with at
    /// least one step
    pub fn progressive_sync_active(&self) -> bool {
        !self.rollout_steps().is_empty()
    }

    /// The rollout steps, empty unless a `RollingSync` strategy defines some
    pub fn rollout_steps(&self) -> &[ApplicationSetRolloutStep] {
        match &self.spec.strategy {
            Some(strategy) if strategy.strategy_type == ApplicationSetStrategyType::RollingSync => {
                strategy.rolling_sync.as_ref().map(|r| r.steps.as_slice()).unwrap_or(&[])
            }
            _ => &[],
        }
    }

    /// Effective deletion ordering for parent teardown
    pub fn deletion_order(&self) -> DeletionOrder {
        let order = self.spec.strategy.as_ref().and_then(|s| s.deletion_order.as_deref());
        match order {
            Some(o) if o.eq_ignore_ascii_case("reverse") => DeletionOrder::Reverse,
            _ => DeletionOrder::AllAtOnce,
        }
    }

    /// Whether a refresh has been requested through the refresh annotation
    pub fn refresh_requested(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(REFRESH_ANNOTATION))
    }
}

/// Observed state of an [`ApplicationSet`]
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetStatus {
    /// Reconcile outcome dimensions, cross-consistent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ApplicationSetCondition>,
    /// Rollout state per generated application
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub application_status: Vec<ApplicationSetApplicationStatus>,
    /// Summary of live children, sorted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

/// Rollout state of one generated application
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetApplicationStatus {
    /// Name of the application
    pub application: String,
    /// 1-based rollout step, or [`STEP_UNASSIGNED`]
    #[serde(default = "unassigned_step")]
    pub step: i32,
    /// Position in the rollout state machine
    pub status: RolloutState,
    /// Why the application is in this state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// When the state last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    /// Revisions the application targeted when the state was recorded.
    ///
    /// `None` only for entries written before the field existed; a status
    /// migration rewrites those to an empty list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_revisions: Option<Vec<String>>,
}

fn unassigned_step() -> i32 {
    STEP_UNASSIGNED
}

/// The rollout state machine positions
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum RolloutState {
    /// Known, but not yet allowed to sync
    Waiting,
    /// Allowed to sync, waiting for the application controller to pick it up
    Pending,
    /// Sync or rollout in flight
    Progressing,
    /// Synced and healthy
    Healthy,
}

/// Live child summary entry
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// API group of the child
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// API version of the child
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Kind of the child
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Name of the child
    pub name: String,
    /// Namespace of the child
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Last observed sync state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SyncStatusCode>,
    /// Last observed health
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_strategy(strategy: ApplicationSetStrategy) -> ApplicationSet {
        ApplicationSet::new(
            "guestbook",
            ApplicationSetSpec {
                strategy: Some(strategy),
                ..Default::default()
            },
        )
    }

    #[test]
    fn sync_policy_defaults_to_full_sync() {
        let set = ApplicationSet::new("guestbook", ApplicationSetSpec::default());
        let policy = set.applications_sync_policy();
        assert!(policy.allow_update());
        assert!(policy.allow_delete());

        let policy = ApplicationsSyncPolicy::CreateOnly;
        assert!(!policy.allow_update());
        assert!(!policy.allow_delete());
        assert!(ApplicationsSyncPolicy::CreateUpdate.allow_update());
        assert!(!ApplicationsSyncPolicy::CreateUpdate.allow_delete());
        assert!(ApplicationsSyncPolicy::CreateDelete.allow_delete());
    }

    #[test]
    fn progressive_sync_needs_a_rolling_strategy_with_steps() {
        let set = ApplicationSet::new("guestbook", ApplicationSetSpec::default());
        assert!(!set.progressive_sync_active());

        // RollingSync without steps stays inactive
        let set = with_strategy(ApplicationSetStrategy {
            strategy_type: ApplicationSetStrategyType::RollingSync,
            ..Default::default()
        });
        assert!(!set.progressive_sync_active());

        let set = with_strategy(ApplicationSetStrategy {
            strategy_type: ApplicationSetStrategyType::RollingSync,
            rolling_sync: Some(ApplicationSetRolloutStrategy {
                steps: vec![ApplicationSetRolloutStep::default()],
            }),
            ..Default::default()
        });
        assert!(set.progressive_sync_active());

        // steps on an AllAtOnce strategy are ignored
        let set = with_strategy(ApplicationSetStrategy {
            strategy_type: ApplicationSetStrategyType::AllAtOnce,
            rolling_sync: Some(ApplicationSetRolloutStrategy {
                steps: vec![ApplicationSetRolloutStep::default()],
            }),
            ..Default::default()
        });
        assert!(!set.progressive_sync_active());
    }

    #[test]
    fn deletion_order_matches_case_insensitively() {
        let set = with_strategy(ApplicationSetStrategy {
            deletion_order: Some("reverse".into()),
            ..Default::default()
        });
        assert_eq!(set.deletion_order(), DeletionOrder::Reverse);

        let set = with_strategy(ApplicationSetStrategy {
            deletion_order: Some("AllAtOnce".into()),
            ..Default::default()
        });
        assert_eq!(set.deletion_order(), DeletionOrder::AllAtOnce);

        let set = ApplicationSet::new("guestbook", ApplicationSetSpec::default());
        assert_eq!(set.deletion_order(), DeletionOrder::AllAtOnce);
    }

    #[test]
    fn sync_policy_round_trips_through_kebab_case() {
        let policy: ApplicationsSyncPolicy = serde_json::from_value(serde_json::json!("create-only")).unwrap();
        assert_eq!(policy, ApplicationsSyncPolicy::CreateOnly);
        assert_eq!(
            serde_json::to_value(ApplicationsSyncPolicy::CreateDelete).unwrap(),
            serde_json::json!("create-delete")
        );
    }
}
