//! End-to-end reconcile scenarios against the in-memory store.

use appset_controller::{
    cluster::{Cluster, ClusterSet},
    generators::GeneratorRegistry,
    materialize::{self, FieldPreservations, OperationResult},
    project::ProjectSet,
    reconcile,
    store::{MemStore, Store, StoreError},
    Context, Error, Settings,
};
use appset_core::{
    application::{
        ApplicationDestination, ApplicationSource, ApplicationSpec, ApplicationStatus,
        HealthStatus, HealthStatusCode, OperationPhase, OperationState, SyncStatus, SyncStatusCode,
    },
    appset::{
        ApplicationMatchExpression, ApplicationSetApplicationStatus, ApplicationSetGenerator,
        ApplicationSetRolloutStep, ApplicationSetRolloutStrategy, ApplicationSetSpec,
        ApplicationSetStrategy, ApplicationSetStrategyType, ApplicationSetTemplate,
        ApplicationSetTemplateMeta, ListGenerator, RolloutState, REFRESH_ANNOTATION,
        RESOURCES_FINALIZER,
    },
    conditions::{
        ApplicationSetConditionStatus, ApplicationSetConditionType,
        REASON_APPLICATION_SET_ROLLOUT_COMPLETE, REASON_APPLICATION_VALIDATION_ERROR,
    },
    Application, ApplicationSet,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{runtime::controller::Action, ResourceExt};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

const NS: &str = "argocd";
const SERVER: &str = "https://kubernetes.default.svc";

fn harness() -> (Arc<MemStore>, Arc<Context>) {
    let store = Arc::new(MemStore::new());
    let clusters = Arc::new(ClusterSet::new(vec![Cluster {
        name: "in-cluster".into(),
        server: SERVER.into(),
        labels: BTreeMap::new(),
    }]));
    let context = Arc::new(Context {
        store: store.clone(),
        clusters: clusters.clone(),
        projects: Arc::new(ProjectSet::default()),
        generators: GeneratorRegistry::new(clusters),
        settings: Settings::default(),
    });
    (store, context)
}

fn elements(names: &[&str]) -> Vec<serde_json::Map<String, serde_json::Value>> {
    names
        .iter()
        .map(|name| {
            serde_json::json!({"name": name})
                .as_object()
                .expect("element fixture")
                .clone()
        })
        .collect()
}

fn template() -> ApplicationSetTemplate {
    ApplicationSetTemplate {
        metadata: ApplicationSetTemplateMeta {
            name: "{{name}}".into(),
            ..Default::default()
        },
        spec: ApplicationSpec {
            project: "default".into(),
            source: Some(ApplicationSource {
                repo_url: "https://github.com/argoproj/argocd-example-apps".into(),
                path: "guestbook".into(),
                ..Default::default()
            }),
            destination: ApplicationDestination {
                server: SERVER.into(),
                namespace: "guestbook".into(),
                ..Default::default()
            },
            sync_policy: None,
        },
    }
}

fn list_app_set(names: &[&str]) -> ApplicationSet {
    let mut set = ApplicationSet::new(
        "guestbook",
        ApplicationSetSpec {
            generators: vec![ApplicationSetGenerator {
                list: Some(ListGenerator {
                    elements: elements(names),
                    template: None,
                }),
                ..Default::default()
            }],
            template: template(),
            ..Default::default()
        },
    );
    set.metadata.namespace = Some(NS.into());
    set
}

async fn get_set(store: &MemStore) -> ApplicationSet {
    store
        .get_app_set(NS, "guestbook")
        .await
        .expect("store read")
        .expect("application set exists")
}

async fn run_reconcile(store: &MemStore, ctx: &Arc<Context>) -> Result<Action, Error> {
    let set = Arc::new(get_set(store).await);
    reconcile(set, ctx.clone()).await
}

async fn set_app_status(
    store: &MemStore,
    name: &str,
    health: HealthStatusCode,
    sync: SyncStatusCode,
    phase: Option<OperationPhase>,
) {
    let mut app = store
        .get_app(NS, name)
        .await
        .expect("store read")
        .expect("application exists");
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
    store.seed_app(app);
}

fn condition_status(
    set: &ApplicationSet,
    condition_type: ApplicationSetConditionType,
) -> Option<ApplicationSetConditionStatus> {
    set.status
        .as_ref()?
        .conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
        .map(|c| c.status)
}

fn app_states(set: &ApplicationSet) -> BTreeMap<String, RolloutState> {
    set.status
        .as_ref()
        .map(|s| {
            s.application_status
                .iter()
                .map(|a| (a.application.clone(), a.status))
                .collect()
        })
        .unwrap_or_default()
}

fn in_flight(set: &ApplicationSet) -> usize {
    app_states(set)
        .values()
        .filter(|state| matches!(state, RolloutState::Pending | RolloutState::Progressing))
        .count()
}

fn assert_requeue(action: &Action, secs: u64) {
    assert_eq!(
        format!("{action:?}"),
        format!("{:?}", Action::requeue(Duration::from_secs(secs)))
    );
}

#[tokio::test]
async fn happy_create_materialises_the_fleet() {
    let (store, ctx) = harness();
    store.seed_app_set(list_app_set(&["a", "b"]));

    run_reconcile(&store, &ctx).await.expect("reconcile succeeds");

    let set = get_set(&store).await;
    for name in ["a", "b"] {
        let app = store.get_app(NS, name).await.unwrap().expect("child exists");
        let owner = &app.metadata.owner_references.as_ref().expect("owner reference")[0];
        assert_eq!(owner.kind, "ApplicationSet");
        assert_eq!(Some(&owner.uid), set.metadata.uid.as_ref());
        assert_eq!(owner.controller, Some(true));
        assert_eq!(app.spec.project, "default");
        assert_eq!(app.spec.destination.server, SERVER);
    }

    assert_eq!(
        condition_status(&set, ApplicationSetConditionType::ResourcesUpToDate),
        Some(ApplicationSetConditionStatus::True)
    );
    assert_eq!(
        condition_status(&set, ApplicationSetConditionType::ErrorOccurred),
        Some(ApplicationSetConditionStatus::False)
    );
    assert_eq!(
        condition_status(&set, ApplicationSetConditionType::ParametersGenerated),
        Some(ApplicationSetConditionStatus::True)
    );
}

#[tokio::test]
async fn converged_reconciles_perform_no_writes() {
    let (store, ctx) = harness();
    store.seed_app_set(list_app_set(&["a", "b"]));

    run_reconcile(&store, &ctx).await.expect("first reconcile");
    // the second pass absorbs the resources summary of the children created above
    run_reconcile(&store, &ctx).await.expect("second reconcile");

    let writes_before = store.writes();
    run_reconcile(&store, &ctx).await.expect("third reconcile");
    assert_eq!(store.writes(), writes_before, "a converged reconcile must not write");
}

#[tokio::test]
async fn drifted_children_are_updated_in_place() {
    let (store, ctx) = harness();
    store.seed_app_set(list_app_set(&["a", "b"]));
    run_reconcile(&store, &ctx).await.expect("seed reconcile");

    let mut drifted = store.get_app(NS, "a").await.unwrap().expect("a exists");
    drifted.spec.project = "old".into();
    store.seed_app(drifted);
    let b_before = store.get_app(NS, "b").await.unwrap().expect("b exists");

    run_reconcile(&store, &ctx).await.expect("drift reconcile");

    let repaired = store.get_app(NS, "a").await.unwrap().expect("a exists");
    assert_eq!(repaired.spec.project, "default");
    let b_after = store.get_app(NS, "b").await.unwrap().expect("b exists");
    assert_eq!(
        b_before.metadata.resource_version, b_after.metadata.resource_version,
        "unchanged sibling must not be written"
    );

    // a direct create-or-update over the converged set reports no-ops
    let set = get_set(&store).await;
    let desired = vec![
        store.get_app(NS, "a").await.unwrap().unwrap(),
        store.get_app(NS, "b").await.unwrap().unwrap(),
    ];
    let results = materialize::create_or_update_in_cluster(
        store.as_ref(),
        &set,
        &desired,
        &FieldPreservations::for_set(&set, &[], &[]),
    )
    .await
    .expect("apply succeeds");
    assert!(results.iter().all(|(_, result)| *result == OperationResult::None));
}

#[tokio::test]
async fn orphans_are_pruned_after_finalizer_fixup() {
    let (store, ctx) = harness();
    store.seed_app_set(list_app_set(&["a", "b", "c"]));
    run_reconcile(&store, &ctx).await.expect("seed reconcile");

    // c leaves the desired set while pointing at a cluster that no longer resolves
    let mut c = store.get_app(NS, "c").await.unwrap().expect("c exists");
    c.metadata.finalizers = Some(vec![RESOURCES_FINALIZER.into()]);
    c.spec.destination = ApplicationDestination {
        server: "https://decommissioned.example.com".into(),
        namespace: "guestbook".into(),
        ..Default::default()
    };
    store.seed_app(c);
    let mut set = get_set(&store).await;
    set.spec.generators[0].list.as_mut().expect("list generator").elements = elements(&["a", "b"]);
    store.seed_app_set(set);

    run_reconcile(&store, &ctx).await.expect("prune reconcile");

    assert!(
        store.get_app(NS, "c").await.unwrap().is_none(),
        "the stripped finalizer lets the orphan delete instead of stalling"
    );
    assert!(store.get_app(NS, "a").await.unwrap().is_some());
    assert!(store.get_app(NS, "b").await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_names_invalidate_only_the_duplicate() {
    let (store, ctx) = harness();
    store.seed_app_set(list_app_set(&["x", "x"]));

    let action = run_reconcile(&store, &ctx).await.expect("reconcile swallows validation");
    assert_requeue(&action, 180);

    assert!(store.get_app(NS, "x").await.unwrap().is_some(), "first x is created");
    let set = get_set(&store).await;
    assert_eq!(
        condition_status(&set, ApplicationSetConditionType::ErrorOccurred),
        Some(ApplicationSetConditionStatus::True)
    );
    let error = set
        .status
        .as_ref()
        .unwrap()
        .conditions
        .iter()
        .find(|c| c.condition_type == ApplicationSetConditionType::ErrorOccurred)
        .unwrap();
    assert_eq!(error.reason, REASON_APPLICATION_VALIDATION_ERROR);
    assert!(error.message.contains("duplicate name: x"));
}

#[tokio::test]
async fn unknown_projects_fail_validation() {
    let (store, ctx) = harness();
    let mut set = list_app_set(&["a"]);
    set.spec.template.spec.project = "payments".into();
    store.seed_app_set(set);

    let action = run_reconcile(&store, &ctx).await.expect("reconcile swallows validation");
    assert_requeue(&action, 180);

    assert!(
        store.get_app(NS, "a").await.unwrap().is_none(),
        "a child with an unregistered project must not be created"
    );
    let set = get_set(&store).await;
    let error = set
        .status
        .as_ref()
        .unwrap()
        .conditions
        .iter()
        .find(|c| c.condition_type == ApplicationSetConditionType::ErrorOccurred)
        .unwrap();
    assert_eq!(error.status, ApplicationSetConditionStatus::True);
    assert_eq!(error.reason, REASON_APPLICATION_VALIDATION_ERROR);
    assert!(error.message.contains("payments"));
}

fn rolling_app_set(names: &[&str]) -> ApplicationSet {
    let mut set = list_app_set(names);
    set.spec.template.metadata.labels = [("stage".to_string(), "one".to_string())].into();
    set.spec.strategy = Some(ApplicationSetStrategy {
        strategy_type: ApplicationSetStrategyType::RollingSync,
        rolling_sync: Some(ApplicationSetRolloutStrategy {
            steps: vec![ApplicationSetRolloutStep {
                match_expressions: vec![ApplicationMatchExpression {
                    key: "stage".into(),
                    operator: "In".into(),
                    values: vec!["one".into()],
                }],
                max_update: Some(
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(1),
                ),
            }],
        }),
        deletion_order: None,
    });
    set
}

#[tokio::test]
async fn rolling_sync_promotes_one_application_at_a_time() {
    let (store, ctx) = harness();
    store.seed_app_set(rolling_app_set(&["a", "b", "c"]));

    // first pass creates the fleet; nothing has reported status yet
    run_reconcile(&store, &ctx).await.expect("create reconcile");
    for name in ["a", "b", "c"] {
        set_app_status(&store, name, HealthStatusCode::Missing, SyncStatusCode::OutOfSync, None).await;
    }

    // one application is promoted and handed a sync operation
    run_reconcile(&store, &ctx).await.expect("promotion reconcile");
    let set = get_set(&store).await;
    let states = app_states(&set);
    assert_eq!(states["a"], RolloutState::Pending);
    assert_eq!(states["b"], RolloutState::Waiting);
    assert_eq!(states["c"], RolloutState::Waiting);
    assert!(in_flight(&set) <= 1, "maxUpdate cap respected");
    let a = store.get_app(NS, "a").await.unwrap().unwrap();
    let operation = a.operation.expect("a got a sync trigger");
    assert_eq!(operation.initiated_by.username, "applicationset-controller");
    assert!(store.get_app(NS, "b").await.unwrap().unwrap().operation.is_none());
    assert_eq!(
        condition_status(&set, ApplicationSetConditionType::RolloutProgressing),
        Some(ApplicationSetConditionStatus::True)
    );

    // a syncs; while it runs nothing else may start
    set_app_status(
        &store,
        "a",
        HealthStatusCode::Progressing,
        SyncStatusCode::Synced,
        Some(OperationPhase::Running),
    )
    .await;
    run_reconcile(&store, &ctx).await.expect("progressing reconcile");
    let set = get_set(&store).await;
    let states = app_states(&set);
    assert_eq!(states["a"], RolloutState::Progressing);
    assert_eq!(states["b"], RolloutState::Waiting);
    assert!(in_flight(&set) <= 1, "maxUpdate cap respected while a runs");

    // a lands healthy, freeing budget for b
    set_app_status(
        &store,
        "a",
        HealthStatusCode::Healthy,
        SyncStatusCode::Synced,
        Some(OperationPhase::Succeeded),
    )
    .await;
    run_reconcile(&store, &ctx).await.expect("a healthy reconcile");
    let set = get_set(&store).await;
    let states = app_states(&set);
    assert_eq!(states["a"], RolloutState::Healthy);
    assert_eq!(states["b"], RolloutState::Pending);
    assert_eq!(states["c"], RolloutState::Waiting);
    assert!(in_flight(&set) <= 1);

    // walk b and c through the same lifecycle; each needs one pass for
    // Pending to Progressing and one for Progressing to Healthy
    set_app_status(
        &store,
        "b",
        HealthStatusCode::Healthy,
        SyncStatusCode::Synced,
        Some(OperationPhase::Succeeded),
    )
    .await;
    run_reconcile(&store, &ctx).await.expect("b progressing reconcile");
    let set = get_set(&store).await;
    assert_eq!(app_states(&set)["b"], RolloutState::Progressing);
    assert!(in_flight(&set) <= 1);
    run_reconcile(&store, &ctx).await.expect("b healthy reconcile");
    let set = get_set(&store).await;
    assert_eq!(app_states(&set)["b"], RolloutState::Healthy);
    assert_eq!(app_states(&set)["c"], RolloutState::Pending);

    set_app_status(
        &store,
        "c",
        HealthStatusCode::Healthy,
        SyncStatusCode::Synced,
        Some(OperationPhase::Succeeded),
    )
    .await;
    run_reconcile(&store, &ctx).await.expect("c progressing reconcile");
    run_reconcile(&store, &ctx).await.expect("c healthy reconcile");

    let set = get_set(&store).await;
    let states = app_states(&set);
    assert!(states.values().all(|s| *s == RolloutState::Healthy));
    assert_eq!(
        condition_status(&set, ApplicationSetConditionType::RolloutProgressing),
        Some(ApplicationSetConditionStatus::False)
    );
    let rollout = set
        .status
        .as_ref()
        .unwrap()
        .conditions
        .iter()
        .find(|c| c.condition_type == ApplicationSetConditionType::RolloutProgressing)
        .unwrap();
    assert_eq!(rollout.reason, REASON_APPLICATION_SET_ROLLOUT_COMPLETE);
}

fn two_step_app_set() -> ApplicationSet {
    let mut set = list_app_set(&["a", "b"]);
    set.spec.generators[0].list.as_mut().expect("list generator").elements = vec![
        serde_json::json!({"name": "a", "stage": "one"}).as_object().unwrap().clone(),
        serde_json::json!({"name": "b", "stage": "two"}).as_object().unwrap().clone(),
    ];
    set.spec.template.metadata.labels = [("stage".to_string(), "{{stage}}".to_string())].into();
    let step = |stage: &str| ApplicationSetRolloutStep {
        match_expressions: vec![ApplicationMatchExpression {
            key: "stage".into(),
            operator: "In".into(),
            values: vec![stage.into()],
        }],
        max_update: None,
    };
    set.spec.strategy = Some(ApplicationSetStrategy {
        strategy_type: ApplicationSetStrategyType::RollingSync,
        rolling_sync: Some(ApplicationSetRolloutStrategy {
            steps: vec![step("one"), step("two")],
        }),
        deletion_order: Some("Reverse".into()),
    });
    set.metadata.finalizers = Some(vec![RESOURCES_FINALIZER.into()]);
    set
}

#[tokio::test]
async fn reverse_teardown_drains_steps_backwards() {
    let (store, ctx) = harness();
    store.seed_app_set(two_step_app_set());

    run_reconcile(&store, &ctx).await.expect("create reconcile");
    for name in ["a", "b"] {
        set_app_status(&store, name, HealthStatusCode::Healthy, SyncStatusCode::Synced, None).await;
    }
    // record step assignments in the parent status
    run_reconcile(&store, &ctx).await.expect("status reconcile");

    let mut set = get_set(&store).await;
    set.metadata.deletion_timestamp = Some(Time(Utc::now()));
    store.seed_app_set(set);

    // step 2 drains before step 1
    let action = run_reconcile(&store, &ctx).await.expect("first teardown round");
    assert_requeue(&action, 10);
    assert!(store.get_app(NS, "b").await.unwrap().is_none(), "b goes first");
    assert!(
        store.get_app(NS, "a").await.unwrap().is_some(),
        "a must outlive the later step"
    );

    let action = run_reconcile(&store, &ctx).await.expect("second teardown round");
    assert_requeue(&action, 10);
    assert!(store.get_app(NS, "a").await.unwrap().is_none());

    // with every child gone the finalizer is released
    run_reconcile(&store, &ctx).await.expect("final teardown round");
    let set = get_set(&store).await;
    assert!(set.finalizers().is_empty());
}

#[tokio::test]
async fn stalled_reverse_teardown_is_a_hard_error() {
    let (store, ctx) = harness();
    store.seed_app_set(two_step_app_set());
    run_reconcile(&store, &ctx).await.expect("create reconcile");
    // record step assignments before tearing down
    run_reconcile(&store, &ctx).await.expect("status reconcile");

    // b keeps a foreign finalizer, so deletion only marks it
    let mut b = store.get_app(NS, "b").await.unwrap().expect("b exists");
    b.metadata.finalizers = Some(vec!["post-delete-finalizer.argocd.argoproj.io/x".into()]);
    store.seed_app(b);

    let mut set = get_set(&store).await;
    set.metadata.deletion_timestamp = Some(Time(Utc::now()));
    store.seed_app_set(set);

    let action = run_reconcile(&store, &ctx).await.expect("marking round");
    assert_requeue(&action, 10);
    let marked = store.get_app(NS, "b").await.unwrap().expect("b still live");
    assert!(marked.metadata.deletion_timestamp.is_some());

    // a fresh mark means waiting, not failing, and the earlier step stays live
    let action = run_reconcile(&store, &ctx).await.expect("waiting round");
    assert_requeue(&action, 10);
    assert!(store.get_app(NS, "a").await.unwrap().is_some());

    // backdate the mark beyond the stall budget
    let mut stuck = store.get_app(NS, "b").await.unwrap().expect("b still live");
    stuck.metadata.deletion_timestamp = Some(Time(Utc::now() - ChronoDuration::minutes(3)));
    store.seed_app(stuck);

    let err = run_reconcile(&store, &ctx).await.expect_err("stall must surface");
    assert!(matches!(err, Error::TeardownStalled { .. }));
    assert!(
        store.get_app(NS, "a").await.unwrap().is_some(),
        "a child of an earlier step is never deleted while a later step is stuck"
    );
}

#[tokio::test]
async fn refresh_annotation_is_acknowledged() {
    let (store, ctx) = harness();
    let mut set = list_app_set(&["a"]);
    set.metadata.annotations = Some([(REFRESH_ANNOTATION.to_string(), "true".to_string())].into());
    store.seed_app_set(set);

    run_reconcile(&store, &ctx).await.expect("reconcile succeeds");
    let set = get_set(&store).await;
    assert!(
        !set.annotations().contains_key(REFRESH_ANNOTATION),
        "the refresh request must be acknowledged"
    );
}

#[tokio::test]
async fn switching_off_rolling_sync_clears_rollout_state() {
    let (store, ctx) = harness();
    let mut set = list_app_set(&["a"]);
    set.status = Some(appset_core::ApplicationSetStatus {
        application_status: vec![ApplicationSetApplicationStatus {
            application: "a".into(),
            step: 1,
            status: RolloutState::Healthy,
            message: String::new(),
            last_transition_time: None,
            target_revisions: Some(vec![]),
        }],
        ..Default::default()
    });
    store.seed_app_set(set);

    run_reconcile(&store, &ctx).await.expect("reconcile succeeds");
    let set = get_set(&store).await;
    assert!(
        set.status.as_ref().unwrap().application_status.is_empty(),
        "stale rollout state must be cleared in one update"
    );
    assert_eq!(condition_status(&set, ApplicationSetConditionType::RolloutProgressing), None);
}

#[tokio::test]
async fn legacy_status_entries_are_migrated_once() {
    let (store, ctx) = harness();
    store.seed_app_set(rolling_app_set(&["a"]));
    run_reconcile(&store, &ctx).await.expect("create reconcile");

    // a pre-existing entry written before targetRevisions existed
    let mut set = get_set(&store).await;
    set.status = Some(appset_core::ApplicationSetStatus {
        application_status: vec![ApplicationSetApplicationStatus {
            application: "a".into(),
            step: 1,
            status: RolloutState::Waiting,
            message: String::new(),
            last_transition_time: None,
            target_revisions: None,
        }],
        ..Default::default()
    });
    store.seed_app_set(set);

    run_reconcile(&store, &ctx).await.expect("migration reconcile");
    let set = get_set(&store).await;
    let entry = set
        .status
        .as_ref()
        .unwrap()
        .application_status
        .iter()
        .find(|a| a.application == "a")
        .expect("entry survives");
    assert_eq!(entry.target_revisions, Some(vec![]));
}

struct PanickingStore;

#[async_trait]
impl Store for PanickingStore {
    async fn get_app_set(&self, _: &str, _: &str) -> Result<Option<ApplicationSet>, StoreError> {
        panic!("store exploded")
    }

    async fn update_app_set(&self, _: &ApplicationSet) -> Result<ApplicationSet, StoreError> {
        panic!("store exploded")
    }

    async fn update_app_set_status(&self, _: &ApplicationSet) -> Result<ApplicationSet, StoreError> {
        panic!("store exploded")
    }

    async fn patch_app_set(
        &self,
        _: &str,
        _: &str,
        _: &serde_json::Value,
    ) -> Result<ApplicationSet, StoreError> {
        panic!("store exploded")
    }

    async fn get_app(&self, _: &str, _: &str) -> Result<Option<Application>, StoreError> {
        panic!("store exploded")
    }

    async fn list_owned_apps(&self, _: &ApplicationSet) -> Result<Vec<Application>, StoreError> {
        panic!("store exploded")
    }

    async fn create_app(&self, _: &Application) -> Result<Application, StoreError> {
        panic!("store exploded")
    }

    async fn update_app(&self, _: &Application) -> Result<Application, StoreError> {
        panic!("store exploded")
    }

    async fn patch_app(
        &self,
        _: &str,
        _: &str,
        _: &serde_json::Value,
    ) -> Result<Application, StoreError> {
        panic!("store exploded")
    }

    async fn delete_app(&self, _: &str, _: &str) -> Result<(), StoreError> {
        panic!("store exploded")
    }
}

#[tokio::test]
async fn panics_never_cross_the_reconciler_boundary() {
    let clusters = Arc::new(ClusterSet::default());
    let ctx = Arc::new(Context {
        store: Arc::new(PanickingStore),
        clusters: clusters.clone(),
        projects: Arc::new(ProjectSet::default()),
        generators: GeneratorRegistry::new(clusters),
        settings: Settings::default(),
    });
    let err = reconcile(Arc::new(list_app_set(&["a"])), ctx).await.expect_err("panic surfaces as error");
    match err {
        Error::Panicked(message) => assert!(message.contains("store exploded")),
        other => panic!("expected a panic error, got {other:?}"),
    }
}
