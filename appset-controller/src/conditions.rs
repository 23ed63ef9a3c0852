//! Persisting parent conditions.
//!
//! The cross-consistency rules live in `appset_core::conditions`; this module
//! only decides whether a write is needed and performs it under the
//! optimistic-concurrency retry discipline. Condition writes are best-effort:
//! a failure is logged and swallowed, the next reconcile recomputes the set.

use crate::store::{update_status_with_retry, Store};
use appset_core::{
    conditions::ApplicationSetConditionType, ApplicationSet, ApplicationSetCondition,
    ApplicationSetStatus, ConditionBatch,
};
use tracing::warn;

/// Fold one evaluated condition into the parent status.
///
/// `parameters_generated` is mirrored into the `ParametersGenerated` record;
/// the `RolloutProgressing` record is dropped whenever progressive sync is not
/// active. The store write is skipped when the resulting set is identical over
/// type, reason, status and message, in order.
pub async fn set_condition(
    store: &dyn Store,
    set: &mut ApplicationSet,
    condition: ApplicationSetCondition,
    parameters_generated: bool,
) {
    let mut batch = ConditionBatch::expand(condition, parameters_generated);
    if !set.progressive_sync_active() {
        batch.remove(ApplicationSetConditionType::RolloutProgressing);
    }

    let mut next = set.status.clone().unwrap_or_default();
    next.set_conditions(batch.clone());
    let current = set.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[]);
    if ApplicationSetStatus::conditions_equivalent(current, &next.conditions) {
        return;
    }

    let result = update_status_with_retry(store, set, |latest| {
        latest
            .status
            .get_or_insert_with(Default::default)
            .set_conditions(batch.clone());
    })
    .await;
    match result {
        Ok(updated) => {
            set.metadata.resource_version = updated.metadata.resource_version.clone();
            set.status = updated.status;
        }
        Err(err) => warn!(%err, "unable to set application set condition"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use appset_core::{
        appset::ApplicationSetSpec,
        conditions::{
            ApplicationSetConditionStatus, REASON_APPLICATION_SET_UP_TO_DATE,
        },
    };

    fn seeded(store: &MemStore) -> ApplicationSet {
        let mut set = ApplicationSet::new("guestbook", ApplicationSetSpec::default());
        set.metadata.namespace = Some("argocd".into());
        store.seed_app_set(set)
    }

    #[tokio::test]
    async fn identical_outcomes_do_not_write() {
        let store = MemStore::new();
        let mut set = seeded(&store);

        let condition = ApplicationSetCondition::new(
            ApplicationSetConditionType::ResourcesUpToDate,
            ApplicationSetConditionStatus::True,
            REASON_APPLICATION_SET_UP_TO_DATE,
            "All applications have been generated successfully",
        );
        set_condition(&store, &mut set, condition.clone(), true).await;
        let after_first = store.writes();
        assert!(after_first > 0);

        set_condition(&store, &mut set, condition, true).await;
        assert_eq!(store.writes(), after_first, "unchanged condition set must not write");

        // the persisted copy carries the paired ErrorOccurred=False
        let stored = store.get_app_set("argocd", "guestbook").await.unwrap().unwrap();
        let conditions = stored.status.unwrap().conditions;
        assert!(conditions
            .iter()
            .any(|c| c.condition_type == ApplicationSetConditionType::ErrorOccurred
                && c.status == ApplicationSetConditionStatus::False));
        assert!(
            !conditions
                .iter()
                .any(|c| c.condition_type == ApplicationSetConditionType::RolloutProgressing),
            "progressive sync is off, no rollout condition"
        );
    }
}
