//! Watch predicates deciding which events enqueue a parent.
//!
//! The reconciler writes the objects it watches, so unfiltered events feed
//! straight back into the queue. The predicates compare the fields this
//! controller reacts to and drop everything else:
//!
//! - child creates are our own writes and never trigger;
//! - child deletes always trigger;
//! - child updates trigger on changes to spec, labels, annotations or
//!   finalizers, and with progressive sync also on changes to health, sync
//!   state, or the operation phase;
//! - parent updates trigger on spec, label, finalizer or deletion-timestamp
//!   changes, and on annotation changes unless the only change is the refresh
//!   annotation being acknowledged.
//!
//! [`LastSeen`] adapts single-object watch events into the old/new pairs the
//! predicates consume.

use crate::util::{lists_equal, maps_equal};
use appset_core::{appset::REFRESH_ANNOTATION, Application, ApplicationSet};
use kube::{Resource, ResourceExt};
use std::collections::HashMap;

/// A freshly created child never triggers its own parent; the write that
/// created it came from this controller
pub fn application_created(_app: &Application) -> bool {
    false
}

/// A deleted child always reconciles the parent
pub fn application_deleted(_app: &Application) -> bool {
    true
}

/// Whether a child update is one the parent must react to
pub fn application_updated(old: &Application, new: &Application, progressive: bool) -> bool {
    if old.spec != new.spec
        || !maps_equal(old.metadata.labels.as_ref(), new.metadata.labels.as_ref())
        || !maps_equal(old.metadata.annotations.as_ref(), new.metadata.annotations.as_ref())
        || !lists_equal(old.metadata.finalizers.as_ref(), new.metadata.finalizers.as_ref())
    {
        return true;
    }
    if !progressive {
        return false;
    }
    let operation_progress = |app: &Application| {
        app.status
            .as_ref()
            .and_then(|s| s.operation_state.as_ref())
            .map(|o| (o.phase, o.started_at.clone()))
    };
    old.health_status() != new.health_status()
        || old.sync_status() != new.sync_status()
        || operation_progress(old) != operation_progress(new)
}

/// Whether a parent update warrants a reconcile
pub fn app_set_updated(old: &ApplicationSet, new: &ApplicationSet) -> bool {
    if old.spec != new.spec
        || !maps_equal(old.metadata.labels.as_ref(), new.metadata.labels.as_ref())
        || !lists_equal(old.metadata.finalizers.as_ref(), new.metadata.finalizers.as_ref())
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
    {
        return true;
    }
    if !maps_equal(old.metadata.annotations.as_ref(), new.metadata.annotations.as_ref()) {
        // acknowledging a refresh is our own write; requeueing it would ping-pong
        let mut acknowledged = old.annotations().clone();
        let had_refresh = acknowledged.remove(REFRESH_ANNOTATION).is_some();
        return !(had_refresh && acknowledged == *new.annotations());
    }
    false
}

/// Whether an object belongs to a namespace this controller serves; an empty
/// allow-list serves everything
pub fn namespace_allowed(namespace: Option<&str>, allowed: &[String]) -> bool {
    allowed.is_empty() || namespace.is_some_and(|ns| allowed.iter().any(|a| a == ns))
}

/// Remembers the last seen version of every object so watch events can be
/// evaluated as old/new pairs
#[derive(Default)]
pub struct LastSeen<K> {
    seen: HashMap<(String, String), K>,
}

impl<K> LastSeen<K>
where
    K: Resource<DynamicType = ()> + Clone,
{
    /// An empty cache
    pub fn new() -> Self {
        Self { seen: HashMap::new() }
    }

    /// Record `obj` and return the previously seen version, if any
    pub fn swap(&mut self, obj: &K) -> Option<K> {
        let key = (obj.meta().namespace.clone().unwrap_or_default(), obj.name_any());
        self.seen.insert(key, obj.clone())
    }

    /// Forget a deleted object
    pub fn forget(&mut self, obj: &K) {
        let key = (obj.meta().namespace.clone().unwrap_or_default(), obj.name_any());
        self.seen.remove(&key);
    }
}
