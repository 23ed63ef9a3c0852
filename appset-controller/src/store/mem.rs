//! An in-process [`Store`] with the same optimistic concurrency behaviour as
//! the real api server.
//!
//! Writes bump a shared resourceVersion counter and replacements carrying a
//! stale version fail with [`StoreError::Conflict`]. Deletes honour
//! finalizers: an object that still carries any is only marked with a deletion
//! timestamp. The write counter lets tests assert that a converged reconcile
//! performs no writes at all.

use super::{controlled_by, Store, StoreError};
use appset_core::{Application, ApplicationSet};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    sync::Mutex,
};

type Key = (String, String);

#[derive(Default)]
struct Inner {
    app_sets: BTreeMap<Key, ApplicationSet>,
    apps: BTreeMap<Key, Application>,
    revision: u64,
    writes: u64,
}

impl Inner {
    fn stamp(&mut self, meta: &mut ObjectMeta) {
        self.revision += 1;
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", self.revision));
        }
        meta.resource_version = Some(self.revision.to_string());
    }
}

/// In-memory object store
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parent directly, assigning uid and resourceVersion
    pub fn seed_app_set(&self, mut set: ApplicationSet) -> ApplicationSet {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.stamp(&mut set.metadata);
        let key = object_key(&set.metadata);
        inner.app_sets.insert(key, set.clone());
        set
    }

    /// Insert a child directly, assigning uid and resourceVersion
    pub fn seed_app(&self, mut app: Application) -> Application {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.stamp(&mut app.metadata);
        let key = object_key(&app.metadata);
        inner.apps.insert(key, app.clone());
        app
    }

    /// Number of mutations performed so far
    pub fn writes(&self) -> u64 {
        self.inner.lock().expect("store poisoned").writes
    }
}

fn object_key(meta: &ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn check_revision(stored: &ObjectMeta, incoming: &ObjectMeta) -> Result<(), StoreError> {
    match &incoming.resource_version {
        Some(version) if Some(version) != stored.resource_version.as_ref() => Err(StoreError::Conflict),
        _ => Ok(()),
    }
}

fn merge_patch<T>(stored: &T, patch: &serde_json::Value) -> Result<T, StoreError>
where
    T: Serialize + DeserializeOwned,
{
    let mut doc = serde_json::to_value(stored)?;
    json_patch::merge(&mut doc, patch);
    Ok(serde_json::from_value(doc)?)
}

#[async_trait]
impl Store for MemStore {
    async fn get_app_set(&self, namespace: &str, name: &str) -> Result<Option<ApplicationSet>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner.app_sets.get(&(namespace.into(), name.into())).cloned())
    }

    async fn update_app_set(&self, set: &ApplicationSet) -> Result<ApplicationSet, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let key = object_key(&set.metadata);
        let stored = inner.app_sets.get(&key).ok_or(StoreError::NotFound)?;
        check_revision(&stored.metadata, &set.metadata)?;
        // replacing the main resource leaves status untouched
        let mut next = set.clone();
        next.status = stored.status.clone();
        inner.stamp(&mut next.metadata);
        inner.writes += 1;
        inner.app_sets.insert(key, next.clone());
        Ok(next)
    }

    async fn update_app_set_status(&self, set: &ApplicationSet) -> Result<ApplicationSet, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let key = object_key(&set.metadata);
        let stored = inner.app_sets.get(&key).ok_or(StoreError::NotFound)?;
        check_revision(&stored.metadata, &set.metadata)?;
        // the status subresource only moves status
        let mut next = stored.clone();
        next.status = set.status.clone();
        inner.stamp(&mut next.metadata);
        inner.writes += 1;
        inner.app_sets.insert(key, next.clone());
        Ok(next)
    }

    async fn patch_app_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<ApplicationSet, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let key = (namespace.to_string(), name.to_string());
        let stored = inner.app_sets.get(&key).ok_or(StoreError::NotFound)?;
        let mut next: ApplicationSet = merge_patch(stored, patch)?;
        inner.stamp(&mut next.metadata);
        inner.writes += 1;
        inner.app_sets.insert(key, next.clone());
        Ok(next)
    }

    async fn get_app(&self, namespace: &str, name: &str) -> Result<Option<Application>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner.apps.get(&(namespace.into(), name.into())).cloned())
    }

    async fn list_owned_apps(&self, set: &ApplicationSet) -> Result<Vec<Application>, StoreError> {
        let inner = self.inner.lock().expect("store poisoned");
        Ok(inner
            .apps
            .values()
            .filter(|app| app.namespace() == set.namespace() && controlled_by(app, set))
            .cloned()
            .collect())
    }

    async fn create_app(&self, app: &Application) -> Result<Application, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let key = object_key(&app.metadata);
        if inner.apps.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        let mut next = app.clone();
        inner.stamp(&mut next.metadata);
        inner.writes += 1;
        inner.apps.insert(key, next.clone());
        Ok(next)
    }

    async fn update_app(&self, app: &Application) -> Result<Application, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let key = object_key(&app.metadata);
        let stored = inner.apps.get(&key).ok_or(StoreError::NotFound)?;
        check_revision(&stored.metadata, &app.metadata)?;
        let mut next = app.clone();
        next.status = stored.status.clone();
        inner.stamp(&mut next.metadata);
        inner.writes += 1;
        inner.apps.insert(key, next.clone());
        Ok(next)
    }

    async fn patch_app(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Application, StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let key = (namespace.to_string(), name.to_string());
        let stored = inner.apps.get(&key).ok_or(StoreError::NotFound)?;
        let mut next: Application = merge_patch(stored, patch)?;
        inner.stamp(&mut next.metadata);
        inner.writes += 1;
        inner.apps.insert(key, next.clone());
        Ok(next)
    }

    async fn delete_app(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store poisoned");
        let key = (namespace.to_string(), name.to_string());
        let Some(stored) = inner.apps.get(&key) else {
            return Err(StoreError::NotFound);
        };
        if stored.finalizers().is_empty() {
            inner.writes += 1;
            inner.apps.remove(&key);
        } else if stored.metadata.deletion_timestamp.is_none() {
            let mut next = stored.clone();
            next.metadata.deletion_timestamp = Some(Time(Utc::now()));
            inner.stamp(&mut next.metadata);
            inner.writes += 1;
            inner.apps.insert(key, next);
        }
        Ok(())
    }
}
