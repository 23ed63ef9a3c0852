//! Typed access to the parent and child resources.
//!
//! The reconciler only ever talks to a [`Store`]; the production
//! implementation ([`KubeStore`]) is a thin wrapper over `kube::Api`, while
//! [`MemStore`] keeps everything in process memory with the same
//! resourceVersion-based conflict behaviour and backs the scenario tests.
//!
//! Kubernetes writes are optimistic: a mutation observed at resourceVersion N
//! fails with a conflict if someone else wrote N+1 first. That contract is
//! deliberately visible here rather than hidden behind a transaction
//! abstraction; [`update_status_with_retry`] is the one helper that re-reads,
//! re-applies and retries.

use appset_core::{Application, ApplicationSet};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use kube::ResourceExt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

mod client;
mod mem;

pub use client::KubeStore;
pub use mem::MemStore;

/// Attempts per optimistic-concurrency write, the initial read included
pub const CONFLICT_RETRY_ATTEMPTS: u32 = 5;

/// Failures talking to the object store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist; benign on reads during teardown
    #[error("object not found")]
    NotFound,

    /// The write raced a concurrent update of the same object
    #[error("write conflicted with a concurrent update")]
    Conflict,

    /// A create hit an existing object
    #[error("object already exists")]
    AlreadyExists,

    /// The object could not be serialized for the wire
    #[error("failed to serialize object: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other api failure
    #[error("api error: {0}")]
    Api(#[source] Box<kube::Error>),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => StoreError::NotFound,
            kube::Error::Api(response) if response.reason == "AlreadyExists" => StoreError::AlreadyExists,
            kube::Error::Api(response) if response.code == 409 => StoreError::Conflict,
            _ => StoreError::Api(Box::new(err)),
        }
    }
}

/// Typed object store operations the reconciler depends on.
///
/// Listing children goes through the "owned by parent" relation; the harness
/// declares that index at startup by watching children through the owner
/// reference (see [`run`](crate::reconciler::run)).
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a parent, `None` when it is gone
    async fn get_app_set(&self, namespace: &str, name: &str) -> Result<Option<ApplicationSet>, StoreError>;

    /// Replace a parent's metadata and spec
    async fn update_app_set(&self, set: &ApplicationSet) -> Result<ApplicationSet, StoreError>;

    /// Replace a parent's status subresource
    async fn update_app_set_status(&self, set: &ApplicationSet) -> Result<ApplicationSet, StoreError>;

    /// Apply a JSON merge patch to a parent
    async fn patch_app_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<ApplicationSet, StoreError>;

    /// Fetch a child, `None` when it is gone
    async fn get_app(&self, namespace: &str, name: &str) -> Result<Option<Application>, StoreError>;

    /// Children controlled by the given parent
    async fn list_owned_apps(&self, set: &ApplicationSet) -> Result<Vec<Application>, StoreError>;

    /// Create a child
    async fn create_app(&self, app: &Application) -> Result<Application, StoreError>;

    /// Replace a child at the resourceVersion it carries
    async fn update_app(&self, app: &Application) -> Result<Application, StoreError>;

    /// Apply a JSON merge patch to a child
    async fn patch_app(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Application, StoreError>;

    /// Delete a child; finalizers may keep it around with a deletion timestamp
    async fn delete_app(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Whether `set` is the controlling owner of `app`
pub(crate) fn controlled_by(app: &Application, set: &ApplicationSet) -> bool {
    let Some(uid) = set.uid() else { return false };
    app.owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

fn conflict_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(10))
        .with_multiplier(1.0)
        .with_randomization_factor(0.1)
        .with_max_elapsed_time(None)
        .build()
}

/// Re-read the parent, apply `mutate` to the fresh copy, and write its status,
/// retrying conflicts up to [`CONFLICT_RETRY_ATTEMPTS`] times with a short
/// jittered backoff.
pub async fn update_status_with_retry<F>(
    store: &dyn Store,
    set: &ApplicationSet,
    mutate: F,
) -> Result<ApplicationSet, StoreError>
where
    F: Fn(&mut ApplicationSet) + Send + Sync,
{
    let namespace = set.namespace().unwrap_or_default();
    let name = set.name_any();
    let mut backoff = conflict_backoff();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut latest = store
            .get_app_set(&namespace, &name)
            .await?
            .ok_or(StoreError::NotFound)?;
        mutate(&mut latest);
        match store.update_app_set_status(&latest).await {
            Err(StoreError::Conflict) if attempt < CONFLICT_RETRY_ATTEMPTS => {
                debug!(%name, attempt, "status write conflicted, retrying");
                if let Some(delay) = backoff.next_backoff() {
                    tokio::time::sleep(delay).await;
                }
            }
            other => return other,
        }
    }
}
