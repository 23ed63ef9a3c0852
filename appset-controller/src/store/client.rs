//! The production [`Store`] backed by the cluster api.

use super::{controlled_by, Store, StoreError};
use appset_core::{Application, ApplicationSet};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};

/// `kube::Api` based object store
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn app_sets(&self, namespace: &str) -> Api<ApplicationSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn apps(&self, namespace: &str) -> Api<Application> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get_app_set(&self, namespace: &str, name: &str) -> Result<Option<ApplicationSet>, StoreError> {
        Ok(self.app_sets(namespace).get_opt(name).await?)
    }

    async fn update_app_set(&self, set: &ApplicationSet) -> Result<ApplicationSet, StoreError> {
        let namespace = set.namespace().unwrap_or_default();
        Ok(self
            .app_sets(&namespace)
            .replace(&set.name_any(), &PostParams::default(), set)
            .await?)
    }

    async fn update_app_set_status(&self, set: &ApplicationSet) -> Result<ApplicationSet, StoreError> {
        let namespace = set.namespace().unwrap_or_default();
        let body = serde_json::to_vec(set)?;
        Ok(self
            .app_sets(&namespace)
            .replace_status(&set.name_any(), &PostParams::default(), body)
            .await?)
    }

    async fn patch_app_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<ApplicationSet, StoreError> {
        Ok(self
            .app_sets(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn get_app(&self, namespace: &str, name: &str) -> Result<Option<Application>, StoreError> {
        Ok(self.apps(namespace).get_opt(name).await?)
    }

    async fn list_owned_apps(&self, set: &ApplicationSet) -> Result<Vec<Application>, StoreError> {
        let namespace = set.namespace().unwrap_or_default();
        let apps = self.apps(&namespace).list(&ListParams::default()).await?;
        Ok(apps.items.into_iter().filter(|app| controlled_by(app, set)).collect())
    }

    async fn create_app(&self, app: &Application) -> Result<Application, StoreError> {
        let namespace = app.namespace().unwrap_or_default();
        Ok(self.apps(&namespace).create(&PostParams::default(), app).await?)
    }

    async fn update_app(&self, app: &Application) -> Result<Application, StoreError> {
        let namespace = app.namespace().unwrap_or_default();
        Ok(self
            .apps(&namespace)
            .replace(&app.name_any(), &PostParams::default(), app)
            .await?)
    }

    async fn patch_app(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Application, StoreError> {
        Ok(self
            .apps(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete_app(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.apps(namespace).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
