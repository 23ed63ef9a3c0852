//! The clusters generator: one parameter map per registered cluster.

use super::{Generator, GeneratorError, GeneratorParams};
use crate::cluster::ClusterResolver;
use appset_core::{
    selector::Selector, ApplicationSet, ApplicationSetGenerator, ApplicationSetTemplate,
};
use async_trait::async_trait;
use serde_json::json;
use std::{sync::Arc, time::Duration};

/// Serves `spec.generators[].clusters`
pub struct ClustersGenerator {
    clusters: Arc<dyn ClusterResolver>,
}

impl ClustersGenerator {
    /// Generator reading from the given registry
    pub fn new(clusters: Arc<dyn ClusterResolver>) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl Generator for ClustersGenerator {
    fn handles(&self, entry: &ApplicationSetGenerator) -> bool {
        entry.clusters.is_some()
    }

    async fn generate_params(
        &self,
        entry: &ApplicationSetGenerator,
        _set: &ApplicationSet,
    ) -> Result<Vec<GeneratorParams>, GeneratorError> {
        let spec = entry.clusters.as_ref().ok_or(GeneratorError::EmptySpec)?;
        let selector = spec.selector.as_ref().map(Selector::from);
        let mut params = Vec::new();
        for cluster in self.clusters.list().await {
            if let Some(selector) = &selector {
                if !selector.matches(&cluster.labels) {
                    continue;
                }
            }
            let mut map = GeneratorParams::new();
            map.insert("name".into(), json!(cluster.name));
            map.insert("server".into(), json!(cluster.server));
            map.insert("metadata".into(), json!({ "labels": cluster.labels }));
            params.push(map);
        }
        Ok(params)
    }

    fn requeue_after(&self, _entry: &ApplicationSetGenerator) -> Option<Duration> {
        None
    }

    fn template(&self, entry: &ApplicationSetGenerator) -> Option<ApplicationSetTemplate> {
        entry.clusters.as_ref().and_then(|c| c.template.clone())
    }
}
