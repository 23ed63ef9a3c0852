//! The list generator: parameter maps written inline on the parent.

use super::{Generator, GeneratorError, GeneratorParams};
use appset_core::{ApplicationSet, ApplicationSetGenerator, ApplicationSetTemplate};
use async_trait::async_trait;
use std::time::Duration;

/// Serves `spec.generators[].list`
pub struct ListGenerator;

#[async_trait]
impl Generator for ListGenerator {
    fn handles(&self, entry: &ApplicationSetGenerator) -> bool {
        entry.list.is_some()
    }

    async fn generate_params(
        &self,
        entry: &ApplicationSetGenerator,
        _set: &ApplicationSet,
    ) -> Result<Vec<GeneratorParams>, GeneratorError> {
        let spec = entry.list.as_ref().ok_or(GeneratorError::EmptySpec)?;
        Ok(spec.elements.clone())
    }

    fn requeue_after(&self, _entry: &ApplicationSetGenerator) -> Option<Duration> {
        None
    }

    fn template(&self, entry: &ApplicationSetGenerator) -> Option<ApplicationSetTemplate> {
        entry.list.as_ref().and_then(|l| l.template.clone())
    }
}
