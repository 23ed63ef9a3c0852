//! Parameter generators.
//!
//! A generator turns its spec fragment on the parent into a list of parameter
//! maps, one desired application each. The engine only depends on the
//! [`Generator`] contract; `list` and `clusters` ship in tree, everything else
//! (git, matrix, merge, ...) is registered by the embedder. An entry whose
//! fragment no registered implementation serves fails generation with a typed
//! error rather than being silently skipped.

use crate::cluster::ClusterResolver;
use appset_core::{ApplicationSet, ApplicationSetGenerator, ApplicationSetTemplate};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

mod clusters;
mod list;

pub use clusters::ClustersGenerator;
pub use list::ListGenerator;

/// One parameter map, rendered into one application
pub type GeneratorParams = Map<String, Value>;

/// Failures producing parameters
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// The entry does not carry the fragment this generator serves
    #[error("generator spec is empty")]
    EmptySpec,

    /// No registered generator serves the entry
    #[error("no generator found for the given generator spec")]
    NoGeneratorFound,

    /// The generator's upstream could not be read
    #[error("failed to read generator source: {0}")]
    SourceUnavailable(String),
}

/// The generator contract
#[async_trait]
pub trait Generator: Send + Sync {
    /// Whether this implementation serves the entry's fragment
    fn handles(&self, entry: &ApplicationSetGenerator) -> bool;

    /// Produce one parameter map per desired application
    async fn generate_params(
        &self,
        entry: &ApplicationSetGenerator,
        set: &ApplicationSet,
    ) -> Result<Vec<GeneratorParams>, GeneratorError>;

    /// How soon the generator wants to be re-evaluated, `None` for event-driven only
    fn requeue_after(&self, entry: &ApplicationSetGenerator) -> Option<Duration>;

    /// Template fragment overriding the parent template for this entry
    fn template(&self, entry: &ApplicationSetGenerator) -> Option<ApplicationSetTemplate>;
}

/// Looks up generator implementations by spec fragment
pub struct GeneratorRegistry {
    generators: Vec<Box<dyn Generator>>,
}

impl GeneratorRegistry {
    /// A registry with the in-tree generators
    pub fn new(clusters: Arc<dyn ClusterResolver>) -> Self {
        Self {
            generators: vec![
                Box::new(ListGenerator),
                Box::new(ClustersGenerator::new(clusters)),
            ],
        }
    }

    /// Register an out-of-tree generator implementation
    pub fn register(&mut self, generator: Box<dyn Generator>) {
        self.generators.push(generator);
    }

    /// The implementation serving the entry's fragment
    pub fn lookup(&self, entry: &ApplicationSetGenerator) -> Result<&dyn Generator, GeneratorError> {
        self.generators
            .iter()
            .map(AsRef::as_ref)
            .find(|g| g.handles(entry))
            .ok_or(GeneratorError::NoGeneratorFound)
    }

    /// The smallest non-zero requeue requested by any resolvable entry on the
    /// parent, `None` when every generator is event-driven
    pub fn min_requeue_after(&self, set: &ApplicationSet) -> Option<Duration> {
        set.spec
            .generators
            .iter()
            .filter_map(|entry| self.lookup(entry).ok().and_then(|g| g.requeue_after(entry)))
            .filter(|d| !d.is_zero())
            .min()
    }
}
