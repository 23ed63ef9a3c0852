//! Project registry.
//!
//! Every generated application names a project; validation rejects children
//! whose project is not registered, the same way unresolvable destinations
//! are rejected through the cluster registry.

use async_trait::async_trait;
use thiserror::Error;

/// Why a project did not resolve
#[derive(Debug, Error)]
pub enum ProjectResolveError {
    /// No project registered under the given name
    #[error("application project {0:?} does not exist")]
    Unknown(String),
}

/// Read access to the project registry
#[async_trait]
pub trait ProjectResolver: Send + Sync {
    /// Resolve a project name, erroring when it is not registered
    async fn resolve(&self, name: &str) -> Result<(), ProjectResolveError>;
}

/// A fixed project inventory, configured at startup
#[derive(Clone, Debug)]
pub struct ProjectSet {
    projects: Vec<String>,
}

impl ProjectSet {
    /// Build from an inventory
    pub fn new(projects: Vec<String>) -> Self {
        Self { projects }
    }
}

impl Default for ProjectSet {
    /// An inventory holding only the default project
    fn default() -> Self {
        Self::new(vec![appset_core::application::DEFAULT_PROJECT.to_string()])
    }
}

#[async_trait]
impl ProjectResolver for ProjectSet {
    async fn resolve(&self, name: &str) -> Result<(), ProjectResolveError> {
        if self.projects.iter().any(|p| p == name) {
            Ok(())
        } else {
            Err(ProjectResolveError::Unknown(name.to_string()))
        }
    }
}
