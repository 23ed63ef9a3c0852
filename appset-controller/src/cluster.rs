//! Destination cluster registry.
//!
//! Desired applications name their destination by server URL or by registered
//! cluster name; validation and the pre-delete finalizer fixup both need to
//! know whether that destination actually resolves to a known cluster.

use appset_core::application::ApplicationDestination;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// A registered destination cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cluster {
    /// Registered name
    pub name: String,
    /// API server URL
    pub server: String,
    /// Labels, consumed by the clusters generator
    pub labels: BTreeMap<String, String>,
}

/// Why a destination did not resolve
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Neither name nor server given
    #[error("application destination is missing both name and server")]
    Unspecified,

    /// Both name and server given; the destination is ambiguous
    #[error("application destination can't have both name and server defined: {name} {server}")]
    Ambiguous {
        /// The given cluster name
        name: String,
        /// The given server URL
        server: String,
    },

    /// No cluster registered under the given name
    #[error("there are no clusters with this name: {0}")]
    UnknownName(String),

    /// No cluster registered for the given server
    #[error("there are no clusters with this server: {0}")]
    UnknownServer(String),
}

/// Read access to the cluster registry
#[async_trait]
pub trait ClusterResolver: Send + Sync {
    /// Resolve a destination to a registered cluster
    async fn resolve(&self, destination: &ApplicationDestination) -> Result<Cluster, ResolveError>;

    /// Every registered cluster
    async fn list(&self) -> Vec<Cluster>;
}

/// A fixed cluster inventory, configured at startup
#[derive(Clone, Debug, Default)]
pub struct ClusterSet {
    clusters: Vec<Cluster>,
}

impl ClusterSet {
    /// Build from an inventory
    pub fn new(clusters: Vec<Cluster>) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl ClusterResolver for ClusterSet {
    async fn resolve(&self, destination: &ApplicationDestination) -> Result<Cluster, ResolveError> {
        match (destination.name.is_empty(), destination.server.is_empty()) {
            (true, true) => Err(ResolveError::Unspecified),
            (false, false) => Err(ResolveError::Ambiguous {
                name: destination.name.clone(),
                server: destination.server.clone(),
            }),
            (false, true) => self
                .clusters
                .iter()
                .find(|c| c.name == destination.name)
                .cloned()
                .ok_or_else(|| ResolveError::UnknownName(destination.name.clone())),
            (true, false) => self
                .clusters
                .iter()
                .find(|c| c.server == destination.server)
                .cloned()
                .ok_or_else(|| ResolveError::UnknownServer(destination.server.clone())),
        }
    }

    async fn list(&self) -> Vec<Cluster> {
        self.clusters.clone()
    }
}
