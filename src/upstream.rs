//! Upstream cluster registry.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::stats::{Scope, Store};

/// An upstream cluster and its statistics scope.
#[derive(Debug)]
pub struct ClusterInfo {
    name: String,
    stats_scope: Scope,
}

impl ClusterInfo {
    /// Create a cluster whose stats live under `cluster.<name>.`.
    pub fn new(name: impl Into<String>, store: &Arc<Store>) -> Self {
        let name = name.into();
        let stats_scope = store.scope(&format!("cluster.{}", name));
        Self { name, stats_scope }
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Statistics scope of the cluster.
    pub fn stats_scope(&self) -> &Scope {
        &self.stats_scope
    }
}

/// Looks up upstream clusters by name.
pub trait ClusterManager: Send + Sync {
    /// The cluster called `name`, if it exists.
    fn get(&self, name: &str) -> Option<Arc<ClusterInfo>>;
}

/// A cluster manager over a fixed, explicitly registered set of clusters.
pub struct StaticClusterManager {
    store: Arc<Store>,
    clusters: DashMap<String, Arc<ClusterInfo>>,
}

impl StaticClusterManager {
    /// Create an empty cluster manager charging stats to `store`.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            clusters: DashMap::new(),
        }
    }

    /// Register a cluster, replacing any existing one with the same name.
    pub fn add_cluster(&self, name: &str) -> Arc<ClusterInfo> {
        debug!(cluster = %name, "Registering upstream cluster");
        let cluster = Arc::new(ClusterInfo::new(name, &self.store));
        self.clusters.insert(name.to_string(), cluster.clone());
        cluster
    }

    /// Number of registered clusters.
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Whether no cluster is registered.
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

impl ClusterManager for StaticClusterManager {
    fn get(&self, name: &str) -> Option<Arc<ClusterInfo>> {
        self.clusters.get(name).map(|c| c.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_cluster_is_found() {
        let store = Store::new();
        let cm = StaticClusterManager::new(store.clone());
        cm.add_cluster("users");

        let cluster = cm.get("users").unwrap();
        assert_eq!(cluster.name(), "users");
        assert_eq!(cluster.stats_scope().prefix(), "cluster.users.");

        cluster.stats_scope().counter("ratelimit.ok").inc();
        assert_eq!(store.counter_value("cluster.users.ratelimit.ok"), 1);
    }

    #[test]
    fn test_unknown_cluster() {
        let cm = StaticClusterManager::new(Store::new());
        assert!(cm.is_empty());
        assert!(cm.get("missing").is_none());
    }
}
