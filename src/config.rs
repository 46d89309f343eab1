//! Configuration management for the rate limit filter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FilterError, Result};
use crate::ratelimit::{DEFAULT_TIMEOUT, MAX_STAGE};
use crate::router::VirtualHostConfig;
use crate::runtime::Runtime;
use crate::stats::Store;
use crate::upstream::ClusterManager;

/// Filter settings as they appear in the filter chain configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSettings {
    /// Domain sent with every limit check
    pub domain: String,

    /// Stage selecting which rate limit entries apply
    #[serde(default)]
    pub stage: u64,

    /// Time allowed for a decision, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

impl FilterSettings {
    /// Parse settings from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| FilterError::Config(format!("Failed to parse filter settings: {}", e)))
    }

    /// Parse settings from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FilterError::Config(format!("Failed to parse filter settings: {}", e)))
    }

    /// Check the settings can drive a filter.
    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(FilterError::Config("domain is required".to_string()));
        }
        if self.stage > MAX_STAGE {
            return Err(FilterError::Config(format!(
                "stage {} exceeds maximum of {}",
                self.stage, MAX_STAGE
            )));
        }
        Ok(())
    }
}

/// Identity of the local service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalInfo {
    /// Cluster the local service belongs to
    #[serde(default)]
    pub cluster_name: String,

    /// Name of this node
    #[serde(default)]
    pub node_name: String,
}

/// Immutable configuration shared by every filter of one filter chain.
pub struct FilterConfig {
    domain: String,
    stage: u64,
    timeout: Duration,
    local_info: LocalInfo,
    global_store: Arc<Store>,
    runtime: Arc<dyn Runtime>,
    cm: Arc<dyn ClusterManager>,
}

impl std::fmt::Debug for FilterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterConfig")
            .field("domain", &self.domain)
            .field("stage", &self.stage)
            .field("timeout", &self.timeout)
            .field("local_info", &self.local_info)
            .finish()
    }
}

impl FilterConfig {
    /// Validate `settings` and bind them to the proxy's shared services.
    pub fn new(
        settings: FilterSettings,
        local_info: LocalInfo,
        global_store: Arc<Store>,
        runtime: Arc<dyn Runtime>,
        cm: Arc<dyn ClusterManager>,
    ) -> Result<Self> {
        settings.validate()?;

        Ok(Self {
            domain: settings.domain,
            stage: settings.stage,
            timeout: Duration::from_millis(settings.timeout_ms),
            local_info,
            global_store,
            runtime,
            cm,
        })
    }

    /// Domain sent to the decision service.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Stage of rate limit entries this filter applies.
    pub fn stage(&self) -> u64 {
        self.stage
    }

    /// Time allowed for a decision.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Local service identity.
    pub fn local_info(&self) -> &LocalInfo {
        &self.local_info
    }

    /// Global statistics store.
    pub fn global_store(&self) -> &Arc<Store> {
        &self.global_store
    }

    /// Runtime feature flags.
    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    /// Upstream cluster registry.
    pub fn cm(&self) -> &dyn ClusterManager {
        self.cm.as_ref()
    }
}

/// Configuration of the `rlfilter` command line tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Decision service connection
    #[serde(default)]
    pub rate_limit_service: RateLimitServiceConfig,

    /// Filter settings
    pub filter: FilterSettings,

    /// Local service identity
    #[serde(default)]
    pub local_info: LocalInfo,

    /// Runtime overrides, key to percentage
    #[serde(default)]
    pub runtime: HashMap<String, u64>,

    /// Known upstream clusters
    #[serde(default)]
    pub clusters: Vec<String>,

    /// Virtual hosts and their routes
    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHostConfig>,
}

/// Decision service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitServiceConfig {
    /// gRPC endpoint of the decision service
    #[serde(default = "default_service_address")]
    pub address: String,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RateLimitServiceConfig {
    fn default() -> Self {
        Self {
            address: default_service_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_service_address() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    250
}

impl ServiceConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FilterError::Config(e.to_string()))?;
        config.filter.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeLoader;
    use crate::upstream::StaticClusterManager;

    fn build(settings: FilterSettings) -> Result<FilterConfig> {
        let store = Store::new();
        FilterConfig::new(
            settings,
            LocalInfo::default(),
            store.clone(),
            Arc::new(RuntimeLoader::new()),
            Arc::new(StaticClusterManager::new(store)),
        )
    }

    #[test]
    fn test_settings_from_json_defaults() {
        let settings = FilterSettings::from_json(r#"{"domain": "foo"}"#).unwrap();
        assert_eq!(settings.domain, "foo");
        assert_eq!(settings.stage, 0);
        assert_eq!(settings.timeout_ms, 20);
        assert_eq!(Duration::from_millis(settings.timeout_ms), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_settings_unknown_field_rejected() {
        let err = FilterSettings::from_json(r#"{"domain": "foo", "stages": 1}"#).unwrap_err();
        assert!(matches!(err, FilterError::Config(_)));

        let yaml = r#"
filter:
  domain: edge
  enforce: true
"#;
        assert!(ServiceConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_settings_missing_domain_rejected() {
        assert!(FilterSettings::from_json(r#"{"stage": 1}"#).is_err());
    }

    #[test]
    fn test_filter_config_validation() {
        let config = build(FilterSettings {
            domain: "foo".to_string(),
            stage: 3,
            timeout_ms: 50,
        })
        .unwrap();
        assert_eq!(config.domain(), "foo");
        assert_eq!(config.stage(), 3);
        assert_eq!(config.timeout(), Duration::from_millis(50));

        let err = build(FilterSettings {
            domain: String::new(),
            stage: 0,
            timeout_ms: 20,
        })
        .unwrap_err();
        assert!(matches!(err, FilterError::Config(_)));

        let err = build(FilterSettings {
            domain: "foo".to_string(),
            stage: MAX_STAGE + 1,
            timeout_ms: 20,
        })
        .unwrap_err();
        assert!(matches!(err, FilterError::Config(_)));
    }

    #[test]
    fn test_service_config_from_yaml() {
        let yaml = r#"
rate_limit_service:
  address: http://ratelimit:8081
filter:
  domain: edge
  stage: 1
local_info:
  cluster_name: frontend
runtime:
  ratelimit.http_filter_enforcing: 0
clusters:
  - users
virtual_hosts:
  - name: api
    routes:
      - name: users
        cluster: users
"#;
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limit_service.address, "http://ratelimit:8081");
        assert_eq!(config.rate_limit_service.connect_timeout_ms, 250);
        assert_eq!(config.filter.domain, "edge");
        assert_eq!(config.filter.stage, 1);
        assert_eq!(config.local_info.cluster_name, "frontend");
        assert_eq!(config.runtime["ratelimit.http_filter_enforcing"], 0);
        assert_eq!(config.clusters, vec!["users".to_string()]);
        assert_eq!(config.virtual_hosts.len(), 1);
    }

    #[test]
    fn test_service_config_requires_domain() {
        let yaml = r#"
filter:
  domain: ""
"#;
        assert!(ServiceConfig::from_yaml(yaml).is_err());
    }
}
