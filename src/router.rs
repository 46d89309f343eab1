//! Routes and virtual hosts carrying rate limit policies.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{FilterError, Result};
use crate::ratelimit::RateLimitPolicy;

/// A resolved route as seen by the rate limit filter.
pub trait RouteEntry: Send + Sync {
    /// Route name.
    fn name(&self) -> &str;

    /// Upstream cluster the route forwards to.
    fn cluster_name(&self) -> &str;

    /// Rate limit policy configured on the route itself.
    fn rate_limit_policy(&self) -> &RateLimitPolicy;

    /// The virtual host the route belongs to.
    fn virtual_host(&self) -> &VirtualHost;
}

/// Virtual host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualHostConfig {
    /// Virtual host name
    pub name: String,
    /// Rate limits applied to every route of the host
    #[serde(default)]
    pub rate_limits: RateLimitPolicy,
    /// Routes, matched in order
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Route configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route name
    pub name: String,
    /// Path prefix the route matches
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Upstream cluster
    pub cluster: String,
    /// Route level rate limits
    #[serde(default)]
    pub rate_limits: RateLimitPolicy,
}

fn default_prefix() -> String {
    "/".to_string()
}

/// A virtual host.
#[derive(Debug)]
pub struct VirtualHost {
    name: String,
    rate_limit_policy: RateLimitPolicy,
}

impl VirtualHost {
    /// Create a virtual host.
    pub fn new(name: impl Into<String>, rate_limit_policy: RateLimitPolicy) -> Self {
        Self {
            name: name.into(),
            rate_limit_policy,
        }
    }

    /// Virtual host name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rate limit policy shared by the host's routes.
    pub fn rate_limit_policy(&self) -> &RateLimitPolicy {
        &self.rate_limit_policy
    }
}

/// A route bound to its virtual host.
#[derive(Debug)]
pub struct Route {
    name: String,
    prefix: String,
    cluster_name: String,
    rate_limit_policy: RateLimitPolicy,
    virtual_host: Arc<VirtualHost>,
}

impl Route {
    /// Create a route under `virtual_host`.
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        cluster_name: impl Into<String>,
        rate_limit_policy: RateLimitPolicy,
        virtual_host: Arc<VirtualHost>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            cluster_name: cluster_name.into(),
            rate_limit_policy,
            virtual_host,
        }
    }

    /// Path prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl RouteEntry for Route {
    fn name(&self) -> &str {
        &self.name
    }

    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn rate_limit_policy(&self) -> &RateLimitPolicy {
        &self.rate_limit_policy
    }

    fn virtual_host(&self) -> &VirtualHost {
        &self.virtual_host
    }
}

/// All routes of all virtual hosts, in configuration order.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Build a route table from virtual host configurations.
    pub fn from_configs(virtual_hosts: Vec<VirtualHostConfig>) -> Result<Self> {
        let mut routes = Vec::new();

        for vhost in virtual_hosts {
            for entry in vhost.rate_limits.entries() {
                entry.validate()?;
            }
            let host = Arc::new(VirtualHost::new(vhost.name, vhost.rate_limits));

            for route in vhost.routes {
                for entry in route.rate_limits.entries() {
                    entry.validate()?;
                }
                routes.push(Arc::new(Route::new(
                    route.name,
                    route.prefix,
                    route.cluster,
                    route.rate_limits,
                    host.clone(),
                )));
            }
        }

        Ok(Self { routes })
    }

    /// Parse a YAML list of virtual hosts.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let virtual_hosts: Vec<VirtualHostConfig> = serde_yaml::from_str(yaml)
            .map_err(|e| FilterError::Config(format!("Failed to parse route config: {}", e)))?;
        Self::from_configs(virtual_hosts)
    }

    /// Look up a route by name.
    pub fn route(&self, name: &str) -> Option<Arc<Route>> {
        self.routes.iter().find(|r| r.name == name).cloned()
    }

    /// First route whose prefix matches `path`.
    pub fn match_path(&self, path: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|r| path.starts_with(r.prefix.as_str()))
            .cloned()
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table has no routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
- name: public
  rate_limits:
    - actions:
        - type: remote_address
  routes:
    - name: login
      prefix: /login
      cluster: auth
    - name: catch_all
      cluster: web
      rate_limits:
        - actions:
            - type: destination_cluster
"#;

    #[test]
    fn test_parse_route_table() {
        let table = RouteTable::from_yaml(YAML).unwrap();
        assert_eq!(table.len(), 2);

        let login = table.route("login").unwrap();
        assert_eq!(login.cluster_name(), "auth");
        assert!(login.rate_limit_policy().is_empty());
        assert_eq!(login.virtual_host().name(), "public");
        assert_eq!(login.virtual_host().rate_limit_policy().entries().len(), 1);
    }

    #[test]
    fn test_match_path_in_order() {
        let table = RouteTable::from_yaml(YAML).unwrap();

        assert_eq!(table.match_path("/login/sso").unwrap().name(), "login");
        assert_eq!(table.match_path("/index.html").unwrap().name(), "catch_all");
        assert!(table.route("missing").is_none());
    }

    #[test]
    fn test_invalid_stage_rejected() {
        let yaml = r#"
- name: public
  routes:
    - name: r
      cluster: c
      rate_limits:
        - stage: 11
          actions:
            - type: remote_address
"#;
        assert!(matches!(
            RouteTable::from_yaml(yaml),
            Err(FilterError::Config(_))
        ));
    }
}
