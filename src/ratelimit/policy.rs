//! Rate limit policies attached to routes and virtual hosts.
//!
//! A policy is an ordered list of entries. Each entry belongs to a stage,
//! may carry a route key used for per-route runtime gating, and produces a
//! descriptor from the request through its list of actions.

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::descriptor::{Descriptor, DescriptorEntry};
use crate::router::RouteEntry;

/// Maximum stage a policy entry or filter may be configured with.
pub const MAX_STAGE: u64 = 10;

/// Inputs a policy rule may draw descriptor entries from.
pub struct RequestContext<'a> {
    /// The route the request resolved to
    pub route: &'a dyn RouteEntry,
    /// Request headers
    pub headers: &'a HeaderMap,
    /// Cluster name of the local service
    pub local_service_cluster: &'a str,
    /// Address of the downstream peer, when known
    pub remote_address: Option<IpAddr>,
}

/// A rule that turns a request into rate limit descriptors.
pub trait PolicyRule: Send + Sync {
    /// The stage this rule applies to.
    fn stage(&self) -> u64;

    /// Key used to gate this rule at runtime. Empty means always applicable.
    fn route_key(&self) -> &str;

    /// Append the descriptors this rule produces for the request.
    fn populate_descriptors(&self, ctx: &RequestContext<'_>, descriptors: &mut Vec<Descriptor>);
}

/// An ordered set of rate limit policy entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimitPolicy {
    entries: Vec<RateLimitPolicyEntry>,
}

impl RateLimitPolicy {
    /// Create a policy from entries, keeping their order.
    pub fn new(entries: Vec<RateLimitPolicyEntry>) -> Self {
        Self { entries }
    }

    /// All entries in configuration order.
    pub fn entries(&self) -> &[RateLimitPolicyEntry] {
        &self.entries
    }

    /// Whether the policy has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A configured rate limit policy entry.
///
/// The actions are evaluated in order and each contributes one entry to a
/// single descriptor. If any action cannot produce its entry the whole
/// descriptor is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicyEntry {
    /// Stage this entry applies to
    #[serde(default)]
    pub stage: u64,
    /// Runtime gating key
    #[serde(default)]
    pub route_key: String,
    /// Descriptor producing actions
    pub actions: Vec<RateLimitAction>,
}

impl RateLimitPolicyEntry {
    /// Validate the entry's stage and actions.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.stage > MAX_STAGE {
            return Err(crate::error::FilterError::Config(format!(
                "rate limit stage {} exceeds maximum of {}",
                self.stage, MAX_STAGE
            )));
        }
        if self.actions.is_empty() {
            return Err(crate::error::FilterError::Config(
                "rate limit entry requires at least one action".to_string(),
            ));
        }
        Ok(())
    }
}

impl PolicyRule for RateLimitPolicyEntry {
    fn stage(&self) -> u64 {
        self.stage
    }

    fn route_key(&self) -> &str {
        &self.route_key
    }

    fn populate_descriptors(&self, ctx: &RequestContext<'_>, descriptors: &mut Vec<Descriptor>) {
        let mut descriptor = Descriptor::new();
        for action in &self.actions {
            match action.populate_entry(ctx) {
                Some(entry) => descriptor.entries.push(entry),
                None => return,
            }
        }

        if !descriptor.is_empty() {
            descriptors.push(descriptor);
        }
    }
}

/// A single descriptor entry producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitAction {
    /// `("source_cluster", <local service cluster>)`
    SourceCluster,
    /// `("destination_cluster", <route's upstream cluster>)`
    DestinationCluster,
    /// `(<descriptor_key>, <value of header_name>)`
    RequestHeaders {
        header_name: String,
        descriptor_key: String,
    },
    /// `("remote_address", <downstream peer ip>)`
    RemoteAddress,
    /// `("generic_key", <descriptor_value>)`
    GenericKey { descriptor_value: String },
    /// `("header_match", <descriptor_value>)` when the matchers agree with
    /// `expect_match`
    HeaderValueMatch {
        descriptor_value: String,
        #[serde(default = "default_expect_match")]
        expect_match: bool,
        headers: Vec<HeaderMatcher>,
    },
}

fn default_expect_match() -> bool {
    true
}

impl RateLimitAction {
    /// Produce this action's descriptor entry, if the request allows it.
    pub fn populate_entry(&self, ctx: &RequestContext<'_>) -> Option<DescriptorEntry> {
        match self {
            RateLimitAction::SourceCluster => Some(DescriptorEntry::new(
                "source_cluster",
                ctx.local_service_cluster,
            )),
            RateLimitAction::DestinationCluster => Some(DescriptorEntry::new(
                "destination_cluster",
                ctx.route.cluster_name(),
            )),
            RateLimitAction::RequestHeaders {
                header_name,
                descriptor_key,
            } => ctx
                .headers
                .get(header_name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|v| DescriptorEntry::new(descriptor_key.as_str(), v)),
            RateLimitAction::RemoteAddress => ctx
                .remote_address
                .map(|addr| DescriptorEntry::new("remote_address", addr.to_string())),
            RateLimitAction::GenericKey { descriptor_value } => {
                Some(DescriptorEntry::new("generic_key", descriptor_value.as_str()))
            }
            RateLimitAction::HeaderValueMatch {
                descriptor_value,
                expect_match,
                headers,
            } => {
                let matched = headers.iter().all(|m| m.matches(ctx.headers));
                (matched == *expect_match)
                    .then(|| DescriptorEntry::new("header_match", descriptor_value.as_str()))
            }
        }
    }
}

/// Matches a request header by presence or exact value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMatcher {
    /// Header name
    pub name: String,
    /// Required value; presence alone matches when unset
    #[serde(default)]
    pub exact_match: Option<String>,
}

impl HeaderMatcher {
    /// Whether the headers satisfy this matcher.
    pub fn matches(&self, headers: &HeaderMap) -> bool {
        match headers.get(self.name.as_str()) {
            None => false,
            Some(value) => match &self.exact_match {
                None => true,
                Some(expected) => value.to_str().map(|v| v == expected).unwrap_or(false),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouteTable;
    use http::HeaderValue;

    const ROUTES: &str = r#"
- name: api
  rate_limits:
    - actions:
        - type: generic_key
          descriptor_value: vhost
  routes:
    - name: users
      prefix: /users
      cluster: users_service
      rate_limits:
        - route_key: users
          actions:
            - type: source_cluster
            - type: destination_cluster
        - stage: 1
          actions:
            - type: request_headers
              header_name: x-user
              descriptor_key: user
"#;

    fn parse_table() -> RouteTable {
        RouteTable::from_yaml(ROUTES).unwrap()
    }

    fn populate(
        entry: &RateLimitPolicyEntry,
        headers: &HeaderMap,
        remote: Option<IpAddr>,
    ) -> Vec<Descriptor> {
        let table = parse_table();
        let route = table.route("users").unwrap();
        let ctx = RequestContext {
            route: &*route,
            headers,
            local_service_cluster: "frontend",
            remote_address: remote,
        };
        let mut descriptors = Vec::new();
        entry.populate_descriptors(&ctx, &mut descriptors);
        descriptors
    }

    #[test]
    fn test_parse_policy_entries() {
        let table = parse_table();
        let route = table.route("users").unwrap();
        let policy = route.rate_limit_policy();

        assert_eq!(policy.entries().len(), 2);
        assert_eq!(policy.entries()[0].route_key, "users");
        assert_eq!(policy.entries()[0].stage, 0);
        assert_eq!(policy.entries()[1].stage, 1);
        assert_eq!(
            policy.entries()[1].actions[0],
            RateLimitAction::RequestHeaders {
                header_name: "x-user".to_string(),
                descriptor_key: "user".to_string(),
            }
        );
    }

    #[test]
    fn test_cluster_actions_compose_one_descriptor() {
        let entry = RateLimitPolicyEntry {
            stage: 0,
            route_key: String::new(),
            actions: vec![RateLimitAction::SourceCluster, RateLimitAction::DestinationCluster],
        };

        let descriptors = populate(&entry, &HeaderMap::new(), None);
        assert_eq!(
            descriptors,
            vec![Descriptor::from_pairs([
                ("source_cluster", "frontend"),
                ("destination_cluster", "users_service"),
            ])]
        );
    }

    #[test]
    fn test_missing_header_drops_descriptor() {
        let entry = RateLimitPolicyEntry {
            stage: 0,
            route_key: String::new(),
            actions: vec![
                RateLimitAction::GenericKey {
                    descriptor_value: "api".to_string(),
                },
                RateLimitAction::RequestHeaders {
                    header_name: "x-user".to_string(),
                    descriptor_key: "user".to_string(),
                },
            ],
        };

        assert!(populate(&entry, &HeaderMap::new(), None).is_empty());

        let mut headers = HeaderMap::new();
        headers.insert("x-user", HeaderValue::from_static("bob"));
        assert_eq!(
            populate(&entry, &headers, None),
            vec![Descriptor::from_pairs([("generic_key", "api"), ("user", "bob")])]
        );
    }

    #[test]
    fn test_remote_address_action() {
        let entry = RateLimitPolicyEntry {
            stage: 0,
            route_key: String::new(),
            actions: vec![RateLimitAction::RemoteAddress],
        };

        assert!(populate(&entry, &HeaderMap::new(), None).is_empty());

        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            populate(&entry, &HeaderMap::new(), Some(addr)),
            vec![Descriptor::from_pairs([("remote_address", "10.0.0.1")])]
        );
    }

    #[test]
    fn test_header_value_match_action() {
        let entry = RateLimitPolicyEntry {
            stage: 0,
            route_key: String::new(),
            actions: vec![RateLimitAction::HeaderValueMatch {
                descriptor_value: "internal".to_string(),
                expect_match: true,
                headers: vec![HeaderMatcher {
                    name: "x-envoy-internal".to_string(),
                    exact_match: Some("true".to_string()),
                }],
            }],
        };

        let mut headers = HeaderMap::new();
        headers.insert("x-envoy-internal", HeaderValue::from_static("true"));
        assert_eq!(
            populate(&entry, &headers, None),
            vec![Descriptor::from_pairs([("header_match", "internal")])]
        );

        headers.insert("x-envoy-internal", HeaderValue::from_static("false"));
        assert!(populate(&entry, &headers, None).is_empty());
    }

    #[test]
    fn test_header_value_match_inverted() {
        let yaml = r#"
actions:
  - type: header_value_match
    descriptor_value: external
    expect_match: false
    headers:
      - name: x-envoy-internal
"#;
        let entry: RateLimitPolicyEntry = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(
            populate(&entry, &HeaderMap::new(), None),
            vec![Descriptor::from_pairs([("header_match", "external")])]
        );
    }

    #[test]
    fn test_validate_entry() {
        let mut entry = RateLimitPolicyEntry {
            stage: 0,
            route_key: String::new(),
            actions: vec![RateLimitAction::RemoteAddress],
        };
        assert!(entry.validate().is_ok());

        entry.stage = MAX_STAGE + 1;
        assert!(entry.validate().is_err());

        entry.stage = 0;
        entry.actions.clear();
        assert!(entry.validate().is_err());
    }
}
