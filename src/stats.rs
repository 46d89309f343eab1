//! In-process statistics store.
//!
//! Counters are addressed by dotted names and created on first use. A
//! `Scope` prefixes every name it hands out, the way per-cluster stats are
//! namespaced under `cluster.<name>.`.

use dashmap::DashMap;
use http::StatusCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Increment by `amount`.
    pub fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Root of all counters.
#[derive(Debug, Default)]
pub struct Store {
    counters: DashMap<String, Arc<Counter>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the counter `name`.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.counters
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Value of `name`, zero if it was never created.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.value().value()).unwrap_or(0)
    }

    /// Create a scope whose counters are prefixed with `prefix.`.
    pub fn scope(self: &Arc<Self>, prefix: &str) -> Scope {
        Scope {
            prefix: format!("{}.", prefix.trim_end_matches('.')),
            store: self.clone(),
        }
    }

    /// Snapshot of all counters, sorted by name.
    pub fn counters(&self) -> Vec<(String, u64)> {
        let mut counters: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().value()))
            .collect();
        counters.sort();
        counters
    }
}

/// A prefixed view onto a `Store`.
#[derive(Debug, Clone)]
pub struct Scope {
    prefix: String,
    store: Arc<Store>,
}

impl Scope {
    /// Get or create the counter `name` under this scope.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        self.store.counter(&self.qualify(name))
    }

    /// Value of `name` under this scope.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.store.counter_value(&self.qualify(name))
    }

    /// The scope's prefix, including the trailing dot.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

/// Everything needed to charge response code statistics.
pub struct ResponseStatInfo<'a> {
    /// Global store, used for virtual cluster stats
    pub global_store: &'a Arc<Store>,
    /// Upstream cluster scope
    pub cluster_scope: &'a Scope,
    /// Response status being charged
    pub status: StatusCode,
    /// Whether the request originated internally
    pub internal_request: bool,
    /// Virtual host of the request, empty when unknown
    pub request_vhost_name: &'a str,
    /// Virtual cluster of the request, empty when unknown
    pub request_vcluster_name: &'a str,
}

/// Charge response code statistics for a response.
///
/// Charges `upstream_rq_<code>` and `upstream_rq_<class>xx` on the cluster
/// scope, the same pair under `internal.`/`external.`, and the virtual
/// cluster counters in the global store when a virtual cluster is known.
pub fn charge_response_stat(info: &ResponseStatInfo<'_>) {
    let code = info.status.as_u16();
    let group = format!("{}xx", code / 100);
    let origin = if info.internal_request {
        "internal"
    } else {
        "external"
    };

    let scope = info.cluster_scope;
    scope.counter(&format!("upstream_rq_{}", code)).inc();
    scope.counter(&format!("upstream_rq_{}", group)).inc();
    scope.counter(&format!("{}.upstream_rq_{}", origin, code)).inc();
    scope.counter(&format!("{}.upstream_rq_{}", origin, group)).inc();

    if !info.request_vhost_name.is_empty() && !info.request_vcluster_name.is_empty() {
        let prefix = format!(
            "vhost.{}.vcluster.{}.",
            info.request_vhost_name, info.request_vcluster_name
        );
        info.global_store
            .counter(&format!("{}upstream_rq_{}", prefix, code))
            .inc();
        info.global_store
            .counter(&format!("{}upstream_rq_{}", prefix, group))
            .inc();
    }
}
