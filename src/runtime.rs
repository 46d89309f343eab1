//! Runtime feature flags.

use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;

/// Percentage based feature gates, queried synchronously.
pub trait Runtime: Send + Sync {
    /// Whether `key` is enabled for this call.
    ///
    /// The key's configured percentage (or `default_value` when unset) is
    /// the probability, out of 100, that the feature reports enabled.
    fn feature_enabled(&self, key: &str, default_value: u64) -> bool;
}

/// Runtime with in-memory percentage overrides.
#[derive(Debug, Default)]
pub struct RuntimeLoader {
    overrides: DashMap<String, u64>,
}

impl RuntimeLoader {
    /// Create a runtime with no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a runtime from a set of overrides.
    pub fn with_overrides(overrides: HashMap<String, u64>) -> Self {
        Self {
            overrides: overrides.into_iter().collect(),
        }
    }

    /// Set the percentage for `key`.
    pub fn set(&self, key: impl Into<String>, percent: u64) {
        self.overrides.insert(key.into(), percent);
    }

    /// Remove the override for `key`.
    pub fn remove(&self, key: &str) {
        self.overrides.remove(key);
    }

    /// Current value for `key`, if overridden.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.overrides.get(key).map(|v| *v)
    }
}

impl Runtime for RuntimeLoader {
    fn feature_enabled(&self, key: &str, default_value: u64) -> bool {
        let percent = self.get(key).unwrap_or(default_value).min(100);
        match percent {
            0 => false,
            100 => true,
            p => rand::thread_rng().gen_range(0..100) < p,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_value_used_when_unset() {
        let runtime = RuntimeLoader::new();
        assert!(runtime.feature_enabled("ratelimit.http_filter_enabled", 100));
        assert!(!runtime.feature_enabled("ratelimit.http_filter_enabled", 0));
    }

    #[test]
    fn test_override_wins_over_default() {
        let runtime = RuntimeLoader::new();
        runtime.set("ratelimit.http_filter_enforcing", 0);
        assert!(!runtime.feature_enabled("ratelimit.http_filter_enforcing", 100));

        runtime.remove("ratelimit.http_filter_enforcing");
        assert!(runtime.feature_enabled("ratelimit.http_filter_enforcing", 100));
    }

    #[test]
    fn test_values_above_hundred_are_clamped() {
        let runtime = RuntimeLoader::with_overrides(HashMap::from([("key".to_string(), 250)]));
        assert_eq!(runtime.get("key"), Some(250));
        assert!(runtime.feature_enabled("key", 0));
    }

    #[test]
    fn test_partial_sampling_stays_in_range() {
        let runtime = RuntimeLoader::new();
        runtime.set("key", 50);

        let enabled = (0..1000).filter(|_| runtime.feature_enabled("key", 0)).count();
        assert!(enabled > 0 && enabled < 1000);
    }
}
