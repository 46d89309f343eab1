//! Rate limit descriptors.

use serde::{Deserialize, Serialize};

/// A single label of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorEntry {
    /// The label key
    pub key: String,
    /// The label value
    pub value: String,
}

impl DescriptorEntry {
    /// Create a new descriptor entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One rate limit dimension sent to the decision service.
///
/// Entries are ordered; two descriptors are equal only if they hold the
/// same entries in the same order, which is also the order they go out on
/// the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    /// Ordered key/value entries
    pub entries: Vec<DescriptorEntry>,
}

impl Descriptor {
    /// Create an empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a descriptor from labeled pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| DescriptorEntry::new(k, v))
                .collect(),
        }
    }

    /// Append an entry to the end of the descriptor.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push(DescriptorEntry::new(key, value));
    }

    /// Whether the descriptor carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries in the descriptor.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}={}", e.key, e.value))
            .collect();

        write!(f, "{{{}}}", entries.join(","))
    }
}
