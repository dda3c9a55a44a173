//! Named scalar mappings used for parameters and summary statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

macro_rules! named_values {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(BTreeMap<String, f64>);

        impl $name {
            /// Creates an empty mapping.
            pub fn new() -> Self {
                Self(BTreeMap::new())
            }

            /// Returns the value stored under `key`.
            pub fn get(&self, key: &str) -> Option<f64> {
                self.0.get(key).copied()
            }

            /// Inserts or replaces a value, returning the previous one.
            pub fn insert(&mut self, key: impl Into<String>, value: f64) -> Option<f64> {
                self.0.insert(key.into(), value)
            }

            /// Builder-style insertion.
            pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
                self.0.insert(key.into(), value);
                self
            }

            /// Number of entries.
            pub fn len(&self) -> usize {
                self.0.len()
            }

            /// Whether the mapping holds no entries.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// Iterates entries in key order.
            pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
                self.0.iter().map(|(key, value)| (key.as_str(), *value))
            }

            /// Iterates keys in order.
            pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
                self.0.keys().map(String::as_str)
            }

            /// Iterates values in key order.
            pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
                self.0.values().copied()
            }

            /// Borrows the underlying ordered map.
            pub fn as_map(&self) -> &BTreeMap<String, f64> {
                &self.0
            }
        }

        impl From<BTreeMap<String, f64>> for $name {
            fn from(map: BTreeMap<String, f64>) -> Self {
                Self(map)
            }
        }

        impl<K: Into<String>> FromIterator<(K, f64)> for $name {
            fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
                Self(iter.into_iter().map(|(key, value)| (key.into(), value)).collect())
            }
        }
    };
}

named_values!(
    /// Parameter vector of a single model, keyed by parameter name.
    ///
    /// Keys are kept sorted, so two parameters built from the same names in a
    /// different insertion order compare and serialize identically.
    Parameter
);

named_values!(
    /// Summary statistics produced by a simulator or observed in the data.
    SumStats
);
