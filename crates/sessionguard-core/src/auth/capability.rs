//! Capability cache: named permissions answered synchronously from the session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::claims::ClaimSet;

/// A single named permission and whether it is granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CapabilityRecord {
    pub name: String,
    pub granted: bool,
}

impl CapabilityRecord {
    pub fn granted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            granted: true,
        }
    }

    pub fn denied(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            granted: false,
        }
    }
}

/// Capability name to granted flag, answered synchronously.
///
/// An empty query list is treated as "no restriction requested" and passes
/// both `has_all` and `has_any`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityCache {
    records: BTreeMap<String, bool>,
}

impl CapabilityCache {
    pub fn from_claims(claims: &ClaimSet) -> Self {
        Self {
            records: claims
                .authorities
                .iter()
                .map(|name| (name.clone(), true))
                .collect(),
        }
    }

    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = CapabilityRecord>,
    {
        let mut cache = Self::default();
        cache.merge(records);
        cache
    }

    /// Overlay records from a supplementary authorization fetch.
    pub fn merge<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = CapabilityRecord>,
    {
        for record in records {
            self.records.insert(record.name, record.granted);
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.records.get(name).copied().unwrap_or(false)
    }

    pub fn has_all<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|name| self.has(name.as_ref()))
    }

    pub fn has_any<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.is_empty() || names.iter().any(|name| self.has(name.as_ref()))
    }

    pub fn records(&self) -> Vec<CapabilityRecord> {
        self.records
            .iter()
            .map(|(name, granted)| CapabilityRecord {
                name: name.clone(),
                granted: *granted,
            })
            .collect()
    }

    /// Names of all granted capabilities, sorted.
    pub fn granted(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|(_, granted)| **granted)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
