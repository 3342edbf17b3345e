//! Managed-host directory.
//!
//! The dashboard knows its hosts by name (`ioc-rf-01`, `ioc-vac-02`, ...).
//! The directory maps those names to addresses so that a browser may send
//! either an alias or a literal address in its `auth` message.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name → address lookup for managed hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostDirectory {
    entries: BTreeMap<String, String>,
}

impl HostDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an alias.
    pub fn insert(&mut self, alias: impl Into<String>, address: impl Into<String>) {
        self.entries.insert(alias.into(), address.into());
    }

    /// Resolves `host` through the directory.
    ///
    /// Unknown names are returned unchanged: they are treated as literal host
    /// names or addresses.
    pub fn resolve<'a>(&'a self, host: &'a str) -> &'a str {
        self.entries.get(host).map(String::as_str).unwrap_or(host)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for HostDirectory {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
