use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One resolved package version inside a request's closure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub ecosystem: String,
    pub name: String,
    pub version: String,
    /// Requirement range as declared in the source manifest, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
    /// sha256 of the artifact ingested into the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub direct: bool,
    /// `name@version` identifiers of the packages that require this one.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub parents: BTreeSet<String>,
}

impl Dependency {
    #[must_use]
    pub fn identifier(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "type": self.ecosystem,
            "name": self.name,
            "version": self.version,
            "direct": self.direct,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error(
    "conflicting versions for {ecosystem} package {name}: {existing} vs {incoming}"
)]
pub struct DependencyConflict {
    pub ecosystem: String,
    pub name: String,
    pub existing: String,
    pub incoming: String,
}

/// The deduplicated dependency closure of one request.
///
/// Insertion order is preserved so reports stay stable across runs; within one
/// ecosystem exactly one version may exist per package name.
#[derive(Clone, Debug, Default)]
pub struct DependencySet {
    entries: IndexMap<(String, String), Dependency>,
}

impl DependencySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dependency, merging parent edges when the same resolved version
    /// is seen again and rejecting a second distinct version for the name.
    pub fn insert(&mut self, dep: Dependency) -> Result<(), DependencyConflict> {
        let key = (dep.ecosystem.clone(), dep.name.clone());
        match self.entries.get_mut(&key) {
            None => {
                self.entries.insert(key, dep);
                Ok(())
            }
            Some(existing) if existing.version == dep.version => {
                existing.direct = existing.direct || dep.direct;
                existing.parents.extend(dep.parents);
                if existing.digest.is_none() {
                    existing.digest = dep.digest;
                }
                if existing.requirement.is_none() {
                    existing.requirement = dep.requirement;
                }
                Ok(())
            }
            Some(existing) => Err(DependencyConflict {
                ecosystem: dep.ecosystem,
                name: dep.name,
                existing: existing.version.clone(),
                incoming: dep.version,
            }),
        }
    }

    pub fn extend(
        &mut self,
        deps: impl IntoIterator<Item = Dependency>,
    ) -> Result<(), DependencyConflict> {
        for dep in deps {
            self.insert(dep)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, ecosystem: &str, name: &str) -> Option<&Dependency> {
        self.entries
            .get(&(ecosystem.to_string(), name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.entries.values()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<Dependency> {
        self.entries.into_values().collect()
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Array(self.iter().map(Dependency::to_json).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(name: &str, version: &str, direct: bool) -> Dependency {
        Dependency {
            ecosystem: "gomod".to_string(),
            name: name.to_string(),
            version: version.to_string(),
            requirement: None,
            digest: None,
            direct,
            parents: BTreeSet::new(),
        }
    }

    #[test]
    fn duplicate_same_version_merges() {
        let mut set = DependencySet::new();
        let mut first = dep("example.com/y", "v1.2.0", false);
        first.parents.insert("example.com/a@v0.1.0".to_string());
        set.insert(first).unwrap();

        let mut second = dep("example.com/y", "v1.2.0", true);
        second.parents.insert("example.com/b@v2.0.0".to_string());
        set.insert(second).unwrap();

        assert_eq!(set.len(), 1);
        let merged = set.get("gomod", "example.com/y").unwrap();
        assert!(merged.direct);
        assert_eq!(merged.parents.len(), 2);
    }

    #[test]
    fn diamond_with_two_versions_is_rejected() {
        let mut set = DependencySet::new();
        set.insert(dep("example.com/y", "v1.2.0", true)).unwrap();
        let err = set.insert(dep("example.com/y", "v1.3.0", false)).unwrap_err();
        assert_eq!(err.existing, "v1.2.0");
        assert_eq!(err.incoming, "v1.3.0");
    }

    #[test]
    fn same_name_across_ecosystems_is_distinct() {
        let mut set = DependencySet::new();
        set.insert(dep("left-pad", "v1.0.0", true)).unwrap();
        let mut npm = dep("left-pad", "1.3.0", true);
        npm.ecosystem = "npm".to_string();
        set.insert(npm).unwrap();
        assert_eq!(set.len(), 2);
    }
}
