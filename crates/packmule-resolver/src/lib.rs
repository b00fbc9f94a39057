//! Pluggable per-ecosystem dependency resolution.
//!
//! Each implementation takes a checked-out source snapshot, delegates the
//! dependency-graph computation to the ecosystem's native tooling, ingests
//! every resolved artifact into the shared [`ArtifactStore`], and stages the
//! offline mirror the bundle builder packs under `deps/<ecosystem>/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use packmule_domain::{Dependency, PipelineError};
use packmule_store::{ArtifactStore, RemoteProxy};

pub mod exec;
mod gomod;

pub use gomod::GomodResolver;

/// Ecosystem-specific knobs supplied with a request.
#[derive(Clone, Debug)]
pub struct ResolveOptions {
    /// Subdirectory of the snapshot holding the manifest, when not the root.
    pub subdir: Option<PathBuf>,
    /// Read-through registry cache to route native tooling through.
    pub proxy: Option<RemoteProxy>,
    /// Bound for every subprocess invocation and registry call.
    pub timeout: Duration,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            subdir: None,
            proxy: None,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Outcome of one ecosystem's resolution for one request.
#[derive(Debug)]
pub struct Resolution {
    pub ecosystem: String,
    pub dependencies: Vec<Dependency>,
    /// Staged offline mirror in the ecosystem's native expected layout.
    pub mirror_dir: PathBuf,
    /// Variables the consumer must export so native tooling uses the mirror.
    pub environment_variables: BTreeMap<String, String>,
}

/// One resolver per package-manager universe.
///
/// Implementations must guarantee that every returned dependency's artifact
/// is present and digest-verified in the store before they return.
pub trait EcosystemResolver: Send + Sync {
    fn ecosystem(&self) -> &'static str;

    fn resolve(
        &self,
        workspace: &Path,
        scratch: &Path,
        options: &ResolveOptions,
        store: &ArtifactStore,
    ) -> Result<Resolution, PipelineError>;
}

/// Mapping from ecosystem identifier to implementation, fixed at startup.
/// Adding an ecosystem means registering here; the orchestrator never changes.
pub struct ResolverRegistry {
    resolvers: BTreeMap<&'static str, Box<dyn EcosystemResolver>>,
}

impl ResolverRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            resolvers: BTreeMap::new(),
        }
    }

    /// Registry with every built-in resolver.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(GomodResolver::new()));
        registry
    }

    pub fn register(&mut self, resolver: Box<dyn EcosystemResolver>) {
        self.resolvers.insert(resolver.ecosystem(), resolver);
    }

    #[must_use]
    pub fn get(&self, ecosystem: &str) -> Option<&dyn EcosystemResolver> {
        self.resolvers.get(ecosystem).map(AsRef::as_ref)
    }

    #[must_use]
    pub fn ecosystems(&self) -> Vec<&'static str> {
        self.resolvers.keys().copied().collect()
    }
}
