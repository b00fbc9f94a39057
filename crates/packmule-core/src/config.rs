use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Immutable view of the process environment, captured once so configuration
/// stays stable for the lifetime of a worker.
#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Worker and orchestrator configuration.
///
/// The two root directories are distinct on purpose: `sources_dir` is the
/// long-term content-addressed side (source snapshots, artifacts, locks) and
/// is never auto-deleted by the core; `bundles_dir` holds generated archives
/// for the download-serving layer.
#[derive(Debug, Clone)]
pub struct Config {
    pub sources_dir: PathBuf,
    pub bundles_dir: PathBuf,
    pub workers: usize,
    /// Bound on every subprocess invocation and registry call within a stage.
    pub stage_timeout: Duration,
    /// Attempts granted to a retryable stage before the failure is terminal.
    pub retry_budget: u32,
    pub backoff_base: Duration,
    /// Per-ecosystem read-through proxy endpoints.
    pub proxies: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources_dir: PathBuf::from("/var/lib/packmule/sources"),
            bundles_dir: PathBuf::from("/var/lib/packmule/bundles"),
            workers: 4,
            stage_timeout: Duration::from_secs(120),
            retry_budget: 3,
            backoff_base: Duration::from_millis(500),
            proxies: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Builds configuration from the current process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let mut config = Self::default();
        if let Some(dir) = snapshot.var("PACKMULE_SOURCES_DIR") {
            config.sources_dir = PathBuf::from(dir);
        }
        if let Some(dir) = snapshot.var("PACKMULE_BUNDLES_DIR") {
            config.bundles_dir = PathBuf::from(dir);
        }
        if let Some(raw) = snapshot.var("PACKMULE_WORKERS") {
            config.workers = raw
                .parse()
                .with_context(|| format!("invalid PACKMULE_WORKERS value '{raw}'"))?;
        }
        if let Some(raw) = snapshot.var("PACKMULE_STAGE_TIMEOUT") {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("invalid PACKMULE_STAGE_TIMEOUT value '{raw}'"))?;
            config.stage_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = snapshot.var("PACKMULE_RETRY_BUDGET") {
            config.retry_budget = raw
                .parse()
                .with_context(|| format!("invalid PACKMULE_RETRY_BUDGET value '{raw}'"))?;
        }
        if let Some(raw) = snapshot.var("PACKMULE_BACKOFF_MS") {
            let millis: u64 = raw
                .parse()
                .with_context(|| format!("invalid PACKMULE_BACKOFF_MS value '{raw}'"))?;
            config.backoff_base = Duration::from_millis(millis);
        }
        if let Some(url) = snapshot.var("PACKMULE_PROXY_GOMOD") {
            config.proxies.insert("gomod".to_string(), url.to_string());
        }
        Ok(config)
    }

    /// Requires both root directories to exist, as the original worker-config
    /// validation does; refusing to start beats silently writing elsewhere.
    pub fn validate(&self) -> Result<()> {
        for (name, dir) in [
            ("sources_dir", &self.sources_dir),
            ("bundles_dir", &self.bundles_dir),
        ] {
            if !dir.is_dir() {
                bail!(
                    "the configuration \"{name}\" must be set to an existing directory (got {})",
                    dir.display()
                );
            }
        }
        if self.workers == 0 {
            bail!("at least one worker is required");
        }
        Ok(())
    }

    /// Development convenience: create the roots, then validate.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.sources_dir, &self.bundles_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        self.validate()
    }

    pub fn proxy_for(&self, ecosystem: &str) -> Option<&str> {
        self.proxies.get(ecosystem).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_constants() {
        let config = Config::default();
        assert_eq!(config.stage_timeout, Duration::from_secs(120));
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn snapshot_overrides_are_applied() -> Result<()> {
        let snapshot = EnvSnapshot::testing(&[
            ("PACKMULE_SOURCES_DIR", "/srv/sources"),
            ("PACKMULE_BUNDLES_DIR", "/srv/bundles"),
            ("PACKMULE_WORKERS", "2"),
            ("PACKMULE_STAGE_TIMEOUT", "30"),
            ("PACKMULE_RETRY_BUDGET", "5"),
            ("PACKMULE_PROXY_GOMOD", "http://athens:3000"),
        ]);
        let config = Config::from_snapshot(&snapshot)?;
        assert_eq!(config.sources_dir, PathBuf::from("/srv/sources"));
        assert_eq!(config.workers, 2);
        assert_eq!(config.stage_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.proxy_for("gomod"), Some("http://athens:3000"));
        assert_eq!(config.proxy_for("npm"), None);
        Ok(())
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let snapshot = EnvSnapshot::testing(&[("PACKMULE_WORKERS", "many")]);
        assert!(Config::from_snapshot(&snapshot).is_err());
    }

    #[test]
    fn validate_requires_existing_roots() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut config = Config {
            sources_dir: temp.path().join("sources"),
            bundles_dir: temp.path().join("bundles"),
            ..Config::default()
        };
        assert!(config.validate().is_err());
        config.ensure_dirs()?;
        assert!(config.validate().is_ok());
        Ok(())
    }
}
