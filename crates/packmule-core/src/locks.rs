use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

use anyhow::{Context, Result};
use fs4::FileExt;
use packmule_domain::{BundleRef, Dependency};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

const EXEC_LOCKS_DIR: &str = "exec-locks";
const RESULTS_DIR: &str = "results";

/// System-wide serialization of executions per (repo, revision).
///
/// The lock is a file lock in the sources root, so it holds across worker
/// processes sharing that volume, not just across threads of one pool.
pub struct ExecutionLockTable {
    dir: PathBuf,
}

/// Held for the duration of one execution; released on drop.
pub struct ExecutionLock {
    _file: File,
}

impl ExecutionLockTable {
    pub fn new(sources_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: sources_dir.into().join(EXEC_LOCKS_DIR),
        }
    }

    /// Blocks until this worker holds the per-(repo, revision) lock.
    pub fn acquire(&self, repo: &str, reference: &str) -> Result<ExecutionLock> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.lock", identity_key(repo, reference)));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open execution lock {}", path.display()))?;
        debug!(repo, reference, "waiting for execution lock");
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        debug!(repo, reference, "execution lock acquired");
        Ok(ExecutionLock { _file: file })
    }
}

/// Completed execution recorded for duplicate-identity reuse.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub pinned_revision: String,
    pub bundle: BundleRef,
    pub dependencies: Vec<Dependency>,
    pub environment_variables: BTreeMap<String, String>,
}

/// Index of finished executions keyed by (repo, revision, ecosystem set).
///
/// Consulted after acquiring the execution lock: a request queued behind an
/// identical one copies the winner's result instead of re-running the
/// pipeline. Only immutable (full SHA) revisions are eligible — a branch name
/// may legitimately point somewhere new by the time a later request arrives.
pub struct ResultsIndex {
    dir: PathBuf,
}

impl ResultsIndex {
    pub fn new(sources_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: sources_dir.into().join(RESULTS_DIR),
        }
    }

    pub fn load(
        &self,
        repo: &str,
        reference: &str,
        ecosystems: &[String],
    ) -> Result<Option<ExecutionResult>> {
        let path = self.entry_path(repo, reference, ecosystems);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let result: ExecutionResult = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt results entry {}", path.display()))?;
        if !result.bundle.path.is_file() {
            // The recorded bundle is gone; treat as a miss and re-execute.
            return Ok(None);
        }
        Ok(Some(result))
    }

    pub fn record(
        &self,
        repo: &str,
        reference: &str,
        ecosystems: &[String],
        result: &ExecutionResult,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.entry_path(repo, reference, ecosystems);
        let tmp = NamedTempFile::new_in(&self.dir)?;
        fs::write(tmp.path(), serde_json::to_string_pretty(result)?)?;
        tmp.persist(&path)
            .with_context(|| format!("failed to persist results entry {}", path.display()))?;
        Ok(())
    }

    fn entry_path(&self, repo: &str, reference: &str, ecosystems: &[String]) -> PathBuf {
        let mut sorted: Vec<&str> = ecosystems.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let mut hasher = Sha256::new();
        hasher.update(repo.as_bytes());
        hasher.update([0]);
        hasher.update(reference.as_bytes());
        for eco in sorted {
            hasher.update([0]);
            hasher.update(eco.as_bytes());
        }
        self.dir.join(format!("{}.json", hex::encode(hasher.finalize())))
    }
}

fn identity_key(repo: &str, reference: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo.as_bytes());
    hasher.update([0]);
    hasher.update(reference.as_bytes());
    hex::encode(hasher.finalize())
}
