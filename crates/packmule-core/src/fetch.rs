use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use packmule_domain::PipelineError;
use packmule_resolver::exec::{is_timeout, stderr_text, Invocation};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Immutable, read-only snapshot of a repository at a pinned commit.
#[derive(Clone, Debug)]
pub struct SourceSnapshot {
    /// Full commit SHA the supplied ref resolved to. Only this identifier is
    /// ever recorded; a branch name never survives the fetch.
    pub pinned_revision: String,
    pub archive_path: PathBuf,
}

/// Produces source snapshots via the git CLI, caching archives in the
/// sources root keyed by (repo, pinned commit).
pub struct SourceFetcher {
    sources_dir: PathBuf,
    timeout: Duration,
}

impl SourceFetcher {
    pub fn new(sources_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            sources_dir: sources_dir.into(),
            timeout,
        }
    }

    /// Fetches `reference` from `repo`, pins it to a commit SHA, and returns
    /// the cached snapshot archive for that commit.
    pub fn fetch(&self, repo: &str, reference: &str) -> Result<SourceSnapshot, PipelineError> {
        // A full SHA that is already archived needs no network at all.
        if is_full_sha(reference) {
            let archive = self.archive_path(repo, reference);
            if archive.is_file() {
                debug!(repo, revision = reference, "source snapshot cache hit");
                return Ok(SourceSnapshot {
                    pinned_revision: reference.to_string(),
                    archive_path: archive,
                });
            }
        }

        let scratch = tempfile::tempdir()
            .map_err(|err| PipelineError::fetch(format!("workspace setup failed: {err}"), true))?;
        let git_root = scratch.path().join("clone");
        fs::create_dir_all(&git_root)
            .map_err(|err| PipelineError::fetch(format!("workspace setup failed: {err}"), true))?;

        self.git(&git_root, &["init", "--quiet"])?;
        self.git(&git_root, &["remote", "add", "origin", repo])?;
        self.git(&git_root, &["fetch", "--no-tags", "origin", reference])?;
        let pinned = self.pin_fetch_head(&git_root)?;
        info!(repo, reference, pinned, "pinned source revision");

        let archive = self.archive_path(repo, &pinned);
        if archive.is_file() {
            return Ok(SourceSnapshot {
                pinned_revision: pinned,
                archive_path: archive,
            });
        }

        let tar_path = scratch.path().join("source.tar");
        self.git(
            &git_root,
            &[
                "archive",
                "--format=tar",
                "--output",
                &tar_path.display().to_string(),
                &pinned,
            ],
        )?;
        self.persist_archive(&tar_path, &archive)
            .map_err(|err| PipelineError::fetch(err.to_string(), true))?;

        Ok(SourceSnapshot {
            pinned_revision: pinned,
            archive_path: archive,
        })
    }

    /// Unpacks a snapshot archive into a private workspace directory.
    pub fn extract(&self, snapshot: &SourceSnapshot, dest: &Path) -> Result<(), PipelineError> {
        let unpack = || -> Result<()> {
            fs::create_dir_all(dest)?;
            let file = File::open(&snapshot.archive_path).with_context(|| {
                format!("missing snapshot archive {}", snapshot.archive_path.display())
            })?;
            let mut archive = tar::Archive::new(GzDecoder::new(file));
            archive
                .unpack(dest)
                .with_context(|| format!("failed to unpack into {}", dest.display()))?;
            Ok(())
        };
        unpack().map_err(|err| PipelineError::fetch(err.to_string(), true))
    }

    fn git(&self, root: &Path, args: &[&str]) -> Result<String, PipelineError> {
        let output = Invocation::new("git", self.timeout)
            .args(args.iter().copied())
            .current_dir(root)
            // Never let git block a worker on an interactive credential prompt.
            .env("GIT_TERMINAL_PROMPT", "0")
            .run()
            .map_err(|err| {
                if is_timeout(&err) {
                    PipelineError::fetch(err.to_string(), true)
                } else {
                    PipelineError::fetch(format!("failed to invoke git: {err}"), false)
                }
            })?;
        if !output.status.success() {
            return Err(classify_git_failure(&stderr_text(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn pin_fetch_head(&self, root: &Path) -> Result<String, PipelineError> {
        let pinned = self.git(root, &["rev-parse", "--verify", "FETCH_HEAD^{commit}"])?;
        if !is_full_sha(&pinned) {
            return Err(PipelineError::fetch(
                format!("git returned a non-commit identifier '{pinned}'"),
                false,
            ));
        }
        Ok(pinned)
    }

    fn persist_archive(&self, tar_path: &Path, dest: &Path) -> Result<()> {
        let parent = dest
            .parent()
            .context("snapshot archive path has no parent")?;
        fs::create_dir_all(parent)?;
        let tmp = NamedTempFile::new_in(parent)?;
        let mut encoder = GzEncoder::new(tmp, Compression::default());
        let mut tar = File::open(tar_path)?;
        io::copy(&mut tar, &mut encoder)?;
        let tmp = encoder.finish()?;
        tmp.persist(dest)
            .with_context(|| format!("failed to persist snapshot {}", dest.display()))?;
        Ok(())
    }

    fn archive_path(&self, repo: &str, pinned: &str) -> PathBuf {
        let repo_key = hex::encode(&Sha256::digest(repo.as_bytes())[..8]);
        self.sources_dir
            .join(repo_key)
            .join(format!("{pinned}.tar.gz"))
    }
}

pub(crate) fn is_full_sha(reference: &str) -> bool {
    reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

/// Maps git stderr onto the error taxonomy. Unresolved revisions and auth
/// failures are final; transport problems are worth retrying.
fn classify_git_failure(stderr: &str) -> PipelineError {
    const REVISION_MARKERS: &[&str] = &[
        "couldn't find remote ref",
        "not a valid object name",
        "bad revision",
        "unknown revision",
        "did not match any",
        "Needed a single revision",
    ];
    const AUTH_MARKERS: &[&str] = &[
        "Authentication failed",
        "could not read Username",
        "could not read Password",
        "Permission denied",
        "Repository not found",
    ];

    let retryable = if REVISION_MARKERS.iter().any(|m| stderr.contains(m)) {
        false
    } else if AUTH_MARKERS.iter().any(|m| stderr.contains(m)) {
        false
    } else {
        // Transport-level failures (DNS, refused connections, broken pipes)
        // all land here.
        true
    };
    PipelineError::fetch(stderr.to_string(), retryable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_sha_detection() {
        assert!(is_full_sha(&"a".repeat(40)));
        assert!(!is_full_sha("main"));
        assert!(!is_full_sha("v1.0.0"));
        assert!(!is_full_sha(&"g".repeat(40)));
    }

    #[test]
    fn unresolved_revision_is_final() {
        let err = classify_git_failure(
            "fatal: couldn't find remote ref refs/heads/no-such-branch",
        );
        assert!(matches!(
            err,
            PipelineError::Fetch {
                retryable: false,
                ..
            }
        ));
    }

    #[test]
    fn auth_failure_is_final() {
        let err = classify_git_failure(
            "fatal: Authentication failed for 'https://example.com/private.git/'",
        );
        assert!(!err.retryable());
    }

    #[test]
    fn transport_failure_is_retryable() {
        let err = classify_git_failure(
            "fatal: unable to access 'https://example.com/x.git/': Could not resolve host",
        );
        assert!(err.retryable());
    }
}
