use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

const OBJECTS_DIR: &str = "objects";
const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";

/// Classified artifact-store failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("artifact {digest} is missing from the store")]
    MissingObject { digest: String },
    #[error("artifact {digest} digest mismatch (found {actual})")]
    DigestMismatch { digest: String, actual: String },
    #[error("artifact store write failed: {0}")]
    WriteFailure(String),
}

/// Metadata persisted alongside each object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub ecosystem: String,
    pub origin: String,
    pub size: u64,
}

/// Append-only, content-addressed store keyed by sha256.
///
/// Writes go through a per-digest file lock plus tempfile-and-rename, so
/// concurrent writers of the same digest either race harmlessly to the same
/// final state or serialize; a partial write is never observable under a
/// digest. Nothing is ever deleted here; retention is an operational concern.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [OBJECTS_DIR, LOCKS_DIR, TMP_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("failed to create store directory {}", path.display()))?;
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stores `bytes` and returns their sha256 digest. Idempotent: storing
    /// identical bytes twice leaves the store unchanged on the second call.
    pub fn put_bytes(&self, bytes: &[u8], meta: &ArtifactMeta) -> Result<String> {
        let digest = hex::encode(Sha256::digest(bytes));
        self.put_under_lock(&digest, meta, |tmp| {
            tmp.write_all(bytes).map_err(Into::into)
        })?;
        Ok(digest)
    }

    /// Streams a file into the store and returns its sha256 digest.
    pub fn put_file(&self, source: &Path, meta: &ArtifactMeta) -> Result<String> {
        let digest = hash_file(source)?;
        self.put_under_lock(&digest, meta, |tmp| {
            let mut reader = File::open(source)
                .with_context(|| format!("failed to open {}", source.display()))?;
            std::io::copy(&mut reader, tmp)?;
            Ok(())
        })?;
        Ok(digest)
    }

    #[must_use]
    pub fn has(&self, digest: &str) -> bool {
        self.object_path(digest).is_file()
    }

    /// Absolute path of a stored object, if present.
    #[must_use]
    pub fn path(&self, digest: &str) -> Option<PathBuf> {
        let path = self.object_path(digest);
        path.is_file().then_some(path)
    }

    /// Reads an object back, verifying its content still matches the digest.
    pub fn get(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.object_path(digest);
        if !path.is_file() {
            return Err(StoreError::MissingObject {
                digest: digest.to_string(),
            }
            .into());
        }
        let bytes =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != digest {
            return Err(StoreError::DigestMismatch {
                digest: digest.to_string(),
                actual,
            }
            .into());
        }
        Ok(bytes)
    }

    pub fn meta(&self, digest: &str) -> Result<Option<ArtifactMeta>> {
        let path = self.meta_path(digest);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw).with_context(|| {
            format!("corrupt artifact metadata {}", path.display())
        })?))
    }

    fn put_under_lock(
        &self,
        digest: &str,
        meta: &ArtifactMeta,
        write: impl FnOnce(&mut NamedTempFile) -> Result<()>,
    ) -> Result<()> {
        let final_path = self.object_path(digest);
        if final_path.is_file() {
            debug!(digest, "artifact store hit");
            return Ok(());
        }

        let _lock = self.acquire_lock(digest)?;
        // Another writer may have won the race while we waited on the lock.
        if final_path.is_file() {
            debug!(digest, "artifact store hit after lock wait");
            return Ok(());
        }

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = NamedTempFile::new_in(self.root.join(TMP_DIR))
            .context("failed to create staging file in artifact store")?;
        write(&mut tmp)?;
        tmp.flush()?;
        tmp.persist(&final_path)
            .map_err(|err| StoreError::WriteFailure(err.to_string()))?;

        // The sidecar gets the same staging discipline as the object; a crash
        // must never leave a present object with a truncated sidecar.
        let mut meta_tmp = NamedTempFile::new_in(self.root.join(TMP_DIR))
            .with_context(|| format!("failed to stage metadata for {digest}"))?;
        meta_tmp.write_all(serde_json::to_string_pretty(meta)?.as_bytes())?;
        meta_tmp
            .persist(self.meta_path(digest))
            .map_err(|err| StoreError::WriteFailure(err.to_string()))?;
        debug!(digest, size = meta.size, "artifact stored");
        Ok(())
    }

    fn acquire_lock(&self, digest: &str) -> Result<File> {
        let path = self.root.join(LOCKS_DIR).join(format!("{digest}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open store lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(file)
    }

    fn object_path(&self, digest: &str) -> PathBuf {
        let shard = digest.get(0..2).unwrap_or("xx");
        self.root.join(OBJECTS_DIR).join(shard).join(digest)
    }

    fn meta_path(&self, digest: &str) -> PathBuf {
        let mut path = self.object_path(digest);
        path.set_extension("json");
        path
    }
}

pub(crate) fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn meta(size: u64) -> ArtifactMeta {
        ArtifactMeta {
            ecosystem: "gomod".to_string(),
            origin: "https://proxy.golang.org/example.com/y/@v/v1.2.0.zip".to_string(),
            size,
        }
    }

    #[test]
    fn put_is_idempotent() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path())?;

        let first = store.put_bytes(b"module bytes", &meta(12))?;
        let path = store.path(&first).unwrap();
        let mtime = fs::metadata(&path)?.modified()?;

        let second = store.put_bytes(b"module bytes", &meta(12))?;
        assert_eq!(first, second);
        assert_eq!(fs::metadata(&path)?.modified()?, mtime);
        Ok(())
    }

    #[test]
    fn get_round_trips_and_flags_missing() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path())?;
        let digest = store.put_bytes(b"payload", &meta(7))?;
        assert_eq!(store.get(&digest)?, b"payload");
        assert!(store.has(&digest));

        let missing = "0".repeat(64);
        let err = store.get(&missing).unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
        Ok(())
    }

    #[test]
    fn get_detects_corruption() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path())?;
        let digest = store.put_bytes(b"pristine", &meta(8))?;
        fs::write(store.path(&digest).unwrap(), b"tampered")?;
        let err = store.get(&digest).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DigestMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn meta_sidecar_survives() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path())?;
        let digest = store.put_bytes(b"abc", &meta(3))?;
        let loaded = store.meta(&digest)?.unwrap();
        assert_eq!(loaded.ecosystem, "gomod");
        assert_eq!(loaded.size, 3);
        Ok(())
    }

    #[test]
    fn sidecar_writes_leave_no_staging_files_behind() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path())?;
        let digest = store.put_bytes(b"abc", &meta(3))?;
        // Both the object and its sidecar were persisted out of tmp/.
        assert!(fs::read_dir(temp.path().join("tmp"))?.next().is_none());
        assert!(store.meta(&digest)?.is_some());
        Ok(())
    }

    #[test]
    fn concurrent_writers_of_same_digest_agree() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path())?;
        let digests: Vec<String> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    scope.spawn(move || store.put_bytes(b"contended bytes", &meta(15)))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("writer panicked").expect("put failed"))
                .collect()
        });
        assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(store.get(&digests[0])?, b"contended bytes");
        Ok(())
    }
}
