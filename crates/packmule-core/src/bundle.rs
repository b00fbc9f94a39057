use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::{write::GzEncoder, Compression};
use packmule_domain::{BundleRef, Dependency, PipelineError};
use packmule_store::ArtifactStore;
use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::info;

/// Everything the builder needs to assemble one request's archive.
pub struct BundleInputs<'a> {
    pub request_id: u64,
    /// Extracted source tree; lands at `app/` in the archive.
    pub app_dir: &'a Path,
    /// Per-ecosystem offline mirrors; each lands at `deps/<ecosystem>/`.
    pub mirrors: &'a [(String, PathBuf)],
    pub dependencies: &'a [Dependency],
    pub store: &'a ArtifactStore,
}

/// Assembles the downloadable archive: the source tree plus one offline
/// dependency mirror per ecosystem, written atomically so a partial bundle is
/// never visible to downloaders.
pub struct BundleBuilder {
    bundles_dir: PathBuf,
}

impl BundleBuilder {
    pub fn new(bundles_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundles_dir: bundles_dir.into(),
        }
    }

    #[must_use]
    pub fn bundle_path(&self, request_id: u64) -> PathBuf {
        self.bundles_dir.join(format!("{request_id}.tar.gz"))
    }

    pub fn build(&self, inputs: &BundleInputs<'_>) -> Result<BundleRef, PipelineError> {
        // Internal consistency first: every resolved artifact must still be
        // in the store. A miss here is a fault in the pipeline, not the user.
        for dep in inputs.dependencies {
            if let Some(digest) = &dep.digest {
                if !inputs.store.has(digest) {
                    return Err(PipelineError::bundle(
                        format!(
                            "artifact {digest} for {} is missing from the store",
                            dep.identifier()
                        ),
                        false,
                    ));
                }
            }
        }

        let final_path = self.bundle_path(inputs.request_id);
        self.write_archive(inputs, &final_path)
            .map_err(|err| PipelineError::bundle(err.to_string(), true))?;

        let bytes = fs::metadata(&final_path)
            .map_err(|err| PipelineError::bundle(err.to_string(), true))?
            .len();
        let checksum = hash_file(&final_path)
            .map_err(|err| PipelineError::bundle(err.to_string(), true))?;
        info!(
            request_id = inputs.request_id,
            path = %final_path.display(),
            size = bytes,
            "bundle written"
        );
        Ok(BundleRef {
            path: final_path,
            size: bytes,
            checksum,
            created_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        })
    }

    /// Replicates an existing bundle under a new request id.
    ///
    /// The copy is staged and renamed exactly like a fresh build, so a
    /// downloader polling the final path never observes a partial archive.
    pub fn replicate(&self, request_id: u64, prior: &BundleRef) -> Result<BundleRef, PipelineError> {
        let final_path = self.bundle_path(request_id);
        if final_path != prior.path {
            self.stage_copy(&prior.path, &final_path)
                .map_err(|err| PipelineError::bundle(err.to_string(), true))?;
        }
        Ok(BundleRef {
            path: final_path,
            size: prior.size,
            checksum: prior.checksum.clone(),
            created_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        })
    }

    fn stage_copy(&self, source: &Path, final_path: &Path) -> Result<()> {
        let staging_dir = self.bundles_dir.join("temp");
        fs::create_dir_all(&staging_dir)?;
        let staged = staging_dir.join(
            final_path
                .file_name()
                .context("bundle path has no file name")?,
        );
        fs::copy(source, &staged)
            .with_context(|| format!("failed to copy {}", source.display()))?;
        fs::rename(&staged, final_path)
            .with_context(|| format!("failed to move bundle into {}", final_path.display()))?;
        Ok(())
    }

    fn write_archive(&self, inputs: &BundleInputs<'_>, final_path: &Path) -> Result<()> {
        let staging_dir = self.bundles_dir.join("temp");
        fs::create_dir_all(&staging_dir)?;
        let staged = staging_dir.join(format!("{}.tar.gz", inputs.request_id));

        {
            let file = File::create(&staged)
                .with_context(|| format!("failed to create {}", staged.display()))?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.follow_symlinks(false);

            append_tree(&mut builder, inputs.app_dir, Path::new("app"))?;
            for (ecosystem, mirror) in inputs.mirrors {
                append_tree(&mut builder, mirror, &Path::new("deps").join(ecosystem))?;
            }

            let encoder = builder.into_inner()?;
            encoder.finish()?;
        }

        // Staged under a temporary name, renamed into place on success.
        fs::rename(&staged, final_path)
            .with_context(|| format!("failed to move bundle into {}", final_path.display()))?;
        Ok(())
    }
}

/// Appends a directory tree under `prefix`, in sorted order so identical
/// inputs always produce identical entry sequences.
fn append_tree<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    source: &Path,
    prefix: &Path,
) -> Result<()> {
    for entry in walkdir::WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("walked entry escaped its root")?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = prefix.join(relative);
        if entry.file_type().is_dir() {
            builder.append_dir(&name, entry.path())?;
        } else if entry.file_type().is_file() {
            builder
                .append_path_with_name(entry.path(), &name)
                .with_context(|| format!("failed to archive {}", entry.path().display()))?;
        }
    }
    Ok(())
}

fn hash_file(path: &Path) -> Result<String> {
    use std::io::Read;
    let mut file = File::open(path)?;
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
    use flate2::read::GzDecoder;
    use packmule_store::ArtifactMeta;
    use std::collections::BTreeSet;

    fn sample_dep(digest: Option<String>) -> Dependency {
        Dependency {
            ecosystem: "gomod".to_string(),
            name: "example.com/y".to_string(),
            version: "v1.2.0".to_string(),
            requirement: Some("v1.2.0".to_string()),
            digest,
            direct: true,
            parents: BTreeSet::new(),
        }
    }

    fn archive_names(path: &Path) -> Vec<String> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .display()
                    .to_string()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn bundle_contains_app_and_per_ecosystem_mirrors() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path().join("store"))?;
        let meta = ArtifactMeta {
            ecosystem: "gomod".to_string(),
            origin: "https://proxy.golang.org/example.com/y/@v/v1.2.0.zip".to_string(),
            size: 3,
        };
        let digest = store.put_bytes(b"zip", &meta)?;

        let app = temp.path().join("app-src");
        fs::create_dir_all(app.join("cmd"))?;
        fs::write(app.join("go.mod"), "module example.com/app\n")?;
        fs::write(app.join("cmd/main.go"), "package main\n")?;

        let mirror = temp.path().join("mirror");
        fs::create_dir_all(mirror.join("pkg/mod/cache/download/example.com/y/@v"))?;
        fs::write(
            mirror.join("pkg/mod/cache/download/example.com/y/@v/v1.2.0.zip"),
            b"zip",
        )?;

        let bundles = temp.path().join("bundles");
        fs::create_dir_all(&bundles)?;
        let builder = BundleBuilder::new(&bundles);
        let mirrors = vec![("gomod".to_string(), mirror)];
        let deps = vec![sample_dep(Some(digest))];
        let bundle = builder.build(&BundleInputs {
            request_id: 42,
            app_dir: &app,
            mirrors: &mirrors,
            dependencies: &deps,
            store: &store,
        })?;

        assert_eq!(bundle.path, bundles.join("42.tar.gz"));
        assert!(bundle.size > 0);
        assert_eq!(bundle.checksum.len(), 64);

        let names = archive_names(&bundle.path);
        assert!(names.contains(&"app/go.mod".to_string()));
        assert!(names.contains(&"app/cmd/main.go".to_string()));
        assert!(names
            .contains(&"deps/gomod/pkg/mod/cache/download/example.com/y/@v/v1.2.0.zip".to_string()));
        Ok(())
    }

    #[test]
    fn missing_artifact_is_a_consistency_fault() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path().join("store"))?;
        let app = temp.path().join("app-src");
        fs::create_dir_all(&app)?;
        let bundles = temp.path().join("bundles");
        fs::create_dir_all(&bundles)?;

        let deps = vec![sample_dep(Some("0".repeat(64)))];
        let err = BundleBuilder::new(&bundles)
            .build(&BundleInputs {
                request_id: 7,
                app_dir: &app,
                mirrors: &[],
                dependencies: &deps,
                store: &store,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Bundle {
                retryable: false,
                ..
            }
        ));
        // Nothing may appear under the final name on failure.
        assert!(!bundles.join("7.tar.gz").exists());
        Ok(())
    }

    #[test]
    fn replicated_bundles_are_staged_then_renamed() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path().join("store"))?;
        let app = temp.path().join("app-src");
        fs::create_dir_all(&app)?;
        fs::write(app.join("go.mod"), "module example.com/app\n")?;
        let bundles = temp.path().join("bundles");
        fs::create_dir_all(&bundles)?;
        let builder = BundleBuilder::new(&bundles);

        let first = builder.build(&BundleInputs {
            request_id: 1,
            app_dir: &app,
            mirrors: &[],
            dependencies: &[],
            store: &store,
        })?;
        let copy = builder.replicate(2, &first)?;

        assert_eq!(copy.path, bundles.join("2.tar.gz"));
        assert_eq!(copy.checksum, first.checksum);
        assert_eq!(fs::read(&first.path)?, fs::read(&copy.path)?);
        // The copy went through the staging area and left it clean.
        assert!(fs::read_dir(bundles.join("temp"))?.next().is_none());
        Ok(())
    }

    #[test]
    fn identical_inputs_produce_identical_entry_order() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::open(temp.path().join("store"))?;
        let app = temp.path().join("app-src");
        fs::create_dir_all(&app)?;
        for name in ["b.txt", "a.txt", "c.txt"] {
            fs::write(app.join(name), name)?;
        }
        let bundles = temp.path().join("bundles");
        fs::create_dir_all(&bundles)?;
        let builder = BundleBuilder::new(&bundles);

        let first = builder.build(&BundleInputs {
            request_id: 1,
            app_dir: &app,
            mirrors: &[],
            dependencies: &[],
            store: &store,
        })?;
        let second = builder.build(&BundleInputs {
            request_id: 2,
            app_dir: &app,
            mirrors: &[],
            dependencies: &[],
            store: &store,
        })?;
        assert_eq!(archive_names(&first.path), archive_names(&second.path));
        Ok(())
    }
}
