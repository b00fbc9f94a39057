//! Go modules resolver.
//!
//! The dependency graph itself comes from the `go` toolchain (`go mod
//! download`, `go list -m all`, `go mod graph`); this module wires those
//! invocations to a private GOPATH, ingests every module archive into the
//! artifact store, and stages the module download cache as the offline
//! mirror. Checksum verification against go.sum is the toolchain's job; the
//! sha256 recorded in the store is our ground truth for the fetched bytes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use packmule_domain::{Dependency, DependencySet, PipelineError};
use packmule_store::{
    download_verified, escape_module_path, ArtifactMeta, ArtifactStore, DownloadRequest,
    RemoteProxy,
};
use serde::Deserialize;
use tracing::{debug, info};
use which::which;

use crate::exec::{copy_tree, is_timeout, stderr_text, Invocation};
use crate::{EcosystemResolver, ResolveOptions, Resolution};

const ECOSYSTEM: &str = "gomod";
const DEFAULT_GOPROXY: &str = "https://proxy.golang.org";

pub struct GomodResolver;

impl GomodResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for GomodResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// One record of `go mod download -json` output.
#[derive(Debug, Deserialize)]
struct DownloadRecord {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Zip", default)]
    zip: Option<PathBuf>,
    #[serde(rename = "Sum", default)]
    sum: Option<String>,
    #[serde(rename = "Error", default)]
    error: Option<String>,
}

impl EcosystemResolver for GomodResolver {
    fn ecosystem(&self) -> &'static str {
        ECOSYSTEM
    }

    fn resolve(
        &self,
        workspace: &Path,
        scratch: &Path,
        options: &ResolveOptions,
        store: &ArtifactStore,
    ) -> Result<Resolution, PipelineError> {
        let go = which("go").map_err(|_| {
            PipelineError::resolution("the go toolchain is not available on this worker")
        })?;

        let project_dir = match &options.subdir {
            Some(subdir) => workspace.join(subdir),
            None => workspace.to_path_buf(),
        };
        let manifest = Manifest::load(&project_dir.join("go.mod"))?;
        info!(module = %manifest.module_path, "resolving gomod dependencies");

        let gopath = scratch.join("gomod-gopath");
        let gocache = scratch.join("gomod-gocache");
        for dir in [&gopath, &gocache] {
            fs::create_dir_all(dir)
                .map_err(|err| PipelineError::resolution(format!("cannot prepare GOPATH: {err}")))?;
        }

        let download_out = self.run_go(
            &go,
            &project_dir,
            &gopath,
            &gocache,
            options,
            &["mod", "download", "-json"],
        )?;
        let records = parse_download_records(&download_out)?;

        let list_out = self.run_go(
            &go,
            &project_dir,
            &gopath,
            &gocache,
            options,
            &["list", "-m", "all"],
        )?;
        let resolved = parse_module_list(&list_out, &manifest.module_path)?;

        let graph_out =
            self.run_go(&go, &project_dir, &gopath, &gocache, options, &["mod", "graph"])?;
        let parents = parse_module_graph(&graph_out, &manifest.module_path);

        let origin_proxy = match &options.proxy {
            Some(proxy) => proxy.clone(),
            None => RemoteProxy::new(DEFAULT_GOPROXY)
                .map_err(|err| PipelineError::resolution(err.to_string()))?,
        };
        let by_identity: HashMap<(String, String), &DownloadRecord> = records
            .iter()
            .map(|record| ((record.path.clone(), record.version.clone()), record))
            .collect();
        let download_cache = gopath.join("pkg").join("mod").join("cache").join("download");

        let mut set = DependencySet::new();
        for (path, version) in &resolved {
            let identity = (path.clone(), version.clone());
            let digest = match by_identity.get(&identity).and_then(|record| record.zip.as_ref()) {
                Some(zip) => ingest_zip(store, &origin_proxy, path, version, zip)?,
                // `go mod download` prunes modules outside the build list;
                // fetch those straight from the proxy so every resolved
                // module has a stored artifact and a mirror entry.
                None => fetch_missing_zip(
                    store,
                    &origin_proxy,
                    path,
                    version,
                    options.timeout,
                    &download_cache,
                )?,
            };
            let dep = Dependency {
                ecosystem: ECOSYSTEM.to_string(),
                name: path.clone(),
                version: version.clone(),
                requirement: manifest.requires.get(path).cloned(),
                digest: Some(digest),
                direct: manifest.requires.contains_key(path),
                parents: parents
                    .get(&format!("{path}@{version}"))
                    .cloned()
                    .unwrap_or_default(),
            };
            set.insert(dep)
                .map_err(|err| PipelineError::resolution(err.to_string()))?;
        }

        let mirror_dir = scratch.join("mirror").join(ECOSYSTEM);
        if download_cache.is_dir() {
            copy_tree(&download_cache, &mirror_dir.join("pkg/mod/cache/download"))
                .map_err(|err| PipelineError::resolution(format!("mirror staging failed: {err}")))?;
        } else {
            fs::create_dir_all(&mirror_dir)
                .map_err(|err| PipelineError::resolution(format!("mirror staging failed: {err}")))?;
        }

        // Variables the consumer exports so `go build` works offline against
        // the bundled mirror.
        let mut environment_variables = BTreeMap::new();
        environment_variables.insert("GOPATH".to_string(), format!("deps/{ECOSYSTEM}"));
        environment_variables.insert("GOCACHE".to_string(), format!("deps/{ECOSYSTEM}"));
        environment_variables.insert("GOFLAGS".to_string(), "-mod=mod".to_string());

        debug!(
            dependencies = set.len(),
            mirror = %mirror_dir.display(),
            "gomod resolution finished"
        );
        Ok(Resolution {
            ecosystem: ECOSYSTEM.to_string(),
            dependencies: set.into_vec(),
            mirror_dir,
            environment_variables,
        })
    }
}

impl GomodResolver {
    fn run_go(
        &self,
        go: &Path,
        project_dir: &Path,
        gopath: &Path,
        gocache: &Path,
        options: &ResolveOptions,
        args: &[&str],
    ) -> Result<String, PipelineError> {
        let mut invocation = Invocation::new(go, options.timeout)
            .args(args.iter().copied())
            .current_dir(project_dir)
            .env("GOPATH", gopath)
            .env("GOCACHE", gocache)
            .env("GO111MODULE", "on")
            .env("GOFLAGS", "-mod=mod");
        if let Some(proxy) = &options.proxy {
            invocation = invocation.env("GOPROXY", proxy.base_url().as_str());
        }

        let output = invocation.run().map_err(|err| {
            if is_timeout(&err) {
                PipelineError::fetch(err.to_string(), true)
            } else {
                PipelineError::resolution(err.to_string())
            }
        })?;
        if !output.status.success() {
            return Err(classify_go_failure(&stderr_text(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Maps `go` stderr onto the pipeline taxonomy.
fn classify_go_failure(stderr: &str) -> PipelineError {
    const MANIFEST_MARKERS: &[&str] = &[
        "go.mod file not found",
        "errors parsing go.mod",
        "cannot determine module path",
        "malformed module path",
    ];
    const NETWORK_MARKERS: &[&str] = &[
        "dial tcp",
        "i/o timeout",
        "connection refused",
        "connection reset",
        "TLS handshake",
        "no such host",
        "proxy.golang.org",
        "502 Bad Gateway",
        "503 Service Unavailable",
    ];

    if MANIFEST_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        PipelineError::manifest(stderr.to_string())
    } else if NETWORK_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        PipelineError::fetch(stderr.to_string(), true)
    } else {
        PipelineError::resolution(stderr.to_string())
    }
}

fn parse_download_records(stdout: &str) -> Result<Vec<DownloadRecord>, PipelineError> {
    let mut records = Vec::new();
    let stream = serde_json::Deserializer::from_str(stdout).into_iter::<DownloadRecord>();
    for record in stream {
        let record = record.map_err(|err| {
            PipelineError::resolution(format!("malformed `go mod download` output: {err}"))
        })?;
        if let Some(error) = &record.error {
            return Err(classify_go_failure(error));
        }
        records.push(record);
    }
    Ok(records)
}

/// Parses `go list -m all`: the main module leads, dependencies follow as
/// `path version` pairs.
fn parse_module_list(
    stdout: &str,
    main_module: &str,
) -> Result<Vec<(String, String)>, PipelineError> {
    let mut resolved = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let mut parts = line.split_whitespace();
        let path = parts.next().unwrap_or_default().to_string();
        match parts.next() {
            None if path == main_module => {}
            None => {
                return Err(PipelineError::resolution(format!(
                    "unversioned module '{path}' in `go list -m all` output"
                )))
            }
            Some(version) => resolved.push((path, version.to_string())),
        }
    }
    Ok(resolved)
}

/// Parses `go mod graph` into child -> parent identifiers. The main module
/// appears without a version; its children are the direct requirements.
fn parse_module_graph(stdout: &str, main_module: &str) -> HashMap<String, BTreeSet<String>> {
    let mut parents: HashMap<String, BTreeSet<String>> = HashMap::new();
    for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let mut parts = line.split_whitespace();
        let (Some(parent), Some(child)) = (parts.next(), parts.next()) else {
            continue;
        };
        let parent_id = if parent == main_module {
            main_module.to_string()
        } else {
            parent.to_string()
        };
        parents
            .entry(child.to_string())
            .or_default()
            .insert(parent_id);
    }
    parents
}

fn ingest_zip(
    store: &ArtifactStore,
    proxy: &RemoteProxy,
    path: &str,
    version: &str,
    zip: &Path,
) -> Result<String, PipelineError> {
    let origin = proxy
        .zip_url(path, version)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| format!("{DEFAULT_GOPROXY}/{path}/@v/{version}.zip"));
    let size = fs::metadata(zip).map(|meta| meta.len()).unwrap_or(0);
    let meta = ArtifactMeta {
        ecosystem: ECOSYSTEM.to_string(),
        origin,
        size,
    };
    store.put_file(zip, &meta).map_err(|err| {
        PipelineError::bundle(
            format!("failed to ingest module archive for {path}@{version}: {err}"),
            false,
        )
    })
}

/// Fetches a module archive the toolchain did not download, via the proxy
/// protocol, and stages it into the download cache so the offline mirror
/// stays complete.
fn fetch_missing_zip(
    store: &ArtifactStore,
    proxy: &RemoteProxy,
    path: &str,
    version: &str,
    timeout: Duration,
    download_cache: &Path,
) -> Result<String, PipelineError> {
    // Pin the version through the proxy first; a version it does not serve
    // is a resolution problem, not a transport one.
    let info = proxy
        .module_info(path, version, timeout)
        .map_err(|err| PipelineError::fetch(err.to_string(), true))?;
    if info.version != version {
        return Err(PipelineError::resolution(format!(
            "proxy serves {path}@{} where {version} was resolved",
            info.version
        )));
    }

    let url = proxy
        .zip_url(path, version)
        .map_err(|err| PipelineError::resolution(err.to_string()))?;
    let artifact = download_verified(
        store,
        &DownloadRequest {
            ecosystem: ECOSYSTEM,
            url: url.as_str(),
            expected_sha256: None,
            timeout,
        },
    )
    .map_err(|err| PipelineError::fetch(err.to_string(), true))?;

    let entry_dir = download_cache.join(escape_module_path(path)).join("@v");
    let stage = || -> Result<()> {
        fs::create_dir_all(&entry_dir)?;
        let object = store.path(&artifact.digest).ok_or_else(|| {
            anyhow::anyhow!("artifact {} vanished from the store", artifact.digest)
        })?;
        fs::copy(&object, entry_dir.join(format!("{version}.zip")))?;
        fs::write(
            entry_dir.join(format!("{version}.info")),
            serde_json::to_string(&info)?,
        )?;
        Ok(())
    };
    stage().map_err(|err| {
        PipelineError::resolution(format!("mirror staging failed for {path}@{version}: {err}"))
    })?;
    debug!(module = path, version, "fetched module archive through the proxy");
    Ok(artifact.digest)
}

/// The parts of go.mod the pipeline needs: the module path and the direct
/// (non-indirect) requirements.
#[derive(Debug)]
struct Manifest {
    module_path: String,
    requires: BTreeMap<String, String>,
}

impl Manifest {
    fn load(path: &Path) -> Result<Self, PipelineError> {
        if !path.is_file() {
            return Err(PipelineError::manifest(format!(
                "go.mod not found at {}",
                path.display()
            )));
        }
        let contents = fs::read_to_string(path)
            .map_err(|err| PipelineError::manifest(format!("unreadable go.mod: {err}")))?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, PipelineError> {
        let mut module_path = None;
        let mut requires = BTreeMap::new();
        let mut in_require_block = false;

        for raw in contents.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            if let Some(rest) = line.strip_prefix("module ") {
                module_path = Some(rest.trim().trim_matches('"').to_string());
            } else if line == "require (" {
                in_require_block = true;
            } else if in_require_block && line == ")" {
                in_require_block = false;
            } else if in_require_block {
                push_require(&mut requires, line);
            } else if let Some(rest) = line.strip_prefix("require ") {
                push_require(&mut requires, rest.trim());
            }
        }

        let module_path = module_path
            .ok_or_else(|| PipelineError::manifest("go.mod is missing a module directive"))?;
        Ok(Self {
            module_path,
            requires,
        })
    }
}

fn push_require(requires: &mut BTreeMap<String, String>, line: &str) {
    if line.contains("// indirect") {
        return;
    }
    let mut parts = line.split_whitespace();
    if let (Some(path), Some(version)) = (parts.next(), parts.next()) {
        requires.insert(path.to_string(), version.to_string());
    }
}
