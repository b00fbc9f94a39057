use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use packmule_domain::{Dependency, DependencySet, PipelineError, RequestRecord, RequestState};
use packmule_resolver::{Resolution, ResolveOptions, ResolverRegistry};
use packmule_store::{ArtifactStore, RemoteProxy};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::backend::{BackendError, RequestBackend, TransitionPayload};
use crate::bundle::{BundleBuilder, BundleInputs};
use crate::config::Config;
use crate::fetch::{is_full_sha, SourceFetcher};
use crate::locks::{ExecutionLockTable, ExecutionResult, ResultsIndex};
use crate::queue::WorkItem;

/// Why an execution stopped before writing a terminal state of its own.
enum Halt {
    /// A newer attempt owns the record now; write nothing and walk away.
    Superseded,
    Pipeline(PipelineError),
}

impl From<PipelineError> for Halt {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

/// Drives one request through the pipeline: fetch, per-ecosystem resolution,
/// bundle assembly, and the state transitions around them.
pub struct Orchestrator {
    config: Config,
    store: ArtifactStore,
    fetcher: SourceFetcher,
    bundles: BundleBuilder,
    registry: ResolverRegistry,
    backend: Arc<dyn RequestBackend>,
    locks: ExecutionLockTable,
    results: ResultsIndex,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        registry: ResolverRegistry,
        backend: Arc<dyn RequestBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let store = ArtifactStore::open(config.sources_dir.join("artifacts"))
            .context("failed to open the artifact store")?;
        let fetcher = SourceFetcher::new(&config.sources_dir, config.stage_timeout);
        let bundles = BundleBuilder::new(&config.bundles_dir);
        let locks = ExecutionLockTable::new(&config.sources_dir);
        let results = ResultsIndex::new(&config.sources_dir);
        Ok(Self {
            config,
            store,
            fetcher,
            bundles,
            registry,
            backend,
            locks,
            results,
        })
    }

    /// Runs one work item to a terminal state and reports the state reached.
    ///
    /// Items for superseded attempts or already-terminal requests are skipped
    /// without touching the record.
    pub fn execute(&self, item: &WorkItem) -> Result<RequestState> {
        let record = self.backend.load(item.request_id)?;
        if record.attempt != item.attempt {
            info!(
                request_id = item.request_id,
                held = item.attempt,
                current = record.attempt,
                "skipping superseded work item"
            );
            return Ok(record.state);
        }
        if record.state.is_terminal() {
            info!(
                request_id = item.request_id,
                state = record.state.as_str(),
                "request already terminal, nothing to do"
            );
            return Ok(record.state);
        }

        match self.run_pipeline(item, &record) {
            Ok(()) => Ok(RequestState::Complete),
            Err(Halt::Superseded) => Ok(RequestState::Stale),
            Err(Halt::Pipeline(err)) => {
                warn!(
                    request_id = item.request_id,
                    kind = err.kind().as_str(),
                    "request failed: {}",
                    err.message()
                );
                self.finish(
                    item,
                    RequestState::Failed,
                    err.message(),
                    TransitionPayload::Failure(&err),
                )?;
                Ok(RequestState::Failed)
            }
        }
    }

    fn run_pipeline(&self, item: &WorkItem, record: &RequestRecord) -> Result<(), Halt> {
        // Fail fast on ecosystems this deployment cannot resolve; retrying
        // would never help.
        for ecosystem in &record.ecosystems {
            if self.registry.get(ecosystem).is_none() {
                return Err(PipelineError::resolution(format!(
                    "the package manager \"{ecosystem}\" is not enabled (enabled: {})",
                    self.registry.ecosystems().join(", ")
                ))
                .into());
            }
        }

        self.transition(
            item,
            RequestState::InProgress,
            "Fetching the application source",
            TransitionPayload::None,
        )?;

        // Identical (repo, ref) executions run one at a time system-wide, so
        // a burst of duplicate requests does the expensive work once.
        let _lock = self
            .locks
            .acquire(&record.repo, &record.reference)
            .map_err(|err| PipelineError::fetch(err.to_string(), true))?;

        if is_full_sha(&record.reference) {
            if let Some(prior) = self
                .results
                .load(&record.repo, &record.reference, &record.ecosystems)
                .unwrap_or_default()
            {
                info!(
                    request_id = item.request_id,
                    repo = %record.repo,
                    revision = %record.reference,
                    "reusing the result of an identical completed request"
                );
                // A bundle belongs to its request id, so the winner's archive
                // is replicated under this request's name.
                let bundle = self.bundles.replicate(item.request_id, &prior.bundle)?;
                self.transition(
                    item,
                    RequestState::Complete,
                    "Completed successfully",
                    TransitionPayload::Success {
                        bundle: &bundle,
                        dependencies: &prior.dependencies,
                        environment_variables: &prior.environment_variables,
                        pinned_revision: &prior.pinned_revision,
                    },
                )?;
                return Ok(());
            }
        }

        self.checkpoint(item)?;
        let snapshot = self.with_retries("fetch", || {
            self.fetcher.fetch(&record.repo, &record.reference)
        })?;
        self.transition(
            item,
            RequestState::InProgress,
            "Fetching dependencies",
            TransitionPayload::PinnedRevision(&snapshot.pinned_revision),
        )?;

        let scratch = tempfile::tempdir()
            .map_err(|err| PipelineError::fetch(format!("workspace setup failed: {err}"), true))?;
        let app_dir = scratch.path().join("app");
        self.fetcher.extract(&snapshot, &app_dir)?;

        self.checkpoint(item)?;
        let resolutions = self.resolve_all(record, &app_dir, scratch.path())?;
        let (dependencies, environment_variables) = merge_resolutions(&resolutions)?;

        self.checkpoint(item)?;
        self.transition(
            item,
            RequestState::InProgress,
            "Assembling the bundle",
            TransitionPayload::None,
        )?;
        let mirrors: Vec<(String, PathBuf)> = resolutions
            .iter()
            .map(|res| (res.ecosystem.clone(), res.mirror_dir.clone()))
            .collect();
        let bundle = self.with_retries("bundle", || {
            self.bundles.build(&BundleInputs {
                request_id: item.request_id,
                app_dir: &app_dir,
                mirrors: &mirrors,
                dependencies: &dependencies,
                store: &self.store,
            })
        })?;

        if is_full_sha(&record.reference) {
            let result = ExecutionResult {
                pinned_revision: snapshot.pinned_revision.clone(),
                bundle: bundle.clone(),
                dependencies: dependencies.clone(),
                environment_variables: environment_variables.clone(),
            };
            if let Err(err) =
                self.results
                    .record(&record.repo, &record.reference, &record.ecosystems, &result)
            {
                // Reuse is an optimization; the request itself still succeeded.
                warn!(request_id = item.request_id, "failed to record result for reuse: {err:#}");
            }
        }

        self.transition(
            item,
            RequestState::Complete,
            "Completed successfully",
            TransitionPayload::Success {
                bundle: &bundle,
                dependencies: &dependencies,
                environment_variables: &environment_variables,
                pinned_revision: &snapshot.pinned_revision,
            },
        )?;
        Ok(())
    }

    /// Runs every requested ecosystem's resolver, in parallel, each against a
    /// private scratch directory.
    fn resolve_all(
        &self,
        record: &RequestRecord,
        app_dir: &std::path::Path,
        scratch: &std::path::Path,
    ) -> Result<Vec<Resolution>, Halt> {
        let outcomes: Vec<Result<Resolution, PipelineError>> = record
            .ecosystems
            .par_iter()
            .map(|ecosystem| {
                let resolver = self
                    .registry
                    .get(ecosystem)
                    .ok_or_else(|| PipelineError::resolution(format!(
                        "the package manager \"{ecosystem}\" is not enabled"
                    )))?;
                let eco_scratch = scratch.join("resolve").join(ecosystem);
                std::fs::create_dir_all(&eco_scratch).map_err(|err| {
                    PipelineError::resolution(format!("workspace setup failed: {err}"))
                })?;
                let options = self.resolve_options(ecosystem)?;
                self.with_retries(ecosystem, || {
                    resolver.resolve(app_dir, &eco_scratch, &options, &self.store)
                })
            })
            .collect();

        let mut resolutions = Vec::with_capacity(outcomes.len());
        let mut first_err: Option<PipelineError> = None;
        for outcome in outcomes {
            match outcome {
                Ok(resolution) => resolutions.push(resolution),
                // Prefer reporting a final error over a retryable one, so the
                // recorded failure names the real blocker.
                Err(err) => match &first_err {
                    Some(existing) if !existing.retryable() => {}
                    _ => first_err = Some(err),
                },
            }
        }
        if let Some(err) = first_err {
            return Err(err.into());
        }
        Ok(resolutions)
    }

    fn resolve_options(&self, ecosystem: &str) -> Result<ResolveOptions, PipelineError> {
        let proxy = match self.config.proxy_for(ecosystem) {
            Some(url) => {
                let proxy = RemoteProxy::new(url).map_err(|err| {
                    PipelineError::resolution(format!("invalid proxy for {ecosystem}: {err}"))
                })?;
                // A dead proxy should fail fast here, not mid-resolution.
                proxy
                    .probe(self.config.stage_timeout)
                    .map_err(|err| PipelineError::fetch(err.to_string(), true))?;
                Some(proxy)
            }
            None => None,
        };
        Ok(ResolveOptions {
            subdir: None,
            proxy,
            timeout: self.config.stage_timeout,
        })
    }

    /// Retries a stage while its failures stay retryable, with exponential
    /// backoff between attempts. Exhaustion keeps the final error's kind and
    /// marks the budget in the message.
    fn with_retries<T>(
        &self,
        stage: &str,
        mut run: impl FnMut() -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let budget = self.config.retry_budget.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match run() {
                Ok(value) => return Ok(value),
                Err(err) if !err.retryable() => return Err(err),
                Err(err) if attempt >= budget => {
                    return Err(exhausted(err, budget));
                }
                Err(err) => {
                    let delay = self.config.backoff_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        stage,
                        attempt,
                        "retrying in {}ms: {}",
                        delay.as_millis(),
                        err.message()
                    );
                    thread::sleep(delay);
                }
            }
        }
    }

    /// Reloads the record between stages to honor cancellation and detect
    /// supersession before more expensive work begins.
    fn checkpoint(&self, item: &WorkItem) -> Result<(), Halt> {
        let record = self
            .backend
            .load(item.request_id)
            .map_err(|err| PipelineError::fetch(err.to_string(), true))?;
        if record.attempt != item.attempt {
            return Err(Halt::Superseded);
        }
        if record.cancel_requested {
            return Err(PipelineError::cancelled("the request was cancelled by the user").into());
        }
        Ok(())
    }

    fn transition(
        &self,
        item: &WorkItem,
        state: RequestState,
        reason: &str,
        payload: TransitionPayload<'_>,
    ) -> Result<(), Halt> {
        match self
            .backend
            .transition(item.request_id, item.attempt, state, reason, payload)
        {
            Ok(()) => Ok(()),
            Err(err) if is_superseded(&err) => Err(Halt::Superseded),
            Err(err) => Err(PipelineError::fetch(
                format!("failed to persist state: {err:#}"),
                true,
            )
            .into()),
        }
    }

    /// Terminal transition; a supersession here means a newer attempt already
    /// owns the record, which is fine.
    fn finish(
        &self,
        item: &WorkItem,
        state: RequestState,
        reason: &str,
        payload: TransitionPayload<'_>,
    ) -> Result<()> {
        match self
            .backend
            .transition(item.request_id, item.attempt, state, reason, payload)
        {
            Ok(()) => Ok(()),
            Err(err) if is_superseded(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn is_superseded(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<BackendError>(),
        Some(BackendError::Superseded { .. })
    )
}

fn exhausted(err: PipelineError, budget: u32) -> PipelineError {
    let suffix = format!(" (retry budget of {budget} attempts exhausted)");
    match err {
        PipelineError::Fetch { message, retryable } => PipelineError::Fetch {
            message: message + &suffix,
            retryable,
        },
        PipelineError::Bundle { message, retryable } => PipelineError::Bundle {
            message: message + &suffix,
            retryable,
        },
        other => other,
    }
}

/// Folds per-ecosystem resolutions into one dependency closure and one
/// consumer environment. A variable two ecosystems want with different values
/// is unsatisfiable.
fn merge_resolutions(
    resolutions: &[Resolution],
) -> Result<(Vec<Dependency>, BTreeMap<String, String>), PipelineError> {
    let mut deps = DependencySet::new();
    let mut env: BTreeMap<String, String> = BTreeMap::new();
    for resolution in resolutions {
        deps.extend(resolution.dependencies.iter().cloned())
            .map_err(|err| PipelineError::resolution(err.to_string()))?;
        for (key, value) in &resolution.environment_variables {
            match env.get(key) {
                Some(existing) if existing != value => {
                    return Err(PipelineError::resolution(format!(
                        "conflicting values for environment variable {key}: \
                         \"{existing}\" vs \"{value}\""
                    )));
                }
                _ => {
                    env.insert(key.clone(), value.clone());
                }
            }
        }
    }
    Ok((deps.into_vec(), env))
}
