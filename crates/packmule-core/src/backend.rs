use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use anyhow::{Context, Result};
use fs4::FileExt;
use packmule_domain::{
    BundleRef, Dependency, PipelineError, RequestRecord, RequestState, StateEntry,
};
use tempfile::NamedTempFile;

/// Data attached to a state transition.
pub enum TransitionPayload<'a> {
    None,
    /// Written once by the source fetcher when the ref is pinned.
    PinnedRevision(&'a str),
    Success {
        bundle: &'a BundleRef,
        dependencies: &'a [Dependency],
        environment_variables: &'a BTreeMap<String, String>,
        pinned_revision: &'a str,
    },
    Failure(&'a PipelineError),
}

/// Narrow surface the external API/persistence layer provides to workers.
///
/// `attempt` guards every transition: a call made by a superseded execution
/// (its attempt number is behind the record's) is rejected with
/// [`BackendError::Superseded`] so stale workers can never clobber the
/// current attempt's state.
pub trait RequestBackend: Send + Sync {
    fn load(&self, id: u64) -> Result<RequestRecord>;

    fn transition(
        &self,
        id: u64,
        attempt: u32,
        state: RequestState,
        reason: &str,
        payload: TransitionPayload<'_>,
    ) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request {0} not found")]
    NotFound(u64),
    #[error("execution superseded: attempt {held} is behind current attempt {current}")]
    Superseded { held: u32, current: u32 },
}

/// On-disk JSON implementation used by the CLI and tests: one record per
/// request under `<data_dir>/<id>.json`, guarded by a file lock per record.
pub struct JsonBackend {
    data_dir: PathBuf,
}

impl JsonBackend {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    /// Persists a freshly created record and returns its id.
    pub fn create(&self, record: &RequestRecord) -> Result<u64> {
        self.write_record(record)?;
        Ok(record.id)
    }

    /// Smallest id not yet in use; the external API layer owns real id
    /// allocation, this is just enough for the CLI.
    pub fn next_id(&self) -> Result<u64> {
        let mut max = 0u64;
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if let Ok(id) = stem.parse::<u64>() {
                    max = max.max(id);
                }
            }
        }
        Ok(max + 1)
    }

    pub fn list_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    if let Ok(id) = stem.parse::<u64>() {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Marks a request for cancellation; the orchestrator honors the flag at
    /// the next stage boundary.
    pub fn request_cancel(&self, id: u64) -> Result<()> {
        let _lock = self.lock_record(id)?;
        let mut record = self.read_record(id)?;
        record.cancel_requested = true;
        self.write_record(&record)
    }

    /// Re-enqueues a request: bumps the attempt, freezes a still-running
    /// prior attempt as stale, and reopens the record as pending. This is the
    /// API layer's retry surface, outside the core's monotonic contract.
    pub fn reset_for_retry(&self, id: u64) -> Result<u32> {
        let _lock = self.lock_record(id)?;
        let mut record = self.read_record(id)?;
        if matches!(record.state, RequestState::Complete | RequestState::Stale) {
            anyhow::bail!(
                "request {id} is {} and cannot be retried",
                record.state.as_str()
            );
        }
        if record.state == RequestState::InProgress {
            record
                .state_history
                .push(StateEntry::now(RequestState::Stale, "superseded by a retry"));
        }
        record.attempt += 1;
        record.cancel_requested = false;
        record.state = RequestState::Pending;
        record.state_history.push(StateEntry::now(
            RequestState::Pending,
            format!("re-enqueued (attempt {})", record.attempt),
        ));
        record.dependencies.clear();
        record.environment_variables.clear();
        record.bundle = None;
        record.error = None;
        self.write_record(&record)?;
        Ok(record.attempt)
    }

    fn record_path(&self, id: u64) -> PathBuf {
        self.data_dir.join(format!("{id}.json"))
    }

    fn lock_record(&self, id: u64) -> Result<std::fs::File> {
        let path = self.data_dir.join(format!("{id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open record lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(file)
    }

    fn read_record(&self, id: u64) -> Result<RequestRecord> {
        let path = self.record_path(id);
        if !path.is_file() {
            return Err(BackendError::NotFound(id).into());
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .with_context(|| format!("corrupt request record {}", path.display()))
    }

    fn write_record(&self, record: &RequestRecord) -> Result<()> {
        let path = self.record_path(record.id);
        let tmp = NamedTempFile::new_in(&self.data_dir)?;
        fs::write(tmp.path(), serde_json::to_string_pretty(record)?)?;
        tmp.persist(&path)
            .with_context(|| format!("failed to persist {}", path.display()))?;
        Ok(())
    }
}

impl RequestBackend for JsonBackend {
    fn load(&self, id: u64) -> Result<RequestRecord> {
        let _lock = self.lock_record(id)?;
        self.read_record(id)
    }

    fn transition(
        &self,
        id: u64,
        attempt: u32,
        state: RequestState,
        reason: &str,
        payload: TransitionPayload<'_>,
    ) -> Result<()> {
        let _lock = self.lock_record(id)?;
        let mut record = self.read_record(id)?;
        if record.attempt != attempt {
            return Err(BackendError::Superseded {
                held: attempt,
                current: record.attempt,
            }
            .into());
        }
        record.add_state(state, reason)?;
        match payload {
            TransitionPayload::None => {}
            TransitionPayload::PinnedRevision(pinned) => {
                record.pinned_revision = Some(pinned.to_string());
            }
            TransitionPayload::Success {
                bundle,
                dependencies,
                environment_variables,
                pinned_revision,
            } => {
                record.pinned_revision = Some(pinned_revision.to_string());
                record.bundle = Some(bundle.clone());
                record.dependencies = dependencies.to_vec();
                record.environment_variables = environment_variables.clone();
            }
            TransitionPayload::Failure(error) => {
                record.error = Some(error.clone());
            }
        }
        self.write_record(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_backend() -> (tempfile::TempDir, JsonBackend) {
        let temp = tempfile::tempdir().unwrap();
        let backend = JsonBackend::open(temp.path()).unwrap();
        (temp, backend)
    }

    fn new_record(backend: &JsonBackend) -> RequestRecord {
        let record = RequestRecord::new(
            backend.next_id().unwrap(),
            "https://example.com/x.git",
            "abc123",
            vec!["gomod".to_string()],
        )
        .unwrap();
        backend.create(&record).unwrap();
        record
    }

    #[test]
    fn create_load_round_trip() {
        let (_temp, backend) = new_backend();
        let record = new_record(&backend);
        let loaded = backend.load(record.id).unwrap();
        assert_eq!(loaded.repo, record.repo);
        assert_eq!(loaded.state, RequestState::Pending);
    }

    #[test]
    fn missing_record_is_not_found() {
        let (_temp, backend) = new_backend();
        let err = backend.load(99).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackendError>(),
            Some(BackendError::NotFound(99))
        ));
    }

    #[test]
    fn transition_rejects_superseded_attempts() {
        let (_temp, backend) = new_backend();
        let record = new_record(&backend);
        backend.reset_for_retry(record.id).unwrap();

        let err = backend
            .transition(
                record.id,
                0,
                RequestState::InProgress,
                "late worker",
                TransitionPayload::None,
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackendError>(),
            Some(BackendError::Superseded { held: 0, current: 1 })
        ));
    }

    #[test]
    fn transition_enforces_state_machine() {
        let (_temp, backend) = new_backend();
        let record = new_record(&backend);
        backend
            .transition(
                record.id,
                0,
                RequestState::InProgress,
                "picked up",
                TransitionPayload::None,
            )
            .unwrap();
        backend
            .transition(
                record.id,
                0,
                RequestState::Failed,
                "boom",
                TransitionPayload::Failure(&PipelineError::manifest("go.mod missing")),
            )
            .unwrap();
        // Terminal; a further transition must fail.
        let err = backend
            .transition(
                record.id,
                0,
                RequestState::InProgress,
                "zombie",
                TransitionPayload::None,
            )
            .unwrap_err();
        assert!(err.to_string().contains("invalid state transition"));

        let loaded = backend.load(record.id).unwrap();
        assert_eq!(loaded.state, RequestState::Failed);
        assert!(matches!(
            loaded.error,
            Some(PipelineError::Manifest { .. })
        ));
    }

    #[test]
    fn cancel_flag_round_trips() {
        let (_temp, backend) = new_backend();
        let record = new_record(&backend);
        backend.request_cancel(record.id).unwrap();
        assert!(backend.load(record.id).unwrap().cancel_requested);
    }

    #[test]
    fn retry_marks_running_attempt_stale_and_reopens() {
        let (_temp, backend) = new_backend();
        let record = new_record(&backend);
        backend
            .transition(
                record.id,
                0,
                RequestState::InProgress,
                "picked up",
                TransitionPayload::None,
            )
            .unwrap();
        let attempt = backend.reset_for_retry(record.id).unwrap();
        assert_eq!(attempt, 1);

        let loaded = backend.load(record.id).unwrap();
        assert_eq!(loaded.state, RequestState::Pending);
        let states: Vec<_> = loaded
            .state_history
            .iter()
            .map(|entry| entry.state)
            .collect();
        assert!(states.contains(&RequestState::Stale));
    }

    #[test]
    fn frozen_states_cannot_be_retried() {
        let (_temp, backend) = new_backend();
        let record = new_record(&backend);
        backend
            .transition(
                record.id,
                0,
                RequestState::Stale,
                "cancelled",
                TransitionPayload::None,
            )
            .unwrap();
        assert!(backend.reset_for_retry(record.id).is_err());
    }
}
