use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::dependency::Dependency;
use crate::error::PipelineError;
use crate::state::{validate_transition, RequestState, StateEntry, StateError};

/// Location and checksum of a produced bundle archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub created_at: String,
}

/// Persistent record of one request, as seen through the narrow
/// state-transition interface the API layer provides.
///
/// `repo` and `ecosystems` are immutable after creation; `pinned_revision` is
/// written once by the source fetcher and never changes afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: u64,
    pub repo: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_revision: Option<String>,
    pub ecosystems: Vec<String>,
    /// Bumped each time the request is re-enqueued; an execution holding a
    /// lower attempt number has been superseded and must go stale.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub cancel_requested: bool,
    pub state: RequestState,
    #[serde(default)]
    pub state_history: Vec<StateEntry>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("at least one ecosystem is required")]
    EmptyEcosystems,
    #[error("duplicate ecosystem '{0}' in request")]
    DuplicateEcosystem(String),
    #[error(transparent)]
    State(#[from] StateError),
}

impl RequestRecord {
    /// Creates a new record in `pending`, validating the ecosystem set.
    pub fn new(
        id: u64,
        repo: impl Into<String>,
        reference: impl Into<String>,
        ecosystems: Vec<String>,
    ) -> Result<Self, RequestError> {
        if ecosystems.is_empty() {
            return Err(RequestError::EmptyEcosystems);
        }
        let mut seen = Vec::new();
        for eco in &ecosystems {
            if seen.contains(&eco) {
                return Err(RequestError::DuplicateEcosystem(eco.clone()));
            }
            seen.push(eco);
        }
        Ok(Self {
            id,
            repo: repo.into(),
            reference: reference.into(),
            pinned_revision: None,
            ecosystems,
            attempt: 0,
            cancel_requested: false,
            state: RequestState::Pending,
            state_history: vec![StateEntry::now(
                RequestState::Pending,
                "The request was initiated",
            )],
            dependencies: Vec::new(),
            environment_variables: BTreeMap::new(),
            bundle: None,
            error: None,
        })
    }

    /// Appends a state, enforcing the monotonic transition rules.
    pub fn add_state(
        &mut self,
        state: RequestState,
        reason: impl Into<String>,
    ) -> Result<(), StateError> {
        validate_transition(self.state, state)?;
        self.state = state;
        self.state_history.push(StateEntry::now(state, reason));
        Ok(())
    }

    /// JSON view served to clients; mirrors the record with the newest state
    /// flattened at the top level and the history newest-first.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut history: Vec<Value> = self
            .state_history
            .iter()
            .map(|entry| {
                json!({
                    "state": entry.state.as_str(),
                    "state_reason": entry.reason,
                    "updated": entry.updated,
                })
            })
            .collect();
        history.reverse();
        let latest = history.first().cloned().unwrap_or_else(|| json!({}));

        let mut view = json!({
            "id": self.id,
            "repo": self.repo,
            "ref": self.reference,
            "pinned_revision": self.pinned_revision,
            "pkg_managers": self.ecosystems,
            "dependencies": self.dependencies.iter().map(Dependency::to_json).collect::<Vec<_>>(),
            "environment_variables": self.environment_variables,
            "state_history": history,
            "bundle": self.bundle.as_ref().map(|bundle| json!({
                "path": bundle.path.display().to_string(),
                "size": bundle.size,
                "checksum": bundle.checksum,
                "created_at": bundle.created_at,
            })),
            "error": self.error.as_ref().map(PipelineError::to_json),
        });
        if let (Some(map), Some(latest)) = (view.as_object_mut(), latest.as_object()) {
            for (key, value) in latest {
                map.insert(key.clone(), value.clone());
            }
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_starts_pending() {
        let record =
            RequestRecord::new(1, "https://example.com/x.git", "abc123", vec!["gomod".into()])
                .unwrap();
        assert_eq!(record.state, RequestState::Pending);
        assert_eq!(record.state_history.len(), 1);
    }

    #[test]
    fn ecosystem_set_must_be_nonempty_and_unique() {
        assert_eq!(
            RequestRecord::new(1, "r", "ref", vec![]).unwrap_err(),
            RequestError::EmptyEcosystems
        );
        assert_eq!(
            RequestRecord::new(1, "r", "ref", vec!["gomod".into(), "gomod".into()]).unwrap_err(),
            RequestError::DuplicateEcosystem("gomod".into())
        );
    }

    #[test]
    fn add_state_enforces_transitions() {
        let mut record = RequestRecord::new(7, "r", "ref", vec!["gomod".into()]).unwrap();
        record
            .add_state(RequestState::InProgress, "picked up")
            .unwrap();
        record.add_state(RequestState::Complete, "done").unwrap();
        assert!(record
            .add_state(RequestState::InProgress, "again")
            .is_err());
    }

    #[test]
    fn json_view_flattens_latest_state() {
        let mut record = RequestRecord::new(9, "r", "v1.0", vec!["gomod".into()]).unwrap();
        record
            .add_state(RequestState::InProgress, "fetching source")
            .unwrap();
        let view = record.to_json();
        assert_eq!(view["state"], "in_progress");
        assert_eq!(view["state_reason"], "fetching source");
        assert_eq!(view["state_history"].as_array().unwrap().len(), 2);
        assert_eq!(view["state_history"][0]["state"], "in_progress");
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut record = RequestRecord::new(3, "repo", "main", vec!["gomod".into()]).unwrap();
        record.pinned_revision = Some("deadbeef".repeat(5));
        let raw = serde_json::to_string(&record).unwrap();
        let back: RequestRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.pinned_revision, record.pinned_revision);
        assert_eq!(back.state, RequestState::Pending);
    }
}
