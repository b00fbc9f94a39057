use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Classified failures surfaced by the pipeline.
///
/// Each stage reports one of these up to the orchestrator, which is the single
/// place that decides retry versus terminal failure. The original message is
/// always preserved verbatim for the API layer.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("fetch failed: {message}")]
    Fetch { message: String, retryable: bool },
    #[error("invalid manifest: {message}")]
    Manifest { message: String },
    #[error("dependency resolution failed: {message}")]
    Resolution { message: String },
    #[error("bundle assembly failed: {message}")]
    Bundle { message: String, retryable: bool },
    #[error("request cancelled: {message}")]
    Cancelled { message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Fetch,
    Manifest,
    Resolution,
    Bundle,
    Cancelled,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch_error",
            Self::Manifest => "manifest_error",
            Self::Resolution => "resolution_error",
            Self::Bundle => "bundle_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl PipelineError {
    pub fn fetch(message: impl Into<String>, retryable: bool) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable,
        }
    }

    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
        }
    }

    pub fn bundle(message: impl Into<String>, retryable: bool) -> Self {
        Self::Bundle {
            message: message.into(),
            retryable,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch { .. } => ErrorKind::Fetch,
            Self::Manifest { .. } => ErrorKind::Manifest,
            Self::Resolution { .. } => ErrorKind::Resolution,
            Self::Bundle { .. } => ErrorKind::Bundle,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Fetch { message, .. }
            | Self::Manifest { message }
            | Self::Resolution { message }
            | Self::Bundle { message, .. }
            | Self::Cancelled { message } => message,
        }
    }

    /// Whether the orchestrator may spend retry budget on this failure.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::Fetch { retryable, .. } | Self::Bundle { retryable, .. } => *retryable,
            Self::Manifest { .. } | Self::Resolution { .. } | Self::Cancelled { .. } => false,
        }
    }

    /// Structured payload handed to the state-transition interface.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "kind": self.kind().as_str(),
            "message": self.message(),
            "retryable": self.retryable(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_classification() {
        assert!(PipelineError::fetch("timeout", true).retryable());
        assert!(!PipelineError::fetch("unknown revision", false).retryable());
        assert!(!PipelineError::manifest("no go.mod").retryable());
        assert!(!PipelineError::resolution("unsatisfiable").retryable());
        assert!(PipelineError::bundle("disk full", true).retryable());
        assert!(!PipelineError::bundle("artifact missing", false).retryable());
        assert!(!PipelineError::cancelled("operator abort").retryable());
    }

    #[test]
    fn json_payload_carries_kind_and_message() {
        let err = PipelineError::manifest("go.mod missing");
        let payload = err.to_json();
        assert_eq!(payload["kind"], "manifest_error");
        assert_eq!(payload["message"], "go.mod missing");
        assert_eq!(payload["retryable"], false);
    }

    #[test]
    fn messages_stay_verbatim() {
        let err = PipelineError::fetch("connect timed out after 120s", true);
        assert_eq!(err.message(), "connect timed out after 120s");
        assert_eq!(
            err.to_string(),
            "fetch failed: connect timed out after 120s"
        );
    }
}
