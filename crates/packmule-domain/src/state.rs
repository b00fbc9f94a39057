use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Lifecycle states a request moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    InProgress,
    Complete,
    Failed,
    Stale,
}

impl RequestState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Stale => "stale",
        }
    }

    /// Terminal states never transition again for the attempt that set them.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Stale)
    }
}

impl TryFrom<&str> for RequestState {
    type Error = StateError;

    fn try_from(value: &str) -> Result<Self, StateError> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "stale" => Ok(Self::Stale),
            other => Err(StateError::UnknownState(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown request state '{0}'")]
    UnknownState(String),
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("a stale request cannot change states")]
    StaleIsFrozen,
}

/// One entry of a request's state history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: RequestState,
    pub reason: String,
    pub updated: String,
}

impl StateEntry {
    #[must_use]
    pub fn now(state: RequestState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
            updated: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        }
    }
}

/// Checks that `to` is a legal successor of `from`.
///
/// Monotonic rules: a terminal state never leaves, `stale` is frozen outright,
/// and `in_progress` may re-enter itself to refresh the reason while stages
/// advance.
pub fn validate_transition(from: RequestState, to: RequestState) -> Result<(), StateError> {
    if from == RequestState::Stale {
        return Err(StateError::StaleIsFrozen);
    }
    let allowed = match from {
        RequestState::Pending => matches!(
            to,
            RequestState::InProgress | RequestState::Failed | RequestState::Stale
        ),
        RequestState::InProgress => matches!(
            to,
            RequestState::InProgress
                | RequestState::Complete
                | RequestState::Failed
                | RequestState::Stale
        ),
        RequestState::Complete | RequestState::Failed | RequestState::Stale => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(StateError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_starts_and_fails() {
        assert!(validate_transition(RequestState::Pending, RequestState::InProgress).is_ok());
        assert!(validate_transition(RequestState::Pending, RequestState::Failed).is_ok());
        assert!(validate_transition(RequestState::Pending, RequestState::Complete).is_err());
    }

    #[test]
    fn in_progress_reaches_all_terminals() {
        for to in [
            RequestState::Complete,
            RequestState::Failed,
            RequestState::Stale,
            RequestState::InProgress,
        ] {
            assert!(validate_transition(RequestState::InProgress, to).is_ok());
        }
    }

    #[test]
    fn terminal_states_are_monotonic() {
        for from in [RequestState::Complete, RequestState::Failed] {
            for to in [
                RequestState::Pending,
                RequestState::InProgress,
                RequestState::Complete,
                RequestState::Failed,
                RequestState::Stale,
            ] {
                assert!(validate_transition(from, to).is_err());
            }
        }
    }

    #[test]
    fn stale_is_frozen() {
        assert_eq!(
            validate_transition(RequestState::Stale, RequestState::InProgress),
            Err(StateError::StaleIsFrozen)
        );
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            RequestState::Pending,
            RequestState::InProgress,
            RequestState::Complete,
            RequestState::Failed,
            RequestState::Stale,
        ] {
            assert_eq!(RequestState::try_from(state.as_str()), Ok(state));
        }
        assert!(RequestState::try_from("done").is_err());
    }
}
