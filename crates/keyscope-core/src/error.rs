use thiserror::Error;

/// Errors produced while probing a credential against a service.
///
/// HTTP statuses are never errors on their own; a status only becomes an
/// error when the scope test that issued it has no interpretation for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("transport error calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("unexpected status code {status} from {endpoint}")]
    UnexpectedStatus { endpoint: String, status: u16 },

    #[error("ambiguous response (status {status}) from {endpoint}: {reason}")]
    AmbiguousResponse {
        endpoint: String,
        status: u16,
        reason: String,
    },

    #[error("credential rejected by identity check (status {status})")]
    Auth { status: u16 },

    #[error("probe cancelled: {endpoint}")]
    Cancelled { endpoint: String },

    #[error("probe task failed: {0}")]
    TaskFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{} probe(s) failed: {}", .0.len(), join_messages(.0))]
    Partial(Vec<ProbeError>),
}

impl ProbeError {
    /// Endpoint template the error refers to, if any.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            ProbeError::Transport { endpoint, .. }
            | ProbeError::UnexpectedStatus { endpoint, .. }
            | ProbeError::AmbiguousResponse { endpoint, .. }
            | ProbeError::Cancelled { endpoint } => Some(endpoint),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProbeError::Cancelled { .. })
    }

    /// Flatten nested aggregates into the individual failures.
    pub fn failures(&self) -> Vec<&ProbeError> {
        match self {
            ProbeError::Partial(errors) => errors.iter().flat_map(|e| e.failures()).collect(),
            other => vec![other],
        }
    }
}

fn join_messages(errors: &[ProbeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
