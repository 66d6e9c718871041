//! Error types for the group chat core.

use thiserror::Error;

/// Errors raised at the generation boundary.
///
/// These describe the backend call itself. Protocol-level failures wrap this
/// type as their source through [`ChatError::GenerationFailed`] and
/// [`ChatError::SelectionBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The call exceeded its deadline.
    #[error("Backend call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The call observed the session's cancellation token.
    #[error("Backend call was cancelled")]
    Cancelled,

    /// The backend rejected the request (auth, quota, malformed input).
    #[error("Backend rejected the request: {0}")]
    Rejected(String),

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    /// Check whether a retry by an outer policy layer could plausibly succeed.
    ///
    /// This core never retries on its own: a failed generation or selection
    /// call surfaces to the session driver. The classification is a hint for
    /// callers that wrap the session in their own retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Timeout(_))
    }
}

/// Errors that can occur while running the group chat protocol.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A malformed broadcast turn reached a participant (unknown source or
    /// empty content). Logged and dropped at the session boundary.
    ///
    /// `source` is the turn's sender identity, not an error cause; the `r#`
    /// spelling (same identifier) keeps thiserror from treating it as the
    /// `Error::source` field, which would require `String: Error`.
    #[error("Invalid turn from '{source}': {reason}")]
    InvalidTurn { r#source: String, reason: String },

    /// The generation backend failed while a participant was speaking.
    #[error("Generation failed for '{participant}': {source}")]
    GenerationFailed {
        participant: String,
        #[source]
        source: BackendError,
    },

    /// A capability-mandatory participant received a response that did not
    /// consist of capability invocations.
    #[error("Contract violation for '{participant}': expected capability outcomes, got {got}")]
    ContractViolation { participant: String, got: String },

    /// The model-based selector's backend call failed.
    ///
    /// Distinct from [`ChatError::SelectionFailed`], which means the call
    /// succeeded but its output named nobody on the roster.
    #[error("Speaker selection backend failed: {0}")]
    SelectionBackend(#[source] BackendError),

    /// No roster candidate matched the selector's output. Carries the raw
    /// output for diagnosis.
    #[error("No candidate matched selector output: {raw:?}")]
    SelectionFailed { raw: String },

    /// Selection was attempted with zero candidates.
    #[error("Speaker selection over an empty candidate set")]
    EmptyRoster,

    /// Two roster entries share the same identity.
    #[error("Duplicate participant identity '{identity}' in roster")]
    DuplicateIdentity { identity: String },

    /// Selection template rendering failed.
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    /// A message could not be delivered to its target.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// A component loop ended abnormally (panicked or was aborted).
    #[error("Session runtime failure: {0}")]
    Runtime(String),

    /// I/O error while persisting or loading a transcript.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Check whether the session may continue after this error.
    ///
    /// Only [`ChatError::InvalidTurn`] is tolerated: the offending turn is
    /// logged and dropped. Every other class stops the session and surfaces
    /// in its report.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChatError::InvalidTurn { .. })
    }
}
