//! The generation boundary.
//!
//! Everything that talks to a model goes through [`CompletionBackend`]: one
//! async call taking a system instruction plus the ordered exchanges so far,
//! returning either plain text or the outcomes of capability invocations.
//! Concrete clients (HTTP APIs, CLI spawns, local inference) live outside
//! this crate; tests script the trait directly.
//!
//! Implementations must honor the cancellation token: a cancelled call
//! returns [`BackendError::Cancelled`] promptly instead of blocking on the
//! underlying client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;
use crate::message::{ContentPart, ConversationTurn};

/// One entry in a participant's private history, as seen by the backend.
///
/// Backends that speak a chat-completions dialect map these onto roles:
/// `Note` → system, `Observed` → user (attributed to `turn.source`),
/// `Authored` → assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Exchange {
    /// Synthetic coordination note injected by the chat layer, e.g.
    /// `"Control passed to editor."`.
    Note { content: String },
    /// A turn observed from another speaker.
    Observed { turn: ConversationTurn },
    /// A contribution this participant authored on an earlier turn.
    Authored { content: Vec<ContentPart> },
}

impl Exchange {
    /// Creates a coordination note.
    pub fn note(content: impl Into<String>) -> Self {
        Exchange::Note {
            content: content.into(),
        }
    }

    /// Creates an observed-turn entry.
    pub fn observed(turn: ConversationTurn) -> Self {
        Exchange::Observed { turn }
    }

    /// Creates a self-authored entry.
    pub fn authored(content: Vec<ContentPart>) -> Self {
        Exchange::Authored { content }
    }
}

/// A single capability invocation performed by the backend during a
/// completion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Name of the capability that was invoked, e.g. `image_synthesis`.
    pub capability: String,
    /// Raw result payload. For media-producing capabilities this is the
    /// opaque reference to the produced artifact.
    pub output: String,
}

impl ToolOutcome {
    /// Creates an outcome.
    pub fn new(capability: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            output: output.into(),
        }
    }
}

/// What a completion call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResponse {
    /// Free-form text.
    Text(String),
    /// The backend answered by invoking capabilities, one outcome per
    /// invocation.
    ToolOutcomes(Vec<ToolOutcome>),
}

impl CompletionResponse {
    /// The text, if this is the text variant.
    pub fn into_text(self) -> Option<String> {
        match self {
            CompletionResponse::Text(text) => Some(text),
            CompletionResponse::ToolOutcomes(_) => None,
        }
    }

    /// Short human description used in error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            CompletionResponse::Text(_) => "free text",
            CompletionResponse::ToolOutcomes(_) => "capability outcomes",
        }
    }
}

/// The single call every generation and selection goes through.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Human-readable backend name used in logs.
    fn name(&self) -> &str {
        "completion-backend"
    }

    /// Runs one completion over `instructions` and `exchanges`.
    async fn complete(
        &self,
        instructions: &str,
        exchanges: &[Exchange],
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, BackendError>;
}
