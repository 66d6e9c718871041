//! Speaker selection strategies.
//!
//! The manager delegates "who speaks next" to a [`SpeakerSelector`]. Two
//! strategies ship with the crate: deterministic round-robin over the roster
//! order, and a model-based selector that asks a completion backend to pick
//! from the candidate descriptions.
//!
//! Selector output is raw text. Mapping it back onto a roster identity
//! (case-insensitive substring containment, first roster-order match) happens
//! in the manager, not here, so a strategy never needs to worry about exact
//! formatting — restating the identity anywhere in its output is enough.

use async_trait::async_trait;
use minijinja::Environment;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{CompletionBackend, CompletionResponse};
use crate::error::{BackendError, ChatError};
use crate::manager::ParticipantRecord;

/// Everything a strategy may consult for one selection.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    /// Roster entries eligible this turn, in roster order. The previous
    /// speaker is already excluded.
    pub candidates: &'a [ParticipantRecord],
    /// Who spoke last, if anyone has.
    pub previous_speaker: Option<&'a str>,
    /// The shared history rendered as `source: content` lines.
    pub history: &'a str,
}

/// Pluggable policy that picks the next speaker.
#[async_trait]
pub trait SpeakerSelector: Send + Sync {
    /// Strategy name used in logs.
    fn name(&self) -> &str;

    /// Produces raw textual output naming the next speaker.
    async fn select(
        &self,
        context: SelectionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError>;
}

/// Deterministic rotation over the configured roster order.
///
/// The candidate set it receives excludes the previous speaker, so the
/// rotation position cannot be reconstructed from the candidates alone; the
/// selector holds the full roster order and scans forward from the previous
/// speaker, wrapping around, until it hits an eligible identity.
pub struct RoundRobinSelector {
    order: Vec<String>,
}

impl RoundRobinSelector {
    /// Creates a selector rotating over `order` (the roster order).
    pub fn new(order: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            order: order.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SpeakerSelector for RoundRobinSelector {
    fn name(&self) -> &str {
        "round-robin"
    }

    async fn select(
        &self,
        context: SelectionContext<'_>,
        _cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        if context.candidates.is_empty() {
            return Err(ChatError::EmptyRoster);
        }
        if self.order.is_empty() {
            return Ok(context.candidates[0].identity.clone());
        }

        // A previous speaker missing from the rotation starts the scan at
        // the front, same as the opening turn.
        let start = match context
            .previous_speaker
            .and_then(|previous| self.order.iter().position(|id| id == previous))
        {
            Some(position) => position + 1,
            None => 0,
        };
        for offset in 0..self.order.len() {
            let identity = &self.order[(start + offset) % self.order.len()];
            if context
                .candidates
                .iter()
                .any(|candidate| &candidate.identity == identity)
            {
                return Ok(identity.clone());
            }
        }

        // Candidates exist but none of them is in the rotation; fall back to
        // roster order rather than failing the session.
        debug!(
            target = "roundtable::selector",
            strategy = "round-robin",
            event = "candidate_missing_from_rotation"
        );
        Ok(context.candidates[0].identity.clone())
    }
}

/// Default instructional template for [`ModelSelector`].
///
/// Context variables: `roles` (one `identity: description` line per
/// candidate), `participants` (comma-separated candidate identities), and
/// `history` (the rendered shared transcript).
pub const SELECTION_TEMPLATE: &str = "\
You are in a role play game. The following roles are available:
{{ roles }}

Read the following conversation. Then select the next role from [{{ participants }}] to play. Only return the role.

{{ history }}

Read the above conversation. Then select the next role from [{{ participants }}] to play. Only return the role.";

/// Model-based selection: renders an instructional template and asks a
/// completion backend to name the next speaker.
pub struct ModelSelector {
    backend: Arc<dyn CompletionBackend>,
    template: String,
}

impl ModelSelector {
    /// Creates a selector using [`SELECTION_TEMPLATE`].
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            backend,
            template: SELECTION_TEMPLATE.to_string(),
        }
    }

    /// Replaces the instructional template. The same context variables are
    /// available as in the default template.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    fn render_prompt(&self, context: SelectionContext<'_>) -> Result<String, ChatError> {
        let roles = context
            .candidates
            .iter()
            .map(ParticipantRecord::render)
            .collect::<Vec<_>>()
            .join("\n");
        let participants = context
            .candidates
            .iter()
            .map(|candidate| candidate.identity.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let history = context.history;

        let mut env = Environment::new();
        env.add_template("selection", &self.template)?;
        let template = env.get_template("selection")?;
        let rendered = template.render(minijinja::context!(roles, participants, history))?;
        Ok(rendered)
    }
}

#[async_trait]
impl SpeakerSelector for ModelSelector {
    fn name(&self) -> &str {
        "model"
    }

    async fn select(
        &self,
        context: SelectionContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        if context.candidates.is_empty() {
            return Err(ChatError::EmptyRoster);
        }

        let prompt = self.render_prompt(context)?;
        let response = self
            .backend
            .complete(&prompt, &[], cancel)
            .await
            .map_err(ChatError::SelectionBackend)?;
        match response {
            CompletionResponse::Text(raw) => {
                debug!(
                    target = "roundtable::selector",
                    strategy = "model",
                    backend = self.backend.name(),
                    raw = %raw,
                    event = "selector_output"
                );
                Ok(raw)
            }
            CompletionResponse::ToolOutcomes(_) => Err(ChatError::SelectionBackend(
                BackendError::Rejected(
                    "selection backend returned capability outcomes instead of text".to_string(),
                ),
            )),
        }
    }
}
