//! Participants: the voices in a group chat.
//!
//! A [`ChatParticipant`] is the shared core every variant uses: identity,
//! roster-facing description, system instructions, the set of sources it
//! accepts turns from, and its append-only private history. What differs per
//! variant is only how a contribution gets generated, captured by the
//! [`Contributor`] trait: model-backed free text, or tool-bound generation
//! that must go through a capability invocation.
//!
//! Participants never initiate. They observe broadcast turns
//! ([`ChatParticipant::observe_turn`]) and produce exactly one turn when
//! asked ([`ChatParticipant::take_turn`]); broadcasting the produced turn is
//! the session loop's job, which keeps this type free of any transport
//! concern.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{CompletionBackend, CompletionResponse, Exchange};
use crate::error::ChatError;
use crate::message::{ContentPart, ConversationTurn, MediaRef};

/// Generation capability, implemented per participant variant.
#[async_trait]
pub trait Contributor: Send + Sync {
    /// Produces the content of one contribution from the private history.
    ///
    /// `identity` is the owning participant's identity, used for error
    /// attribution; `instructions` is its system instruction.
    async fn contribute(
        &self,
        identity: &str,
        instructions: &str,
        history: &[Exchange],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentPart>, ChatError>;
}

/// Plain model-backed contributor: forwards instructions and history to a
/// completion backend and returns its text.
pub struct ModelContributor {
    backend: Arc<dyn CompletionBackend>,
}

impl ModelContributor {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Contributor for ModelContributor {
    async fn contribute(
        &self,
        identity: &str,
        instructions: &str,
        history: &[Exchange],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentPart>, ChatError> {
        let response = self
            .backend
            .complete(instructions, history, cancel)
            .await
            .map_err(|source| ChatError::GenerationFailed {
                participant: identity.to_string(),
                source,
            })?;
        let content = match response {
            CompletionResponse::Text(text) => vec![ContentPart::text(text)],
            // A plain participant has no capability contract; outcomes are
            // carried along as opaque media references.
            CompletionResponse::ToolOutcomes(outcomes) => outcomes
                .into_iter()
                .map(|outcome| ContentPart::media(MediaRef::new(outcome.output)))
                .collect(),
        };
        Ok(content)
    }
}

/// Tool-bound contributor for capability-mandatory participants such as an
/// illustrator.
///
/// The backend response must consist entirely of outcomes of the configured
/// capability; each outcome is mapped to an opaque media reference. Free
/// text, an empty outcome set, or outcomes of a different capability fail
/// with [`ChatError::ContractViolation`].
pub struct ToolBoundContributor {
    backend: Arc<dyn CompletionBackend>,
    capability: String,
}

impl ToolBoundContributor {
    pub fn new(backend: Arc<dyn CompletionBackend>, capability: impl Into<String>) -> Self {
        Self {
            backend,
            capability: capability.into(),
        }
    }
}

#[async_trait]
impl Contributor for ToolBoundContributor {
    async fn contribute(
        &self,
        identity: &str,
        instructions: &str,
        history: &[Exchange],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContentPart>, ChatError> {
        let response = self
            .backend
            .complete(instructions, history, cancel)
            .await
            .map_err(|source| ChatError::GenerationFailed {
                participant: identity.to_string(),
                source,
            })?;

        let outcomes = match response {
            CompletionResponse::ToolOutcomes(outcomes) if !outcomes.is_empty() => outcomes,
            CompletionResponse::ToolOutcomes(_) => {
                return Err(ChatError::ContractViolation {
                    participant: identity.to_string(),
                    got: "an empty outcome set".to_string(),
                });
            }
            text @ CompletionResponse::Text(_) => {
                return Err(ChatError::ContractViolation {
                    participant: identity.to_string(),
                    got: text.describe().to_string(),
                });
            }
        };

        let mut content = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            if outcome.capability != self.capability {
                return Err(ChatError::ContractViolation {
                    participant: identity.to_string(),
                    got: format!("an outcome of capability '{}'", outcome.capability),
                });
            }
            content.push(ContentPart::media(MediaRef::new(outcome.output)));
        }
        Ok(content)
    }
}

/// Shared participant core: identity, configuration, private history.
pub struct ChatParticipant {
    identity: String,
    description: String,
    instructions: String,
    known_sources: Vec<String>,
    history: Vec<Exchange>,
    contributor: Box<dyn Contributor>,
}

impl ChatParticipant {
    /// Creates a participant.
    ///
    /// `description` is what selection strategies see on the roster;
    /// `instructions` is the system instruction handed to the generation
    /// capability on every contribution.
    ///
    /// A fresh participant accepts turns from nobody: the session builder
    /// fills in the known sources once the full roster exists, or callers
    /// wiring their own runtime use [`ChatParticipant::with_known_sources`].
    pub fn new(
        identity: impl Into<String>,
        description: impl Into<String>,
        instructions: impl Into<String>,
        contributor: Box<dyn Contributor>,
    ) -> Self {
        Self {
            identity: identity.into(),
            description: description.into(),
            instructions: instructions.into(),
            known_sources: Vec::new(),
            history: Vec::new(),
            contributor,
        }
    }

    /// Sets the full list of sources this participant accepts turns from
    /// (roster identities plus the designated user identity).
    pub fn with_known_sources(
        mut self,
        sources: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.known_sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn set_known_sources(&mut self, sources: Vec<String>) {
        self.known_sources = sources;
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The private history accumulated so far. Append-only: entries are
    /// never rewritten or dropped.
    pub fn history(&self) -> &[Exchange] {
        &self.history
    }

    /// Handles a broadcast turn: validates it, then appends a transition
    /// annotation followed by the turn itself to the private history.
    ///
    /// Turns from unknown sources or with empty content are rejected with
    /// [`ChatError::InvalidTurn`]; the session loop logs and drops those,
    /// leaving the history untouched.
    pub fn observe_turn(&mut self, turn: &ConversationTurn) -> Result<(), ChatError> {
        if !self.known_sources.iter().any(|known| known == &turn.source) {
            return Err(ChatError::InvalidTurn {
                source: turn.source.clone(),
                reason: "unknown source".to_string(),
            });
        }
        if turn.is_empty() {
            return Err(ChatError::InvalidTurn {
                source: turn.source.clone(),
                reason: "empty content".to_string(),
            });
        }

        self.history
            .push(Exchange::note(format!("Control passed to {}.", turn.source)));
        self.history.push(Exchange::observed(turn.clone()));
        debug!(
            target = "roundtable::participant",
            participant = %self.identity,
            source = %turn.source,
            history_len = self.history.len(),
            event = "turn_observed"
        );
        Ok(())
    }

    /// Handles a speak request: annotates the transition to itself, invokes
    /// the generation capability over the full private history, records the
    /// result, and returns the turn to broadcast.
    ///
    /// On failure the error propagates unchanged; the transition annotation
    /// stays in the history (it is append-only) and no turn is produced.
    pub async fn take_turn(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<ConversationTurn, ChatError> {
        self.history
            .push(Exchange::note(format!("Control passed to {}.", self.identity)));
        let content = self
            .contributor
            .contribute(&self.identity, &self.instructions, &self.history, cancel)
            .await?;
        self.history.push(Exchange::authored(content.clone()));
        debug!(
            target = "roundtable::participant",
            participant = %self.identity,
            parts = content.len(),
            event = "contribution_generated"
        );
        Ok(ConversationTurn::new(self.identity.clone(), content))
    }
}
