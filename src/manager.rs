//! The group chat manager.
//!
//! One manager per session. It owns the authoritative shared history, the
//! roster, and the previous-speaker exclusion; it evaluates the termination
//! policy; and through the configured [`SpeakerSelector`] it decides who
//! speaks next. No other component evaluates termination or issues speak
//! requests.
//!
//! The manager never talks to a transport: [`GroupChatManager::on_turn`]
//! takes a received turn and answers with the identity to signal (or none),
//! and the session loop does the delivery. That keeps every policy decision
//! in one synchronously testable place.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::message::{ConversationTurn, render_transcript};
use crate::selector::{SelectionContext, SpeakerSelector};

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Unique identity; doubles as the participant's address on the bus.
    pub identity: String,
    /// Free-text description shown to selection strategies.
    pub description: String,
}

impl ParticipantRecord {
    pub fn new(identity: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            description: description.into(),
        }
    }

    /// Renders the record as an `identity: description` roster line.
    pub fn render(&self) -> String {
        format!("{}: {}", self.identity, self.description)
    }
}

/// Manager lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    /// Waiting for the next broadcast turn.
    AwaitingTurn,
    /// Processing a received turn (termination check, then selection).
    Evaluating,
    /// The termination policy matched. Turns are still recorded, but no
    /// further speaker is ever selected.
    Terminated,
}

/// Authoritative coordinator for one group chat session.
pub struct GroupChatManager {
    roster: Vec<ParticipantRecord>,
    user_identity: String,
    selector: Box<dyn SpeakerSelector>,
    history: Vec<ConversationTurn>,
    previous_speaker: Option<String>,
    phase: ManagerPhase,
    turn_limit: Option<usize>,
}

impl std::fmt::Debug for GroupChatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The selector is a trait object without a Debug bound; its strategy
        // name stands in for it.
        f.debug_struct("GroupChatManager")
            .field("roster", &self.roster)
            .field("user_identity", &self.user_identity)
            .field("selector", &self.selector.name())
            .field("history", &self.history)
            .field("previous_speaker", &self.previous_speaker)
            .field("phase", &self.phase)
            .field("turn_limit", &self.turn_limit)
            .finish()
    }
}

impl GroupChatManager {
    /// Creates a manager for the given roster.
    ///
    /// The roster order is fixed here and never changes; it is the tie-break
    /// order for selection matching. Fails with [`ChatError::EmptyRoster`]
    /// on an empty roster and [`ChatError::DuplicateIdentity`] if two
    /// entries share an identity.
    pub fn new(
        roster: Vec<ParticipantRecord>,
        user_identity: impl Into<String>,
        selector: Box<dyn SpeakerSelector>,
    ) -> Result<Self, ChatError> {
        if roster.is_empty() {
            return Err(ChatError::EmptyRoster);
        }
        for (index, record) in roster.iter().enumerate() {
            if roster[..index]
                .iter()
                .any(|earlier| earlier.identity == record.identity)
            {
                return Err(ChatError::DuplicateIdentity {
                    identity: record.identity.clone(),
                });
            }
        }
        Ok(Self {
            roster,
            user_identity: user_identity.into(),
            selector,
            history: Vec::new(),
            previous_speaker: None,
            phase: ManagerPhase::AwaitingTurn,
            turn_limit: None,
        })
    }

    /// Caps the shared history: once it holds `limit` turns, the manager
    /// stops selecting speakers. Turns are still recorded, and termination
    /// by approval is unaffected.
    ///
    /// Sessions whose designated user never approves need a limit, or the
    /// turn-taking cycle has nothing to stop it.
    pub fn with_turn_limit(mut self, limit: usize) -> Self {
        self.turn_limit = Some(limit);
        self
    }

    pub fn phase(&self) -> ManagerPhase {
        self.phase
    }

    /// Whether the termination policy has matched.
    pub fn is_terminated(&self) -> bool {
        self.phase == ManagerPhase::Terminated
    }

    /// The authoritative shared history, oldest first.
    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn roster(&self) -> &[ParticipantRecord] {
        &self.roster
    }

    pub fn previous_speaker(&self) -> Option<&str> {
        self.previous_speaker.as_deref()
    }

    /// The shared history rendered as `source: content` lines.
    pub fn rendered_transcript(&self) -> String {
        render_transcript(&self.history)
    }

    /// Handles one broadcast turn.
    ///
    /// The turn is recorded unconditionally — an approval message is part of
    /// the record, and so is anything that arrives after termination. Unless
    /// the session is (or just became) terminated, the next speaker is
    /// selected and returned for the session loop to signal.
    pub async fn on_turn(
        &mut self,
        turn: ConversationTurn,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ChatError> {
        let source = turn.source.clone();
        let text = turn.text_content();
        self.history.push(turn);
        debug!(
            target = "roundtable::manager",
            source = %source,
            history_len = self.history.len(),
            event = "turn_recorded"
        );

        if self.phase == ManagerPhase::Terminated {
            return Ok(None);
        }
        self.phase = ManagerPhase::Evaluating;

        if source == self.user_identity && is_approval(&text) {
            self.phase = ManagerPhase::Terminated;
            info!(
                target = "roundtable::manager",
                source = %source,
                history_len = self.history.len(),
                event = "session_terminated"
            );
            return Ok(None);
        }

        if let Some(limit) = self.turn_limit {
            if self.history.len() >= limit {
                info!(
                    target = "roundtable::manager",
                    limit,
                    history_len = self.history.len(),
                    event = "turn_limit_reached"
                );
                self.phase = ManagerPhase::AwaitingTurn;
                return Ok(None);
            }
        }

        // Previous speaker sits out exactly one selection.
        let candidates: Vec<ParticipantRecord> = self
            .roster
            .iter()
            .filter(|record| Some(record.identity.as_str()) != self.previous_speaker.as_deref())
            .cloned()
            .collect();
        let transcript = render_transcript(&self.history);
        let context = SelectionContext {
            candidates: &candidates,
            previous_speaker: self.previous_speaker.as_deref(),
            history: &transcript,
        };

        let raw = match self.selector.select(context, cancel).await {
            Ok(raw) => raw,
            Err(err) => {
                self.phase = ManagerPhase::AwaitingTurn;
                return Err(err);
            }
        };

        let Some(chosen) = Self::match_candidate(&candidates, &raw) else {
            warn!(
                target = "roundtable::manager",
                raw = %raw,
                candidates = candidates.len(),
                event = "selection_unmatched"
            );
            self.phase = ManagerPhase::AwaitingTurn;
            return Err(ChatError::SelectionFailed { raw });
        };

        info!(
            target = "roundtable::manager",
            speaker = %chosen,
            strategy = self.selector.name(),
            event = "speaker_selected"
        );
        self.previous_speaker = Some(chosen.clone());
        self.phase = ManagerPhase::AwaitingTurn;
        Ok(Some(chosen))
    }

    /// First roster-order candidate whose identity appears, case-insensitively,
    /// as a substring of the raw selector output.
    ///
    /// Substring (not exact) matching is deliberate: backends restate the
    /// identity inside a longer sentence, and exact matching would be
    /// brittle. The cost is that overlapping identities (`Ed` inside
    /// `Editor`) resolve to whichever comes first in roster order.
    fn match_candidate(candidates: &[ParticipantRecord], raw: &str) -> Option<String> {
        let raw_lower = raw.to_lowercase();
        candidates
            .iter()
            .find(|record| raw_lower.contains(&record.identity.to_lowercase()))
            .map(|record| record.identity.clone())
    }

    /// Serializes the shared history as pretty JSON at `path`.
    pub fn save_history<P: AsRef<Path>>(&self, path: P) -> Result<(), ChatError> {
        let json = serde_json::to_string_pretty(&self.history)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Replaces the shared history with the contents of `path`, returning
    /// the number of loaded turns.
    ///
    /// Meant for seeding a session with an earlier transcript before it
    /// starts; phase and previous-speaker exclusion are untouched.
    pub fn load_history<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, ChatError> {
        let json = std::fs::read_to_string(path)?;
        self.history = serde_json::from_str(&json)?;
        Ok(self.history.len())
    }
}

/// Termination policy: does the normalized content end with `approve`?
///
/// Normalization trims the text, strips trailing punctuation and whitespace,
/// and case-folds, so `"Looks great, APPROVE!"` terminates. The check is a
/// string suffix, not a word match: `"approved"` does not terminate, while
/// `"disapprove"` would.
fn is_approval(content: &str) -> bool {
    let normalized = content
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_lowercase();
    normalized.ends_with("approve")
}
