//! Session assembly and driving.
//!
//! [`GroupChatSession`] wires a manager and its participants onto a private
//! [`SessionBus`], seeds the first turn, and runs one component loop per
//! piece until the conversation terminates, settles, fails, or is cancelled.
//! Each loop owns its component outright; nothing is shared across sessions,
//! so concurrent sessions are isolated by construction.
//!
//! The flow per turn: a participant's turn is broadcast; the manager records
//! it and either terminates or signals the next speaker with a directed
//! [`ChatMessage::SpeakRequest`]; that participant generates a contribution
//! and broadcasts it; repeat. Exactly one participant is ever working,
//! enforced by the protocol itself rather than a lock.

use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::bus::{Mailbox, SessionBus};
use crate::error::ChatError;
use crate::manager::{GroupChatManager, ParticipantRecord};
use crate::message::{ChatMessage, ConversationTurn, render_transcript};
use crate::participant::ChatParticipant;
use crate::selector::{RoundRobinSelector, SpeakerSelector};

/// How a session run ended.
#[derive(Debug)]
pub enum SessionStatus {
    /// The designated user approved; the manager reached its terminal phase.
    Approved,
    /// The conversation settled without approval (turn limit reached).
    Idle,
    /// The cancellation token fired before the conversation settled.
    Cancelled,
    /// A fatal protocol error stopped the session.
    Failed(ChatError),
}

impl SessionStatus {
    pub fn is_approved(&self) -> bool {
        matches!(self, SessionStatus::Approved)
    }
}

/// Outcome of a session run: the final status plus the shared history up to
/// the stopping point.
#[derive(Debug)]
pub struct SessionReport {
    pub status: SessionStatus,
    pub transcript: Vec<ConversationTurn>,
}

impl SessionReport {
    /// The transcript rendered as `source: content` lines.
    pub fn rendered_transcript(&self) -> String {
        render_transcript(&self.transcript)
    }
}

/// Builder for [`GroupChatSession`].
#[derive(Default)]
pub struct GroupChatSessionBuilder {
    participants: Vec<ChatParticipant>,
    user_identity: Option<String>,
    selector: Option<Box<dyn SpeakerSelector>>,
    turn_limit: Option<usize>,
}

impl GroupChatSessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a participant. Roster order follows insertion order and is the
    /// tie-break order for selection matching.
    pub fn participant(mut self, participant: ChatParticipant) -> Self {
        self.participants.push(participant);
        self
    }

    /// The identity whose approval terminates the session. Defaults to
    /// `user`. To let the approval actually be spoken during a run, add a
    /// participant under this same identity.
    pub fn user_identity(mut self, identity: impl Into<String>) -> Self {
        self.user_identity = Some(identity.into());
        self
    }

    /// Speaker selection strategy. Defaults to round-robin over the roster
    /// in insertion order.
    pub fn selector(mut self, selector: impl SpeakerSelector + 'static) -> Self {
        self.selector = Some(Box::new(selector));
        self
    }

    /// Stops speaker selection once the shared history holds this many
    /// turns; the run then settles with [`SessionStatus::Idle`]. Without a
    /// limit, only approval or cancellation ends the turn-taking cycle.
    pub fn turn_limit(mut self, limit: usize) -> Self {
        self.turn_limit = Some(limit);
        self
    }

    /// Validates the roster and wires the participants together.
    ///
    /// Fails with [`ChatError::EmptyRoster`] or
    /// [`ChatError::DuplicateIdentity`]. Each participant's known sources
    /// are set to every other roster identity plus the user identity, so
    /// anything spoken in this session is accepted by every listener.
    pub fn build(self) -> Result<GroupChatSession, ChatError> {
        let user_identity = self.user_identity.unwrap_or_else(|| "user".to_string());
        let roster: Vec<ParticipantRecord> = self
            .participants
            .iter()
            .map(|participant| {
                ParticipantRecord::new(participant.identity(), participant.description())
            })
            .collect();
        let selector = self.selector.unwrap_or_else(|| {
            Box::new(RoundRobinSelector::new(
                roster.iter().map(|record| record.identity.clone()),
            ))
        });

        let mut manager = GroupChatManager::new(roster, user_identity.clone(), selector)?;
        if let Some(limit) = self.turn_limit {
            manager = manager.with_turn_limit(limit);
        }

        let mut participants = self.participants;
        let mut known: Vec<String> = participants
            .iter()
            .map(|participant| participant.identity().to_string())
            .collect();
        if !known.iter().any(|identity| identity == &user_identity) {
            known.push(user_identity.clone());
        }
        for participant in &mut participants {
            let sources: Vec<String> = known
                .iter()
                .filter(|identity| identity.as_str() != participant.identity())
                .cloned()
                .collect();
            participant.set_known_sources(sources);
        }

        Ok(GroupChatSession {
            manager,
            participants,
            user_identity,
        })
    }
}

/// One configured group chat, ready to run.
pub struct GroupChatSession {
    manager: GroupChatManager,
    participants: Vec<ChatParticipant>,
    user_identity: String,
}

impl std::fmt::Debug for GroupChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Participants hold trait-object contributors without a Debug bound;
        // their identities stand in for them.
        f.debug_struct("GroupChatSession")
            .field("manager", &self.manager)
            .field(
                "participants",
                &self
                    .participants
                    .iter()
                    .map(ChatParticipant::identity)
                    .collect::<Vec<_>>(),
            )
            .field("user_identity", &self.user_identity)
            .finish()
    }
}

impl GroupChatSession {
    pub fn builder() -> GroupChatSessionBuilder {
        GroupChatSessionBuilder::new()
    }

    /// The identity whose approval terminates this session.
    pub fn user_identity(&self) -> &str {
        &self.user_identity
    }

    /// Seeds the shared history from a transcript saved by
    /// [`GroupChatManager::save_history`], before the run starts.
    pub fn load_history<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, ChatError> {
        self.manager.load_history(path)
    }

    /// Runs the session to completion with a fresh cancellation token.
    pub async fn run(self, seed: ConversationTurn) -> Result<SessionReport, ChatError> {
        self.run_with_cancellation(seed, CancellationToken::new())
            .await
    }

    /// Runs the session, stopping early when `cancel` fires.
    ///
    /// The seed must be attributed to the user identity and non-empty; it is
    /// broadcast as the first turn. The returned `Err` covers setup problems
    /// only (seed validation, a panicked component loop); protocol failures
    /// during the run land in the report as [`SessionStatus::Failed`],
    /// together with the partial transcript.
    pub async fn run_with_cancellation(
        self,
        seed: ConversationTurn,
        cancel: CancellationToken,
    ) -> Result<SessionReport, ChatError> {
        if seed.source != self.user_identity {
            return Err(ChatError::InvalidTurn {
                source: seed.source,
                reason: format!("seed turns must come from '{}'", self.user_identity),
            });
        }
        if seed.is_empty() {
            return Err(ChatError::InvalidTurn {
                source: seed.source,
                reason: "empty content".to_string(),
            });
        }

        let span = info_span!("group_chat_session", participants = self.participants.len());
        self.drive(seed, cancel).instrument(span).await
    }

    async fn drive(
        self,
        seed: ConversationTurn,
        cancel: CancellationToken,
    ) -> Result<SessionReport, ChatError> {
        let bus = Arc::new(SessionBus::new());
        // Child token so the driver can wind the loops down itself once the
        // conversation is over, without cancelling the caller's token.
        let loop_cancel = cancel.child_token();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        // Attach every mailbox before the seed is published so nobody can
        // miss it.
        let manager_mailbox = bus.subscribe().await;
        let manager_handle = spawn_manager_loop(
            self.manager,
            manager_mailbox,
            Arc::clone(&bus),
            loop_cancel.clone(),
            err_tx.clone(),
        );
        let mut participant_handles = Vec::with_capacity(self.participants.len());
        for participant in self.participants {
            let mailbox = bus.register(participant.identity()).await;
            participant_handles.push(spawn_participant_loop(
                participant,
                mailbox,
                Arc::clone(&bus),
                loop_cancel.clone(),
                err_tx.clone(),
            ));
        }
        drop(err_tx);

        info!(
            target = "roundtable::session",
            source = %seed.source,
            event = "session_started"
        );
        let seed_source = seed.source.clone();
        bus.broadcast(&seed_source, &ChatMessage::Turn(seed)).await;

        let (mut failure, cancelled) = tokio::select! {
            biased;
            _ = cancel.cancelled() => (None, true),
            err = err_rx.recv() => (err, false),
            _ = bus.quiescent() => (None, false),
        };
        if !cancelled && failure.is_none() {
            // A loop may have reported in the same instant the bus drained.
            failure = err_rx.try_recv().ok();
        }

        loop_cancel.cancel();
        for result in join_all(participant_handles).await {
            result.map_err(|err| {
                ChatError::Runtime(format!("participant loop ended abnormally: {err}"))
            })?;
        }
        let manager = manager_handle
            .await
            .map_err(|err| ChatError::Runtime(format!("manager loop ended abnormally: {err}")))?;

        let status = if let Some(err) = failure {
            warn!(
                target = "roundtable::session",
                error = %err,
                event = "session_failed"
            );
            SessionStatus::Failed(err)
        } else if manager.is_terminated() {
            info!(target = "roundtable::session", event = "session_approved");
            SessionStatus::Approved
        } else if cancelled {
            info!(target = "roundtable::session", event = "session_cancelled");
            SessionStatus::Cancelled
        } else {
            info!(target = "roundtable::session", event = "session_idle");
            SessionStatus::Idle
        };

        Ok(SessionReport {
            status,
            transcript: manager.history().to_vec(),
        })
    }
}

fn spawn_manager_loop(
    mut manager: GroupChatManager,
    mut mailbox: Mailbox,
    bus: Arc<SessionBus>,
    cancel: CancellationToken,
    err_tx: UnboundedSender<ChatError>,
) -> JoinHandle<GroupChatManager> {
    let span = info_span!("manager_loop");
    tokio::spawn(
        async move {
            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    delivery = mailbox.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                match delivery.message {
                    ChatMessage::Turn(turn) => {
                        // Cancellation outranks the handler, so a selection
                        // backend that ignores its token cannot wedge
                        // shutdown.
                        let dispatch = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            dispatch = manager.on_turn(turn, &cancel) => dispatch,
                        };
                        match dispatch {
                            Ok(Some(speaker)) => {
                                if let Err(err) =
                                    bus.send_to(&speaker, ChatMessage::SpeakRequest).await
                                {
                                    let _ = err_tx.send(err);
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                let _ = err_tx.send(err);
                                break;
                            }
                        }
                    }
                    // Speak requests are directed at participants; an
                    // anonymous subscriber cannot be addressed, so nothing
                    // arrives here.
                    ChatMessage::SpeakRequest => {}
                }
            }
            manager
        }
        .instrument(span),
    )
}

fn spawn_participant_loop(
    mut participant: ChatParticipant,
    mut mailbox: Mailbox,
    bus: Arc<SessionBus>,
    cancel: CancellationToken,
    err_tx: UnboundedSender<ChatError>,
) -> JoinHandle<()> {
    let span = info_span!("participant_loop", identity = %participant.identity());
    tokio::spawn(
        async move {
            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    delivery = mailbox.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                match delivery.message {
                    ChatMessage::Turn(turn) => {
                        if let Err(err) = participant.observe_turn(&turn) {
                            if err.is_recoverable() {
                                // Malformed turns are dropped; the session
                                // goes on without them.
                                warn!(
                                    target = "roundtable::participant",
                                    participant = %participant.identity(),
                                    error = %err,
                                    event = "turn_rejected"
                                );
                            } else {
                                let _ = err_tx.send(err);
                                break;
                            }
                        }
                    }
                    ChatMessage::SpeakRequest => {
                        let generated = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            generated = participant.take_turn(&cancel) => generated,
                        };
                        match generated {
                            Ok(turn) => {
                                info!(
                                    target = "roundtable::participant",
                                    participant = %participant.identity(),
                                    event = "contribution_broadcast"
                                );
                                bus.broadcast(participant.identity(), &ChatMessage::Turn(turn))
                                    .await;
                            }
                            Err(err) => {
                                let _ = err_tx.send(err);
                                break;
                            }
                        }
                    }
                }
            }
        }
        .instrument(span),
    )
}
