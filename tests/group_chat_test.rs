//! Integration tests for the group chat protocol.
//!
//! These run complete sessions over the in-process bus with scripted
//! backends and verify the protocol end to end: approval termination,
//! speaker exclusion, model-based selection, failure reporting, media
//! contributions, cancellation, and session isolation.

use roundtable::message::MEDIA_PLACEHOLDER;
use roundtable::{
    BackendError, ChatError, ChatParticipant, CompletionBackend, CompletionResponse, ContentPart,
    ConversationTurn, Exchange, GroupChatSession, MediaRef, ModelContributor, ModelSelector,
    SelectionContext, SessionStatus, SpeakerSelector, ToolBoundContributor, ToolOutcome,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted Backends
// ============================================================================

/// Completion backend that replays a queue of scripted responses and records
/// what it was asked.
struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<CompletionResponse, BackendError>>>,
    seen_instructions: Arc<Mutex<Vec<String>>>,
    seen_history_lens: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedBackend {
    fn new(responses: Vec<Result<CompletionResponse, BackendError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            seen_instructions: Arc::new(Mutex::new(Vec::new())),
            seen_history_lens: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// One text response per line, in order.
    fn texts(lines: &[&str]) -> Arc<Self> {
        Self::new(
            lines
                .iter()
                .map(|line| Ok(CompletionResponse::Text(line.to_string())))
                .collect(),
        )
    }

    fn failing(err: BackendError) -> Arc<Self> {
        Self::new(vec![Err(err)])
    }

    fn outcomes(capability: &str, outputs: &[&str]) -> Arc<Self> {
        Self::new(vec![Ok(CompletionResponse::ToolOutcomes(
            outputs
                .iter()
                .map(|output| ToolOutcome::new(capability, *output))
                .collect(),
        ))])
    }
}

#[async_trait::async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(
        &self,
        instructions: &str,
        exchanges: &[Exchange],
        _cancel: &CancellationToken,
    ) -> Result<CompletionResponse, BackendError> {
        self.seen_instructions
            .lock()
            .unwrap()
            .push(instructions.to_string());
        self.seen_history_lens.lock().unwrap().push(exchanges.len());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Rejected("script exhausted".to_string())))
    }
}

/// Backend that never answers and never looks at the cancellation token.
struct PendingBackend;

#[async_trait::async_trait]
impl CompletionBackend for PendingBackend {
    async fn complete(
        &self,
        _instructions: &str,
        _exchanges: &[Exchange],
        _cancel: &CancellationToken,
    ) -> Result<CompletionResponse, BackendError> {
        std::future::pending().await
    }
}

/// Selector double that replays scripted outputs and records the candidate
/// sets it was offered.
struct RecordingSelector {
    outputs: Mutex<VecDeque<String>>,
    offered: Arc<Mutex<Vec<Vec<String>>>>,
}

impl RecordingSelector {
    fn new(outputs: &[&str]) -> Self {
        Self {
            outputs: Mutex::new(outputs.iter().map(|s| s.to_string()).collect()),
            offered: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn offered_log(&self) -> Arc<Mutex<Vec<Vec<String>>>> {
        Arc::clone(&self.offered)
    }
}

#[async_trait::async_trait]
impl SpeakerSelector for RecordingSelector {
    fn name(&self) -> &str {
        "recording"
    }

    async fn select(
        &self,
        context: SelectionContext<'_>,
        _cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        self.offered.lock().unwrap().push(
            context
                .candidates
                .iter()
                .map(|record| record.identity.clone())
                .collect(),
        );
        self.outputs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ChatError::SelectionFailed {
                raw: "script exhausted".to_string(),
            })
    }
}

// ============================================================================
// Participant Helpers
// ============================================================================

fn model_participant(
    identity: &str,
    description: &str,
    backend: Arc<ScriptedBackend>,
) -> ChatParticipant {
    ChatParticipant::new(
        identity,
        description,
        format!("You are {identity}."),
        Box::new(ModelContributor::new(backend)),
    )
}

/// A proxy for the human: participates under the `user` identity and speaks
/// the scripted lines when selected.
fn user_proxy(lines: &[&str]) -> ChatParticipant {
    model_participant("user", "The human requester", ScriptedBackend::texts(lines))
}

fn sources(report_transcript: &[ConversationTurn]) -> Vec<&str> {
    report_transcript
        .iter()
        .map(|turn| turn.source.as_str())
        .collect()
}

// ============================================================================
// Protocol Tests
// ============================================================================

#[tokio::test]
async fn test_round_robin_session_runs_to_approval() {
    let session = GroupChatSession::builder()
        .participant(model_participant(
            "writer",
            "Drafts the story",
            ScriptedBackend::texts(&["Here is a short draft about a fox."]),
        ))
        .participant(model_participant(
            "editor",
            "Reviews drafts",
            ScriptedBackend::texts(&["Solid draft; tightened the ending."]),
        ))
        .participant(user_proxy(&["Looks great, APPROVE!"]))
        .build()
        .unwrap();

    let report = session
        .run(ConversationTurn::text("user", "Draft a story about a fox."))
        .await
        .unwrap();

    assert!(
        report.status.is_approved(),
        "expected approval, got {:?}",
        report.status
    );
    assert_eq!(
        sources(&report.transcript),
        vec!["user", "writer", "editor", "user"]
    );
    assert_eq!(
        report.transcript[3].text_content(),
        "Looks great, APPROVE!",
        "the approval itself is part of the record"
    );

    let rendered = report.rendered_transcript();
    assert!(rendered.contains("writer: Here is a short draft about a fox."));
    assert!(rendered.contains("editor: Solid draft; tightened the ending."));
}

#[tokio::test]
async fn test_previous_speaker_never_offered_as_next_candidate() {
    let selector = RecordingSelector::new(&["writer", "editor", "user"]);
    let offered = selector.offered_log();

    let session = GroupChatSession::builder()
        .participant(model_participant(
            "writer",
            "Drafts",
            ScriptedBackend::texts(&["Draft."]),
        ))
        .participant(model_participant(
            "editor",
            "Edits",
            ScriptedBackend::texts(&["Notes."]),
        ))
        .participant(user_proxy(&["approve"]))
        .selector(selector)
        .build()
        .unwrap();

    let report = session
        .run(ConversationTurn::text("user", "Begin."))
        .await
        .unwrap();
    assert!(report.status.is_approved());

    let offered = offered.lock().unwrap();
    assert_eq!(offered.len(), 3, "no selection after the approval");
    assert_eq!(offered[0], vec!["writer", "editor", "user"]);
    assert_eq!(offered[1], vec!["editor", "user"], "writer just spoke");
    assert_eq!(offered[2], vec!["writer", "user"], "editor just spoke");
}

#[tokio::test]
async fn test_model_selector_drives_a_full_session() {
    let selector_backend = ScriptedBackend::texts(&[
        "The writer should begin.",
        "Now the EDITOR, please.",
        "Back to the user for sign-off.",
    ]);

    let session = GroupChatSession::builder()
        .participant(model_participant(
            "writer",
            "Drafts the story",
            ScriptedBackend::texts(&["A fox crossed the frozen river."]),
        ))
        .participant(model_participant(
            "editor",
            "Reviews drafts",
            ScriptedBackend::texts(&["Crisp. Ship it."]),
        ))
        .participant(user_proxy(&["approve"]))
        .selector(ModelSelector::new(selector_backend.clone()))
        .build()
        .unwrap();

    let report = session
        .run(ConversationTurn::text("user", "Draft a story about a fox."))
        .await
        .unwrap();

    assert!(report.status.is_approved());
    assert_eq!(
        sources(&report.transcript),
        vec!["user", "writer", "editor", "user"]
    );

    // The selector saw the rendered roster and history in its prompt.
    let prompts = selector_backend.seen_instructions.lock().unwrap();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[0].contains("The following roles are available"));
    assert!(prompts[0].contains("writer: Drafts the story"));
    assert!(prompts[0].contains("user: Draft a story about a fox."));
    assert!(
        !prompts[1].contains("[writer,"),
        "the previous speaker is excluded from the offered roles"
    );
}

#[tokio::test]
async fn test_unmatched_selector_output_fails_the_session() {
    let session = GroupChatSession::builder()
        .participant(model_participant(
            "Writer",
            "Drafts",
            ScriptedBackend::texts(&["unused"]),
        ))
        .participant(model_participant(
            "Editor",
            "Edits",
            ScriptedBackend::texts(&["unused"]),
        ))
        .selector(ModelSelector::new(ScriptedBackend::texts(&["I don't know"])))
        .build()
        .unwrap();

    let report = session
        .run(ConversationTurn::text("user", "go"))
        .await
        .unwrap();

    match report.status {
        SessionStatus::Failed(ChatError::SelectionFailed { ref raw }) => {
            assert_eq!(raw, "I don't know", "the raw output is preserved verbatim");
        }
        other => panic!("expected SelectionFailed, got {other:?}"),
    }
    assert_eq!(
        sources(&report.transcript),
        vec!["user"],
        "the seed was recorded before selection failed"
    );
}

#[tokio::test]
async fn test_generation_failure_reports_partial_transcript() {
    let session = GroupChatSession::builder()
        .participant(model_participant(
            "writer",
            "Drafts",
            ScriptedBackend::texts(&["First and only draft."]),
        ))
        .participant(model_participant(
            "editor",
            "Edits",
            ScriptedBackend::failing(BackendError::Rejected("quota exceeded".to_string())),
        ))
        .participant(user_proxy(&["approve"]))
        .build()
        .unwrap();

    let report = session
        .run(ConversationTurn::text("user", "Begin."))
        .await
        .unwrap();

    match report.status {
        SessionStatus::Failed(ChatError::GenerationFailed {
            ref participant, ..
        }) => assert_eq!(participant, "editor"),
        other => panic!("expected GenerationFailed, got {other:?}"),
    }
    assert_eq!(
        sources(&report.transcript),
        vec!["user", "writer"],
        "everything up to the failure stays available"
    );
}

#[tokio::test]
async fn test_tool_bound_participant_contributes_media() {
    let session = GroupChatSession::builder()
        .participant(ChatParticipant::new(
            "illustrator",
            "Draws one scene per request",
            "You illustrate scenes.",
            Box::new(ToolBoundContributor::new(
                ScriptedBackend::outcomes("image_synthesis", &["blob://fox-sketch"]),
                "image_synthesis",
            )),
        ))
        .participant(user_proxy(&["approve"]))
        .build()
        .unwrap();

    let report = session
        .run(ConversationTurn::text("user", "Sketch the fox."))
        .await
        .unwrap();

    assert!(report.status.is_approved());
    assert_eq!(
        report.transcript[1].content,
        vec![ContentPart::media(MediaRef::new("blob://fox-sketch"))]
    );
    assert_eq!(
        report.transcript[1].render(),
        format!("illustrator: {MEDIA_PLACEHOLDER}"),
        "media renders as an opaque placeholder in transcripts"
    );
}

#[tokio::test]
async fn test_tool_bound_participant_rejects_text_as_contract_violation() {
    let session = GroupChatSession::builder()
        .participant(ChatParticipant::new(
            "illustrator",
            "Draws scenes",
            "You illustrate scenes.",
            Box::new(ToolBoundContributor::new(
                ScriptedBackend::texts(&["I imagined it vividly"]),
                "image_synthesis",
            )),
        ))
        .participant(user_proxy(&["approve"]))
        .build()
        .unwrap();

    let report = session
        .run(ConversationTurn::text("user", "Sketch the fox."))
        .await
        .unwrap();

    match report.status {
        SessionStatus::Failed(ChatError::ContractViolation {
            ref participant, ..
        }) => assert_eq!(participant, "illustrator"),
        other => panic!("expected ContractViolation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_contribution_is_recorded_but_leaves_no_trace_in_listeners() {
    let editor_backend = ScriptedBackend::texts(&["Nothing to edit yet; here's my read."]);

    let session = GroupChatSession::builder()
        .participant(model_participant(
            "writer",
            "Drafts",
            ScriptedBackend::new(vec![Ok(CompletionResponse::Text(String::new()))]),
        ))
        .participant(model_participant(
            "editor",
            "Edits",
            Arc::clone(&editor_backend),
        ))
        .participant(user_proxy(&["approve"]))
        .build()
        .unwrap();

    let report = session
        .run(ConversationTurn::text("user", "Begin."))
        .await
        .unwrap();

    assert!(
        report.status.is_approved(),
        "a rejected broadcast must not stop the session"
    );
    assert_eq!(
        sources(&report.transcript),
        vec!["user", "writer", "editor", "user"],
        "the shared history records the empty turn regardless"
    );
    assert_eq!(report.transcript[1].text_content(), "");

    // Seed (annotation + turn) plus the editor's own transition annotation;
    // the rejected empty turn was dropped from its private history.
    assert_eq!(
        editor_backend.seen_history_lens.lock().unwrap().clone(),
        vec![3]
    );
}

#[tokio::test]
async fn test_cancellation_stops_a_wedged_session() {
    let session = GroupChatSession::builder()
        .participant(ChatParticipant::new(
            "sloth",
            "Takes forever",
            "You never answer.",
            Box::new(ModelContributor::new(Arc::new(PendingBackend))),
        ))
        .participant(user_proxy(&["approve"]))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        session.run_with_cancellation(ConversationTurn::text("user", "Begin."), cancel),
    )
    .await
    .expect("a cancelled session must shut down promptly")
    .unwrap();

    assert!(matches!(report.status, SessionStatus::Cancelled));
    assert_eq!(
        sources(&report.transcript),
        vec!["user"],
        "the sloth never produced a turn"
    );
}

#[tokio::test]
async fn test_concurrent_sessions_are_isolated() {
    let poet_session = GroupChatSession::builder()
        .participant(model_participant(
            "poet",
            "Writes verse",
            ScriptedBackend::texts(&["The fox at dawn, a rust-red blur."]),
        ))
        .participant(user_proxy(&["approve"]))
        .build()
        .unwrap();

    let chef_session = GroupChatSession::builder()
        .participant(model_participant(
            "chef",
            "Plans menus",
            ScriptedBackend::texts(&["Tonight: mushroom risotto."]),
        ))
        .participant(user_proxy(&["approve"]))
        .build()
        .unwrap();

    let (poem, menu) = tokio::join!(
        poet_session.run(ConversationTurn::text("user", "A poem, please.")),
        chef_session.run(ConversationTurn::text("user", "Dinner ideas?")),
    );
    let poem = poem.unwrap();
    let menu = menu.unwrap();

    assert!(poem.status.is_approved());
    assert!(menu.status.is_approved());
    assert_eq!(sources(&poem.transcript), vec!["user", "poet", "user"]);
    assert_eq!(sources(&menu.transcript), vec!["user", "chef", "user"]);
    assert!(
        !poem.rendered_transcript().contains("risotto"),
        "histories must never leak across sessions"
    );
    assert!(!menu.rendered_transcript().contains("fox"));
}
