//! Turn-taking group chat orchestration for multi-agent LLM conversations.
//!
//! A group chat is a set of [`ChatParticipant`]s coordinated by one
//! [`GroupChatManager`]: every turn is broadcast to everyone, the manager
//! records it on the shared history and picks who speaks next (round-robin
//! or a model-based [`ModelSelector`]), and the chosen participant generates
//! the following turn from its own private history. The session ends when
//! the designated user says `approve`, when a configured turn limit is
//! reached, on the first fatal error, or on cancellation.
//!
//! [`GroupChatSession`] wires the pieces onto an in-process session bus and
//! drives them to completion; generation plugs in through the
//! [`CompletionBackend`] trait (or a custom [`Contributor`] for full control
//! over how a participant speaks).
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use roundtable::{
//!     ChatError, ChatParticipant, ContentPart, Contributor, ConversationTurn, Exchange,
//!     GroupChatSession,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! // A stand-in for a model-backed contributor.
//! struct Scripted(&'static str);
//!
//! #[async_trait]
//! impl Contributor for Scripted {
//!     async fn contribute(
//!         &self,
//!         _identity: &str,
//!         _instructions: &str,
//!         _history: &[Exchange],
//!         _cancel: &CancellationToken,
//!     ) -> Result<Vec<ContentPart>, ChatError> {
//!         Ok(vec![ContentPart::text(self.0)])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ChatError> {
//!     let session = GroupChatSession::builder()
//!         .participant(ChatParticipant::new(
//!             "writer",
//!             "Drafts the story",
//!             "You write short stories.",
//!             Box::new(Scripted("Once upon a time...")),
//!         ))
//!         .participant(ChatParticipant::new(
//!             "editor",
//!             "Reviews drafts",
//!             "You edit stories.",
//!             Box::new(Scripted("Tighten the opening.")),
//!         ))
//!         .turn_limit(4)
//!         .build()?;
//!
//!     let report = session
//!         .run(ConversationTurn::text("user", "Write a story about a fox."))
//!         .await?;
//!     println!("{}", report.rendered_transcript());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod bus;
pub mod error;
pub mod manager;
pub mod message;
pub mod participant;
pub mod selector;
pub mod session;

pub use backend::{CompletionBackend, CompletionResponse, Exchange, ToolOutcome};
pub use bus::{Delivery, Mailbox, SessionBus};
pub use error::{BackendError, ChatError};
pub use manager::{GroupChatManager, ManagerPhase, ParticipantRecord};
pub use message::{ChatMessage, ContentPart, ConversationTurn, MediaRef};
pub use participant::{ChatParticipant, Contributor, ModelContributor, ToolBoundContributor};
pub use selector::{ModelSelector, RoundRobinSelector, SelectionContext, SpeakerSelector};
pub use session::{GroupChatSession, GroupChatSessionBuilder, SessionReport, SessionStatus};
