//! Message protocol for the group chat topic.
//!
//! Two message shapes travel between components: a [`ConversationTurn`]
//! broadcast on the shared topic, and the zero-payload speak request directed
//! at exactly one participant. Both are carried by the [`ChatMessage`] tagged
//! union so every component loop pattern-matches a single entry point.
//!
//! Turn content is an ordered sequence of [`ContentPart`]s. Text parts render
//! as-is; media parts stay opaque ([`MediaRef`]) and render as the
//! [`MEDIA_PLACEHOLDER`] token wherever a text transcript is needed.

use serde::{Deserialize, Serialize};

/// Placeholder token used when a non-text content item has to be rendered
/// into a text transcript (selection prompts, logs).
pub const MEDIA_PLACEHOLDER: &str = "[media]";

/// An opaque reference to externally stored media.
///
/// The chat core never dereferences it; whichever backend produced the
/// reference (or a downstream consumer) decides what it means.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Locator understood by the backend that produced it.
    pub reference: String,
    /// Optional MIME-style hint such as `image/png`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl MediaRef {
    /// Creates a media reference without a type hint.
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            media_type: None,
        }
    }

    /// Attaches a MIME-style type hint.
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// One item inside a turn's content sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },
    /// An opaque media reference.
    Media { media: MediaRef },
}

impl ContentPart {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Creates a media part.
    pub fn media(media: MediaRef) -> Self {
        ContentPart::Media { media }
    }

    /// Renders this part for a text transcript.
    pub fn render(&self) -> &str {
        match self {
            ContentPart::Text { text } => text,
            ContentPart::Media { .. } => MEDIA_PLACEHOLDER,
        }
    }
}

/// One contribution to the shared conversation.
///
/// Turns are immutable once created: a participant creates one when it
/// finishes generating, the manager and every receiving participant append it
/// to their histories, and nobody edits it afterwards. Ordering is implicit
/// in arrival order; there is no explicit timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Identity of the speaker this turn is attributed to.
    pub source: String,
    /// Ordered content items.
    pub content: Vec<ContentPart>,
}

impl ConversationTurn {
    /// Creates a turn from arbitrary content items.
    pub fn new(source: impl Into<String>, content: Vec<ContentPart>) -> Self {
        Self {
            source: source.into(),
            content,
        }
    }

    /// Creates a text-only turn.
    pub fn text(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(source, vec![ContentPart::text(text)])
    }

    /// Concatenates the text items, ignoring media.
    ///
    /// The termination policy runs over this view; a turn whose content is
    /// all media yields an empty string.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Media { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Renders the turn as a `source: content` transcript line.
    pub fn render(&self) -> String {
        let rendered: Vec<&str> = self.content.iter().map(ContentPart::render).collect();
        format!("{}: {}", self.source, rendered.join(" "))
    }

    /// Whether the turn carries nothing worth recording: no items at all, or
    /// only blank text. A media-only turn is not empty.
    pub fn is_empty(&self) -> bool {
        self.content.iter().all(|part| match part {
            ContentPart::Text { text } => text.trim().is_empty(),
            ContentPart::Media { .. } => false,
        })
    }
}

/// Renders a shared history as one transcript line per turn.
pub fn render_transcript(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(ConversationTurn::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// The two message kinds that travel between group chat components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatMessage {
    /// A turn broadcast on the shared topic.
    Turn(ConversationTurn),
    /// A directed signal telling one participant it may speak. Carries no
    /// payload; the recipient acts on it and discards it.
    SpeakRequest,
}
